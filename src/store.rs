//! Durable copy of the queue.
//!
//! Every backend stores a full snapshot: `save` replaces whatever was there
//! with the given items in order, `load` returns them in the same order.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::model::QueuedRequest;

const CURRENT_SCHEMA_VERSION: u32 = 1;
const MAX_STORE_BYTES: usize = 512 * 1024 * 1024;
const MAX_QUEUE_ENTRIES: usize = 10_000;
const STORE_MAGIC: &[u8; 4] = b"EDQS";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(not(target_arch = "wasm32"))]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupted store: {reason}")]
    Corrupted { reason: &'static str },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("unknown schema version: {0}")]
    UnknownSchema(u32),

    #[error("store too large: {size} bytes, max {max}")]
    StoreTooLarge { size: usize, max: usize },

    #[error("too many queued requests: {count}, max {max}")]
    TooManyEntries { count: usize, max: usize },

    #[error("lock acquisition failed")]
    LockFailed,

    #[error("blocking task failed: {0}")]
    Task(String),
}

impl From<ciborium::de::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::Task(e.to_string())
    }
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Replaces the stored queue with `queue`, preserving order.
    async fn save(&self, queue: &[QueuedRequest]) -> Result<(), StoreError>;

    async fn load(&self) -> Result<Vec<QueuedRequest>, StoreError>;
}

fn check_entry_count(count: usize) -> Result<(), StoreError> {
    if count > MAX_QUEUE_ENTRIES {
        return Err(StoreError::TooManyEntries {
            count,
            max: MAX_QUEUE_ENTRIES,
        });
    }
    Ok(())
}

// --- SQLite ---

#[cfg(not(target_arch = "wasm32"))]
pub use self::sqlite::SqliteStore;

#[cfg(not(target_arch = "wasm32"))]
mod sqlite {
    use super::*;
    use rusqlite::{params, Connection};

    const SCHEMA: &str = "
        CREATE TABLE IF NOT EXISTS queued_requests (
            id          TEXT PRIMARY KEY NOT NULL,
            position    INTEGER NOT NULL,
            timestamp   INTEGER NOT NULL,
            retry_count INTEGER NOT NULL,
            request     BLOB NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_queued_requests_timestamp
            ON queued_requests(timestamp);
    ";

    struct Row {
        id: String,
        timestamp: i64,
        retry_count: u32,
        request: Vec<u8>,
    }

    /// Queue table in a SQLite database. Calls run on the blocking pool.
    #[derive(Clone)]
    pub struct SqliteStore {
        conn: Arc<std::sync::Mutex<Connection>>,
    }

    impl SqliteStore {
        pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
            let conn = Connection::open(path)?;
            Self::init(conn)
        }

        pub fn open_in_memory() -> Result<Self, StoreError> {
            Self::init(Connection::open_in_memory()?)
        }

        fn init(conn: Connection) -> Result<Self, StoreError> {
            let version: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
            match version {
                0 => {
                    conn.execute_batch(SCHEMA)?;
                    conn.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)?;
                }
                CURRENT_SCHEMA_VERSION => {}
                found => {
                    return Err(StoreError::FutureSchema {
                        found,
                        max: CURRENT_SCHEMA_VERSION,
                    })
                }
            }
            Ok(Self {
                conn: Arc::new(std::sync::Mutex::new(conn)),
            })
        }

        pub async fn schema_version(&self) -> Result<u32, StoreError> {
            let conn = Arc::clone(&self.conn);
            tokio::task::spawn_blocking(move || -> Result<u32, StoreError> {
                let conn = conn.lock().map_err(|_| StoreError::LockFailed)?;
                Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
            })
            .await?
        }
    }

    #[async_trait]
    impl QueueStore for SqliteStore {
        #[instrument(skip_all, fields(len = queue.len()))]
        async fn save(&self, queue: &[QueuedRequest]) -> Result<(), StoreError> {
            check_entry_count(queue.len())?;

            let mut rows = Vec::with_capacity(queue.len());
            for item in queue {
                let mut request = Vec::new();
                ciborium::into_writer(&item.request_data, &mut request)?;
                rows.push(Row {
                    id: item.id.as_str().to_string(),
                    timestamp: i64::try_from(item.timestamp.0).unwrap_or(i64::MAX),
                    retry_count: item.retry_count,
                    request,
                });
            }

            let conn = Arc::clone(&self.conn);
            tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
                let mut conn = conn.lock().map_err(|_| StoreError::LockFailed)?;
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM queued_requests", [])?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO queued_requests (id, position, timestamp, retry_count, request)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                    )?;
                    for (position, row) in rows.iter().enumerate() {
                        stmt.execute(params![
                            row.id,
                            position as i64,
                            row.timestamp,
                            row.retry_count,
                            row.request
                        ])?;
                    }
                }
                tx.commit()?;
                debug!(rows = rows.len(), "queue snapshot written");
                Ok(())
            })
            .await?
        }

        async fn load(&self) -> Result<Vec<QueuedRequest>, StoreError> {
            let conn = Arc::clone(&self.conn);
            let rows = tokio::task::spawn_blocking(move || -> Result<Vec<Row>, StoreError> {
                let conn = conn.lock().map_err(|_| StoreError::LockFailed)?;
                let mut stmt = conn.prepare(
                    "SELECT id, timestamp, retry_count, request
                     FROM queued_requests ORDER BY position ASC",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok(Row {
                            id: row.get(0)?,
                            timestamp: row.get(1)?,
                            retry_count: row.get(2)?,
                            request: row.get(3)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await??;

            check_entry_count(rows.len())?;

            rows.into_iter()
                .map(|row| {
                    Ok(QueuedRequest {
                        id: crate::event::RequestId::new(row.id),
                        request_data: ciborium::from_reader(&row.request[..])?,
                        timestamp: crate::model::UnixTimeMs(
                            u64::try_from(row.timestamp).unwrap_or_default(),
                        ),
                        retry_count: row.retry_count,
                    })
                })
                .collect()
        }
    }
}

// --- Single file ---

#[derive(Serialize, Deserialize, Debug)]
struct StoreEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    checksum: [u8; 32],
    payload: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug)]
struct StorePayload {
    requests: Vec<QueuedRequest>,
}

/// Whole queue in one checksummed CBOR file, replaced atomically on save.
pub struct FileStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn encode(queue: &[QueuedRequest]) -> Result<Vec<u8>, StoreError> {
        let mut payload = Vec::new();
        ciborium::into_writer(
            &StorePayload {
                requests: queue.to_vec(),
            },
            &mut payload,
        )?;

        let envelope = StoreEnvelope {
            magic: *STORE_MAGIC,
            schema_version: CURRENT_SCHEMA_VERSION,
            checksum: *blake3::hash(&payload).as_bytes(),
            payload,
        };
        let mut out = Vec::new();
        ciborium::into_writer(&envelope, &mut out)?;
        Ok(out)
    }

    fn decode(bytes: &[u8]) -> Result<Vec<QueuedRequest>, StoreError> {
        if bytes.len() > MAX_STORE_BYTES {
            return Err(StoreError::StoreTooLarge {
                size: bytes.len(),
                max: MAX_STORE_BYTES,
            });
        }

        let envelope: StoreEnvelope = ciborium::from_reader(bytes)?;
        if &envelope.magic != STORE_MAGIC {
            return Err(StoreError::Corrupted {
                reason: "not a queue file",
            });
        }
        match envelope.schema_version {
            CURRENT_SCHEMA_VERSION => {}
            found if found > CURRENT_SCHEMA_VERSION => {
                return Err(StoreError::FutureSchema {
                    found,
                    max: CURRENT_SCHEMA_VERSION,
                })
            }
            older => return Err(StoreError::UnknownSchema(older)),
        }

        let digest = blake3::hash(&envelope.payload);
        if digest.as_bytes() != &envelope.checksum {
            return Err(StoreError::IntegrityCheckFailed {
                expected: hex::encode(envelope.checksum),
                actual: digest.to_hex().to_string(),
            });
        }

        let StorePayload { requests } = ciborium::from_reader(envelope.payload.as_slice())?;
        check_entry_count(requests.len())?;
        Ok(requests)
    }

    /// Temp file, fsync, rename, then a best-effort fsync of the directory.
    fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let staging = path.with_extension("tmp");
        {
            let mut file = File::create(&staging)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&staging, path)?;

        if let Some(dir) = path.parent().and_then(|parent| File::open(parent).ok()) {
            let _ = dir.sync_all();
        }
        Ok(())
    }
}

#[async_trait]
impl QueueStore for FileStore {
    #[instrument(skip_all, fields(path = %self.path.display(), len = queue.len()))]
    async fn save(&self, queue: &[QueuedRequest]) -> Result<(), StoreError> {
        check_entry_count(queue.len())?;
        let bytes = Self::encode(queue)?;

        let _guard = self.write_lock.lock().await;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || Self::write_atomic(&path, &bytes)).await?
    }

    async fn load(&self) -> Result<Vec<QueuedRequest>, StoreError> {
        let path = self.path.clone();
        let bytes = tokio::task::spawn_blocking(move || {
            if !path.exists() {
                return Ok(None);
            }
            std::fs::read(&path).map(Some)
        })
        .await??;

        match bytes {
            None => Ok(Vec::new()),
            Some(bytes) if bytes.is_empty() => Err(StoreError::Corrupted {
                reason: "empty file",
            }),
            Some(bytes) => Self::decode(&bytes),
        }
    }
}

// --- In memory ---

/// Process-local store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    items: tokio::sync::Mutex<Vec<QueuedRequest>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(items: Vec<QueuedRequest>) -> Self {
        Self {
            items: tokio::sync::Mutex::new(items),
        }
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn save(&self, queue: &[QueuedRequest]) -> Result<(), StoreError> {
        check_entry_count(queue.len())?;
        *self.items.lock().await = queue.to_vec();
        Ok(())
    }

    async fn load(&self) -> Result<Vec<QueuedRequest>, StoreError> {
        Ok(self.items.lock().await.clone())
    }
}
