use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, instrument};
use url::Url;

use crate::event::ClientEvent;
use crate::notifier::ClientNotifier;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkStatus {
    Online,
    #[default]
    Offline,
}

impl NetworkStatus {
    pub fn from_online(online: bool) -> Self {
        if online {
            NetworkStatus::Online
        } else {
            NetworkStatus::Offline
        }
    }

    pub fn is_online(self) -> bool {
        self == NetworkStatus::Online
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NetworkStatus::Online => "online",
            NetworkStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for NetworkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Holds the last verified connectivity state.
///
/// Only a real transition is published: repeating the current status is
/// swallowed, so several signals reporting the same thing produce one
/// `NETWORK_STATUS_CHANGE`.
#[derive(Debug)]
pub struct NetworkMonitor {
    status: watch::Sender<NetworkStatus>,
    notifier: ClientNotifier,
}

impl NetworkMonitor {
    pub fn new(initial: NetworkStatus, notifier: ClientNotifier) -> Self {
        let (status, _) = watch::channel(initial);
        Self { status, notifier }
    }

    pub fn current(&self) -> NetworkStatus {
        *self.status.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.current().is_online()
    }

    pub fn watch(&self) -> watch::Receiver<NetworkStatus> {
        self.status.subscribe()
    }

    /// Returns true when `status` differs from the current one.
    pub fn update(&self, status: NetworkStatus) -> bool {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });

        if changed {
            info!(%status, "network status changed");
            self.notifier
                .broadcast(ClientEvent::NetworkStatusChange { status });
        }
        changed
    }
}

/// Active reachability check. Implementations report offline on any error
/// and never panic.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn probe(&self) -> NetworkStatus;
}

/// HEAD round-trip to a known endpoint. Any HTTP answer, whatever the
/// status, proves the network path works.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    url: Url,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(client: reqwest::Client, url: Url, timeout: Duration) -> Self {
        Self {
            client,
            url,
            timeout,
        }
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    #[instrument(skip(self), fields(url = %self.url))]
    async fn probe(&self) -> NetworkStatus {
        match self
            .client
            .head(self.url.clone())
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(response) => {
                debug!(status = response.status().as_u16(), "probe answered");
                NetworkStatus::Online
            }
            Err(e) => {
                debug!(error = %e, "probe failed");
                NetworkStatus::Offline
            }
        }
    }
}
