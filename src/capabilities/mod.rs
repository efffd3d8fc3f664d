pub mod http;

pub use self::http::{
    ContentType, HttpError, HttpHeaders, HttpMethod, HttpResponse, ReqwestTransport, Transport,
};

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
