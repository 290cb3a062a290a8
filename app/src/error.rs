use crate::chaos::CrashCategory;
use crate::config::ConfigError;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: hyper::Error,
    },

    #[error("Server error: {0}")]
    Server(#[from] hyper::Error),

    #[error("Failed to build response: {0}")]
    Http(#[from] hyper::http::Error),

    /// Returned from the request service to drop the connection without
    /// writing a response
    #[error("Server crashed due to sustained {category}")]
    ForcedCrash { category: CrashCategory },
}
