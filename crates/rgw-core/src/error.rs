use thiserror::Error;

/// Error taxonomy for the core (§7). Only conditions that abort a handler's normal
/// control flow are variants here — response codes like NXDOMAIN/SERVFAIL are DNS
/// wire outcomes, not Rust errors, and are produced directly by the DNS frontend.
#[derive(Error, Debug)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("host conflict: {0} already registered with a different address")]
    Conflict(String),

    #[error("duplicate reservation key")]
    Duplicate,

    #[error("circular pool exhausted")]
    PoolExhausted,

    #[error("resolution failure: {0}")]
    ResolutionFailure(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
