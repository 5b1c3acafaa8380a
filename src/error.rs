pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    #[error("term {term} rejected at {position}: expected predecessor {expected_prev}")]
    TermRejected {
        term: u64,
        position: u64,
        expected_prev: u64,
    },
    #[error("join rejected by {addr}: group id or token mismatch")]
    JoinRejected { addr: std::net::SocketAddr },
    #[error("log is closed")]
    Closed,
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

impl Error {
    /// Transient errors are recovered by dropping the connection and
    /// retrying; they never reach the caller of a public operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Protocol(_))
    }
}
