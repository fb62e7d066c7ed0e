use thiserror::Error;

/// Crate-wide error taxonomy. Each variant maps to exactly one outcome in the
/// publish-handler's response codes (see `to_status_code`); anything that
/// doesn't need to be distinguished by callers is carried as `anyhow::Error`
/// at the call site instead of growing this enum.
#[derive(Debug, Error)]
pub enum PropolisError {
    #[error("syntax error at byte {offset}: {lexeme:?}")]
    SyntaxError { offset: usize, lexeme: String },

    #[error("merge predicate matched {count} rows, expected at most one")]
    MultiMatch { count: usize },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("unauthorized: no certificate cached for {identifier}")]
    Unauthorized { identifier: String },

    #[error("bad signature")]
    BadSignature,

    #[error("moderation rejected: {0}")]
    NotAcceptable(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl PropolisError {
    /// HTTP-like status code the publish handler (and its QUIC-envelope
    /// equivalent) maps this error to. `AlreadyExists` is handled by the
    /// caller as 302 before this is ever consulted (it's not an error path,
    /// just dedup), but the mapping is included for completeness.
    pub fn to_status_code(&self) -> u16 {
        match self {
            PropolisError::SyntaxError { .. } => 400,
            PropolisError::MultiMatch { .. } => 400,
            PropolisError::NotFound(_) => 404,
            PropolisError::AlreadyExists(_) => 302,
            PropolisError::Unauthorized { .. } => 401,
            PropolisError::BadSignature => 400,
            PropolisError::NotAcceptable(_) => 406,
            PropolisError::Transient(_) => 503,
            PropolisError::Fatal(_) => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, PropolisError>;
