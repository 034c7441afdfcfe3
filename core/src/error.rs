//! Error types for Heimdall Core

/// Result type alias for Heimdall operations
pub type HeimdallResult<T> = Result<T, HeimdallError>;

/// Main error type for Heimdall
#[derive(Debug, thiserror::Error)]
pub enum HeimdallError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing errors
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    /// IMAP protocol errors
    #[error("IMAP error: {0}")]
    Imap(#[from] async_imap::error::Error),

    /// TLS errors
    #[error("TLS error: {0}")]
    Tls(#[from] async_native_tls::Error),

    /// SMTP message building errors
    #[error("SMTP error: {0}")]
    Smtp(#[from] lettre::error::Error),

    /// SMTP transport errors
    #[error("SMTP transport error: {0}")]
    SmtpTransport(#[from] lettre::transport::smtp::Error),

    /// Address parsing errors
    #[error("Address parsing error: {0}")]
    Address(#[from] lettre::address::AddressError),

    /// MIME parsing errors
    #[error("MIME parsing error: {0}")]
    Mime(#[from] mailparse::MailParseError),

    /// Connection-level failures (dial, handshake, unexpected drop)
    #[error("Connection error: {0}")]
    Connection(String),

    /// A remote operation exceeded its bounded timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The connection actor is gone; queued operations were rejected
    #[error("Session closed before the operation could run")]
    SessionClosed,

    /// Account errors
    #[error("Account error: {0}")]
    Account(String),

    /// Container (folder/label) errors
    #[error("Container error: {0}")]
    Container(String),

    /// Message errors
    #[error("Message error: {0}")]
    Message(String),

    /// Mailbox sync errors
    #[error("Sync error: {0}")]
    Sync(String),

    /// A pipeline stage rejected a message (the message is skipped, not the pass)
    #[error("Processing error: {0}")]
    Processing(String),

    /// Syncback task failures, classified by whether a resubmit is safe
    #[error("Syncback error: {message}")]
    Syncback { message: String, retryable: bool },

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid state errors
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl HeimdallError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a new timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a new account error
    pub fn account(msg: impl Into<String>) -> Self {
        Self::Account(msg.into())
    }

    /// Create a new container error
    pub fn container(msg: impl Into<String>) -> Self {
        Self::Container(msg.into())
    }

    /// Create a new message error
    pub fn message(msg: impl Into<String>) -> Self {
        Self::Message(msg.into())
    }

    /// Create a new sync error
    pub fn sync(msg: impl Into<String>) -> Self {
        Self::Sync(msg.into())
    }

    /// Create a new processing error
    pub fn processing(msg: impl Into<String>) -> Self {
        Self::Processing(msg.into())
    }

    /// Create a syncback error that is safe to resubmit
    pub fn syncback_retryable(msg: impl Into<String>) -> Self {
        Self::Syncback { message: msg.into(), retryable: true }
    }

    /// Create a syncback error after a remote side effect may have occurred
    pub fn syncback_fatal(msg: impl Into<String>) -> Self {
        Self::Syncback { message: msg.into(), retryable: false }
    }

    /// Create a new not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Transport errors take down the session: the owner must reconnect
    /// and may resubmit operations that never started.
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Connection(_)
                | Self::Timeout(_)
                | Self::SessionClosed
                | Self::Imap(_)
                | Self::Tls(_)
                | Self::Io(_)
        )
    }

    /// Check if this is the typed timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Whether a syncback request that failed with this error may be
    /// resubmitted. Anything that failed after a remote side effect was
    /// confirmed reports `false`.
    pub fn is_retryable_syncback(&self) -> bool {
        match self {
            Self::Syncback { retryable, .. } => *retryable,
            other => other.is_transport_error(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(HeimdallError::connection("refused").is_transport_error());
        assert!(HeimdallError::timeout("fetch").is_transport_error());
        assert!(HeimdallError::SessionClosed.is_transport_error());
        assert!(!HeimdallError::sync("bad state").is_transport_error());
        assert!(!HeimdallError::processing("empty body").is_transport_error());
    }

    #[test]
    fn test_timeout_is_distinct() {
        assert!(HeimdallError::timeout("uid fetch").is_timeout());
        assert!(!HeimdallError::connection("reset").is_timeout());
    }

    #[test]
    fn test_syncback_retryability() {
        assert!(HeimdallError::syncback_retryable("move failed").is_retryable_syncback());
        assert!(!HeimdallError::syncback_fatal("handed to transport").is_retryable_syncback());
        // Transport failures before any side effect are retryable.
        assert!(HeimdallError::timeout("append").is_retryable_syncback());
    }
}
