use murre_protocol::ServerError;
use thiserror::Error;

/// Substring the broker embeds in `ServiceNotReady` messages that stem from a
/// permanent server-side failure rather than a transient unavailability.
const SERVER_EXCEPTION_MARKER: &str = "ServerException";

/// Client error kinds.
///
/// These are semantic results, not transport details: the same kind is used
/// whether an error was produced locally (admission, timeouts) or mapped from
/// a broker error code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("operation timed out")]
    Timeout,

    #[error("not connected to a broker")]
    NotConnected,

    #[error("already closed")]
    AlreadyClosed,

    #[error("interrupted while waiting for admission")]
    Interrupted,

    #[error("producer pending-message queue is full")]
    ProducerQueueIsFull,

    #[error("client memory buffer is full")]
    MemoryBufferIsFull,

    #[error("message exceeds the maximum allowed size")]
    MessageTooBig,

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("message checksum mismatch")]
    ChecksumError,

    #[error("message encryption failed: {0}")]
    CryptoError(String),

    #[error("producer was fenced by the broker")]
    ProducerFenced,

    #[error("producer blocked: topic backlog quota exceeded")]
    ProducerBlockedQuotaExceededError,

    #[error("topic backlog quota exceeded")]
    ProducerBlockedQuotaExceededException,

    #[error("topic was terminated")]
    TopicTerminated,

    #[error("incompatible schema")]
    IncompatibleSchema,

    #[error("authentication failed: {0}")]
    AuthenticationError(String),

    #[error("not authorized: {0}")]
    AuthorizationError(String),

    #[error("broker metadata error: {0}")]
    BrokerMetadataError(String),

    #[error("broker persistence error: {0}")]
    BrokerPersistenceError(String),

    #[error("service unit not ready: {0}")]
    ServiceUnitNotReady(String),

    #[error("retryable error: {0}")]
    Retryable(String),

    #[error("unknown broker error: {0}")]
    UnknownError(String),

    #[error("too many outstanding lookup requests")]
    TooManyLookupRequests,

    #[error("failed to establish connection: {0}")]
    ConnectError(String),

    #[error("invalid service URL: {0}")]
    InvalidUrl(String),

    #[error("i/o error: {0}")]
    Io(String),

    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl Error {
    /// Map a broker error code (plus its human-readable message) onto a
    /// client error kind.
    ///
    /// `ServiceNotReady` is transient unless the message carries the broker's
    /// permanent-failure marker.
    pub fn from_server_error(error: ServerError, message: &str) -> Self {
        match error {
            ServerError::UnknownError => Error::UnknownError(message.to_string()),
            ServerError::MetadataError => Error::BrokerMetadataError(message.to_string()),
            ServerError::PersistenceError => Error::BrokerPersistenceError(message.to_string()),
            ServerError::AuthenticationError => Error::AuthenticationError(message.to_string()),
            ServerError::AuthorizationError => Error::AuthorizationError(message.to_string()),
            ServerError::ServiceNotReady => {
                if message.contains(SERVER_EXCEPTION_MARKER) {
                    Error::ServiceUnitNotReady(message.to_string())
                } else {
                    Error::Retryable(message.to_string())
                }
            }
            ServerError::ProducerBlockedQuotaExceededError => {
                Error::ProducerBlockedQuotaExceededError
            }
            ServerError::ProducerBlockedQuotaExceededException => {
                Error::ProducerBlockedQuotaExceededException
            }
            ServerError::ChecksumError => Error::ChecksumError,
            ServerError::TooManyRequests => Error::TooManyLookupRequests,
            ServerError::TopicTerminatedError => Error::TopicTerminated,
            ServerError::IncompatibleSchema => Error::IncompatibleSchema,
            ServerError::ProducerFenced => Error::ProducerFenced,
            ServerError::ConsumerBusy
            | ServerError::UnsupportedVersionError
            | ServerError::TopicNotFound
            | ServerError::SubscriptionNotFound
            | ServerError::ConsumerNotFound
            | ServerError::ProducerBusy
            | ServerError::InvalidTopicName
            | ServerError::ConsumerAssignError
            | ServerError::NotAllowedError => Error::UnknownError(message.to_string()),
        }
    }

    /// Whether the handler machinery should retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Retryable(_))
    }

    /// Whether this error permanently terminates a producer.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::ProducerFenced
                | Error::ProducerBlockedQuotaExceededException
                | Error::AuthenticationError(_)
                | Error::TopicTerminated
                | Error::IncompatibleSchema
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<murre_protocol::ProtocolError> for Error {
    fn from(err: murre_protocol::ProtocolError) -> Self {
        Error::Protocol(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_not_ready_is_retryable_without_marker() {
        let err = Error::from_server_error(ServerError::ServiceNotReady, "bundle unloading");
        assert!(matches!(err, Error::Retryable(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn service_not_ready_with_marker_is_not_retryable() {
        let err = Error::from_server_error(
            ServerError::ServiceNotReady,
            "ServerException: namespace is deleted",
        );
        assert!(matches!(err, Error::ServiceUnitNotReady(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn too_many_requests_maps_to_lookup_overload() {
        let err = Error::from_server_error(ServerError::TooManyRequests, "slow down");
        assert_eq!(err, Error::TooManyLookupRequests);
    }

    #[test]
    fn terminal_kinds() {
        assert!(Error::ProducerFenced.is_terminal());
        assert!(Error::ProducerBlockedQuotaExceededException.is_terminal());
        assert!(!Error::Retryable("x".into()).is_terminal());
        assert!(!Error::Timeout.is_terminal());
    }
}
