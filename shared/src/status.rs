//! Command status codes reported by the protocol engine, and the outcome of
//! a sequential command queue.

use thiserror::Error;

/// Status of an entity (AEM) command, as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum AemCommandStatus {
    #[error("Success")]
    Success,
    #[error("Not implemented")]
    NotImplemented,
    #[error("No such descriptor")]
    NoSuchDescriptor,
    #[error("Locked by another controller")]
    LockedByOther,
    #[error("Acquired by another controller")]
    AcquiredByOther,
    #[error("Not authenticated")]
    NotAuthenticated,
    #[error("Authentication disabled")]
    AuthenticationDisabled,
    #[error("Bad arguments")]
    BadArguments,
    #[error("No resources")]
    NoResources,
    #[error("In progress")]
    InProgress,
    #[error("Entity misbehaving")]
    EntityMisbehaving,
    #[error("Not supported")]
    NotSupported,
    #[error("Stream is running")]
    StreamIsRunning,
    #[error("Network error")]
    NetworkError,
    #[error("Protocol error")]
    ProtocolError,
    #[error("Timed out")]
    TimedOut,
    #[error("Unknown entity")]
    UnknownEntity,
    #[error("Internal error")]
    InternalError,
}

impl AemCommandStatus {
    /// Check if the command completed successfully
    pub fn is_success(self) -> bool {
        self == AemCommandStatus::Success
    }
}

/// Status of a stream connection (ACMP) command, as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ControlStatus {
    #[error("Success")]
    Success,
    #[error("Listener unknown ID")]
    ListenerUnknownId,
    #[error("Talker unknown ID")]
    TalkerUnknownId,
    #[error("Talker destination MAC failure")]
    TalkerDestMacFail,
    #[error("Talker no stream index")]
    TalkerNoStreamIndex,
    #[error("Talker no bandwidth")]
    TalkerNoBandwidth,
    #[error("Talker exclusive")]
    TalkerExclusive,
    #[error("Listener talker timeout")]
    ListenerTalkerTimeout,
    #[error("Listener exclusive")]
    ListenerExclusive,
    #[error("State unavailable")]
    StateUnavailable,
    #[error("Not connected")]
    NotConnected,
    #[error("No such connection")]
    NoSuchConnection,
    #[error("Could not send message")]
    CouldNotSendMessage,
    #[error("Talker misbehaving")]
    TalkerMisbehaving,
    #[error("Listener misbehaving")]
    ListenerMisbehaving,
    #[error("Controller not authorized")]
    ControllerNotAuthorized,
    #[error("Incompatible request")]
    IncompatibleRequest,
    #[error("Not supported")]
    NotSupported,
    #[error("Network error")]
    NetworkError,
    #[error("Protocol error")]
    ProtocolError,
    #[error("Timed out")]
    TimedOut,
    #[error("Unknown entity")]
    UnknownEntity,
    #[error("Internal error")]
    InternalError,
}

impl ControlStatus {
    /// Check if the command completed successfully
    pub fn is_success(self) -> bool {
        self == ControlStatus::Success
    }
}

/// Why a sequential command queue did not complete successfully
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ExecutorError {
    /// Aborted, either by the user or by the engine handle
    #[error("Aborted")]
    Aborted,
    /// The target entity vanished before or while handling a request
    #[error("Unknown entity")]
    UnknownEntity,
    /// The engine completed a command but reported a failure
    #[error("Protocol error: {0}")]
    ProtocolError(AemCommandStatus),
    /// A contract violation inside the control core
    #[error("Internal error")]
    InternalError,
}

impl ExecutorError {
    /// Status reported by the engine, only carried by `ProtocolError`
    pub fn protocol_status(&self) -> Option<AemCommandStatus> {
        match self {
            ExecutorError::ProtocolError(status) => Some(*status),
            _ => None,
        }
    }
}

/// Final outcome of a sequential command queue
pub type ExecutorResult = Result<(), ExecutorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_statuses() {
        assert!(AemCommandStatus::Success.is_success());
        assert!(!AemCommandStatus::TimedOut.is_success());
        assert!(ControlStatus::Success.is_success());
        assert!(!ControlStatus::NotConnected.is_success());
    }

    #[test]
    fn test_protocol_status_only_on_protocol_error() {
        let err = ExecutorError::ProtocolError(AemCommandStatus::LockedByOther);
        assert_eq!(err.protocol_status(), Some(AemCommandStatus::LockedByOther));
        assert_eq!(ExecutorError::UnknownEntity.protocol_status(), None);
        assert_eq!(ExecutorError::Aborted.protocol_status(), None);
    }

    #[test]
    fn test_error_message_carries_status_text() {
        let err = ExecutorError::ProtocolError(AemCommandStatus::BadArguments);
        assert_eq!(err.to_string(), "Protocol error: Bad arguments");
    }
}
