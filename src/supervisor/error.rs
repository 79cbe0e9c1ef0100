//! Manager 전용 에러 타입 — 호출자가 치명적인 실패와 재시도 가능한
//! 실패를 구분할 수 있게 합니다.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use crate::instance::RegistryError;
use crate::protocol::ProtocolError;
use crate::supervisor::state_machine::{State, TransitionError};

/// Manager 작업 중 발생할 수 있는 에러 유형
#[derive(thiserror::Error, Debug)]
pub enum ManagerError {
    /// Every connect attempt in the backoff schedule failed. Startup must abort.
    #[error("cannot connect to proxy server on {path:?} after {attempts} attempts")]
    ControlChannelUnreachable { path: PathBuf, attempts: usize },

    #[error("no acknowledgment for '{verb}' command within {timeout:?}")]
    CommandTimedOut { verb: &'static str, timeout: Duration },

    #[error("failed to launch '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("control channel I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("manager is not started")]
    NotStarted,

    #[error("manager is already started")]
    AlreadyStarted,

    #[error("instance on port {0} not found")]
    InstanceNotFound(u16),

    #[error("instance on port {0} already exists")]
    InstanceAlreadyExists(u16),

    #[error("instance on port {port}: invalid transition {from:?} -> {to:?}")]
    InvalidTransition { port: u16, from: State, to: State },

    #[error("control channel closed")]
    ChannelClosed,

    #[error("lock poisoned")]
    LockPoisoned,
}

impl ManagerError {
    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ControlChannelUnreachable { .. } => "CONTROL_CHANNEL_UNREACHABLE",
            Self::CommandTimedOut { .. } => "COMMAND_TIMED_OUT",
            Self::Spawn { .. } => "SPAWN_FAILED",
            Self::Io(_) => "IO_ERROR",
            Self::Protocol(_) => "PROTOCOL_ERROR",
            Self::NotStarted => "NOT_STARTED",
            Self::AlreadyStarted => "ALREADY_STARTED",
            Self::InstanceNotFound(_) => "INSTANCE_NOT_FOUND",
            Self::InstanceAlreadyExists(_) => "INSTANCE_ALREADY_EXISTS",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::ChannelClosed => "CHANNEL_CLOSED",
            Self::LockPoisoned => "LOCK_POISONED",
        }
    }

    /// Startup cannot continue after these.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ControlChannelUnreachable { .. } | Self::Spawn { .. }
        )
    }

    pub(crate) fn transition(port: u16, err: TransitionError) -> Self {
        match err {
            TransitionError::InvalidTransition(from, to) => Self::InvalidTransition { port, from, to },
            TransitionError::LockPoisoned => Self::LockPoisoned,
        }
    }
}

impl From<RegistryError> for ManagerError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::AlreadyExists(port) => Self::InstanceAlreadyExists(port),
            RegistryError::LockPoisoned => Self::LockPoisoned,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = ManagerError::ControlChannelUnreachable {
            path: PathBuf::from("/tmp/manager.sock"),
            attempts: 8,
        };
        assert_eq!(err.error_code(), "CONTROL_CHANNEL_UNREACHABLE");
        assert!(err.is_fatal());
        assert!(err.to_string().contains("8 attempts"));

        let err = ManagerError::CommandTimedOut {
            verb: "add",
            timeout: Duration::from_secs(5),
        };
        assert_eq!(err.error_code(), "COMMAND_TIMED_OUT");
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_registry_error_conversion() {
        let err: ManagerError = RegistryError::AlreadyExists(8388).into();
        assert!(matches!(err, ManagerError::InstanceAlreadyExists(8388)));
    }

    #[test]
    fn test_transition_error_conversion() {
        let err = ManagerError::transition(
            8388,
            TransitionError::InvalidTransition(State::Running, State::Starting),
        );
        assert_eq!(err.error_code(), "INVALID_TRANSITION");
        assert!(err.to_string().contains("8388"));
    }
}
