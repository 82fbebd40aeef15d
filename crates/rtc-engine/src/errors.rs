//! Engine error types.
//!
//! Synchronous operations return [`EngineError`]; its [`EngineError::code`] is
//! the negative integer exposed to bindings (0 means success). Failures that
//! happen asynchronously are reported through the event sink as
//! [`ErrorCode`] / [`WarningCode`] values from the same numeric catalogue.

use crate::session::ConnectionState;
use serde::Serialize;
use thiserror::Error;

/// Numeric error catalogue shared by return codes and error notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(i32)]
pub enum ErrorCode {
    Failed = 1,
    InvalidArgument = 2,
    NotReady = 3,
    NotSupported = 4,
    Refused = 5,
    NotInitialized = 7,
    NoPermission = 9,
    TimedOut = 10,
    TooOften = 12,
    JoinChannelRejected = 17,
    LeaveChannelRejected = 18,
    AlreadyInUse = 19,
    InvalidChannelId = 102,
    TokenExpired = 109,
    InvalidToken = 110,
    NotInChannel = 113,
    SizeTooLarge = 114,
    BitrateLimit = 115,
    TooManyDataStreams = 116,
}

impl ErrorCode {
    /// The positive catalogue value.
    #[must_use]
    pub const fn value(self) -> i32 {
        self as i32
    }
}

/// Warnings are informational; the engine keeps working after emitting one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(i32)]
pub enum WarningCode {
    LookupChannelTimeout = 104,
    OpenChannelTimeout = 106,
    OpenChannelRejected = 107,
    SetClientRoleTimeout = 118,
    SetClientRoleNotAuthorized = 119,
}

impl WarningCode {
    #[must_use]
    pub const fn value(self) -> i32 {
        self as i32
    }
}

/// Broad category of a failure, deciding who must react to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    /// Bad input. Never retried; the caller must fix the arguments.
    Argument,
    /// Operation not valid in the current state. The caller must fix sequencing.
    State,
    /// Network level. Retried internally and surfaced as notifications.
    Transport,
    /// Limit hit on one operation. The session is otherwise unaffected.
    Resource,
    /// Session is banned. Nothing succeeds until a new session starts.
    Fatal,
}

/// Error returned by synchronous engine operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("Operation failed: {0}")]
    Failed(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid channel id: {0}")]
    InvalidChannelId(String),

    #[error("{operation} is not valid while {state}")]
    InvalidState {
        operation: &'static str,
        state: ConnectionState,
    },

    #[error("Not supported: {0}")]
    NotSupported(String),

    /// The session was banned by the server.
    #[error("Refused: session is banned")]
    Refused,

    /// The engine was destroyed or its task is gone.
    #[error("Engine not initialized")]
    NotInitialized,

    #[error("Client role is not authorized for this operation")]
    RoleNotAuthorized,

    #[error("Operation timed out")]
    TimedOut,

    #[error("Join rejected: {0}")]
    JoinRejected(String),

    #[error("Leave rejected: not in a channel")]
    LeaveRejected,

    #[error("Already in use: {0}")]
    AlreadyInUse(String),

    #[error("Not in channel")]
    NotInChannel,

    #[error("Message too large: {size} bytes exceeds {max}")]
    SizeTooLarge { size: usize, max: usize },

    #[error("Message rate limit exceeded")]
    TooOften,

    #[error("Data bitrate limit exceeded")]
    BitrateLimit,

    #[error("Too many data streams (max {max})")]
    TooManyDataStreams { max: usize },
}

impl EngineError {
    /// Catalogue entry for this error.
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        match self {
            EngineError::Failed(_) => ErrorCode::Failed,
            EngineError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            EngineError::InvalidChannelId(_) => ErrorCode::InvalidChannelId,
            EngineError::InvalidState { .. } => ErrorCode::NotReady,
            EngineError::NotSupported(_) => ErrorCode::NotSupported,
            EngineError::Refused => ErrorCode::Refused,
            EngineError::NotInitialized => ErrorCode::NotInitialized,
            EngineError::RoleNotAuthorized => ErrorCode::NoPermission,
            EngineError::TimedOut => ErrorCode::TimedOut,
            EngineError::JoinRejected(_) => ErrorCode::JoinChannelRejected,
            EngineError::LeaveRejected => ErrorCode::LeaveChannelRejected,
            EngineError::AlreadyInUse(_) => ErrorCode::AlreadyInUse,
            EngineError::NotInChannel => ErrorCode::NotInChannel,
            EngineError::SizeTooLarge { .. } => ErrorCode::SizeTooLarge,
            EngineError::TooOften => ErrorCode::TooOften,
            EngineError::BitrateLimit => ErrorCode::BitrateLimit,
            EngineError::TooManyDataStreams { .. } => ErrorCode::TooManyDataStreams,
        }
    }

    /// Return code for bindings: always negative.
    #[must_use]
    pub fn code(&self) -> i32 {
        -self.error_code().value()
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidArgument(_)
            | EngineError::InvalidChannelId(_)
            | EngineError::RoleNotAuthorized => ErrorKind::Argument,
            EngineError::InvalidState { .. }
            | EngineError::NotSupported(_)
            | EngineError::NotInitialized
            | EngineError::JoinRejected(_)
            | EngineError::LeaveRejected
            | EngineError::AlreadyInUse(_)
            | EngineError::NotInChannel => ErrorKind::State,
            EngineError::Failed(_) | EngineError::TimedOut => ErrorKind::Transport,
            EngineError::SizeTooLarge { .. }
            | EngineError::TooOften
            | EngineError::BitrateLimit
            | EngineError::TooManyDataStreams { .. } => ErrorKind::Resource,
            EngineError::Refused => ErrorKind::Fatal,
        }
    }

    /// Short label for metrics and logs.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Argument => "argument",
            ErrorKind::State => "state",
            ErrorKind::Transport => "transport",
            ErrorKind::Resource => "resource",
            ErrorKind::Fatal => "fatal",
        }
    }
}

/// Convert a synchronous result into a binding return code.
#[must_use]
pub fn return_code<T>(result: &Result<T, EngineError>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.code(),
    }
}
