//! Wire-level and domain error taxonomy.
//!
//! These are the outcomes a request's future can resolve to, or that a
//! broken connection fails every pending handler with (see
//! `crate::client`'s result-handler arena). They are distinct from
//! `color_eyre::Report`, which is reserved for wiring failures (bind
//! errors, file I/O, corrupt config) that never cross the wire.

use thiserror::Error;

/// Numeric error codes carried on the wire, one per `ErrorCode` variant.
/// Values are stable once assigned; never renumber a shipped variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorCode {
    #[error("no error")]
    NoError = 0,
    #[error("already done")]
    AlreadyDone = 1,
    #[error("not logged in")]
    NotLoggedIn = 2,
    #[error("queue id not found")]
    QueueIdNotFound = 3,
    #[error("invalid hash")]
    InvalidHash = 4,
    #[error("invalid queue index")]
    InvalidQueueIndex = 5,
    #[error("invalid queue item type")]
    InvalidQueueItemType = 6,
    #[error("invalid time span")]
    InvalidTimeSpan = 7,
    #[error("invalid user id")]
    InvalidUserId = 8,
    #[error("invalid user account name")]
    InvalidUserAccountName = 9,
    #[error("user account already exists")]
    UserAccountAlreadyExists = 10,
    #[error("user login authentication failed")]
    UserLoginAuthenticationFailed = 11,
    #[error("maximum queue size exceeded")]
    MaximumQueueSizeExceeded = 12,
    #[error("operation already running")]
    OperationAlreadyRunning = 13,
    #[error("server too old")]
    ServerTooOld = 14,
    #[error("extension not supported")]
    ExtensionNotSupported = 15,
    #[error("database problem")]
    DatabaseProblem = 16,
    #[error("non-fatal internal server error")]
    NonFatalInternalServerError = 17,
    #[error("unknown action")]
    UnknownAction = 18,
    #[error("invalid message structure")]
    InvalidMessageStructure = 19,
    #[error("connection to server broken")]
    ConnectionToServerBroken = 20,
    #[error("already logged in")]
    AlreadyLoggedIn = 21,
    #[error("unknown error")]
    UnknownError = 255,
}

impl ErrorCode {
    /// Decode the wire byte. Unrecognized codes map to `UnknownError` rather
    /// than failing the frame outright — a newer peer may send a code this
    /// build doesn't know about yet.
    pub fn from_wire(byte: u8) -> Self {
        match byte {
            0 => Self::NoError,
            1 => Self::AlreadyDone,
            2 => Self::NotLoggedIn,
            3 => Self::QueueIdNotFound,
            4 => Self::InvalidHash,
            5 => Self::InvalidQueueIndex,
            6 => Self::InvalidQueueItemType,
            7 => Self::InvalidTimeSpan,
            8 => Self::InvalidUserId,
            9 => Self::InvalidUserAccountName,
            10 => Self::UserAccountAlreadyExists,
            11 => Self::UserLoginAuthenticationFailed,
            12 => Self::MaximumQueueSizeExceeded,
            13 => Self::OperationAlreadyRunning,
            14 => Self::ServerTooOld,
            15 => Self::ExtensionNotSupported,
            16 => Self::DatabaseProblem,
            17 => Self::NonFatalInternalServerError,
            18 => Self::UnknownAction,
            19 => Self::InvalidMessageStructure,
            20 => Self::ConnectionToServerBroken,
            21 => Self::AlreadyLoggedIn,
            _ => Self::UnknownError,
        }
    }

    pub fn to_wire(self) -> u8 {
        self as u8
    }

    pub fn is_success(self) -> bool {
        // Open Question resolution (see DESIGN.md): AlreadyDone counts as
        // success, callers proceed rather than retry.
        matches!(self, Self::NoError | Self::AlreadyDone)
    }
}

/// Reason a connection was torn down. Distinct from [`ErrorCode`]: this
/// describes the *session*, not a single request's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DisconnectReason {
    #[error("keep-alive timeout")]
    KeepAliveTimeout,
    #[error("handshake failed")]
    HandshakeFailure,
    #[error("client ref space exhausted")]
    ClientRefOverflow,
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("io error")]
    IoError,
    #[error("unknown")]
    Unknown,
}

/// Failure delivered to every pending result handler in `crate::client`'s
/// arena when a connection tears down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("connection broken: {0}")]
pub struct ConnectionBroken(pub DisconnectReason);
