//! Error taxonomy shared by the spawner, the launcher daemon and the job engine.
//!
//! Internal plumbing uses `anyhow::Result`; these typed errors ride inside it
//! and are recovered with `downcast_ref` where a caller has to branch on them.

use thiserror::Error;

/// Stable worker error codes carried on the wire in `message::ERROR`.
pub mod code {
    pub const ERR_CANNOT_OPEN_FOR_READING: i32 = 1;
    pub const ERR_CANNOT_OPEN_FOR_WRITING: i32 = 2;
    pub const ERR_CANNOT_LAUNCH_PROCESS: i32 = 3;
    pub const ERR_INTERNAL: i32 = 4;
    pub const ERR_MALFORMED_URL: i32 = 5;
    pub const ERR_UNSUPPORTED_PROTOCOL: i32 = 6;
    pub const ERR_IS_DIRECTORY: i32 = 9;
    pub const ERR_IS_FILE: i32 = 10;
    pub const ERR_DOES_NOT_EXIST: i32 = 11;
    pub const ERR_FILE_ALREADY_EXIST: i32 = 12;
    pub const ERR_DIR_ALREADY_EXIST: i32 = 13;
    pub const ERR_ACCESS_DENIED: i32 = 17;
    pub const ERR_WRITE_ACCESS_DENIED: i32 = 18;
    pub const ERR_CANNOT_ENTER_DIRECTORY: i32 = 19;
    pub const ERR_CYCLIC_LINK: i32 = 21;
    pub const ERR_USER_CANCELED: i32 = 22;
    pub const ERR_CYCLIC_COPY: i32 = 23;
    pub const ERR_CONNECTION_BROKEN: i32 = 28;
    pub const ERR_COULD_NOT_READ: i32 = 37;
    pub const ERR_COULD_NOT_WRITE: i32 = 38;
    pub const ERR_CANNOT_RESUME: i32 = 45;
    pub const ERR_CANNOT_RENAME: i32 = 46;
    pub const ERR_CANNOT_CHMOD: i32 = 47;
    pub const ERR_CANNOT_DELETE: i32 = 48;
    pub const ERR_WORKER_DIED: i32 = 49;
    pub const ERR_UNSUPPORTED_ACTION: i32 = 51;
    pub const ERR_SERVICE_NOT_FOUND: i32 = 52;
    pub const ERR_MALFORMED_REQUEST: i32 = 53;

    pub fn describe(code: i32) -> &'static str {
        match code {
            ERR_CANNOT_OPEN_FOR_READING => "could not open for reading",
            ERR_CANNOT_OPEN_FOR_WRITING => "could not open for writing",
            ERR_CANNOT_LAUNCH_PROCESS => "could not launch process",
            ERR_INTERNAL => "internal error",
            ERR_MALFORMED_URL => "malformed URL",
            ERR_UNSUPPORTED_PROTOCOL => "unsupported protocol",
            ERR_IS_DIRECTORY => "is a directory",
            ERR_IS_FILE => "is a file",
            ERR_DOES_NOT_EXIST => "does not exist",
            ERR_FILE_ALREADY_EXIST => "file already exists",
            ERR_DIR_ALREADY_EXIST => "directory already exists",
            ERR_ACCESS_DENIED => "access denied",
            ERR_WRITE_ACCESS_DENIED => "write access denied",
            ERR_CANNOT_ENTER_DIRECTORY => "could not enter directory",
            ERR_CYCLIC_LINK => "cyclic redirection",
            ERR_USER_CANCELED => "canceled",
            ERR_CYCLIC_COPY => "cyclic copy",
            ERR_CONNECTION_BROKEN => "connection broken",
            ERR_COULD_NOT_READ => "could not read",
            ERR_COULD_NOT_WRITE => "could not write",
            ERR_CANNOT_RESUME => "could not resume",
            ERR_CANNOT_RENAME => "could not rename",
            ERR_CANNOT_CHMOD => "could not change permissions",
            ERR_CANNOT_DELETE => "could not delete",
            ERR_WORKER_DIED => "worker died unexpectedly",
            ERR_UNSUPPORTED_ACTION => "unsupported action",
            ERR_SERVICE_NOT_FOUND => "service not found",
            ERR_MALFORMED_REQUEST => "malformed request",
            _ => "unknown error",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ShuttleError {
    #[error("spawn failed: {0}")]
    SpawnFailure(String),
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("communication lost: {0}")]
    CommunicationLost(String),
    #[error("service not found: {0}")]
    ServiceNotFound(String),
    #[error("cyclic redirection at {0}")]
    CyclicRedirection(String),
    #[error("resume negotiation failed: {0}")]
    ResumeNegotiationFailure(String),
    #[error("worker error {code}: {text}")]
    Worker { code: i32, text: String },
    #[error("killed")]
    Killed,
}

impl ShuttleError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        ShuttleError::MalformedRequest(msg.into())
    }

    pub fn lost(msg: impl Into<String>) -> Self {
        ShuttleError::CommunicationLost(msg.into())
    }

    /// Wire error code used when this error is surfaced through a job result.
    pub fn code(&self) -> i32 {
        match self {
            ShuttleError::SpawnFailure(_) => code::ERR_CANNOT_LAUNCH_PROCESS,
            ShuttleError::MalformedRequest(_) => code::ERR_MALFORMED_REQUEST,
            ShuttleError::CommunicationLost(_) => code::ERR_CONNECTION_BROKEN,
            ShuttleError::ServiceNotFound(_) => code::ERR_SERVICE_NOT_FOUND,
            ShuttleError::CyclicRedirection(_) => code::ERR_CYCLIC_LINK,
            ShuttleError::ResumeNegotiationFailure(_) => code::ERR_CANNOT_RESUME,
            ShuttleError::Worker { code, .. } => *code,
            ShuttleError::Killed => code::ERR_USER_CANCELED,
        }
    }
}

/// Find the typed error inside an anyhow chain, if any.
pub fn classify(err: &anyhow::Error) -> Option<&ShuttleError> {
    err.chain().find_map(|e| e.downcast_ref::<ShuttleError>())
}
