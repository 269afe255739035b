//! Error types for the patch client.
//!
//! Protocol errors end the session (never the process), while patch errors are
//! reported back to the coordinator as a single completion message and the
//! session keeps running.

use thiserror::Error;

/// Transport/framing failures. Any of these makes the session unusable.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Connection I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed by peer")]
    Closed,

    #[error("Unknown opcode: {0:#x}")]
    UnknownOpcode(u32),

    #[error("Frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),

    #[error("String payload is not valid UTF-8")]
    InvalidUtf8,
}

impl ProtocolError {
    /// True when the peer simply went away rather than sending garbage.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ProtocolError::Closed => true,
            ProtocolError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Failures of a single patch request, reported via `completion(error-text)`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatchError {
    #[error("Staging failed: {0}")]
    Staging(String),

    #[error("Code signing rejected: {0}")]
    ApprovalDenied(String),

    #[error("Load failed: {0}")]
    Load(String),

    #[error("Activation failed: {0}")]
    Activation(String),

    #[error("Not supported: {0}")]
    Unsupported(String),

    #[error("Serialized execution context queue is full")]
    Busy,

    #[error("Serialized execution context is gone")]
    WorkerClosed,
}

impl PatchError {
    /// The human-readable text sent with the `Error` response.
    pub fn completion_message(&self) -> String {
        self.to_string()
    }
}

impl From<std::io::Error> for PatchError {
    fn from(e: std::io::Error) -> Self {
        PatchError::Staging(e.to_string())
    }
}

impl<T> From<std::sync::mpsc::SendError<T>> for PatchError {
    fn from(_: std::sync::mpsc::SendError<T>) -> Self {
        PatchError::WorkerClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for PatchError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        PatchError::WorkerClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eof_is_a_disconnect() {
        let err = ProtocolError::Io(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
        assert!(err.is_disconnect());
        assert!(ProtocolError::Closed.is_disconnect());
        assert!(!ProtocolError::UnknownOpcode(7).is_disconnect());
    }

    #[test]
    fn completion_message_names_the_failure() {
        let err = PatchError::ApprovalDenied("Foo.dylib".into());
        assert_eq!(
            err.completion_message(),
            "Code signing rejected: Foo.dylib"
        );
    }
}
