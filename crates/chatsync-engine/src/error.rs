//! Error types for chatsync-engine

use thiserror::Error;

use crate::handler::HandlerError;

/// Result type alias using chatsync-engine Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while synchronizing a conversation
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the wire layer (transport, retrieval)
    #[error(transparent)]
    Wire(#[from] chatsync_wire::Error),

    /// A handler rejected a dispatch
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// A task state payload did not have a recognized shape
    #[error("Invalid task state: {0}")]
    TaskState(String),

    /// A generic engine error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Check if this error came from the stream transport
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Wire(
                chatsync_wire::Error::Transport(_)
                    | chatsync_wire::Error::Http(_)
                    | chatsync_wire::Error::Io(_)
                    | chatsync_wire::Error::Api { .. }
            )
        )
    }
}
