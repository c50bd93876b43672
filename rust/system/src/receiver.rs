use strata_error::{ErrorCodes, StrataError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Failed to send message: {0}")]
    SendError(String),
}

impl StrataError for ChannelError {
    fn code(&self) -> ErrorCodes {
        ErrorCodes::Unavailable
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum RequestError {
    #[error("Failed to send request")]
    SendError,
    #[error("Failed to receive response")]
    ReceiveError,
}

impl StrataError for RequestError {
    fn code(&self) -> ErrorCodes {
        match self {
            RequestError::SendError => ErrorCodes::Unavailable,
            // The handler dropped the reply, usually because it panicked.
            RequestError::ReceiveError => ErrorCodes::Aborted,
        }
    }
}
