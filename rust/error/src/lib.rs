// Status codes follow the gRPC status code numbering so that callers can map
// pipeline failures onto transport errors without a lookup table.
use std::error::Error;

#[derive(PartialEq, Eq, Debug, Clone, Copy, Hash)]
pub enum ErrorCodes {
    // Success is used instead of Ok, which would shadow Result::Ok.
    Success = 0,
    // The operation was cancelled, usually by a stop request.
    Cancelled = 1,
    // The error could not be classified.
    Unknown = 2,
    // The caller supplied an invalid argument or configuration.
    InvalidArgument = 3,
    // A call did not finish before its deadline.
    DeadlineExceeded = 4,
    // The requested entity (pipeline, level, key) does not exist.
    NotFound = 5,
    // The entity already exists.
    AlreadyExists = 6,
    // A resource such as memory or queue capacity ran out.
    ResourceExhausted = 8,
    // The system is not in the state required by the operation.
    FailedPrecondition = 9,
    // The operation was aborted, typically after a panic.
    Aborted = 10,
    // The operation is not implemented.
    Unimplemented = 12,
    // An invariant was broken inside the pipeline.
    Internal = 13,
    // A dependency (data source, cache) is temporarily unavailable.
    Unavailable = 14,
}

impl ErrorCodes {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCodes::InvalidArgument => "InvalidArgumentError",
            ErrorCodes::NotFound => "NotFoundError",
            ErrorCodes::FailedPrecondition => "FailedPreconditionError",
            ErrorCodes::ResourceExhausted => "ResourceExhaustedError",
            ErrorCodes::Unavailable => "UnavailableError",
            ErrorCodes::Internal => "InternalError",
            _ => "StrataError",
        }
    }

    /// Whether an error with this code may succeed if the same call is repeated.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorCodes::DeadlineExceeded | ErrorCodes::Unavailable | ErrorCodes::ResourceExhausted
        )
    }
}

pub trait StrataError: Error + Send {
    fn code(&self) -> ErrorCodes;
    fn boxed(self) -> Box<dyn StrataError>
    where
        Self: Sized + 'static,
    {
        Box::new(self)
    }
    fn should_trace_error(&self) -> bool {
        true
    }
}

impl Error for Box<dyn StrataError> {}

impl StrataError for Box<dyn StrataError> {
    fn code(&self) -> ErrorCodes {
        self.as_ref().code()
    }

    fn should_trace_error(&self) -> bool {
        self.as_ref().should_trace_error()
    }
}

impl StrataError for std::io::Error {
    fn code(&self) -> ErrorCodes {
        ErrorCodes::Unknown
    }
}
