use std::any::Any;
use strata_error::{ErrorCodes, StrataError};
use thiserror::Error;

/// A panic payload captured with `catch_unwind`, carried as an error.
#[derive(Error)]
#[error("Panic: {}", self.message())]
pub struct PanicError(Box<dyn Any + Send>);

impl std::fmt::Debug for PanicError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PanicError({:?})", self.message())
    }
}

impl PanicError {
    pub fn new(panic_value: Box<dyn Any + Send>) -> Self {
        PanicError(panic_value)
    }

    pub fn message(&self) -> String {
        get_panic_message(&self.0)
            .unwrap_or_else(|| "panic does not have displayable message".to_string())
    }
}

impl StrataError for PanicError {
    fn code(&self) -> ErrorCodes {
        ErrorCodes::Aborted
    }
}

/// Extracts the panic message from the value returned by `std::panic::catch_unwind`.
pub fn get_panic_message(value: &Box<dyn Any + Send>) -> Option<String> {
    if let Some(s) = value.downcast_ref::<&str>() {
        Some(s.to_string())
    } else {
        value.downcast_ref::<String>().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_str_and_string_payloads() {
        let caught = std::panic::catch_unwind(|| panic!("static message")).expect_err("panics");
        assert_eq!(PanicError::new(caught).message(), "static message");

        let caught =
            std::panic::catch_unwind(|| panic!("formatted {}", 42)).expect_err("panics");
        let err = PanicError::new(caught);
        assert_eq!(err.to_string(), "Panic: formatted 42");
        assert_eq!(err.code(), ErrorCodes::Aborted);
    }

    #[test]
    fn opaque_payloads_have_a_fallback_message() {
        let caught =
            std::panic::catch_unwind(|| std::panic::panic_any(7_u32)).expect_err("panics");
        assert_eq!(
            PanicError::new(caught).message(),
            "panic does not have displayable message"
        );
    }
}
