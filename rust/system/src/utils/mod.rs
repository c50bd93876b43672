mod guard;
mod panic;

pub use guard::CleanupGuard;
pub use panic::{get_panic_message, PanicError};
