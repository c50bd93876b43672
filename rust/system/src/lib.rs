pub mod executor;
pub mod receiver;
#[allow(clippy::module_inception)]
pub mod system;
pub mod types;
pub mod utils;
pub mod wrapped_message;

pub use receiver::*;
pub use system::*;
pub use types::*;
pub use utils::*;
pub(crate) use wrapped_message::*;
