mod aggregation;
mod chunk;
mod state;
mod value;

pub use aggregation::*;
pub use chunk::*;
pub use state::*;
pub use value::*;
