pub mod field;
pub mod priority;
pub mod record;
pub mod registry;
pub mod state;

pub use field::*;
pub use priority::*;
pub use record::*;
pub use registry::*;
pub use state::*;
