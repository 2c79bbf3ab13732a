pub mod model;
pub mod reducer;

pub use model::*;
pub use reducer::*;
