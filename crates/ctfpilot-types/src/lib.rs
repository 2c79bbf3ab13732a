pub mod challenge;
pub mod insight;
pub mod phase;
pub mod step;

pub use challenge::*;
pub use insight::*;
pub use phase::*;
pub use step::*;
