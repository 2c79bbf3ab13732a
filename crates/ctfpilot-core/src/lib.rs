pub mod aggregator;
pub mod analysis;
pub mod classify;
pub mod collaborators;
pub mod config;
pub mod control;
pub mod controller;
mod driver;
pub mod error;
pub mod event_bus;
pub mod flags;
pub mod history;
pub mod observer;
mod recon;
pub mod strategy;
mod synthesis;

pub use aggregator::*;
pub use analysis::LoopExit;
pub use classify::{keyword_category, FALLBACK_CONFIDENCE};
pub use collaborators::*;
pub use config::*;
pub use control::*;
pub use controller::*;
pub use error::*;
pub use event_bus::*;
pub use flags::*;
pub use history::*;
pub use observer::*;
pub use strategy::*;
