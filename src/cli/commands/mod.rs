//! CLI command implementations

pub mod config;
pub mod du;
pub mod output;
pub mod prune;

pub use config::execute as config;
pub use du::execute as du;
pub use prune::execute as prune;
