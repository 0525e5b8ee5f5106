// Risk management module
pub mod sizing;

pub use sizing::UnitSizer;
