pub mod analysis;
pub mod analyzers;
