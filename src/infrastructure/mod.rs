pub mod asset;
pub mod staging;
