pub mod data;
pub mod engine;
pub mod fit;
pub mod records;
pub mod summary;
