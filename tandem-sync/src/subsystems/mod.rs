pub mod migrate;
pub mod source;
pub mod writer;
