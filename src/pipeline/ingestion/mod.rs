// Pipeline ingestion: hand-over point for extracts fetched by source adapters

pub mod extract_file;

pub use extract_file::{load_extract, load_extracts};
