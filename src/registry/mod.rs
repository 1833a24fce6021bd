// Source registry: declarative per-feed mapping specs

pub mod source_loader;

pub use source_loader::{SourceRole, SourceRegistry, SourceSpec};
