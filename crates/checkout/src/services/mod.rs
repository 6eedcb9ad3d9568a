//! Collaborators the engine consumes but does not own.

pub mod catalog;

pub use catalog::{CatalogSeed, CatalogService, InMemoryCatalog};
