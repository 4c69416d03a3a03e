//! Shared test scaffolding for the mesh gateway crates: an in-memory
//! `StorePort` and builders for the normalized wire types.

pub mod fixtures;
mod store;

pub use store::InMemoryStore;
