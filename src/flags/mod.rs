//! Flag and segment data model.
mod models;
mod rules;

pub use models::*;
