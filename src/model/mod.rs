//! Model ownership: the per-role registry and discovery of models on disk.

mod catalog;
mod manager;

pub use catalog::available_models;
pub use manager::{GenerationStats, ModelRegistry, ModelState, RoleStatus, UnloadReport};

#[cfg(test)]
pub(crate) use manager::tests as mock;
