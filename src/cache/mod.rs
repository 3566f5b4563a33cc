//! Model cache: a bounded set of resident model instances.
//!
//! One `ModelCache` is constructed at startup and shared by handle with
//! whatever serves requests. There is no global registry.

pub mod errors;
pub mod model_cache;
pub mod registry;

pub use errors::CacheError;
pub use model_cache::{ModelCache, ModelInstance, ModelLease, ResidentModel};
pub use registry::ModelRegistry;
