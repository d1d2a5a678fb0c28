//! Multi-tenant configuration resolution.
//!
//! - [`context`] - immutable per-tenant context with lazy initialization
//! - [`registry`] - context factory and memoized get-or-create caching
//! - [`resolver`] - per-request tenant resolution chain

pub mod context;
pub mod registry;
pub mod resolver;

pub use context::{DerivedSecrets, RuntimeOverrides, TenantConfigContext};
pub use registry::{ContextFactory, TenantRegistry, ValidatorFactory};
pub use resolver::{CustomTenantResolver, TenantResolver};
