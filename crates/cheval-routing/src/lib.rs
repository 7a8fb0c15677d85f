//! Routing for the Cheval gateway.
//!
//! Resolves agent names through alias chains to concrete
//! `provider:model-id` pairs, walks fallback and downgrade chains when
//! a provider fails or the budget pushes back, gates providers behind a
//! file-persisted circuit breaker, and filters outgoing context by
//! per-model epistemic trust scopes.

pub mod breaker;
pub mod chains;
pub mod filter;
pub mod resolver;

pub use breaker::{BreakerState, CircuitBreaker};
pub use chains::{validate_chains, walk_downgrade_chain, walk_fallback_chain};
pub use filter::{
    audit_filter_context, filter_context, ContextAccess, PermissionsCache, ScopeLevel,
};
pub use resolver::{resolve_alias, resolve_execution, validate_bindings};
