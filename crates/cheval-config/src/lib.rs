//! Layered configuration for the Cheval gateway.
//!
//! Configuration is assembled from four layers, lowest precedence first:
//!
//! 1. Embedded system defaults (`defaults.yaml`)
//! 2. Project config (`.loa.config.yaml`, `hounfour:` section)
//! 3. Environment overrides (`LOA_MODEL` only)
//! 4. CLI overrides
//!
//! Every leaf carries a provenance tag naming its source layer. After
//! the merge, `{env:VAR}` and `{file:PATH}` interpolation tokens are
//! resolved under allowlist and file-permission checks; resolved values
//! never appear in the effective-config display.

pub mod display;
pub mod interpolate;
pub mod loader;
pub mod schema;
pub mod validate;

pub use display::effective_config_display;
pub use interpolate::{interpolate_tree, InterpolationContext};
pub use loader::{find_project_root, load_config, CliOverrides, ConfigCache, ConfigLayer, LoadedConfig};
pub use schema::{
    AgentConfig, ApiMode, BreakerSettings, BudgetConfig, ContextFilterMode, FeatureFlags,
    HounfourConfig, InvokeDefaults, MeteringConfig, ModelConfig, ModelExtra, OnExceeded,
    PricingConfig, PricingMode, ProviderConfig, ProviderKind, RateLimitConfig, RequireLevel,
    RetryConfig, RoutingConfig, SecretString,
};
pub use validate::detect_alias_cycles;
