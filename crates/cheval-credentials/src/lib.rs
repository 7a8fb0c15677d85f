//! Layered credential resolution for the Cheval gateway.
//!
//! A composite provider queries sub-providers in a fixed priority order
//! (environment, then project dotenv) and returns the first hit. Health
//! checks validate known credentials either structurally (format-only,
//! dry-run-safe) or against the provider's live endpoint.

pub mod chain;
pub mod health;

pub use chain::{default_chain, CompositeProvider, CredentialProvider, DotenvProvider, EnvProvider};
pub use health::{
    check_all_format, check_all_live, check_format, HealthReport, HealthStatus, KNOWN_CREDENTIALS,
};
