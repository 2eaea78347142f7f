//! # gantry-config
//!
//! Configuration for the Gantry gateway: the `gantry.toml` schema with
//! env-var overrides, a loader with file watching, and the hot-reloaded
//! alias store.

pub mod aliases;
pub mod loader;
pub mod schema;

pub use aliases::{AliasStore, split_spec};
pub use loader::ConfigLoader;
pub use schema::{
    CircuitBreakerSettings, CostRates, FailoverSettings, GantryConfig, LoggingConfig,
    ProviderConfig, QueueSettings, RateLimitSettings, RetrySettings, RouterConfig, ServerConfig,
};
