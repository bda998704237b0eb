//! Gateway configuration.
//!
//! YAML on disk, `${VAR}` substitution, serde schema, and a validation pass
//! that turns every inconsistency into a startup failure.

mod duration;
pub mod error;
pub mod loader;
pub mod schema;

pub use duration::parse_duration;
pub use error::{ConfigError, ValidationResult, ValidationWarning};
pub use loader::{
    default_config_paths, find_config_file, load_and_validate, load_config, parse_config,
    substitute_env_vars, validate,
};
pub use schema::{
    AdminConfig, ApiKeyConfig, AuthConfig, Config, DownstreamDescriptor, IntrospectionConfig,
    JwtAlgorithm, JwtConfig, MemoryConfig, RateLimitConfig, RateLimitKeyStrategy,
    RateLimitScope, RouteConfig, RouteKind, ServerConfig, default_routes,
};
