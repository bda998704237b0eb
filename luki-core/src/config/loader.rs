//! Configuration loading and validation.
//!
//! The loaded [`Config`] is validated once and then treated as immutable for
//! the life of the process.

use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use super::error::{ConfigError, ValidationResult, ValidationWarning};
use super::schema::{Config, JwtAlgorithm, RouteKind};

/// Configuration file search paths (in priority order).
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Ok(path) = std::env::var("LUKI_CONFIG") {
        paths.push(PathBuf::from(path));
    }

    paths.push(PathBuf::from("/etc/luki/config.yaml"));
    paths.push(PathBuf::from("./config.yaml"));

    paths
}

/// Find the first existing config file from the search paths.
///
/// An explicit path (CLI flag) is never silently replaced by a default.
pub fn find_config_file(explicit_path: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit_path {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(ConfigError::NotFound {
            searched: vec![path.to_path_buf()],
        });
    }

    let paths = default_config_paths();
    for path in &paths {
        if path.exists() {
            return Ok(path.clone());
        }
    }

    Err(ConfigError::NotFound { searched: paths })
}

/// Load configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&contents)
}

/// Parse configuration text (after env substitution).
pub fn parse_config(contents: &str) -> Result<Config, ConfigError> {
    if contents.trim().is_empty() {
        return Err(ConfigError::Empty);
    }

    let contents = substitute_env_vars(contents)?;
    let config: Config = serde_saphyr::from_str(&contents)?;

    Ok(config)
}

/// Load and validate configuration.
pub fn load_and_validate(path: &Path) -> Result<(Config, ValidationResult), ConfigError> {
    let config = load_config(path)?;
    let result = validate(&config)?;
    Ok((config, result))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Environment Variable Substitution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

// SAFETY: .expect() on LazyLock with a compile-time literal regex pattern.
// The pattern is known-valid and tested by test_env_var_pattern_compiles().
static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
        .expect("BUG: ENV_VAR_PATTERN regex is invalid")
});

/// Substitute environment variables in a string.
///
/// # Syntax
/// - `${VAR}` - Required, fail if not set
/// - `${VAR:-default}` - Optional with default
pub fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let mut missing: Option<String> = None;

    let result = ENV_VAR_PATTERN.replace_all(content, |cap: &regex::Captures<'_>| {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(value) => value,
            Err(_) => match cap.get(2) {
                Some(default) => default.as_str().to_string(),
                None => {
                    missing.get_or_insert_with(|| var_name.to_string());
                    String::new()
                }
            },
        }
    });

    if let Some(var) = missing {
        return Err(ConfigError::MissingEnvVar {
            var,
            field: "configuration".to_string(),
        });
    }

    Ok(result.into_owned())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Validate a parsed configuration.
///
/// Returns the first fatal error, or the list of non-fatal warnings.
pub fn validate(config: &Config) -> Result<ValidationResult, ConfigError> {
    let mut warnings = Vec::new();

    validate_server(config)?;
    validate_rate_limit(config)?;
    validate_downstreams(config)?;
    validate_auth(config, &mut warnings)?;

    let routes = config.effective_routes();
    let mut seen = HashSet::new();
    let mut referenced: HashSet<&str> = HashSet::new();

    for (i, route) in routes.iter().enumerate() {
        if !route.path.starts_with('/') {
            return Err(ConfigError::invalid(
                format!("routes[{i}].path"),
                "must start with '/'",
            ));
        }
        if config.downstream(&route.downstream).is_none() {
            return Err(ConfigError::UnknownDownstream {
                name: route.downstream.clone(),
                field: format!("routes[{i}].downstream"),
            });
        }
        if route.methods.is_empty() {
            return Err(ConfigError::invalid(
                format!("routes[{i}].methods"),
                "at least one method is required",
            ));
        }
        for method in &route.methods {
            let parsed = http::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                .map_err(|e| ConfigError::invalid(format!("routes[{i}].methods"), e.to_string()))?;
            if route.kind == RouteKind::Chat && parsed != http::Method::POST {
                return Err(ConfigError::invalid(
                    format!("routes[{i}].methods"),
                    "chat routes accept POST only",
                ));
            }
            if !seen.insert((parsed.to_string(), route.path.clone())) {
                return Err(ConfigError::DuplicateRoute {
                    method: parsed.to_string(),
                    path: route.path.clone(),
                });
            }
        }
        if route.cost == 0 || route.cost > config.rate_limit.capacity {
            return Err(ConfigError::invalid(
                format!("routes[{i}].cost"),
                format!(
                    "must be between 1 and rate_limit.capacity ({})",
                    config.rate_limit.capacity
                ),
            ));
        }
        referenced.insert(route.downstream.as_str());
    }

    if let Some(memory) = &config.memory {
        if config.downstream(&memory.downstream).is_none() {
            warnings.push(ValidationWarning::MemoryDisabled {
                name: memory.downstream.clone(),
            });
        } else {
            referenced.insert(memory.downstream.as_str());
        }
    }

    for name in config.downstreams.keys() {
        if !referenced.contains(name.as_str()) {
            warnings.push(ValidationWarning::UnusedDownstream { name: name.clone() });
        }
    }

    Ok(ValidationResult { warnings })
}

fn validate_server(config: &Config) -> Result<(), ConfigError> {
    if config.server.request_timeout.is_zero() {
        return Err(ConfigError::invalid(
            "server.request_timeout",
            "must be greater than zero",
        ));
    }
    if config.server.stream_max_duration.is_zero() {
        return Err(ConfigError::invalid(
            "server.stream_max_duration",
            "must be greater than zero",
        ));
    }
    for origin in &config.server.allowed_origins {
        if origin == "*" {
            continue;
        }
        let valid = reqwest::Url::parse(origin).is_ok_and(|url| {
            matches!(url.scheme(), "http" | "https")
                && url.path() == "/"
                && !origin.ends_with('/')
        });
        if !valid {
            return Err(ConfigError::invalid(
                "server.allowed_origins",
                format!("'{origin}' is not an origin (scheme://host[:port])"),
            ));
        }
    }
    Ok(())
}

fn validate_rate_limit(config: &Config) -> Result<(), ConfigError> {
    let rl = &config.rate_limit;
    if rl.capacity == 0 {
        return Err(ConfigError::invalid(
            "rate_limit.capacity",
            "must be greater than zero",
        ));
    }
    let rate = rl.refill_rate();
    if !rate.is_finite() || rate <= 0.0 {
        return Err(ConfigError::invalid(
            "rate_limit.refill_per_second",
            format!("refill rate must be a positive number, got {rate}"),
        ));
    }
    Ok(())
}

fn validate_downstreams(config: &Config) -> Result<(), ConfigError> {
    for (name, d) in &config.downstreams {
        let url = reqwest::Url::parse(&d.base_url).map_err(|e| ConfigError::InvalidUrl {
            url: d.base_url.clone(),
            message: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidUrl {
                url: d.base_url.clone(),
                message: format!("unsupported scheme '{}'", url.scheme()),
            });
        }
        if d.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                format!("downstreams.{name}.failure_threshold"),
                "must be greater than zero",
            ));
        }
        if d.max_connections == 0 {
            return Err(ConfigError::invalid(
                format!("downstreams.{name}.max_connections"),
                "must be greater than zero",
            ));
        }
        if d.timeout.is_zero() {
            return Err(ConfigError::invalid(
                format!("downstreams.{name}.timeout"),
                "must be greater than zero",
            ));
        }
    }
    Ok(())
}

fn validate_auth(config: &Config, warnings: &mut Vec<ValidationWarning>) -> Result<(), ConfigError> {
    let auth = &config.auth;

    let mut ids = HashSet::new();
    for (i, key) in auth.api_keys.iter().enumerate() {
        if key.key.trim().is_empty() {
            return Err(ConfigError::invalid(
                format!("auth.api_keys[{i}].key"),
                "must not be empty",
            ));
        }
        if !ids.insert(key.id.as_str()) {
            return Err(ConfigError::invalid(
                format!("auth.api_keys[{i}].id"),
                format!("duplicate id '{}'", key.id),
            ));
        }
    }

    if let Some(jwt) = &auth.jwt {
        match jwt.algorithm {
            JwtAlgorithm::HS256 if jwt.secret.as_deref().is_none_or(str::is_empty) => {
                return Err(ConfigError::InvalidJwtKey {
                    message: "HS256 requires auth.jwt.secret".to_string(),
                });
            }
            JwtAlgorithm::RS256 if jwt.public_key_pem.is_none() => {
                return Err(ConfigError::InvalidJwtKey {
                    message: "RS256 requires auth.jwt.public_key_pem".to_string(),
                });
            }
            _ => {}
        }
    }

    if let Some(introspection) = &auth.introspection {
        reqwest::Url::parse(&introspection.url).map_err(|e| ConfigError::InvalidUrl {
            url: introspection.url.clone(),
            message: e.to_string(),
        })?;
    }

    if auth.api_keys.is_empty()
        && auth.jwt.is_none()
        && auth.introspection.is_none()
        && !auth.allow_anonymous
    {
        warnings.push(ValidationWarning::NoCredentialSources);
    }

    Ok(())
}
