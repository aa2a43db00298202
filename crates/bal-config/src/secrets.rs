//! Runtime secret resolution — the single source of truth for env-derived
//! connection strings.
//!
//! # Contract
//! - Config YAML never stores secret values, only env var *names*.
//! - At startup, callers invoke [`resolve_secrets`] once and pass the result
//!   into constructors; don't scatter `std::env::var` calls elsewhere.
//! - `Debug` on [`ResolvedSecrets`] redacts every value.
//! - Error messages reference the env var NAME, never the value.

use anyhow::Result;

/// All runtime-resolved connection secrets for one process.
///
/// Built once at startup via [`resolve_secrets`]. Values are redacted in
/// `Debug` output.
#[derive(Clone)]
pub struct ResolvedSecrets {
    pub database_url: String,
    pub kafka_brokers: String,
    pub redis_url: String,
}

impl std::fmt::Debug for ResolvedSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedSecrets")
            .field("database_url", &"<REDACTED>")
            .field("kafka_brokers", &"<REDACTED>")
            .field("redis_url", &"<REDACTED>")
            .finish()
    }
}

pub const ENV_DATABASE_URL: &str = "BAL_DATABASE_URL";
pub const ENV_KAFKA_BROKERS: &str = "BAL_KAFKA_BROKERS";
pub const ENV_REDIS_URL: &str = "BAL_REDIS_URL";

/// Read a named environment variable, treating blank values as absent.
fn resolve_env(var_name: &str) -> Option<String> {
    match std::env::var(var_name) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// Resolve the three required infrastructure secrets from the environment.
///
/// # Errors
/// Returns `Err` naming the first missing required env var. The actual
/// value, if any, is never included in the error.
pub fn resolve_secrets() -> Result<ResolvedSecrets> {
    let database_url = resolve_env(ENV_DATABASE_URL).ok_or_else(|| {
        anyhow::anyhow!(
            "SECRETS_MISSING: required env var '{}' (Postgres DSN) is not set or empty",
            ENV_DATABASE_URL
        )
    })?;

    let kafka_brokers = resolve_env(ENV_KAFKA_BROKERS).ok_or_else(|| {
        anyhow::anyhow!(
            "SECRETS_MISSING: required env var '{}' (Kafka bootstrap servers) is not set or empty",
            ENV_KAFKA_BROKERS
        )
    })?;

    let redis_url = resolve_env(ENV_REDIS_URL).ok_or_else(|| {
        anyhow::anyhow!(
            "SECRETS_MISSING: required env var '{}' (Redis URL) is not set or empty",
            ENV_REDIS_URL
        )
    })?;

    Ok(ResolvedSecrets {
        database_url,
        kafka_brokers,
        redis_url,
    })
}

/// Like [`resolve_secrets`] but validated against an explicit map, used by
/// tests that must not touch process-global environment state.
pub fn resolve_secrets_from(vars: &std::collections::HashMap<String, String>) -> Result<ResolvedSecrets> {
    let get = |name: &str| -> Option<String> {
        vars.get(name).map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
    };

    let database_url = get(ENV_DATABASE_URL)
        .ok_or_else(|| anyhow::anyhow!("SECRETS_MISSING: required env var '{}'", ENV_DATABASE_URL))?;
    let kafka_brokers = get(ENV_KAFKA_BROKERS)
        .ok_or_else(|| anyhow::anyhow!("SECRETS_MISSING: required env var '{}'", ENV_KAFKA_BROKERS))?;
    let redis_url = get(ENV_REDIS_URL)
        .ok_or_else(|| anyhow::anyhow!("SECRETS_MISSING: required env var '{}'", ENV_REDIS_URL))?;

    Ok(ResolvedSecrets {
        database_url,
        kafka_brokers,
        redis_url,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn full_vars() -> HashMap<String, String> {
        let mut m = HashMap::new();
        m.insert(ENV_DATABASE_URL.to_string(), "postgres://localhost/bal".to_string());
        m.insert(ENV_KAFKA_BROKERS.to_string(), "localhost:9092".to_string());
        m.insert(ENV_REDIS_URL.to_string(), "redis://localhost".to_string());
        m
    }

    #[test]
    fn resolves_when_all_present() {
        let secrets = resolve_secrets_from(&full_vars()).unwrap();
        assert_eq!(secrets.database_url, "postgres://localhost/bal");
    }

    #[test]
    fn errors_naming_the_missing_var() {
        let mut vars = full_vars();
        vars.remove(ENV_KAFKA_BROKERS);
        let err = resolve_secrets_from(&vars).unwrap_err();
        assert!(format!("{err}").contains(ENV_KAFKA_BROKERS));
    }

    #[test]
    fn blank_value_is_treated_as_missing() {
        let mut vars = full_vars();
        vars.insert(ENV_REDIS_URL.to_string(), "   ".to_string());
        assert!(resolve_secrets_from(&vars).is_err());
    }

    #[test]
    fn debug_output_redacts_values() {
        let secrets = resolve_secrets_from(&full_vars()).unwrap();
        let debug = format!("{secrets:?}");
        assert!(!debug.contains("localhost"));
        assert!(debug.contains("REDACTED"));
    }
}
