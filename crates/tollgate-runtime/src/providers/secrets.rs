//! Secure credential handling for provider backends.
//!
//! Every provider that needs an API key stores it as an [`ApiCredential`]:
//!
//! - **No accidental logging**: Debug/Display print `[REDACTED]`
//! - **Memory safety**: the value is zeroed on drop
//! - **Explicit exposure**: only `.expose()` yields the raw key, at the
//!   point of use (an HTTP header), never for storage

use secrecy::{ExposeSecret, SecretString};
use serde_json::Value as JsonValue;
use std::fmt;

use super::ProviderError;

/// Where a credential was loaded from. Safe to log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    /// Loaded from configuration JSON
    Config,
    /// Loaded from an environment variable
    Environment,
    /// Provided programmatically
    Programmatic,
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialSource::Config => write!(f, "config"),
            CredentialSource::Environment => write!(f, "environment"),
            CredentialSource::Programmatic => write!(f, "programmatic"),
        }
    }
}

/// A securely-stored API credential with source tracking.
pub struct ApiCredential {
    value: SecretString,
    source: CredentialSource,
    name: &'static str,
}

impl ApiCredential {
    /// Wrap a raw key. After this point it cannot be accidentally printed.
    pub fn new(value: impl Into<String>, source: CredentialSource, name: &'static str) -> Self {
        Self {
            value: SecretString::from(value.into()),
            source,
            name,
        }
    }

    /// Load from an environment variable.
    pub fn from_env(env_var: &str, name: &'static str) -> Result<Self, ProviderError> {
        std::env::var(env_var)
            .map(|v| Self::new(v, CredentialSource::Environment, name))
            .map_err(|_| {
                ProviderError::NotConfigured(format!(
                    "{} not set: configure '{}' environment variable",
                    name, env_var
                ))
            })
    }

    /// Load from JSON config, falling back to an environment variable.
    /// The recommended path for provider factories.
    pub fn from_config_or_env(
        config: &JsonValue,
        config_key: &str,
        env_var: &str,
        name: &'static str,
    ) -> Result<Self, ProviderError> {
        if let Some(value) = config[config_key].as_str() {
            return Ok(Self::new(value, CredentialSource::Config, name));
        }

        if let Ok(value) = std::env::var(env_var) {
            return Ok(Self::new(value, CredentialSource::Environment, name));
        }

        Err(ProviderError::NotConfigured(format!(
            "{} required: set '{}' in config or {} environment variable",
            name, config_key, env_var
        )))
    }

    /// Check availability without loading. Used by factory validation.
    pub fn is_available(config: &JsonValue, config_key: &str, env_var: &str) -> bool {
        config[config_key].as_str().is_some() || std::env::var(env_var).is_ok()
    }

    /// Expose the raw value. Only call at the point of use; never store
    /// the returned reference's contents.
    pub fn expose(&self) -> &str {
        self.value.expose_secret()
    }

    pub fn is_empty(&self) -> bool {
        self.value.expose_secret().is_empty()
    }

    pub fn source(&self) -> CredentialSource {
        self.source
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredential")
            .field("value", &"[REDACTED]")
            .field("source", &self.source)
            .field("name", &self.name)
            .finish()
    }
}

impl fmt::Display for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} from {} [REDACTED]", self.name, self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_redacted_in_debug() {
        let secret = "sk-super-secret-key-12345";
        let cred = ApiCredential::new(secret, CredentialSource::Programmatic, "Test API key");

        let debug = format!("{:?}", cred);
        assert!(!debug.contains(secret), "Secret exposed in Debug!");
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_credential_redacted_in_display() {
        let secret = "sk-super-secret-key-12345";
        let cred = ApiCredential::new(secret, CredentialSource::Config, "Test API key");

        let display = format!("{}", cred);
        assert!(!display.contains(secret), "Secret exposed in Display!");
        assert!(display.contains("[REDACTED]"));
        assert!(display.contains("config"));
    }

    #[test]
    fn test_credential_expose() {
        let secret = "sk-super-secret-key-12345";
        let cred = ApiCredential::new(secret, CredentialSource::Programmatic, "Test API key");
        assert_eq!(cred.expose(), secret);
    }

    #[test]
    fn test_from_config_or_env_prefers_config() {
        let config = serde_json::json!({"api_key": "config-key"});

        std::env::set_var("TOLLGATE_TEST_KEY_PRIORITY", "env-key");
        let cred = ApiCredential::from_config_or_env(
            &config,
            "api_key",
            "TOLLGATE_TEST_KEY_PRIORITY",
            "Test key",
        )
        .unwrap();

        assert_eq!(cred.expose(), "config-key");
        assert_eq!(cred.source(), CredentialSource::Config);

        std::env::remove_var("TOLLGATE_TEST_KEY_PRIORITY");
    }

    #[test]
    fn test_from_config_or_env_falls_back_to_env() {
        let config = serde_json::json!({});

        std::env::set_var("TOLLGATE_TEST_KEY_FALLBACK", "env-key");
        let cred = ApiCredential::from_config_or_env(
            &config,
            "api_key",
            "TOLLGATE_TEST_KEY_FALLBACK",
            "Test key",
        )
        .unwrap();

        assert_eq!(cred.expose(), "env-key");
        assert_eq!(cred.source(), CredentialSource::Environment);

        std::env::remove_var("TOLLGATE_TEST_KEY_FALLBACK");
    }

    #[test]
    fn test_from_config_or_env_error_when_missing() {
        let result = ApiCredential::from_config_or_env(
            &serde_json::json!({}),
            "api_key",
            "TOLLGATE_NONEXISTENT_VAR",
            "Test key",
        );

        let err = result.unwrap_err();
        assert!(err.to_string().contains("Test key"));
        assert!(err.to_string().contains("TOLLGATE_NONEXISTENT_VAR"));
    }

    #[test]
    fn test_is_available() {
        let config = serde_json::json!({"api_key": "value"});

        assert!(ApiCredential::is_available(&config, "api_key", "NONEXISTENT"));
        assert!(!ApiCredential::is_available(
            &serde_json::json!({}),
            "api_key",
            "NONEXISTENT"
        ));
    }
}
