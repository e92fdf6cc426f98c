//! Provider configuration block.
//!
//! Every attribute may be left out of the configuration and supplied through
//! the environment instead:
//!
//! | attribute         | environment   | default                  |
//! |-------------------|---------------|--------------------------|
//! | `endpoint`        | `RS_ENDPOINT` | `https://127.0.0.1:8092` |
//! | `username`        | `RS_USERNAME` |                          |
//! | `password`        | `RS_PASSWORD` |                          |
//! | `token`           | `RS_TOKEN`    |                          |
//! | `insecure`        | `RS_INSECURE` | `true`                   |
//! | `request_timeout` |               | 30 seconds               |
//!
//! Either `token` or both `username` and `password` must end up set.

use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::schema::{Attribute, Diagnostic, Schema};

/// Endpoint used when neither the configuration nor `RS_ENDPOINT` sets one.
pub const DEFAULT_ENDPOINT: &str = "https://127.0.0.1:8092";

/// Request timeout used when `request_timeout` is unset.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The provider block as written by the user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// DRP API endpoint.
    pub endpoint: Option<String>,
    /// Basic auth user.
    pub username: Option<String>,
    /// Basic auth password.
    pub password: Option<String>,
    /// Bearer token, preferred over username/password.
    pub token: Option<String>,
    /// Skip TLS certificate verification.
    pub insecure: Option<bool>,
    /// Per-request timeout in seconds.
    pub request_timeout: Option<u64>,
}

/// How requests authenticate.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// `Authorization: Bearer <token>`.
    Token(String),
    /// HTTP basic auth.
    Basic {
        /// User name.
        username: String,
        /// Password.
        password: String,
    },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Token(_) => f.write_str("Token(<redacted>)"),
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// Fully resolved settings used to build a [`crate::client::DrpClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    /// DRP endpoint, without the `/api/v3` suffix.
    pub endpoint: Url,
    /// Credentials.
    pub credentials: Credentials,
    /// Skip TLS certificate verification.
    pub insecure: bool,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl ProviderConfig {
    /// Parse the configuration JSON sent by the host.
    pub fn from_value(value: serde_json::Value) -> Result<Self, Vec<Diagnostic>> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value).map_err(|err| {
            vec![Diagnostic::error("Invalid provider configuration").with_detail(err.to_string())]
        })
    }

    /// Resolve against the process environment.
    pub fn resolve(self) -> Result<ClientSettings, Vec<Diagnostic>> {
        self.resolve_with(|key| std::env::var(key).ok())
    }

    /// Resolve, reading fallbacks through `env`.
    pub fn resolve_with(
        self,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<ClientSettings, Vec<Diagnostic>> {
        let mut diagnostics = Vec::new();

        let endpoint = non_empty(self.endpoint)
            .or_else(|| non_empty(env("RS_ENDPOINT")))
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        let endpoint = match Url::parse(&endpoint) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Some(url),
            Ok(url) => {
                diagnostics.push(
                    Diagnostic::error("Unsupported endpoint scheme")
                        .with_detail(format!("{} must use http or https", url))
                        .with_attribute("endpoint"),
                );
                None
            },
            Err(err) => {
                diagnostics.push(
                    Diagnostic::error("Invalid endpoint")
                        .with_detail(format!("{}: {}", endpoint, err))
                        .with_attribute("endpoint"),
                );
                None
            },
        };

        let insecure = match self.insecure {
            Some(insecure) => insecure,
            None => match non_empty(env("RS_INSECURE")).as_deref() {
                None => true,
                Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                    "1" | "true" | "yes" => true,
                    "0" | "false" | "no" => false,
                    _ => {
                        diagnostics.push(
                            Diagnostic::error("Invalid RS_INSECURE")
                                .with_detail(format!("expected a boolean, got {:?}", raw))
                                .with_attribute("insecure"),
                        );
                        true
                    },
                },
            },
        };

        let request_timeout = match self.request_timeout {
            Some(0) => {
                diagnostics.push(
                    Diagnostic::error("request_timeout must be positive")
                        .with_attribute("request_timeout"),
                );
                DEFAULT_REQUEST_TIMEOUT
            },
            Some(secs) => Duration::from_secs(secs),
            None => DEFAULT_REQUEST_TIMEOUT,
        };

        let token = non_empty(self.token).or_else(|| non_empty(env("RS_TOKEN")));
        let username = non_empty(self.username).or_else(|| non_empty(env("RS_USERNAME")));
        let password = non_empty(self.password).or_else(|| non_empty(env("RS_PASSWORD")));

        let credentials = match (token, username, password) {
            (Some(token), _, _) => Some(Credentials::Token(token)),
            (None, Some(username), Some(password)) => {
                Some(Credentials::Basic { username, password })
            },
            (None, Some(_), None) => {
                diagnostics.push(
                    Diagnostic::error("Missing password")
                        .with_detail("username is set but neither password nor RS_PASSWORD is")
                        .with_attribute("password"),
                );
                None
            },
            (None, None, _) => {
                diagnostics.push(
                    Diagnostic::error("Missing credentials")
                        .with_detail("set token (RS_TOKEN) or username and password (RS_USERNAME, RS_PASSWORD)")
                        .with_attribute("token"),
                );
                None
            },
        };

        match (endpoint, credentials) {
            (Some(endpoint), Some(credentials)) if diagnostics.is_empty() => Ok(ClientSettings {
                endpoint,
                credentials,
                insecure,
                request_timeout,
            }),
            _ => Err(diagnostics),
        }
    }
}

/// Schema of the provider block.
pub fn provider_schema() -> Schema {
    Schema::v0()
        .with_description("DigitalRebar Provision connection settings")
        .with_attribute(
            "endpoint",
            Attribute::optional_string()
                .with_description("DRP API endpoint, falls back to RS_ENDPOINT"),
        )
        .with_attribute(
            "username",
            Attribute::optional_string().with_description("DRP user, falls back to RS_USERNAME"),
        )
        .with_attribute(
            "password",
            Attribute::optional_string()
                .sensitive()
                .with_description("DRP password, falls back to RS_PASSWORD"),
        )
        .with_attribute(
            "token",
            Attribute::optional_string()
                .sensitive()
                .with_description("DRP auth token, falls back to RS_TOKEN"),
        )
        .with_attribute(
            "insecure",
            Attribute::optional_bool()
                .with_description("Skip TLS verification, falls back to RS_INSECURE"),
        )
        .with_attribute(
            "request_timeout",
            Attribute::optional_int64().with_description("Per-request timeout in seconds"),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_token_from_config() {
        let config = ProviderConfig::from_value(json!({
            "endpoint": "https://drp.example.com:8092",
            "token": "abc",
            "insecure": false
        }))
        .unwrap();

        let settings = config.resolve_with(env(&[])).unwrap();
        assert_eq!(settings.endpoint.as_str(), "https://drp.example.com:8092/");
        assert_eq!(settings.credentials, Credentials::Token("abc".to_string()));
        assert!(!settings.insecure);
        assert_eq!(settings.request_timeout, DEFAULT_REQUEST_TIMEOUT);
    }

    #[test]
    fn test_environment_fallback() {
        let settings = ProviderConfig::default()
            .resolve_with(env(&[
                ("RS_USERNAME", "rocketskates"),
                ("RS_PASSWORD", "r0cketsk8ts"),
                ("RS_INSECURE", "false"),
            ]))
            .unwrap();

        assert_eq!(settings.endpoint.as_str(), "https://127.0.0.1:8092/");
        assert_eq!(
            settings.credentials,
            Credentials::Basic {
                username: "rocketskates".to_string(),
                password: "r0cketsk8ts".to_string(),
            }
        );
        assert!(!settings.insecure);
    }

    #[test]
    fn test_config_beats_environment() {
        let config = ProviderConfig {
            endpoint: Some("http://10.0.0.1:8092".to_string()),
            token: Some("from-config".to_string()),
            request_timeout: Some(5),
            ..Default::default()
        };
        let settings = config
            .resolve_with(env(&[
                ("RS_ENDPOINT", "https://ignored:8092"),
                ("RS_TOKEN", "from-env"),
            ]))
            .unwrap();

        assert_eq!(settings.endpoint.host_str(), Some("10.0.0.1"));
        assert_eq!(settings.credentials, Credentials::Token("from-config".to_string()));
        assert!(settings.insecure);
        assert_eq!(settings.request_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_missing_credentials() {
        let diags = ProviderConfig::default().resolve_with(env(&[])).unwrap_err();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].attribute.as_deref(), Some("token"));

        let diags = ProviderConfig {
            username: Some("admin".to_string()),
            ..Default::default()
        }
        .resolve_with(env(&[]))
        .unwrap_err();
        assert_eq!(diags[0].attribute.as_deref(), Some("password"));
    }

    #[test]
    fn test_bad_endpoint_and_insecure() {
        let diags = ProviderConfig {
            endpoint: Some("ftp://drp".to_string()),
            token: Some("t".to_string()),
            ..Default::default()
        }
        .resolve_with(env(&[("RS_INSECURE", "maybe")]))
        .unwrap_err();

        let attrs: Vec<_> = diags.iter().filter_map(|d| d.attribute.as_deref()).collect();
        assert!(attrs.contains(&"endpoint"));
        assert!(attrs.contains(&"insecure"));
    }

    #[test]
    fn test_unknown_types_rejected() {
        assert!(ProviderConfig::from_value(json!({"insecure": "yes please"})).is_err());
        assert_eq!(
            ProviderConfig::from_value(serde_json::Value::Null).unwrap(),
            ProviderConfig::default()
        );
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let debug = format!(
            "{:?}",
            Credentials::Basic {
                username: "admin".to_string(),
                password: "hunter2".to_string(),
            }
        );
        assert!(debug.contains("admin"));
        assert!(!debug.contains("hunter2"));
        assert!(!format!("{:?}", Credentials::Token("secret".to_string())).contains("secret"));
    }

    #[test]
    fn test_schema_marks_secrets_sensitive() {
        let schema = provider_schema();
        assert!(schema.block.attributes["token"].flags.sensitive);
        assert!(schema.block.attributes["password"].flags.sensitive);
        assert!(!schema.block.attributes["endpoint"].flags.sensitive);
    }
}
