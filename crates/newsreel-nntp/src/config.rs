//! Provider configuration.

use serde::{Deserialize, Serialize};

/// One news provider, as declared by the session configuration.
///
/// Providers are ordered: the first is the primary, later entries are
/// spill-over targets used when the primary is saturated or missing an
/// article.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Display name used in logs; defaults to the host when empty.
    #[serde(default)]
    pub name: String,

    /// Server host name or address.
    pub host: String,

    /// Server port, typically 119 or 563 (TLS).
    pub port: u16,

    /// Connect through TLS.
    #[serde(default)]
    pub tls: bool,

    /// Account user name; providers without credentials skip the
    /// authentication exchange entirely.
    #[serde(default)]
    pub username: Option<String>,

    /// Account password.
    #[serde(default)]
    pub password: Option<String>,

    /// Connection budget for this provider.
    pub max_connections: usize,
}

impl ProviderConfig {
    /// Socket address string for dialing.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Name for diagnostics.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.host
        } else {
            &self.name
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_falls_back_to_host() {
        let config = ProviderConfig {
            name: String::new(),
            host: "news.example.com".to_string(),
            port: 563,
            tls: true,
            username: None,
            password: None,
            max_connections: 8,
        };
        assert_eq!(config.display_name(), "news.example.com");
        assert_eq!(config.addr(), "news.example.com:563");
    }
}
