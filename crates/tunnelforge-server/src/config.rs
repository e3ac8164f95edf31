//! Server configuration (§2a, §6): a TOML file layered under environment
//! variable overrides, with `#[serde(default)]` per-field fallbacks.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

fn default_tunnel_port() -> u16 {
    3100
}

fn default_cache_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tunnelforge")
        .join("subdomains.json")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Single pre-shared secret (§4.8). Required.
    pub api_key: String,
    /// Wildcard base domain, e.g. `tunnel.example.com`. Required.
    pub base_domain: String,
    #[serde(default = "default_tunnel_port")]
    pub tunnel_port: u16,
    /// Used by an external collaborator to register per-subdomain routes;
    /// the core itself never calls out to it.
    #[serde(default)]
    pub caddy_admin_url: Option<String>,
    #[serde(default = "default_cache_path")]
    pub cache_path: PathBuf,
}

impl ServerConfig {
    /// Load from an optional TOML file, then apply environment overrides.
    /// `API_KEY` and `BASE_DOMAIN` are required by one source or the other.
    pub fn load(path: Option<&Path>) -> color_eyre::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| color_eyre::eyre::eyre!("failed to read {}: {e}", path.display()))?;
                toml::from_str::<ServerConfig>(&text)?
            }
            None => ServerConfig {
                api_key: String::new(),
                base_domain: String::new(),
                tunnel_port: default_tunnel_port(),
                caddy_admin_url: None,
                cache_path: default_cache_path(),
            },
        };

        if let Ok(key) = std::env::var("API_KEY") {
            config.api_key = key;
        }
        if let Ok(domain) = std::env::var("BASE_DOMAIN") {
            config.base_domain = domain;
        }
        if let Ok(port) = std::env::var("TUNNEL_PORT") {
            config.tunnel_port = port
                .parse()
                .map_err(|_| color_eyre::eyre::eyre!("TUNNEL_PORT must be a u16, got {port:?}"))?;
        }
        if let Ok(admin_url) = std::env::var("CADDY_ADMIN_URL") {
            config.caddy_admin_url = Some(admin_url);
        }

        if config.api_key.is_empty() {
            return Err(color_eyre::eyre::eyre!("API_KEY is required (env or config file)"));
        }
        if config.base_domain.is_empty() {
            return Err(color_eyre::eyre::eyre!("BASE_DOMAIN is required (env or config file)"));
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_api_key_without_env_is_rejected() {
        // SAFETY: test runs single-threaded within this process's env mutation.
        std::env::remove_var("API_KEY");
        std::env::remove_var("BASE_DOMAIN");
        let result = ServerConfig::load(None);
        assert!(result.is_err());
    }

    #[test]
    fn env_vars_populate_a_config_with_no_file() {
        std::env::set_var("API_KEY", "test-key");
        std::env::set_var("BASE_DOMAIN", "tunnel.example.com");
        let config = ServerConfig::load(None).unwrap();
        assert_eq!(config.api_key, "test-key");
        assert_eq!(config.base_domain, "tunnel.example.com");
        assert_eq!(config.tunnel_port, 3100);
        std::env::remove_var("API_KEY");
        std::env::remove_var("BASE_DOMAIN");
    }
}
