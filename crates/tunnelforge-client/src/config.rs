//! Client configuration (§2a, §6): an on-disk JSON file per user, overridden
//! by CLI flags, matching the `clap` + on-disk `Settings` layering of the
//! teacher's top-level CLI.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// `{serverUrl, apiKey, portSubdomains?: {<port>: <subdomain>}}` (§6). The
/// `port_subdomains` map is the client-side half of subdomain stickiness; the
/// server-side cache is independent and authoritative on conflict.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    #[serde(default)]
    pub server_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub port_subdomains: HashMap<u16, String>,
}

impl ClientConfig {
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tunnelforge")
            .join("client.json")
    }

    pub async fn load(path: &Path) -> color_eyre::Result<Self> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, path: &Path) -> color_eyre::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let contents = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(path, contents).await?;
        Ok(())
    }

    pub fn remember_subdomain(&mut self, port: u16, subdomain: String) {
        self.port_subdomains.insert(port, subdomain);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn load_missing_file_returns_default() {
        let dir = tempdir().unwrap();
        let config = ClientConfig::load(&dir.path().join("missing.json")).await.unwrap();
        assert!(config.server_url.is_empty());
        assert!(config.port_subdomains.is_empty());
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("client.json");
        let mut config = ClientConfig {
            server_url: "https://tunnel.example.com".to_string(),
            api_key: "secret".to_string(),
            ..Default::default()
        };
        config.remember_subdomain(3000, "brave-fox-abcd".to_string());
        config.save(&path).await.unwrap();

        let reloaded = ClientConfig::load(&path).await.unwrap();
        assert_eq!(reloaded.server_url, "https://tunnel.example.com");
        assert_eq!(reloaded.port_subdomains.get(&3000).map(String::as_str), Some("brave-fox-abcd"));
    }
}
