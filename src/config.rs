//! `.splash/config.yml` client configuration.

use crate::errors::*;
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_port() -> u16 {
    49000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientIdentity {
    #[serde(default = "uuid::Uuid::new_v4")]
    pub uuid: uuid::Uuid,
}

impl Default for ClientIdentity {
    fn default() -> Self {
        ClientIdentity { uuid: uuid::Uuid::new_v4() }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientIdentity,
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<ClientConfig> {
        let text = std::fs::read_to_string(path).chain_err(|| format!("reading {}", path.display()))?;
        let cfg: ClientConfig = serde_yaml::from_str(&text).chain_err(|| format!("parsing {}", path.display()))?;
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_yaml::to_string(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn round_trips_through_yaml() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.yml");
        let cfg = ClientConfig { server: ServerConfig { host: "builds.example.com".into(), port: 49000 }, client: ClientIdentity::default() };
        cfg.save(&path).unwrap();
        let loaded = ClientConfig::load(&path).unwrap();
        assert_eq!(loaded.server.host, "builds.example.com");
        assert_eq!(loaded.client.uuid, cfg.client.uuid);
    }

    #[test]
    fn port_defaults_when_absent() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.yml");
        std::fs::write(&path, "server:\n  host: builds.example.com\n").unwrap();
        let cfg = ClientConfig::load(&path).unwrap();
        assert_eq!(cfg.server.port, 49000);
    }
}
