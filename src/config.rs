//! Runtime configuration.
//!
//! Settings come from an optional `vigil.toml` next to the working
//! directory, overridden by environment variables. The catalog section
//! stands in for the external tool/scope/user store: records listed
//! there are seeded into the database at startup.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::models::{Scope, Tool, User};

#[derive(Debug, Clone, Deserialize, Default)]
pub struct VigilConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub catalog: CatalogSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default)]
    pub dev_mode: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            db_path: default_db_path(),
            dev_mode: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    #[serde(default = "default_engine_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            command: default_engine_command(),
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CatalogSection {
    #[serde(default)]
    pub tools: Vec<Tool>,
    #[serde(default)]
    pub scopes: Vec<Scope>,
    #[serde(default)]
    pub users: Vec<User>,
}

fn default_port() -> u16 {
    3610
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".vigil/vigil.db")
}

fn default_engine_command() -> String {
    "vigil-engine".to_string()
}

impl VigilConfig {
    /// Load configuration: file (when present), then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file: {}", path.display()))?;
                toml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file: {}", path.display()))?
            }
            _ => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(port) = get("VIGIL_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Some(db_path) = get("VIGIL_DB_PATH") {
            self.server.db_path = PathBuf::from(db_path);
        }
        if let Some(command) = get("VIGIL_ENGINE_CMD") {
            self.engine.command = command;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let config = VigilConfig::load(Some(Path::new("/nonexistent/vigil.toml"))).unwrap();
        assert_eq!(config.server.port, 3610);
        assert_eq!(config.server.db_path, PathBuf::from(".vigil/vigil.db"));
        assert_eq!(config.engine.command, "vigil-engine");
        assert!(config.catalog.tools.is_empty());
    }

    #[test]
    fn parses_full_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.toml");
        std::fs::write(
            &path,
            r#"
[server]
port = 8080
db_path = "/tmp/vigil-test.db"
dev_mode = true

[engine]
command = "scan-engine"
args = ["--profile", "lab"]

[[catalog.tools]]
id = "t1"
slug = "nmap"
name = "Network Mapper"
enabled = true

[catalog.tools.manifest]
default_timeout_secs = 120

[[catalog.scopes]]
id = "sc1"
name = "lab"
cidrs = ["10.0.0.0/24"]
host_patterns = ["*.lab.internal"]
active = true

[[catalog.users]]
id = "u1"
name = "analyst"
role = "user"
"#,
        )
        .unwrap();

        let config = VigilConfig::load(Some(&path)).unwrap();
        assert_eq!(config.server.port, 8080);
        assert!(config.server.dev_mode);
        assert_eq!(config.engine.command, "scan-engine");
        assert_eq!(config.engine.args, vec!["--profile", "lab"]);
        assert_eq!(config.catalog.tools.len(), 1);
        assert_eq!(config.catalog.tools[0].default_timeout_secs(), Some(120));
        assert_eq!(config.catalog.scopes[0].cidrs, vec!["10.0.0.0/24"]);
        assert_eq!(config.catalog.users[0].id, "u1");
    }

    #[test]
    fn env_overrides_take_precedence() {
        let mut config = VigilConfig::default();
        config.apply_overrides_from(|key| match key {
            "VIGIL_PORT" => Some("9999".into()),
            "VIGIL_ENGINE_CMD" => Some("other-engine".into()),
            _ => None,
        });
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.engine.command, "other-engine");
        // Unparseable values are ignored, keeping the previous setting.
        config.apply_overrides_from(|key| (key == "VIGIL_PORT").then(|| "not-a-port".into()));
        assert_eq!(config.server.port, 9999);
    }
}
