//! popgen configuration
//!
//! Loaded from TOML at startup, falls back to defaults if no config file exists.

use crate::types::Role;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PopgenConfig {
    pub server: ServerConfig,
    pub generator: GeneratorConfig,
    pub registry: RegistryConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: BindMode,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            bind: BindMode::default(),
        }
    }
}

/// Bind mode for the HTTP server
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindMode {
    Loopback,
    #[default]
    Lan,
}

impl BindMode {
    pub fn to_addr(&self) -> &str {
        match self {
            BindMode::Loopback => "127.0.0.1",
            BindMode::Lan => "0.0.0.0",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "loopback" | "localhost" | "127.0.0.1" => BindMode::Loopback,
            _ => BindMode::Lan,
        }
    }
}

/// Where the external generator lives and how it is run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Working directory of the generator process.
    pub root: PathBuf,
    /// Program to execute, resolved relative to `root` when relative.
    pub program: String,
    /// Arguments placed before the generated ones, e.g. a script when
    /// `program` is an interpreter.
    pub args: Vec<String>,
    /// Output directory, relative to `root` when relative. Holds one
    /// subdirectory per format.
    pub output_dir: PathBuf,
    /// Kill the generator after this many seconds. `None` waits forever.
    pub timeout_secs: Option<u64>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/synthea"),
            program: "./run_synthea".to_string(),
            args: Vec::new(),
            output_dir: PathBuf::from("output"),
            timeout_secs: Some(3600),
        }
    }
}

impl GeneratorConfig {
    pub fn output_root(&self) -> PathBuf {
        self.root.join(&self.output_dir)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// JSON file holding run records. In-memory only when unset.
    pub path: Option<PathBuf>,
}

/// Authentication configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub mode: AuthMode,
    pub users: Vec<UserEntry>,
}

/// Authentication mode
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    Token,
    None,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserEntry {
    pub username: String,
    pub token: String,
    #[serde(default)]
    pub role: Role,
}

// ============================================================
// Loading
// ============================================================

impl PopgenConfig {
    /// Load config from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {} - using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!("No config at {} - using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Default path: $POPGEN_CONFIG, else ./popgen.toml
    pub fn default_path() -> PathBuf {
        std::env::var("POPGEN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("popgen.toml"))
    }

    /// Write the current config as TOML (for generating a default config file).
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}
