//! Settings and credentials for the ttlsync CLI.
//!
//! Settings come from an optional TOML file; every key has a default. API
//! credentials are read from the environment only.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

pub const TOKEN_VAR: &str = "TTLSYNC_API_TOKEN";
pub const SECRET_VAR: &str = "TTLSYNC_API_SECRET";

/// Target platform environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Prod,
    Dev,
}

impl Environment {
    pub fn name(&self) -> &'static str {
        match self {
            Environment::Prod => "prod",
            Environment::Dev => "dev",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformSettings {
    pub api_host: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Downloads, documents, state databases, journals and run logs
    pub working_dir: PathBuf,
    /// Index of dated export directories
    pub export_base_url: String,
    pub export_file_name: String,
    pub prod: PlatformSettings,
    pub dev: PlatformSettings,
    pub batch_size: usize,
    pub timeout_secs: u64,
    /// Schema file replacing the built-in mapping
    pub schema: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("/tmp/ttlsync"),
            export_base_url: "https://cassava.ucsd.edu/sparc/archive/exports/".to_string(),
            export_file_name: "curation-export.ttl".to_string(),
            prod: PlatformSettings {
                api_host: "https://api.pennsieve.io".to_string(),
            },
            dev: PlatformSettings {
                api_host: "https://api.pennsieve.net".to_string(),
            },
            batch_size: ttlsync_core::updater::DEFAULT_BATCH_SIZE,
            timeout_secs: 300,
            schema: None,
        }
    }
}

impl Settings {
    /// Load settings from `path`, or defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let data = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {:?}", path))?;
        let settings: Settings = toml::from_str(&data)
            .with_context(|| format!("Failed to parse settings {:?}", path))?;
        if settings.batch_size == 0 {
            return Err(anyhow!("batch_size must be at least 1"));
        }
        Ok(settings)
    }

    pub fn platform(&self, env: Environment) -> &PlatformSettings {
        match env {
            Environment::Prod => &self.prod,
            Environment::Dev => &self.dev,
        }
    }

    pub fn state_db(&self, env: Environment) -> PathBuf {
        self.working_dir.join(format!("{}-state.sqlite", env))
    }

    pub fn resume_path(&self, env: Environment) -> PathBuf {
        self.working_dir.join(format!("{}-resume.json", env))
    }

    /// Local copy of an export; older versions get the offset as suffix.
    pub fn ttl_path(&self, version_offset: i32) -> PathBuf {
        if version_offset == 0 {
            self.working_dir.join(&self.export_file_name)
        } else {
            let stem = self
                .export_file_name
                .strip_suffix(".ttl")
                .unwrap_or(&self.export_file_name);
            self.working_dir
                .join(format!("{}_{}.ttl", stem, version_offset))
        }
    }

    pub fn document_path(&self) -> PathBuf {
        self.working_dir.join("full_metadata.json")
    }
}

/// API token and secret
#[derive(Clone)]
pub struct Credentials {
    pub token: String,
    pub secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &self.token)
            .field("secret", &"***")
            .finish()
    }
}

impl Credentials {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |name: &str| {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| anyhow!("{} is not set", name))
        };
        Ok(Self {
            token: get(TOKEN_VAR)?,
            secret: get(SECRET_VAR)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let settings = Settings::load(None).unwrap();
        assert_eq!(settings.platform(Environment::Prod).api_host, "https://api.pennsieve.io");
        assert_eq!(settings.platform(Environment::Dev).api_host, "https://api.pennsieve.net");
        assert_eq!(settings.batch_size, 100);
        assert_eq!(
            settings.state_db(Environment::Dev),
            PathBuf::from("/tmp/ttlsync/dev-state.sqlite")
        );
        assert_eq!(
            settings.ttl_path(0),
            PathBuf::from("/tmp/ttlsync/curation-export.ttl")
        );
        assert_eq!(
            settings.ttl_path(-1),
            PathBuf::from("/tmp/ttlsync/curation-export_-1.ttl")
        );
    }

    #[test]
    fn test_partial_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ttlsync.toml");
        fs::write(
            &path,
            "working_dir = \"/data/sync\"\nbatch_size = 25\n\n[dev]\napi_host = \"http://localhost:9000\"\n",
        )
        .unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.working_dir, PathBuf::from("/data/sync"));
        assert_eq!(settings.batch_size, 25);
        assert_eq!(settings.dev.api_host, "http://localhost:9000");
        assert_eq!(settings.prod.api_host, "https://api.pennsieve.io");
        assert_eq!(
            settings.resume_path(Environment::Prod),
            PathBuf::from("/data/sync/prod-resume.json")
        );
    }

    #[test]
    fn test_zero_batch_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ttlsync.toml");
        fs::write(&path, "batch_size = 0\n").unwrap();
        assert!(Settings::load(Some(&path)).is_err());
    }

    #[test]
    fn test_credentials() {
        let creds = Credentials::from_lookup(|name| match name {
            TOKEN_VAR => Some("tok".to_string()),
            SECRET_VAR => Some("sec".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(creds.token, "tok");
        assert!(!format!("{:?}", creds).contains("sec\""));

        let missing = Credentials::from_lookup(|name| match name {
            TOKEN_VAR => Some("tok".to_string()),
            _ => Some("  ".to_string()),
        });
        let err = missing.unwrap_err().to_string();
        assert!(err.contains(SECRET_VAR));
    }
}
