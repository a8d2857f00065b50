// ABOUTME: Auditor configuration - JSON document merged over built-in defaults
// ABOUTME: Selects the source backend and the audit store location and policies

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Bundled sample database scanned when no target is configured
pub const DEFAULT_TARGET_DATABASE: &str = "Chinook_Sqlite.sqlite";
pub const DEFAULT_AUDIT_DATABASE: &str = "audit.db";
pub const DEFAULT_CONFIG_FILE: &str = "config.json";
/// Pending entries committed per transaction
pub const DEFAULT_BATCH_SIZE: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    Sqlite,
    Postgres,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Sqlite => "sqlite",
            SourceKind::Postgres => "postgres",
        }
    }
}

/// What to do with prior fingerprints no scanned row matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionPolicy {
    /// Count only
    #[default]
    Ignore,
    /// Count and log each table's remainder
    Report,
    /// Append a removal tombstone per unmatched fingerprint
    Record,
}

/// Whether rows recorded on the first run carry their row dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirstRunPayloads {
    #[default]
    Store,
    Omit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    #[serde(rename = "type")]
    pub kind: SourceKind,
    pub connection_string: String,
    /// Accept self-signed TLS certificates (postgres only)
    pub allow_self_signed_certs: bool,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::Sqlite,
            connection_string: DEFAULT_TARGET_DATABASE.to_string(),
            allow_self_signed_certs: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Path of the embedded audit database
    pub connection_string: String,
    pub batch_size: usize,
    pub deletion_policy: DeletionPolicy,
    pub first_run_payloads: FirstRunPayloads,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            connection_string: DEFAULT_AUDIT_DATABASE.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            deletion_policy: DeletionPolicy::default(),
            first_run_payloads: FirstRunPayloads::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub target: TargetConfig,
    pub audit: AuditConfig,
}

impl Config {
    /// Load configuration from a JSON file.
    ///
    /// A missing file yields the defaults; any field the file omits keeps its
    /// default value.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(
                "Config file {} not found, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;
        let config =
            Self::from_json(&contents).with_context(|| format!("Invalid config file {:?}", path))?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        let config: Config =
            serde_json::from_str(contents).context("Failed to parse config JSON")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.target.connection_string.trim().is_empty() {
            bail!("target.connection_string cannot be empty");
        }
        if self.audit.connection_string.trim().is_empty() {
            bail!("audit.connection_string cannot be empty");
        }
        if self.audit.batch_size == 0 {
            bail!("audit.batch_size must be greater than zero");
        }
        Ok(())
    }

    pub fn audit_path(&self) -> PathBuf {
        PathBuf::from(&self.audit.connection_string)
    }
}
