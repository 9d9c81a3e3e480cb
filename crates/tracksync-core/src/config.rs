use anyhow::{Context, Result};
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::merge::BuiltinPolicy;
use crate::model::item::ParseEnumError;
use crate::model::schema::{AttrKind, Schema};

/// Directory holding the store and project config, relative to the project root.
pub const PROJECT_DIR: &str = ".tracksync";

/// Overrides `[merge] conflict_policy` when set.
pub const POLICY_ENV: &str = "TRACKSYNC_CONFLICT_POLICY";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub merge: MergeConfig,
    #[serde(default)]
    pub schema: SchemaConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyName {
    #[default]
    Manual,
    ServerWins,
    LocalWins,
    ServerWinsAfter,
}

impl FromStr for PolicyName {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "manual" => Ok(Self::Manual),
            "server-wins" => Ok(Self::ServerWins),
            "local-wins" => Ok(Self::LocalWins),
            "server-wins-after" => Ok(Self::ServerWinsAfter),
            _ => Err(ParseEnumError {
                expected: "conflict policy",
                got: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for PolicyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Manual => "manual",
            Self::ServerWins => "server-wins",
            Self::LocalWins => "local-wins",
            Self::ServerWinsAfter => "server-wins-after",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    #[serde(default)]
    pub conflict_policy: PolicyName,
    #[serde(default = "default_server_wins_after_minutes")]
    pub server_wins_after_minutes: i64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            conflict_policy: PolicyName::default(),
            server_wins_after_minutes: default_server_wins_after_minutes(),
        }
    }
}

impl MergeConfig {
    #[must_use]
    pub fn policy(&self) -> BuiltinPolicy {
        match self.conflict_policy {
            PolicyName::Manual => BuiltinPolicy::Manual,
            PolicyName::ServerWins => BuiltinPolicy::ServerWins,
            PolicyName::LocalWins => BuiltinPolicy::LocalWins,
            PolicyName::ServerWinsAfter => {
                let minutes = self.server_wins_after_minutes.max(0);
                BuiltinPolicy::ServerWinsAfter(TimeDelta::minutes(minutes))
            }
        }
    }
}

/// Attributes that never enter a shadow, e.g. rendered HTML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaConfig {
    #[serde(default)]
    pub derived: Vec<String>,
}

impl SchemaConfig {
    #[must_use]
    pub fn schema(&self) -> Schema {
        self.derived
            .iter()
            .fold(Schema::new(), |schema, name| schema.derived(name.as_str(), AttrKind::Any))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

impl StoreConfig {
    /// Store location; relative paths resolve inside `<root>/.tracksync`.
    #[must_use]
    pub fn resolve_path(&self, project_root: &Path) -> PathBuf {
        if self.path.is_absolute() {
            self.path.clone()
        } else {
            project_root.join(PROJECT_DIR).join(&self.path)
        }
    }

    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UserConfig {
    #[serde(default)]
    pub output: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub sync: SyncConfig,
    pub user: UserConfig,
    pub resolved_output: String,
}

fn read_toml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<T>(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

fn user_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tracksync"))
}

/// Project config, else the user-level sync config, else defaults.
pub fn load_sync_config(project_root: &Path) -> Result<SyncConfig> {
    load_sync_config_from(project_root, user_config_dir().as_deref())
}

fn load_sync_config_from(project_root: &Path, user_dir: Option<&Path>) -> Result<SyncConfig> {
    let project = project_root.join(PROJECT_DIR).join("config.toml");
    if project.exists() {
        return read_toml(&project);
    }

    let Some(user_dir) = user_dir else {
        return Ok(SyncConfig::default());
    };
    let user = user_dir.join("config.toml");
    if user.exists() {
        return read_toml(&user);
    }
    Ok(SyncConfig::default())
}

pub fn load_user_config() -> Result<UserConfig> {
    let Some(dir) = user_config_dir() else {
        return Ok(UserConfig::default());
    };

    let path = dir.join("config.toml");
    if !path.exists() {
        return Ok(UserConfig::default());
    }
    read_toml(&path)
}

pub fn resolve_config(project_root: &Path, cli_json: bool) -> Result<EffectiveConfig> {
    let mut sync = load_sync_config(project_root)?;
    apply_policy_override(&mut sync, env::var(POLICY_ENV).ok().as_deref())?;
    let user = load_user_config()?;

    let env_format = env::var("FORMAT").ok();
    let resolved_output = resolve_output(cli_json, user.output.clone(), env_format);

    Ok(EffectiveConfig {
        sync,
        user,
        resolved_output,
    })
}

fn apply_policy_override(config: &mut SyncConfig, value: Option<&str>) -> Result<()> {
    let Some(raw) = value.filter(|raw| !raw.trim().is_empty()) else {
        return Ok(());
    };
    config.merge.conflict_policy = raw
        .parse()
        .with_context(|| format!("Invalid {POLICY_ENV}"))?;
    Ok(())
}

fn resolve_output(
    cli_json: bool,
    user_output: Option<String>,
    env_format: Option<String>,
) -> String {
    fn normalize_output_mode(raw: &str) -> Option<&'static str> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pretty" | "human" => Some("pretty"),
            "text" | "table" => Some("text"),
            "json" => Some("json"),
            _ => None,
        }
    }

    if cli_json {
        return "json".to_string();
    }

    if let Some(mode) = env_format.as_deref().and_then(normalize_output_mode) {
        return mode.to_string();
    }

    if let Some(mode) = user_output.as_deref().and_then(normalize_output_mode) {
        return mode.to_string();
    }

    if std::io::stdout().is_terminal() {
        "pretty".to_string()
    } else {
        "text".to_string()
    }
}

const fn default_server_wins_after_minutes() -> i64 {
    60
}

fn default_store_path() -> PathBuf {
    PathBuf::from("items.db")
}

const fn default_lock_timeout_ms() -> u64 {
    2000
}
