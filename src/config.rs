//! Configuration
//!
//! Engine timing and per-store settings. Store settings arrive as a flat
//! string map (the volume snapshot location config) or as a YAML file with a
//! `block` and a `file` section holding the same keys.

use crate::convergence::delete::{DeleteMode, DEFAULT_RETRY_DELAY};
use crate::convergence::migrate::MigrationTimeouts;
use crate::convergence::poller::DEFAULT_POLL_INTERVAL;
use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Default wait budget of every store operation
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

// =============================================================================
// Engine Configuration
// =============================================================================

/// Timing shared by all convergence primitives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Interval between two status observations
    pub poll_interval: Duration,
    /// Pause between two ensure-deleted cycles
    pub retry_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

// =============================================================================
// Snapshot Methods
// =============================================================================

/// How the block store protects a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockMethod {
    #[default]
    Snapshot,
    Clone,
    Backup,
    Image,
}

impl BlockMethod {
    const SUPPORTED: &'static [&'static str] = &["snapshot", "clone", "backup", "image"];
}

impl FromStr for BlockMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "snapshot" => Ok(BlockMethod::Snapshot),
            "clone" => Ok(BlockMethod::Clone),
            "backup" => Ok(BlockMethod::Backup),
            "image" => Ok(BlockMethod::Image),
            other => Err(Error::UnsupportedMethod {
                method: other.to_string(),
                supported: Self::SUPPORTED,
            }),
        }
    }
}

impl std::fmt::Display for BlockMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockMethod::Snapshot => write!(f, "snapshot"),
            BlockMethod::Clone => write!(f, "clone"),
            BlockMethod::Backup => write!(f, "backup"),
            BlockMethod::Image => write!(f, "image"),
        }
    }
}

/// How the file store protects a share
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileMethod {
    #[default]
    Snapshot,
    Clone,
}

impl FileMethod {
    const SUPPORTED: &'static [&'static str] = &["snapshot", "clone"];
}

impl FromStr for FileMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "snapshot" => Ok(FileMethod::Snapshot),
            "clone" => Ok(FileMethod::Clone),
            other => Err(Error::UnsupportedMethod {
                method: other.to_string(),
                supported: Self::SUPPORTED,
            }),
        }
    }
}

impl std::fmt::Display for FileMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileMethod::Snapshot => write!(f, "snapshot"),
            FileMethod::Clone => write!(f, "clone"),
        }
    }
}

// =============================================================================
// Block Store Configuration
// =============================================================================

/// Settings of the volume store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockStoreConfig {
    pub method: BlockMethod,
    pub volume_timeout: Duration,
    pub snapshot_timeout: Duration,
    pub clone_timeout: Duration,
    pub backup_timeout: Duration,
    pub image_timeout: Duration,
    /// Run the ensure-deleted loop instead of a single delete call
    pub ensure_deleted: bool,
    pub ensure_deleted_delay: Duration,
    /// Delete a clone's snapshots before the clone itself
    pub cascade_delete: bool,
    pub poll_interval: Duration,
}

impl Default for BlockStoreConfig {
    fn default() -> Self {
        Self {
            method: BlockMethod::default(),
            volume_timeout: DEFAULT_TIMEOUT,
            snapshot_timeout: DEFAULT_TIMEOUT,
            clone_timeout: DEFAULT_TIMEOUT,
            backup_timeout: DEFAULT_TIMEOUT,
            image_timeout: DEFAULT_TIMEOUT,
            ensure_deleted: false,
            ensure_deleted_delay: DEFAULT_RETRY_DELAY,
            cascade_delete: false,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl BlockStoreConfig {
    /// Build from the plugin's key/value configuration
    pub fn from_map(config: &BTreeMap<String, String>) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            method: lookup(config, "method").unwrap_or("").parse()?,
            volume_timeout: duration_key(config, "volumeTimeout", defaults.volume_timeout)?,
            snapshot_timeout: duration_key(config, "snapshotTimeout", defaults.snapshot_timeout)?,
            clone_timeout: duration_key(config, "cloneTimeout", defaults.clone_timeout)?,
            backup_timeout: duration_key(config, "backupTimeout", defaults.backup_timeout)?,
            image_timeout: duration_key(config, "imageTimeout", defaults.image_timeout)?,
            ensure_deleted: bool_key(config, "ensureDeleted", defaults.ensure_deleted)?,
            ensure_deleted_delay: duration_key(
                config,
                "ensureDeletedDelay",
                defaults.ensure_deleted_delay,
            )?,
            cascade_delete: bool_key(config, "cascadeDelete", defaults.cascade_delete)?,
            poll_interval: duration_key(config, "pollInterval", defaults.poll_interval)?,
        })
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            poll_interval: self.poll_interval,
            retry_delay: self.ensure_deleted_delay,
        }
    }

    pub fn delete_mode(&self) -> DeleteMode {
        DeleteMode::from_flag(self.ensure_deleted)
    }
}

// =============================================================================
// File Store Configuration
// =============================================================================

/// Settings of the share store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStoreConfig {
    pub method: FileMethod,
    pub share_timeout: Duration,
    pub snapshot_timeout: Duration,
    pub clone_timeout: Duration,
    pub replica_timeout: Duration,
    pub ensure_deleted: bool,
    pub ensure_deleted_delay: Duration,
    /// Delete a clone's replicas and snapshots before the clone itself
    pub cascade_delete: bool,
    /// Migrate clones that land outside the requested availability zone
    pub enforce_az: bool,
    pub poll_interval: Duration,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            method: FileMethod::default(),
            share_timeout: DEFAULT_TIMEOUT,
            snapshot_timeout: DEFAULT_TIMEOUT,
            clone_timeout: DEFAULT_TIMEOUT,
            replica_timeout: DEFAULT_TIMEOUT,
            ensure_deleted: false,
            ensure_deleted_delay: DEFAULT_RETRY_DELAY,
            cascade_delete: false,
            enforce_az: false,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl FileStoreConfig {
    /// Build from the plugin's key/value configuration
    pub fn from_map(config: &BTreeMap<String, String>) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            method: lookup(config, "method").unwrap_or("").parse()?,
            share_timeout: duration_key(config, "shareTimeout", defaults.share_timeout)?,
            snapshot_timeout: duration_key(config, "snapshotTimeout", defaults.snapshot_timeout)?,
            clone_timeout: duration_key(config, "cloneTimeout", defaults.clone_timeout)?,
            replica_timeout: duration_key(config, "replicaTimeout", defaults.replica_timeout)?,
            ensure_deleted: bool_key(config, "ensureDeleted", defaults.ensure_deleted)?,
            ensure_deleted_delay: duration_key(
                config,
                "ensureDeletedDelay",
                defaults.ensure_deleted_delay,
            )?,
            cascade_delete: bool_key(config, "cascadeDelete", defaults.cascade_delete)?,
            enforce_az: bool_key(config, "enforceAZ", defaults.enforce_az)?,
            poll_interval: duration_key(config, "pollInterval", defaults.poll_interval)?,
        })
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            poll_interval: self.poll_interval,
            retry_delay: self.ensure_deleted_delay,
        }
    }

    pub fn delete_mode(&self) -> DeleteMode {
        DeleteMode::from_flag(self.ensure_deleted)
    }

    pub fn migration_timeouts(&self) -> MigrationTimeouts {
        MigrationTimeouts {
            replica: self.replica_timeout,
            resource: self.share_timeout,
        }
    }
}

// =============================================================================
// Plugin Configuration File
// =============================================================================

/// Configuration of both stores
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginConfig {
    pub block: BlockStoreConfig,
    pub file: FileStoreConfig,
}

#[derive(Debug, Default, Deserialize)]
struct RawPluginConfig {
    #[serde(default)]
    block: BTreeMap<String, serde_yaml::Value>,
    #[serde(default)]
    file: BTreeMap<String, serde_yaml::Value>,
}

impl PluginConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let raw: RawPluginConfig = serde_yaml::from_str(yaml)?;
        Ok(Self {
            block: BlockStoreConfig::from_map(&flatten("block", raw.block)?)?,
            file: FileStoreConfig::from_map(&flatten("file", raw.file)?)?,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }
}

/// Scalars only; YAML booleans and numbers are kept in their textual form
fn flatten(
    section: &str,
    raw: BTreeMap<String, serde_yaml::Value>,
) -> Result<BTreeMap<String, String>> {
    raw.into_iter()
        .map(|(key, value)| {
            let text = match value {
                serde_yaml::Value::String(s) => s,
                serde_yaml::Value::Bool(b) => b.to_string(),
                serde_yaml::Value::Number(n) => n.to_string(),
                serde_yaml::Value::Null => String::new(),
                _ => {
                    return Err(Error::Configuration(format!(
                        "{}.{} must be a scalar value",
                        section, key
                    )))
                }
            };
            Ok((key, text))
        })
        .collect()
}

// =============================================================================
// Value Parsing
// =============================================================================

fn lookup<'a>(config: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    config
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

fn duration_key(config: &BTreeMap<String, String>, key: &str, default: Duration) -> Result<Duration> {
    match lookup(config, key) {
        None => Ok(default),
        Some(value) => parse_duration(value)
            .map_err(|e| Error::DurationParse(format!("{}: {}", key, e))),
    }
}

fn bool_key(config: &BTreeMap<String, String>, key: &str, default: bool) -> Result<bool> {
    match lookup(config, key) {
        None => Ok(default),
        Some(value) => parse_bool(value).ok_or_else(|| {
            Error::Configuration(format!("{}: invalid boolean {:?}", key, value))
        }),
    }
}

/// Parse a boolean flag (true/false, 1/0, yes/no)
pub fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "t" => Some(true),
        "false" | "0" | "no" | "f" => Some(false),
        _ => None,
    }
}

/// Parse a duration such as "300ms", "1.5s", "+5m" or "1h30m".
///
/// Segments are handed to humantime; a fractional segment is first
/// rewritten in whole nanoseconds since humantime only reads integers.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let invalid = |reason: &str| Error::DurationParse(format!("{}: {:?}", reason, s));

    let trimmed = s.trim();
    let unsigned = trimmed.strip_prefix('+').unwrap_or(trimmed);
    if unsigned.is_empty() {
        return Err(invalid("empty duration"));
    }
    if unsigned.starts_with('-') {
        return Err(invalid("negative duration"));
    }
    if unsigned == "0" {
        return Ok(Duration::ZERO);
    }
    if unsigned.contains(char::is_whitespace) {
        return Err(invalid("whitespace in duration"));
    }

    let mut segments = Vec::new();
    let mut rest = unsigned;
    while !rest.is_empty() {
        let number_end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        let unit_end = rest[number_end..]
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .map_or(rest.len(), |i| number_end + i);
        let (number, unit) = (&rest[..number_end], &rest[number_end..unit_end]);
        let unit = match unit {
            "µs" | "μs" => "us",
            other => other,
        };
        if number.is_empty() {
            return Err(invalid("expected a number"));
        }
        if unit.is_empty() {
            return Err(invalid("missing unit"));
        }

        segments.push(match number.split_once('.') {
            None => format!("{}{}", number, unit),
            Some((whole, fraction)) => {
                let nanos = fractional_nanos(whole, fraction, unit)
                    .ok_or_else(|| invalid("invalid fractional segment"))?;
                format!("{}ns", nanos)
            }
        });
        rest = &rest[unit_end..];
    }

    humantime::parse_duration(&segments.join(" "))
        .map_err(|e| Error::DurationParse(format!("{}: {:?}", e, s)))
}

/// `whole.fraction` of `unit` in nanoseconds
fn fractional_nanos(whole: &str, fraction: &str, unit: &str) -> Option<u128> {
    let scale: u128 = match unit {
        "ns" => 1,
        "us" => 1_000,
        "ms" => 1_000_000,
        "s" => 1_000_000_000,
        "m" => 60_000_000_000,
        "h" => 3_600_000_000_000,
        _ => return None,
    };
    if (whole.is_empty() && fraction.is_empty()) || !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let whole: u128 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    // 18 digits keep the product within u128
    let fraction = &fraction[..fraction.len().min(18)];
    let fraction_nanos = if fraction.is_empty() {
        0
    } else {
        fraction.parse::<u128>().ok()? * scale / 10u128.pow(fraction.len() as u32)
    };
    whole.checked_mul(scale)?.checked_add(fraction_nanos)
}
