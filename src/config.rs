use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::artifact::hash_bytes;
use crate::filter::ClassFilter;
use crate::rules::{RuleConfig, Ruleset};

pub const DEFAULT_JAR_STREAM_THRESHOLD: u64 = 16 * 1024 * 1024;

/// The `AmsConfig` settings file, as written by the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AmsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub include_patterns: Vec<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    #[serde(default = "default_true")]
    pub strict_mode: bool,
    #[serde(default = "default_true")]
    pub incremental_enabled: bool,
    #[serde(default = "default_true")]
    pub exclude_generated_classes: bool,
    #[serde(default = "default_stream_threshold")]
    pub jar_stream_threshold: u64,
    #[serde(default)]
    pub max_workers: Option<usize>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

fn default_true() -> bool {
    true
}

fn default_stream_threshold() -> u64 {
    DEFAULT_JAR_STREAM_THRESHOLD
}

impl Default for AmsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            strict_mode: true,
            incremental_enabled: true,
            exclude_generated_classes: true,
            jar_stream_threshold: DEFAULT_JAR_STREAM_THRESHOLD,
            max_workers: None,
            rules: Vec::new(),
        }
    }
}

impl AmsConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
        Self::from_json(&text)
            .with_context(|| format!("Invalid settings file: {}", path.display()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Validates the settings and freezes them for a run.
    pub fn into_settings(self) -> Result<BuildSettings> {
        let max_workers = match self.max_workers {
            Some(0) => anyhow::bail!("maxWorkers must be at least 1"),
            Some(n) => n,
            None => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        };
        let filter = ClassFilter::new(
            &self.include_patterns,
            &self.exclude_patterns,
            self.exclude_generated_classes,
        )?;
        let ruleset = Ruleset::from_config(self.rules)?;

        Ok(BuildSettings {
            enabled: self.enabled,
            include_patterns: self.include_patterns,
            exclude_patterns: self.exclude_patterns,
            strict_mode: self.strict_mode,
            incremental_enabled: self.incremental_enabled,
            exclude_generated_classes: self.exclude_generated_classes,
            jar_stream_threshold: self.jar_stream_threshold,
            max_workers,
            ruleset,
            filter,
        })
    }
}

/// Settings captured once at the start of a build; shared read-only.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSettings {
    pub enabled: bool,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub strict_mode: bool,
    pub incremental_enabled: bool,
    pub exclude_generated_classes: bool,
    pub jar_stream_threshold: u64,
    pub max_workers: usize,
    pub ruleset: Ruleset,
    #[serde(skip)]
    pub filter: ClassFilter,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutputAffecting<'a> {
    enabled: bool,
    include_patterns: &'a [String],
    exclude_patterns: &'a [String],
    strict_mode: bool,
    exclude_generated_classes: bool,
    ruleset: &'a Ruleset,
}

impl BuildSettings {
    /// Hash of every setting that can change an output byte. Worker count
    /// and stream threshold are left out.
    pub fn fingerprint(&self) -> String {
        let view = OutputAffecting {
            enabled: self.enabled,
            include_patterns: &self.include_patterns,
            exclude_patterns: &self.exclude_patterns,
            strict_mode: self.strict_mode,
            exclude_generated_classes: self.exclude_generated_classes,
            ruleset: &self.ruleset,
        };
        let canonical = serde_json::to_vec(&view).unwrap_or_default();
        hash_bytes(&canonical)
    }
}

/// `<output>.state.lmdb`, next to the output directory.
pub fn default_state_path(output: &Path) -> PathBuf {
    let name = output
        .file_name()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("ams-output");
    let file_name = format!("{name}.state.lmdb");

    match output.parent() {
        Some(parent) => parent.join(file_name),
        None => PathBuf::from(file_name),
    }
}

pub fn clean_state(state_path: &Path) -> Result<()> {
    remove_file_if_exists(state_path, "state")?;
    remove_file_if_exists(&lmdb_lock_path(state_path), "state lock")?;
    Ok(())
}

pub fn lmdb_lock_path(db_path: &Path) -> PathBuf {
    let mut os = db_path.as_os_str().to_os_string();
    os.push("-lock");
    PathBuf::from(os)
}

fn remove_file_if_exists(path: &Path, kind: &str) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove {kind} file: {}", path.display()))?;
    }
    Ok(())
}
