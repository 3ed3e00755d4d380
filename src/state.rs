//! Incremental state: what each input unit hashed to and what became of it
//! in the last successful run.
//!
//! Persisted in LMDB (via heed). A run reads the snapshot once at start and
//! writes it back in a single write transaction after every unit has
//! finished, so readers never see a half-updated snapshot.

use anyhow::{Context, Result};
use heed::types::Str;
use heed::{Database, Env, EnvFlags, EnvOpenOptions};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::artifact::hash_bytes;

pub const UNITS_DB: &str = "units";
pub const META_DB: &str = "meta";

const FINGERPRINT_KEY: &str = "settings_fingerprint";
const FORMAT_KEY: &str = "format";
const FORMAT_VERSION: &str = "1";

const DEFAULT_MAP_SIZE: usize = 256 * 1024 * 1024;
const DEFAULT_MAX_DBS: u32 = 4;

type StrDb = Database<Str, Str>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Outcome {
    Unchanged,
    Rewritten,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitRecord {
    /// `InputUnit::key`.
    pub key: String,
    pub content_hash: String,
    pub outcome: Outcome,
    /// Output location relative to the output root.
    pub output: String,
    pub last_modified: u64,
    #[serde(default)]
    pub rules: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncrementalState {
    pub fingerprint: Option<String>,
    units: BTreeMap<String, UnitRecord>,
}

impl IncrementalState {
    pub fn new(fingerprint: String) -> Self {
        Self {
            fingerprint: Some(fingerprint),
            units: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&UnitRecord> {
        self.units.get(key)
    }

    pub fn insert(&mut self, record: UnitRecord) {
        self.units.insert(record.key.clone(), record);
    }

    pub fn records(&self) -> impl Iterator<Item = &UnitRecord> {
        self.units.values()
    }

    /// The prior record for `key` when its output can be reused for content
    /// hashing to `content_hash`.
    pub fn reusable(&self, key: &str, content_hash: &str) -> Option<&UnitRecord> {
        self.units
            .get(key)
            .filter(|r| r.content_hash == content_hash && r.outcome != Outcome::Failed)
    }
}

#[derive(Debug)]
pub struct StateStore {
    env: Env,
    path: PathBuf,
    units: StrDb,
    meta: StrDb,
}

impl StateStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create state directory: {}", parent.display())
            })?;
        }

        let env = open_env(path)?;
        let mut wtxn = env.write_txn()?;
        let units = env.create_database::<Str, Str>(&mut wtxn, Some(UNITS_DB))?;
        let meta = env.create_database::<Str, Str>(&mut wtxn, Some(META_DB))?;
        wtxn.commit()?;

        Ok(Self {
            env,
            path: path.to_path_buf(),
            units,
            meta,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the whole snapshot. Any unreadable row fails the load, so the
    /// caller falls back to a full run instead of trusting a partial map.
    pub fn load(&self) -> Result<IncrementalState> {
        let rtxn = self.env.read_txn()?;
        match self.meta.get(&rtxn, FORMAT_KEY)? {
            Some(FORMAT_VERSION) | None => {}
            Some(other) => anyhow::bail!("unsupported state format '{other}'"),
        }
        let fingerprint = self.meta.get(&rtxn, FINGERPRINT_KEY)?.map(str::to_string);

        let mut units = BTreeMap::new();
        for item in self.units.iter(&rtxn)? {
            let (_, v) = item?;
            let record: UnitRecord =
                serde_json::from_str(v).context("Failed to decode state row")?;
            units.insert(record.key.clone(), record);
        }
        Ok(IncrementalState { fingerprint, units })
    }

    /// Replaces the stored snapshot with `state` in one transaction.
    pub fn commit(&self, state: &IncrementalState) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        self.units.clear(&mut wtxn)?;
        self.meta.clear(&mut wtxn)?;
        // LMDB keys are capped at 511 bytes; unit keys hold full paths.
        for record in state.records() {
            let row = serde_json::to_string(record)?;
            self.units
                .put(&mut wtxn, &hash_bytes(record.key.as_bytes()), &row)?;
        }
        self.meta.put(&mut wtxn, FORMAT_KEY, FORMAT_VERSION)?;
        if let Some(fingerprint) = &state.fingerprint {
            self.meta.put(&mut wtxn, FINGERPRINT_KEY, fingerprint)?;
        }
        wtxn.commit()
            .with_context(|| format!("Failed to commit state: {}", self.path.display()))?;
        Ok(())
    }
}

fn open_env(path: &Path) -> Result<Env> {
    let mut options = EnvOpenOptions::new();
    options.map_size(DEFAULT_MAP_SIZE);
    options.max_dbs(DEFAULT_MAX_DBS);
    // SAFETY: Default LMDB locking is kept; the state file is only opened
    // through this function. NO_SUB_DIR keeps the state a single file path.
    unsafe {
        options.flags(EnvFlags::NO_SUB_DIR);
        options
            .open(path)
            .with_context(|| format!("Failed to create/open state env: {}", path.display()))
    }
}
