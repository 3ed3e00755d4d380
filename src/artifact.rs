//! Class artifacts and the units the driver schedules.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::stage::Scope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ArtifactFormat {
    DirectoryEntry,
    JarEntry,
}

/// Identity of one class artifact: input root, path inside it, and format.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactId {
    pub root: PathBuf,
    pub relative: String,
    pub format: ArtifactFormat,
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.format {
            ArtifactFormat::DirectoryEntry => {
                write!(f, "{}/{}", self.root.display(), self.relative)
            }
            ArtifactFormat::JarEntry => write!(f, "{}!/{}", self.root.display(), self.relative),
        }
    }
}

/// One class on its way through the rewriter. Content hashes are taken per
/// unit (the jar or the directory file), which is what incremental reuse keys on.
#[derive(Debug, Clone)]
pub struct ClassArtifact {
    pub id: ArtifactId,
    pub bytes: Vec<u8>,
    /// Nanoseconds since the epoch; zero when unknown.
    pub last_modified: u64,
}

impl ClassArtifact {
    pub fn new(id: ArtifactId, bytes: Vec<u8>, last_modified: u64) -> Self {
        Self {
            id,
            bytes,
            last_modified,
        }
    }
}

/// Per-artifact processing state; everything but `Pending` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ArtifactState {
    Pending,
    Skipped,
    Rewritten,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitKind {
    Jar,
    /// A file inside a directory input, `/`-separated.
    DirectoryFile { relative: String },
}

/// What the driver schedules, hashes and caches: one jar, or one file of a
/// class directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputUnit {
    pub scope: Scope,
    /// The jar, or the directory input the file belongs to.
    pub root: PathBuf,
    pub kind: UnitKind,
}

impl InputUnit {
    pub fn jar(scope: Scope, path: PathBuf) -> Self {
        Self {
            scope,
            root: path,
            kind: UnitKind::Jar,
        }
    }

    pub fn directory_file(scope: Scope, root: PathBuf, relative: String) -> Self {
        Self {
            scope,
            root,
            kind: UnitKind::DirectoryFile { relative },
        }
    }

    /// Stable key for the incremental state.
    pub fn key(&self) -> String {
        match &self.kind {
            UnitKind::Jar => format!("{}:jar:{}", self.scope, self.root.display()),
            UnitKind::DirectoryFile { relative } => {
                format!("{}:dir:{}!/{}", self.scope, self.root.display(), relative)
            }
        }
    }

    /// The file holding the unit's bytes.
    pub fn path(&self) -> PathBuf {
        match &self.kind {
            UnitKind::Jar => self.root.clone(),
            UnitKind::DirectoryFile { relative } => self.root.join(relative),
        }
    }

    pub fn artifact_id(&self, relative: &str) -> ArtifactId {
        let format = match self.kind {
            UnitKind::Jar => ArtifactFormat::JarEntry,
            UnitKind::DirectoryFile { .. } => ArtifactFormat::DirectoryEntry,
        };
        ArtifactId {
            root: self.root.clone(),
            relative: relative.to_string(),
            format,
        }
    }
}

impl fmt::Display for InputUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            UnitKind::Jar => write!(f, "{}", self.root.display()),
            UnitKind::DirectoryFile { relative } => {
                write!(f, "{}/{}", self.root.display(), relative)
            }
        }
    }
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Streams a file through sha256.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Hash of a path's string form, used to keep output names unique.
pub fn hash_path(path: &Path) -> String {
    hash_bytes(path.to_string_lossy().as_bytes())
}
