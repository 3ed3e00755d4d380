//! The contract between the transform and the host build pipeline.
//!
//! The host only sees a `StageDescriptor` and calls `TransformStage::transform`
//! with a `TransformInvocation`; how it splices stages into its task graph is
//! its own business.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::artifact::{InputUnit, UnitKind, hash_path};
use crate::report::{RunError, RunReport};
use crate::scan;

pub const STAGE_NAME: &str = "amsTransform";

/// Directory under the output root that holds in-flight outputs.
pub const STAGING_DIR: &str = ".ams-staging";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Scope {
    Project,
    SubProjects,
    ExternalLibraries,
}

impl Scope {
    pub const ALL: [Scope; 3] = [Scope::Project, Scope::SubProjects, Scope::ExternalLibraries];

    pub fn dir_name(self) -> &'static str {
        match self {
            Scope::Project => "project",
            Scope::SubProjects => "sub-projects",
            Scope::ExternalLibraries => "external-libraries",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Artifact content types a stage consumes or produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContentKind {
    Classes,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageDescriptor {
    pub name: String,
    pub input_kinds: BTreeSet<ContentKind>,
    pub scopes: BTreeSet<Scope>,
    pub incremental: bool,
    pub output_kind: ContentKind,
}

impl StageDescriptor {
    pub fn declares(
        input_kinds: impl IntoIterator<Item = ContentKind>,
        scopes: impl IntoIterator<Item = Scope>,
        incremental: bool,
    ) -> Self {
        Self {
            name: STAGE_NAME.to_string(),
            input_kinds: input_kinds.into_iter().collect(),
            scopes: scopes.into_iter().collect(),
            incremental,
            output_kind: ContentKind::Classes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Directory,
    Jar,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformInput {
    pub scope: Scope,
    pub kind: InputKind,
    pub path: PathBuf,
}

impl TransformInput {
    pub fn directory(scope: Scope, path: PathBuf) -> Self {
        Self {
            scope,
            kind: InputKind::Directory,
            path,
        }
    }

    pub fn jar(scope: Scope, path: PathBuf) -> Self {
        Self {
            scope,
            kind: InputKind::Jar,
            path,
        }
    }

    /// Jar when the path ends in `.jar`, directory otherwise.
    pub fn from_path(scope: Scope, path: PathBuf) -> Self {
        if scan::is_jar(&path) {
            Self::jar(scope, path)
        } else {
            Self::directory(scope, path)
        }
    }
}

/// Where outputs go under the output root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    pub fn scope_dir(&self, scope: Scope) -> PathBuf {
        self.root.join(scope.dir_name())
    }

    /// Output location of an input, relative to the root:
    /// `<scope>/dirs/<name>-<hash8>` or `<scope>/jars/<stem>-<hash8>.jar`.
    pub fn content_location(&self, scope: Scope, kind: InputKind, input: &Path) -> String {
        let hash = hash_path(input);
        let hash8 = &hash[..8];
        match kind {
            InputKind::Directory => {
                let name = input
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "classes".to_string());
                format!("{}/dirs/{name}-{hash8}", scope.dir_name())
            }
            InputKind::Jar => {
                let stem = input
                    .file_stem()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "input".to_string());
                format!("{}/jars/{stem}-{hash8}.jar", scope.dir_name())
            }
        }
    }

    /// Output path of a unit, relative to the root.
    pub fn unit_location(&self, unit: &InputUnit) -> String {
        match &unit.kind {
            UnitKind::Jar => self.content_location(unit.scope, InputKind::Jar, &unit.root),
            UnitKind::DirectoryFile { relative } => format!(
                "{}/{relative}",
                self.content_location(unit.scope, InputKind::Directory, &unit.root)
            ),
        }
    }
}

/// Shared abort flag; once set, no new units start.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct TransformInvocation {
    pub inputs: Vec<TransformInput>,
    pub output: OutputLayout,
    /// The host allows reuse of the previous run's outputs.
    pub incremental: bool,
    pub state_path: PathBuf,
    pub cancel: CancellationToken,
}

pub trait TransformStage: Send + Sync {
    fn descriptor(&self) -> StageDescriptor;

    fn transform(&self, invocation: &TransformInvocation) -> Result<RunReport, RunError>;
}
