//! The artifact pipeline driver.
//!
//! Every input unit (one jar, or one file of a class directory) is processed
//! independently on a bounded worker pool. Workers only write into the
//! staging directory and return their results; a single commit step after
//! the pool drains moves staged outputs into place and replaces the
//! incremental state. Nothing outside staging changes unless the whole run
//! succeeds.

use anyhow::Context;
use rayon::prelude::*;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::artifact::{
    ArtifactId, ArtifactState, ClassArtifact, InputUnit, UnitKind, hash_bytes, hash_file,
};
use crate::classfile::ParsedClass;
use crate::config::{self, BuildSettings};
use crate::error::{ArtifactError, ErrorKind, IoFailure};
use crate::filter::class_name_from_entry;
use crate::jar::{self, EntryResult, retry_read};
use crate::report::{ArtifactRecord, Failure, RunError, RunReport};
use crate::rewrite::rewrite;
use crate::rules::{ClassDescriptor, RuleMatch};
use crate::scan;
use crate::stage::{
    ContentKind, OutputLayout, Scope, StageDescriptor, TransformInvocation, TransformStage,
};
use crate::state::{IncrementalState, Outcome, StateStore, UnitRecord};

/// Why a class was forwarded unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    Filtered,
    NoMatchingRule,
    /// Rules matched, but every one was already applied or selected no method.
    NothingToApply,
}

#[derive(Debug)]
pub enum ClassOutcome {
    Skipped(SkipReason),
    Rewritten {
        class: String,
        bytes: Vec<u8>,
        rules: Vec<String>,
    },
    Failed(ArtifactError),
}

/// Filter, match, apply and rewrite one class.
pub fn process_class(settings: &BuildSettings, artifact: &ClassArtifact) -> ClassOutcome {
    if !settings.enabled {
        return ClassOutcome::Skipped(SkipReason::Disabled);
    }
    let mut class = match ParsedClass::parse(&artifact.bytes) {
        Ok(class) => class,
        Err(e) => return ClassOutcome::Failed(e.into()),
    };
    if !settings.filter.accepts(&class.name) {
        return ClassOutcome::Skipped(SkipReason::Filtered);
    }

    let ids = settings.ruleset.matches(&ClassDescriptor::of(&class));
    if ids.is_empty() {
        return ClassOutcome::Skipped(SkipReason::NoMatchingRule);
    }
    for id in ids {
        class = match settings.ruleset.apply(id, class) {
            Ok(class) => class,
            Err(e) => return ClassOutcome::Failed(e.into()),
        };
    }
    if !class.has_edits() {
        return ClassOutcome::Skipped(SkipReason::NothingToApply);
    }

    match rewrite(&class) {
        Ok(bytes) => ClassOutcome::Rewritten {
            class: class.dotted_name(),
            bytes,
            rules: class.newly_applied().to_vec(),
        },
        Err(e) => ClassOutcome::Failed(e.into()),
    }
}

/// The transform stage registered with the host.
#[derive(Debug, Clone)]
pub struct AmsTransform {
    settings: Arc<BuildSettings>,
}

impl AmsTransform {
    pub fn new(settings: Arc<BuildSettings>) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &BuildSettings {
        &self.settings
    }

    fn run(&self, invocation: &TransformInvocation) -> Result<RunReport, RunError> {
        let started = Instant::now();
        if invocation.cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }
        let settings = &*self.settings;
        let layout = &invocation.output;

        let units = dedup_units(scan::collect_units(&invocation.inputs)?);
        let staging = layout.staging_dir();
        discard_staging(&staging);
        std::fs::create_dir_all(&staging)
            .with_context(|| format!("Failed to create staging dir: {}", staging.display()))?;

        let fingerprint = settings.fingerprint();
        let store = if settings.incremental_enabled {
            match StateStore::open(&invocation.state_path) {
                Ok(store) => Some(store),
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "incremental state unavailable; running full");
                    None
                }
            }
        } else {
            None
        };
        let prior = match &store {
            Some(store) if invocation.incremental => load_prior(store, &fingerprint),
            _ => None,
        };

        info!(
            units = units.len(),
            rules = settings.ruleset.len(),
            incremental = prior.is_some(),
            workers = settings.max_workers,
            "transform started"
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(settings.max_workers)
            .build()
            .context("Failed to build worker pool")?;

        let ctx = RunContext {
            settings,
            layout,
            staging: &staging,
            prior: prior.as_ref(),
        };
        let results: Vec<Option<UnitResult>> = pool.install(|| {
            units
                .par_iter()
                .map(|unit| {
                    if invocation.cancel.is_cancelled() {
                        return None;
                    }
                    Some(process_unit(&ctx, unit))
                })
                .collect()
        });

        if invocation.cancel.is_cancelled() {
            discard_staging(&staging);
            warn!("transform cancelled; outputs and state left untouched");
            return Err(RunError::Cancelled);
        }

        let mut report = RunReport {
            incremental: prior.is_some(),
            units: units.len(),
            ..RunReport::default()
        };
        let mut next = IncrementalState::new(fingerprint);
        let mut staged = Vec::new();
        let mut conflicts = Vec::new();
        let mut fatal = Vec::new();

        for result in results.into_iter().flatten() {
            if result.reused {
                report.reused_units += 1;
            }
            report.resources_copied += result.resources;
            staged.extend(result.staged);
            if let Some(record) = result.record {
                next.insert(record);
            }
            for class in result.classes {
                match class.state {
                    ArtifactState::Skipped => report.classes_skipped += 1,
                    ArtifactState::Rewritten => {
                        report.classes_rewritten += 1;
                        let name = class.class.clone().unwrap_or_default();
                        report.matches.extend(class.rules.iter().map(|rule| RuleMatch {
                            class: name.clone(),
                            rule: rule.clone(),
                        }));
                    }
                    ArtifactState::Failed => {
                        report.classes_failed += 1;
                        if let Some(err) = &class.error {
                            let failure = Failure::new(&class.artifact, err);
                            if err.kind() == ErrorKind::ConflictingRule {
                                conflicts.push(failure);
                            } else if !class.passthrough {
                                fatal.push(failure);
                            }
                        }
                    }
                    ArtifactState::Pending => {}
                }
                if class.state != ArtifactState::Skipped {
                    report.artifacts.push(class.into_record());
                }
            }
        }

        if !conflicts.is_empty() {
            discard_staging(&staging);
            error!(count = conflicts.len(), "ruleset conflicts; nothing written");
            return Err(RunError::Conflict(conflicts));
        }
        if !fatal.is_empty() {
            discard_staging(&staging);
            error!(count = fatal.len(), "transform failed; nothing written");
            return Err(RunError::Failed(fatal));
        }

        match commit_outputs(layout, prior.as_ref(), &next, &staged) {
            Ok(removed) => report.removed_outputs = removed,
            Err(e) => {
                discard_staging(&staging);
                drop(store);
                let _ = config::clean_state(&invocation.state_path);
                return Err(RunError::Setup(e));
            }
        }
        match store {
            Some(store) => {
                if let Err(e) = store.commit(&next) {
                    warn!(error = %format!("{e:#}"), "failed to save incremental state; next run is full");
                    drop(store);
                    let _ = config::clean_state(&invocation.state_path);
                }
            }
            // The outputs changed without a snapshot describing them.
            None => {
                if let Err(e) = config::clean_state(&invocation.state_path) {
                    warn!(error = %format!("{e:#}"), "failed to remove stale incremental state");
                }
            }
        }

        report.elapsed_ms = millis(started.elapsed());
        info!(
            units = report.units,
            reused = report.reused_units,
            rewritten = report.classes_rewritten,
            skipped = report.classes_skipped,
            failed = report.classes_failed,
            incremental = report.incremental,
            elapsed_ms = report.elapsed_ms,
            "transform finished"
        );
        Ok(report)
    }
}

impl TransformStage for AmsTransform {
    fn descriptor(&self) -> StageDescriptor {
        StageDescriptor::declares(
            [ContentKind::Classes],
            Scope::ALL,
            self.settings.incremental_enabled,
        )
    }

    fn transform(&self, invocation: &TransformInvocation) -> Result<RunReport, RunError> {
        self.run(invocation)
    }
}

struct RunContext<'r> {
    settings: &'r BuildSettings,
    layout: &'r OutputLayout,
    staging: &'r Path,
    prior: Option<&'r IncrementalState>,
}

impl RunContext<'_> {
    /// The prior output of `unit`, when it can stand in for reprocessing.
    fn reuse(
        &self,
        unit: &InputUnit,
        content_hash: &str,
        location: &str,
        last_modified: u64,
    ) -> Option<UnitResult> {
        let prior = self.prior?.reusable(&unit.key(), content_hash)?;
        if prior.output != location || !self.layout.root().join(&prior.output).exists() {
            return None;
        }
        debug!(artifact = %unit, "unchanged since last run; reusing output");
        Some(UnitResult {
            record: Some(UnitRecord {
                last_modified,
                ..prior.clone()
            }),
            staged: None,
            reused: true,
            classes: Vec::new(),
            resources: 0,
        })
    }
}

struct ClassReport {
    artifact: String,
    /// Dotted name, for rewritten classes.
    class: Option<String>,
    state: ArtifactState,
    rules: Vec<String>,
    error: Option<ArtifactError>,
    passthrough: bool,
    elapsed: Duration,
}

impl ClassReport {
    /// Whether some bytes of this artifact may be written.
    fn forwardable(&self) -> bool {
        self.state != ArtifactState::Failed || self.passthrough
    }

    fn into_record(self) -> ArtifactRecord {
        ArtifactRecord {
            artifact: self.artifact,
            state: self.state,
            rules: self.rules,
            error_kind: self.error.as_ref().map(ArtifactError::kind),
            message: self.error.as_ref().map(ToString::to_string),
            passthrough: self.passthrough,
            elapsed_ms: millis(self.elapsed),
        }
    }
}

struct UnitResult {
    /// `None` when the unit could not be forwarded at all.
    record: Option<UnitRecord>,
    /// Location staged for commit.
    staged: Option<String>,
    reused: bool,
    classes: Vec<ClassReport>,
    resources: usize,
}

fn process_unit(ctx: &RunContext<'_>, unit: &InputUnit) -> UnitResult {
    let started = Instant::now();
    match run_unit(ctx, unit) {
        Ok(result) => result,
        Err(e) => {
            let err = ArtifactError::from(e);
            let elapsed = started.elapsed();
            error!(
                artifact = %unit,
                kind = %err.kind(),
                error = %err,
                elapsed_ms = millis(elapsed),
                "artifact failed"
            );
            UnitResult {
                record: None,
                staged: None,
                reused: false,
                classes: vec![ClassReport {
                    artifact: unit.to_string(),
                    class: None,
                    state: ArtifactState::Failed,
                    rules: Vec::new(),
                    error: Some(err),
                    passthrough: false,
                    elapsed,
                }],
                resources: 0,
            }
        }
    }
}

fn run_unit(ctx: &RunContext<'_>, unit: &InputUnit) -> Result<UnitResult, IoFailure> {
    let path = unit.path();
    let label = unit.to_string();
    let location = ctx.layout.unit_location(unit);
    let last_modified = scan::modified_nanos(&path);

    match &unit.kind {
        UnitKind::Jar => {
            let content_hash = retry_read(&label, || hash_file(&path))?;
            if let Some(hit) = ctx.reuse(unit, &content_hash, &location, last_modified) {
                return Ok(hit);
            }
            let entries = jar::transform_jar(
                &path,
                &ctx.staging.join(&location),
                ctx.settings.jar_stream_threshold,
                |name, bytes| {
                    if class_name_from_entry(name).is_none() {
                        return EntryResult::keep(None);
                    }
                    let (replacement, report) =
                        handle_class(ctx.settings, unit.artifact_id(name), bytes, last_modified);
                    EntryResult {
                        replacement,
                        detail: Some(report),
                    }
                },
            )?;
            let resources = entries.iter().filter(|(_, d)| d.is_none()).count();
            let classes = entries.into_iter().filter_map(|(_, d)| d).collect();
            Ok(finished(unit, content_hash, location, last_modified, classes, resources, true))
        }
        UnitKind::DirectoryFile { relative } => {
            let bytes = retry_read(&label, || std::fs::read(&path))?;
            let content_hash = hash_bytes(&bytes);
            if let Some(hit) = ctx.reuse(unit, &content_hash, &location, last_modified) {
                return Ok(hit);
            }
            let (output, classes, resources) = if class_name_from_entry(relative).is_some() {
                let (replacement, report) =
                    handle_class(ctx.settings, unit.artifact_id(relative), &bytes, last_modified);
                let output = report.forwardable().then(|| replacement.unwrap_or(bytes));
                (output, vec![report], 0)
            } else {
                (Some(bytes), Vec::new(), 1)
            };
            let staged = match output {
                Some(bytes) => {
                    write_staged(&ctx.staging.join(&location), &bytes)?;
                    true
                }
                None => false,
            };
            Ok(finished(unit, content_hash, location, last_modified, classes, resources, staged))
        }
    }
}

fn finished(
    unit: &InputUnit,
    content_hash: String,
    location: String,
    last_modified: u64,
    classes: Vec<ClassReport>,
    resources: usize,
    staged: bool,
) -> UnitResult {
    let outcome = if classes.iter().any(|c| c.state == ArtifactState::Failed) {
        Outcome::Failed
    } else if classes.iter().any(|c| c.state == ArtifactState::Rewritten) {
        Outcome::Rewritten
    } else {
        Outcome::Unchanged
    };
    let mut rules: Vec<String> = Vec::new();
    for rule in classes.iter().flat_map(|c| &c.rules) {
        if !rules.contains(rule) {
            rules.push(rule.clone());
        }
    }
    UnitResult {
        record: Some(UnitRecord {
            key: unit.key(),
            content_hash,
            outcome,
            output: location.clone(),
            last_modified,
            rules,
        }),
        staged: staged.then_some(location),
        reused: false,
        classes,
        resources,
    }
}

/// Runs one class through the stage and logs the result. Returns the
/// replacement bytes, if any.
fn handle_class(
    settings: &BuildSettings,
    id: ArtifactId,
    bytes: &[u8],
    last_modified: u64,
) -> (Option<Vec<u8>>, ClassReport) {
    let started = Instant::now();
    let artifact = ClassArtifact::new(id, bytes.to_vec(), last_modified);
    let outcome = process_class(settings, &artifact);
    let elapsed = started.elapsed();
    let name = artifact.id.to_string();

    match outcome {
        ClassOutcome::Skipped(reason) => {
            debug!(artifact = %name, reason = ?reason, "class skipped");
            (
                None,
                ClassReport {
                    artifact: name,
                    class: None,
                    state: ArtifactState::Skipped,
                    rules: Vec::new(),
                    error: None,
                    passthrough: false,
                    elapsed,
                },
            )
        }
        ClassOutcome::Rewritten { class, bytes, rules } => {
            info!(
                artifact = %name,
                rules = %rules.join(","),
                elapsed_ms = millis(elapsed),
                "class rewritten"
            );
            (
                Some(bytes),
                ClassReport {
                    artifact: name,
                    class: Some(class),
                    state: ArtifactState::Rewritten,
                    rules,
                    error: None,
                    passthrough: false,
                    elapsed,
                },
            )
        }
        ClassOutcome::Failed(err) => {
            let passthrough = !settings.strict_mode && err.allows_passthrough();
            if passthrough {
                warn!(
                    artifact = %name,
                    kind = %err.kind(),
                    error = %err,
                    elapsed_ms = millis(elapsed),
                    "passing artifact through unmodified"
                );
            } else {
                error!(
                    artifact = %name,
                    kind = %err.kind(),
                    error = %err,
                    elapsed_ms = millis(elapsed),
                    "artifact failed"
                );
            }
            (
                None,
                ClassReport {
                    artifact: name,
                    class: None,
                    state: ArtifactState::Failed,
                    rules: Vec::new(),
                    error: Some(err),
                    passthrough,
                    elapsed,
                },
            )
        }
    }
}

fn load_prior(store: &StateStore, fingerprint: &str) -> Option<IncrementalState> {
    match store.load() {
        Ok(state) if state.fingerprint.as_deref() == Some(fingerprint) => {
            debug!(units = state.len(), "loaded incremental state");
            Some(state)
        }
        Ok(state) if state.is_empty() => None,
        Ok(_) => {
            info!("settings changed since last run; running full");
            None
        }
        Err(e) => {
            warn!(
                path = %store.path().display(),
                error = %format!("{e:#}"),
                "incremental state unreadable; running full"
            );
            None
        }
    }
}

/// Drops repeated units (the same input listed twice) keeping the first.
fn dedup_units(units: Vec<InputUnit>) -> Vec<InputUnit> {
    let mut seen = HashSet::new();
    units
        .into_iter()
        .filter(|unit| {
            let fresh = seen.insert(unit.key());
            if !fresh {
                warn!(artifact = %unit, "input listed more than once; ignoring repeat");
            }
            fresh
        })
        .collect()
}

fn write_staged(path: &Path, bytes: &[u8]) -> Result<(), IoFailure> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| IoFailure::write(format!("{}: {e}", parent.display())))?;
    }
    std::fs::write(path, bytes).map_err(|e| IoFailure::write(format!("{}: {e}", path.display())))
}

/// Moves staged outputs into place. A full run first clears every scope
/// directory; an incremental one deletes the outputs of vanished inputs.
fn commit_outputs(
    layout: &OutputLayout,
    prior: Option<&IncrementalState>,
    next: &IncrementalState,
    staged: &[String],
) -> anyhow::Result<usize> {
    let mut removed = 0;
    match prior {
        None => {
            for scope in Scope::ALL {
                let dir = layout.scope_dir(scope);
                if dir.exists() {
                    std::fs::remove_dir_all(&dir)
                        .with_context(|| format!("Failed to clear output dir: {}", dir.display()))?;
                }
            }
        }
        Some(prior) => {
            for record in prior.records().filter(|r| next.get(&r.key).is_none()) {
                let stale = layout.root().join(&record.output);
                if stale.is_file() {
                    std::fs::remove_file(&stale).with_context(|| {
                        format!("Failed to remove stale output: {}", stale.display())
                    })?;
                    debug!(output = %stale.display(), "removed output of vanished input");
                    removed += 1;
                }
            }
        }
    }

    let staging = layout.staging_dir();
    for location in staged {
        let from = staging.join(location);
        let to = layout.root().join(location);
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create output dir: {}", parent.display()))?;
        }
        if to.exists() {
            std::fs::remove_file(&to)
                .with_context(|| format!("Failed to replace output: {}", to.display()))?;
        }
        std::fs::rename(&from, &to)
            .with_context(|| format!("Failed to move {} to {}", from.display(), to.display()))?;
    }
    discard_staging(&staging);
    Ok(removed)
}

fn discard_staging(staging: &Path) {
    if !staging.exists() {
        return;
    }
    if let Err(e) = std::fs::remove_dir_all(staging) {
        warn!(path = %staging.display(), error = %e, "failed to remove staging dir");
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}
