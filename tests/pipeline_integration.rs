#[path = "../src/fixture.rs"]
mod fixture;

use ams_transform::classfile::ParsedClass;
use ams_transform::config::AmsConfig;
use ams_transform::error::ErrorKind;
use ams_transform::pipeline::AmsTransform;
use ams_transform::report::{RunError, RunReport};
use ams_transform::state::StateStore;
use ams_transform::stage::{
    CancellationToken, InputKind, OutputLayout, Scope, TransformInput, TransformInvocation,
    TransformStage,
};
use fixture::ClassFixture;
use serde_json::Value;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

const R1: &str = r#"{"id": "r1", "classes": {"className": "com.example.A"},
    "action": {"kind": "enterHook", "owner": "com.example.Tracer", "method": "enter"}}"#;

const MALFORMED: &[u8] = b"\xCA\xFE\xBA\xBEnot really a class";

fn temp_dir(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!(
        "ams_transform_it_{}_{}_{}",
        std::process::id(),
        nanos,
        name
    ))
}

fn write_file(path: &Path, content: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

fn write_jar(path: &Path, entries: &[(&str, &[u8])]) -> anyhow::Result<()> {
    use zip::write::FileOptions;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for (name, content) in entries {
        zip.start_file(*name, options)?;
        zip.write_all(content)?;
    }
    zip.finish()?;
    Ok(())
}

fn read_jar(path: &Path) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
    let mut archive = zip::ZipArchive::new(std::fs::File::open(path)?)?;
    let mut entries = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        entries.push((entry.name().to_string(), data));
    }
    Ok(entries)
}

fn stage(json: &str) -> anyhow::Result<AmsTransform> {
    let settings = AmsConfig::from_json(json)?.into_settings()?;
    Ok(AmsTransform::new(Arc::new(settings)))
}

fn invocation(base: &Path, inputs: Vec<TransformInput>, incremental: bool) -> TransformInvocation {
    TransformInvocation {
        inputs,
        output: OutputLayout::new(base.join("out")),
        incremental,
        state_path: base.join("out.state.lmdb"),
        cancel: CancellationToken::new(),
    }
}

fn jar_output(inv: &TransformInvocation, scope: Scope, jar: &Path) -> PathBuf {
    inv.output
        .root()
        .join(inv.output.content_location(scope, InputKind::Jar, jar))
}

fn dir_output(inv: &TransformInvocation, dir: &Path, relative: &str) -> PathBuf {
    inv.output.root().join(format!(
        "{}/{relative}",
        inv.output
            .content_location(Scope::Project, InputKind::Directory, dir)
    ))
}

struct Scenario {
    base: PathBuf,
    jar: PathBuf,
    a: Vec<u8>,
    b: Vec<u8>,
}

/// One jar holding `A` (matched by r1), `B` (matched by nothing) and a
/// malformed `C`.
fn abc_scenario(name: &str) -> anyhow::Result<Scenario> {
    let base = temp_dir(name);
    let jar = base.join("libs/abc.jar");
    let a = fixture::sample_class("com/example/A");
    let b = fixture::sample_class("org/other/B");
    write_jar(
        &jar,
        &[
            ("com/example/A.class", &a),
            ("org/other/B.class", &b),
            ("C.class", MALFORMED),
        ],
    )?;
    Ok(Scenario { base, jar, a, b })
}

#[test]
fn strict_mode_fails_on_malformed_class_and_writes_nothing() -> anyhow::Result<()> {
    let s = abc_scenario("strict")?;
    let stage = stage(&format!(r#"{{"strictMode": true, "rules": [{R1}]}}"#))?;
    let inv = invocation(
        &s.base,
        vec![TransformInput::jar(Scope::ExternalLibraries, s.jar.clone())],
        true,
    );

    let err = stage.transform(&inv).unwrap_err();
    let RunError::Failed(failures) = &err else {
        panic!("expected a failed run, got {err}");
    };
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].artifact, format!("{}!/C.class", s.jar.display()));
    assert_eq!(failures[0].kind, ErrorKind::MalformedClass);
    assert!(err.to_string().contains("C.class: MalformedClassError"));

    assert!(!jar_output(&inv, Scope::ExternalLibraries, &s.jar).exists());
    assert!(!inv.output.staging_dir().exists());
    assert!(!inv.output.scope_dir(Scope::ExternalLibraries).exists());

    let _ = std::fs::remove_dir_all(&s.base);
    Ok(())
}

#[test]
fn lenient_mode_passes_malformed_class_through() -> anyhow::Result<()> {
    let s = abc_scenario("lenient")?;
    let stage = stage(&format!(r#"{{"strictMode": false, "rules": [{R1}]}}"#))?;
    let inv = invocation(
        &s.base,
        vec![TransformInput::jar(Scope::ExternalLibraries, s.jar.clone())],
        true,
    );

    let report = stage.transform(&inv)?;
    assert_eq!(report.classes_rewritten, 1);
    assert_eq!(report.classes_skipped, 1);
    assert_eq!(report.classes_failed, 1);
    assert_eq!(report.matches.len(), 1);
    assert_eq!(report.matches[0].class, "com.example.A");
    assert_eq!(report.matches[0].rule, "r1");

    let c_name = format!("{}!/C.class", s.jar.display());
    let c = report
        .artifacts
        .iter()
        .find(|a| a.artifact == c_name)
        .expect("C is reported");
    assert!(c.passthrough);
    assert_eq!(c.error_kind, Some(ErrorKind::MalformedClass));

    let entries = read_jar(&jar_output(&inv, Scope::ExternalLibraries, &s.jar))?;
    let names: Vec<&str> = entries.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["com/example/A.class", "org/other/B.class", "C.class"]);

    assert_ne!(entries[0].1, s.a);
    let rewritten = ParsedClass::parse(&entries[0].1)?;
    assert_eq!(rewritten.applied_rules, vec!["r1"]);
    assert_eq!(entries[1].1, s.b);
    assert_eq!(entries[2].1, MALFORMED);

    let _ = std::fs::remove_dir_all(&s.base);
    Ok(())
}

#[test]
fn transforming_an_output_again_is_byte_identical() -> anyhow::Result<()> {
    let base = temp_dir("idempotent");
    let jar = base.join("in/app.jar");
    write_jar(&jar, &[("com/example/A.class", &fixture::sample_class("com/example/A"))])?;
    let stage = stage(&format!(r#"{{"rules": [{R1}]}}"#))?;

    let first = invocation(
        &base.join("first"),
        vec![TransformInput::jar(Scope::Project, jar.clone())],
        false,
    );
    stage.transform(&first)?;
    let once = jar_output(&first, Scope::Project, &jar);

    let second = invocation(
        &base.join("second"),
        vec![TransformInput::jar(Scope::Project, once.clone())],
        false,
    );
    let report = stage.transform(&second)?;
    assert_eq!(report.classes_rewritten, 0);
    assert_eq!(report.classes_skipped, 1);

    let twice = jar_output(&second, Scope::Project, &once);
    assert_eq!(read_jar(&once)?, read_jar(&twice)?);

    let _ = std::fs::remove_dir_all(&base);
    Ok(())
}

#[test]
fn streaming_and_in_memory_jars_agree() -> anyhow::Result<()> {
    let s = abc_scenario("streaming")?;
    let mut outputs = Vec::new();
    for (label, threshold) in [("memory", u64::MAX), ("stream", 0)] {
        let stage = stage(&format!(
            r#"{{"strictMode": false, "jarStreamThreshold": {threshold}, "rules": [{R1}]}}"#
        ))?;
        let inv = invocation(
            &s.base.join(label),
            vec![TransformInput::jar(Scope::ExternalLibraries, s.jar.clone())],
            false,
        );
        let report = stage.transform(&inv)?;
        assert_eq!(report.classes_rewritten, 1);
        outputs.push(read_jar(&jar_output(&inv, Scope::ExternalLibraries, &s.jar))?);
    }
    assert_eq!(outputs[0], outputs[1]);

    let _ = std::fs::remove_dir_all(&s.base);
    Ok(())
}

#[test]
fn incremental_runs_reuse_unchanged_units() -> anyhow::Result<()> {
    let base = temp_dir("incremental");
    let classes = base.join("app/classes");
    write_file(&classes.join("com/example/A.class"), &fixture::sample_class("com/example/A"))?;
    write_file(&classes.join("org/other/B.class"), &fixture::sample_class("org/other/B"))?;
    write_file(&classes.join("res/notes.txt"), b"kept as-is")?;
    let stage = stage(&format!(r#"{{"rules": [{R1}]}}"#))?;
    let inputs = vec![TransformInput::directory(Scope::Project, classes.clone())];

    let first = stage.transform(&invocation(&base, inputs.clone(), true))?;
    assert!(!first.incremental);
    assert_eq!(first.units, 3);
    assert_eq!(first.classes_rewritten, 1);
    assert_eq!(first.resources_copied, 1);

    let inv = invocation(&base, inputs.clone(), true);
    let a_out = dir_output(&inv, &classes, "com/example/A.class");
    let rewritten_a = std::fs::read(&a_out)?;
    assert_eq!(std::fs::read(dir_output(&inv, &classes, "res/notes.txt"))?, b"kept as-is");

    let second = stage.transform(&inv)?;
    assert!(second.incremental);
    assert_eq!(second.reused_units, 3);
    assert_eq!(second.classes_rewritten, 0);
    assert_eq!(std::fs::read(&a_out)?, rewritten_a);

    let mut fx = ClassFixture::new("org/other/B");
    fx.method(fixture::run_method());
    let changed_b = fx.build();
    write_file(&classes.join("org/other/B.class"), &changed_b)?;
    let third = stage.transform(&inv)?;
    assert_eq!(third.reused_units, 2);
    assert_eq!(third.classes_skipped, 1);
    assert_eq!(std::fs::read(dir_output(&inv, &classes, "org/other/B.class"))?, changed_b);

    std::fs::remove_file(classes.join("com/example/A.class"))?;
    let fourth = stage.transform(&inv)?;
    assert_eq!(fourth.units, 2);
    assert_eq!(fourth.removed_outputs, 1);
    assert!(!a_out.exists());

    let _ = std::fs::remove_dir_all(&base);
    Ok(())
}

#[test]
fn settings_change_forces_a_full_run() -> anyhow::Result<()> {
    let base = temp_dir("fingerprint");
    let classes = base.join("classes");
    write_file(&classes.join("com/example/A.class"), &fixture::sample_class("com/example/A"))?;
    let inputs = vec![TransformInput::directory(Scope::Project, classes.clone())];

    let traced = stage(&format!(r#"{{"rules": [{R1}]}}"#))?;
    traced.transform(&invocation(&base, inputs.clone(), true))?;
    let inv = invocation(&base, inputs, true);
    let report = stage("{}")?.transform(&inv)?;
    assert!(!report.incremental);
    assert_eq!(report.reused_units, 0);
    assert_eq!(report.classes_skipped, 1);
    assert_eq!(
        std::fs::read(dir_output(&inv, &classes, "com/example/A.class"))?,
        fixture::sample_class("com/example/A")
    );

    let _ = std::fs::remove_dir_all(&base);
    Ok(())
}

#[test]
fn conflicting_rules_abort_before_output() -> anyhow::Result<()> {
    let base = temp_dir("conflict");
    let classes = base.join("classes");
    write_file(&classes.join("com/example/A.class"), &fixture::sample_class("com/example/A"))?;
    write_file(&classes.join("org/other/B.class"), &fixture::sample_class("org/other/B"))?;
    let stage = stage(&format!(
        r#"{{"strictMode": false, "rules": [{R1},
            {{"id": "stub", "classes": {{"packagePrefix": "com.example"}},
              "methods": {{"name": "compute"}}, "action": {{"kind": "replaceBody"}}}}]}}"#
    ))?;
    let inv = invocation(&base, vec![TransformInput::directory(Scope::Project, classes)], true);

    let err = stage.transform(&inv).unwrap_err();
    let RunError::Conflict(conflicts) = &err else {
        panic!("expected a conflict, got {err}");
    };
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].kind, ErrorKind::ConflictingRule);
    assert!(conflicts[0].message.contains("'r1' and 'stub'"));
    assert!(!inv.output.scope_dir(Scope::Project).exists());
    {
        let store = StateStore::open(&inv.state_path)?;
        assert!(store.load()?.is_empty());
    }

    let _ = std::fs::remove_dir_all(&base);
    Ok(())
}

#[test]
fn cancelled_run_touches_nothing() -> anyhow::Result<()> {
    let s = abc_scenario("cancel")?;
    let inv = invocation(
        &s.base,
        vec![TransformInput::jar(Scope::ExternalLibraries, s.jar.clone())],
        true,
    );
    inv.cancel.cancel();
    let err = stage("{}")?.transform(&inv).unwrap_err();
    assert!(matches!(err, RunError::Cancelled));
    assert!(!inv.output.root().exists());

    let _ = std::fs::remove_dir_all(&s.base);
    Ok(())
}

#[test]
fn disabled_stage_forwards_everything() -> anyhow::Result<()> {
    let s = abc_scenario("disabled")?;
    let inv = invocation(
        &s.base,
        vec![TransformInput::jar(Scope::ExternalLibraries, s.jar.clone())],
        false,
    );
    let stage = stage(&format!(r#"{{"enabled": false, "rules": [{R1}]}}"#))?;
    let report: RunReport = stage.transform(&inv)?;
    assert_eq!(report.classes_skipped, 3);
    let entries = read_jar(&jar_output(&inv, Scope::ExternalLibraries, &s.jar))?;
    assert_eq!(entries[0].1, s.a);
    assert_eq!(entries[2].1, MALFORMED);

    let _ = std::fs::remove_dir_all(&s.base);
    Ok(())
}

#[test]
fn disabling_incremental_mode_invalidates_the_state() -> anyhow::Result<()> {
    let base = temp_dir("toggle");
    let classes = base.join("classes");
    let a_path = classes.join("com/example/A.class");
    let v1 = fixture::sample_class("com/example/A");
    let mut fx = ClassFixture::new("com/example/A");
    fx.method(fixture::run_method());
    let v2 = fx.build();
    let inputs = vec![TransformInput::directory(Scope::Project, classes.clone())];
    let on = stage(&format!(r#"{{"rules": [{R1}]}}"#))?;
    let off = stage(&format!(r#"{{"incrementalEnabled": false, "rules": [{R1}]}}"#))?;
    let inv = invocation(&base, inputs, true);
    let a_out = dir_output(&inv, &classes, "com/example/A.class");

    write_file(&a_path, &v1)?;
    on.transform(&inv)?;
    let v1_rewritten = std::fs::read(&a_out)?;

    write_file(&a_path, &v2)?;
    off.transform(&inv)?;
    assert_ne!(std::fs::read(&a_out)?, v1_rewritten);
    assert!(!inv.state_path.exists());

    write_file(&a_path, &v1)?;
    let report = on.transform(&inv)?;
    assert!(!report.incremental);
    assert_eq!(report.reused_units, 0);
    assert_eq!(std::fs::read(&a_out)?, v1_rewritten);

    let _ = std::fs::remove_dir_all(&base);
    Ok(())
}

#[test]
fn write_failure_fails_the_run_in_both_modes() -> anyhow::Result<()> {
    let base = temp_dir("write_failure");
    // The staged copy appends `-<hash8>` to this name, past NAME_MAX.
    let classes = base.join("c".repeat(250));
    write_file(&classes.join("com/example/A.class"), &fixture::sample_class("com/example/A"))?;

    for strict in [true, false] {
        let stage = stage(&format!(r#"{{"strictMode": {strict}, "rules": [{R1}]}}"#))?;
        let inv = invocation(
            &base,
            vec![TransformInput::directory(Scope::Project, classes.clone())],
            true,
        );
        let err = stage.transform(&inv).unwrap_err();
        let RunError::Failed(failures) = &err else {
            panic!("expected a failed run (strict={strict}), got {err}");
        };
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind, ErrorKind::Io);
        assert!(failures[0].message.starts_with("write failed"), "{}", failures[0].message);
        assert!(!inv.output.scope_dir(Scope::Project).exists());
        assert!(!inv.output.staging_dir().exists());
        {
            let store = StateStore::open(&inv.state_path)?;
            assert!(store.load()?.is_empty());
        }
    }

    let _ = std::fs::remove_dir_all(&base);
    Ok(())
}

#[test]
fn failed_run_keeps_the_previous_state() -> anyhow::Result<()> {
    let base = temp_dir("failed_state");
    let classes = base.join("classes");
    write_file(&classes.join("com/example/A.class"), &fixture::sample_class("com/example/A"))?;
    write_file(&classes.join("org/other/B.class"), &fixture::sample_class("org/other/B"))?;
    let stage = stage(&format!(r#"{{"strictMode": true, "rules": [{R1}]}}"#))?;
    let inv = invocation(
        &base,
        vec![TransformInput::directory(Scope::Project, classes.clone())],
        true,
    );

    stage.transform(&inv)?;
    let before = {
        let store = StateStore::open(&inv.state_path)?;
        store.load()?
    };
    assert_eq!(before.records().count(), 2);

    write_file(&classes.join("C.class"), MALFORMED)?;
    assert!(matches!(stage.transform(&inv), Err(RunError::Failed(_))));
    let after = {
        let store = StateStore::open(&inv.state_path)?;
        store.load()?
    };
    assert_eq!(after.fingerprint, before.fingerprint);
    assert_eq!(
        after.records().map(|r| r.key.clone()).collect::<Vec<_>>(),
        before.records().map(|r| r.key.clone()).collect::<Vec<_>>()
    );

    std::fs::remove_file(classes.join("C.class"))?;
    let report = stage.transform(&inv)?;
    assert!(report.incremental);
    assert_eq!(report.reused_units, 2);

    let _ = std::fs::remove_dir_all(&base);
    Ok(())
}

fn run_json(args: &[&str]) -> anyhow::Result<Value> {
    let out = Command::new(env!("CARGO_BIN_EXE_ams-transform"))
        .args(args)
        .output()?;
    if !out.status.success() {
        anyhow::bail!(
            "command failed: {}\nstderr: {}",
            out.status,
            String::from_utf8_lossy(&out.stderr)
        );
    }
    Ok(serde_json::from_slice(&out.stdout)?)
}

#[test]
fn cli_describes_runs_and_inspects() -> anyhow::Result<()> {
    let base = temp_dir("cli");
    let config = base.join("ams.json");
    write_file(&config, format!(r#"{{"rules": [{R1}]}}"#).as_bytes())?;
    let classes = base.join("classes");
    write_file(&classes.join("com/example/A.class"), &fixture::sample_class("com/example/A"))?;
    let config_arg = config.to_string_lossy().to_string();
    let classes_arg = classes.to_string_lossy().to_string();
    let output_arg = base.join("out").to_string_lossy().to_string();

    let descriptor = run_json(&["describe", "--config", &config_arg])?;
    assert_eq!(descriptor["name"], "amsTransform");
    assert_eq!(descriptor["outputKind"], "CLASSES");

    let report = run_json(&[
        "run",
        "--config",
        &config_arg,
        "--output",
        &output_arg,
        "--project",
        &classes_arg,
    ])?;
    assert_eq!(report["classesRewritten"], 1);
    assert_eq!(report["matches"][0]["rule"], "r1");

    let layout = OutputLayout::new(base.join("out"));
    let rewritten = layout.root().join(format!(
        "{}/com/example/A.class",
        layout.content_location(Scope::Project, InputKind::Directory, &classes)
    ));
    let summary = run_json(&["inspect", &rewritten.to_string_lossy()])?;
    assert_eq!(summary["name"], "com.example.A");
    assert_eq!(summary["applied_rules"][0], "r1");

    let out = Command::new(env!("CARGO_BIN_EXE_ams-transform"))
        .args(["clean", "--output", &output_arg])
        .output()?;
    assert!(out.status.success());
    assert!(!base.join("out.state.lmdb").exists());

    let _ = std::fs::remove_dir_all(&base);
    Ok(())
}

#[test]
fn cli_run_failure_lists_every_artifact() -> anyhow::Result<()> {
    let base = temp_dir("cli_fail");
    let config = base.join("ams.json");
    write_file(&config, b"{}")?;
    let classes = base.join("classes");
    write_file(&classes.join("X.class"), MALFORMED)?;
    write_file(&classes.join("Y.class"), b"junk")?;

    let out = Command::new(env!("CARGO_BIN_EXE_ams-transform"))
        .args([
            "run",
            "--config",
            &config.to_string_lossy(),
            "--output",
            &base.join("out").to_string_lossy(),
            "--project",
            &classes.to_string_lossy(),
        ])
        .output()?;
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("2 artifact(s) failed"), "{stderr}");
    assert!(stderr.contains("X.class: MalformedClassError"), "{stderr}");
    assert!(stderr.contains("Y.class: MalformedClassError"), "{stderr}");

    let _ = std::fs::remove_dir_all(&base);
    Ok(())
}
