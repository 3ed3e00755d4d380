use anyhow::{Context, Result};
use ignore::WalkBuilder;
use std::path::Path;
use std::sync::mpsc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::artifact::InputUnit;
use crate::stage::{InputKind, TransformInput};

/// Files under `root`, as sorted `/`-separated relative paths.
pub fn scan_directory(root: &Path) -> Result<Vec<String>> {
    if !root.is_dir() {
        anyhow::bail!("input directory not found: {}", root.display());
    }

    let (tx, rx) = mpsc::channel();
    let walker = WalkBuilder::new(root)
        .hidden(false)
        .ignore(false)
        .parents(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .build_parallel();

    walker.run(|| {
        let tx = tx.clone();
        Box::new(move |entry| {
            if let Ok(entry) = entry
                && entry.file_type().is_some_and(|t| t.is_file())
            {
                let _ = tx.send(entry.into_path());
            }
            ignore::WalkState::Continue
        })
    });
    drop(tx);

    let mut files = Vec::new();
    for path in rx.iter() {
        let relative = path
            .strip_prefix(root)
            .with_context(|| format!("walked outside input root: {}", path.display()))?;
        files.push(to_slash(relative));
    }
    files.sort_unstable();
    Ok(files)
}

/// Expands transform inputs into schedulable units, in input order.
pub fn collect_units(inputs: &[TransformInput]) -> Result<Vec<InputUnit>> {
    let mut units = Vec::new();
    for input in inputs {
        match input.kind {
            InputKind::Jar => {
                if !input.path.is_file() {
                    anyhow::bail!("input jar not found: {}", input.path.display());
                }
                units.push(InputUnit::jar(input.scope, input.path.clone()));
            }
            InputKind::Directory => {
                for relative in scan_directory(&input.path)? {
                    units.push(InputUnit::directory_file(
                        input.scope,
                        input.path.clone(),
                        relative,
                    ));
                }
            }
        }
    }
    Ok(units)
}

pub fn to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Modification time in nanoseconds since the epoch, zero when unavailable.
pub fn modified_nanos(path: &Path) -> u64 {
    let mtime = path
        .metadata()
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let nanos = mtime
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    u64::try_from(nanos).unwrap_or(u64::MAX)
}

pub fn is_jar(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "jar")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::Scope;
    use std::fs;
    use std::path::PathBuf;

    fn temp_dir(prefix: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!(
            "{prefix}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        p
    }

    #[test]
    fn scan_directory_lists_nested_files_sorted() {
        let base = temp_dir("ams-scan");
        fs::create_dir_all(base.join("com/example")).unwrap();
        fs::write(base.join("com/example/B.class"), b"b").unwrap();
        fs::write(base.join("com/example/A.class"), b"a").unwrap();
        fs::write(base.join(".hidden.txt"), b"h").unwrap();

        let files = scan_directory(&base).unwrap();
        assert_eq!(
            files,
            vec![".hidden.txt", "com/example/A.class", "com/example/B.class"]
        );
        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn collect_units_expands_directories_and_keeps_jars_whole() {
        let base = temp_dir("ams-units");
        let classes = base.join("classes");
        fs::create_dir_all(&classes).unwrap();
        fs::write(classes.join("A.class"), b"a").unwrap();
        let jar = base.join("lib.jar");
        fs::write(&jar, b"not really a jar").unwrap();

        let units = collect_units(&[
            TransformInput::directory(Scope::Project, classes.clone()),
            TransformInput::jar(Scope::ExternalLibraries, jar.clone()),
        ])
        .unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].path(), classes.join("A.class"));
        assert_eq!(units[1].path(), jar);
        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn missing_inputs_are_errors() {
        let base = temp_dir("ams-missing");
        assert!(scan_directory(&base).is_err());
        assert!(collect_units(&[TransformInput::jar(Scope::Project, base.join("x.jar"))]).is_err());
    }
}
