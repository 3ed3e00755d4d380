//! Include/exclude filtering of class names.
//!
//! Patterns use gitignore glob semantics over internal class names, so
//! `com.example.**`, `com/example` and `*Activity` all work. A pattern that
//! names a package also covers every class below it.

use anyhow::{Context, Result};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::path::Path;

/// Simple names of classes the Android build generates.
const GENERATED: &[&str] = &["R", "BuildConfig", "Manifest", "module-info", "package-info"];

#[derive(Debug, Clone)]
pub struct ClassFilter {
    include: Option<Gitignore>,
    exclude: Option<Gitignore>,
    exclude_generated: bool,
}

impl ClassFilter {
    pub fn new(include: &[String], exclude: &[String], exclude_generated: bool) -> Result<Self> {
        Ok(Self {
            include: build_matcher(include).context("invalid includePatterns")?,
            exclude: build_matcher(exclude).context("invalid excludePatterns")?,
            exclude_generated,
        })
    }

    /// Whether `internal_name` (e.g. `com/example/Foo$1`) is offered to the ruleset.
    pub fn accepts(&self, internal_name: &str) -> bool {
        if self.exclude_generated && is_generated(internal_name) {
            return false;
        }
        let included = self
            .include
            .as_ref()
            .is_none_or(|m| matches(m, internal_name));
        included && !self.exclude.as_ref().is_some_and(|m| matches(m, internal_name))
    }
}

fn build_matcher(patterns: &[String]) -> Result<Option<Gitignore>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GitignoreBuilder::new("");
    for pattern in patterns {
        let line = normalize_pattern(pattern);
        builder
            .add_line(None, &line)
            .with_context(|| format!("bad pattern '{pattern}'"))?;
    }
    Ok(Some(builder.build()?))
}

/// `com.example.**` → `com/example/**`.
fn normalize_pattern(pattern: &str) -> String {
    pattern.trim().replace('.', "/")
}

fn matches(matcher: &Gitignore, internal_name: &str) -> bool {
    matcher
        .matched_path_or_any_parents(Path::new(internal_name), false)
        .is_ignore()
}

pub fn is_generated(internal_name: &str) -> bool {
    let simple = internal_name.rsplit('/').next().unwrap_or(internal_name);
    if GENERATED.contains(&simple) {
        return true;
    }
    ["R$", "Manifest$"].iter().any(|p| simple.starts_with(p))
}

/// `com/example/Foo.class` → `com/example/Foo`; `None` for other files and
/// for multi-release copies under `META-INF/`.
pub fn class_name_from_entry(entry: &str) -> Option<&str> {
    let name = entry.strip_suffix(".class")?;
    if name.is_empty() || entry.starts_with("META-INF/") {
        return None;
    }
    Some(name)
}
