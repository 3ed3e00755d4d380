//! Instrumentation rules.
//!
//! A rule pairs a class predicate and an optional method selector with one
//! bytecode action. Every matching rule applies, in declaration order;
//! `apply` only records the edits on the `ParsedClass`, the rewriter turns
//! them into code.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::classfile::{MethodInfo, ParsedClass};
use crate::error::ConflictingRuleError;

/// Descriptor every hook method must have: `static void hook(String site)`.
pub const HOOK_DESCRIPTOR: &str = "(Ljava/lang/String;)V";

const ACC_NATIVE: u16 = 0x0100;
const ACC_ABSTRACT: u16 = 0x0400;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClassPredicate {
    ClassName(String),
    PackagePrefix(String),
    Annotation(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MethodSelector {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub descriptor: Option<String>,
    #[serde(default)]
    pub annotation: Option<String>,
    #[serde(default)]
    pub include_constructors: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RuleAction {
    EnterHook { owner: String, method: String },
    ExitHook { owner: String, method: String },
    ReplaceBody,
}

/// A rule as written in the settings file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RuleConfig {
    pub id: String,
    pub classes: ClassPredicate,
    #[serde(default)]
    pub methods: Option<MethodSelector>,
    pub action: RuleAction,
}

/// A static hook call target, owner in internal form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Hook {
    pub owner: String,
    pub method: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
enum Action {
    Enter(Hook),
    Exit(Hook),
    Replace,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
enum Predicate {
    /// Internal name.
    Class(String),
    /// Internal package prefix ending in `/`.
    Package(String),
    /// Annotation type descriptor.
    Annotated(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct Selector {
    name: Option<String>,
    descriptor: Option<String>,
    annotation: Option<String>,
    include_constructors: bool,
}

impl Selector {
    fn accepts(&self, method: &MethodInfo) -> bool {
        if method.code.is_none() || method.access_flags & (ACC_ABSTRACT | ACC_NATIVE) != 0 {
            return false;
        }
        if method.is_constructor() && !self.include_constructors {
            return false;
        }
        self.name.as_ref().is_none_or(|n| *n == method.name)
            && self
                .descriptor
                .as_ref()
                .is_none_or(|d| *d == method.descriptor)
            && self
                .annotation
                .as_ref()
                .is_none_or(|a| method.annotations.contains(a))
    }
}

/// A validated rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rule {
    pub id: String,
    predicate: Predicate,
    selector: Selector,
    action: Action,
}

impl Rule {
    pub fn from_config(config: RuleConfig) -> Result<Self> {
        let id = config.id.trim().to_string();
        if id.is_empty() {
            bail!("rule id must not be empty");
        }

        let predicate = match config.classes {
            ClassPredicate::ClassName(name) => Predicate::Class(internal_name(&id, &name)?),
            ClassPredicate::PackagePrefix(prefix) => {
                let mut prefix = internal_name(&id, &prefix)?;
                prefix.push('/');
                Predicate::Package(prefix)
            }
            ClassPredicate::Annotation(a) => Predicate::Annotated(annotation_descriptor(&id, &a)?),
        };

        let selector = config.methods.unwrap_or_default();
        let selector = Selector {
            name: selector.name,
            descriptor: selector.descriptor,
            annotation: selector
                .annotation
                .map(|a| annotation_descriptor(&id, &a))
                .transpose()?,
            include_constructors: selector.include_constructors,
        };

        let action = match config.action {
            RuleAction::EnterHook { owner, method } => Action::Enter(hook(&id, &owner, &method)?),
            RuleAction::ExitHook { owner, method } => Action::Exit(hook(&id, &owner, &method)?),
            RuleAction::ReplaceBody => Action::Replace,
        };

        Ok(Self {
            id,
            predicate,
            selector,
            action,
        })
    }

    fn matches(&self, class: &ClassDescriptor<'_>) -> bool {
        match &self.predicate {
            Predicate::Class(name) => class.name == name,
            Predicate::Package(prefix) => class.name.starts_with(prefix.as_str()),
            Predicate::Annotated(desc) => class.annotations.iter().any(|a| a == desc),
        }
    }
}

fn internal_name(rule: &str, name: &str) -> Result<String> {
    let name = name.trim().trim_end_matches(".*").trim_matches('/');
    if name.is_empty() || name.contains(['*', ';', '[', ' ']) {
        bail!("rule '{rule}': invalid class or package name '{name}'");
    }
    Ok(name.replace('.', "/"))
}

fn annotation_descriptor(rule: &str, name: &str) -> Result<String> {
    let name = name.trim();
    if name.starts_with('L') && name.ends_with(';') && name.len() > 2 {
        return Ok(name.to_string());
    }
    Ok(format!("L{};", internal_name(rule, name.trim_start_matches('@'))?))
}

fn hook(rule: &str, owner: &str, method: &str) -> Result<Hook> {
    let owner = internal_name(rule, owner)?;
    let valid_method = !method.is_empty()
        && !method.contains(['.', ';', '[', '/', '<', '>', ' '])
        && !method.starts_with(|c: char| c.is_ascii_digit());
    if !valid_method {
        bail!("rule '{rule}': invalid hook method name '{method}'");
    }
    Ok(Hook {
        owner,
        method: method.to_string(),
    })
}

/// What rule matching needs to know about a class.
#[derive(Debug, Clone, Copy)]
pub struct ClassDescriptor<'c> {
    /// Internal name.
    pub name: &'c str,
    pub annotations: &'c [String],
}

impl<'c> ClassDescriptor<'c> {
    pub fn of(class: &'c ParsedClass<'_>) -> Self {
        Self {
            name: &class.name,
            annotations: &class.annotations,
        }
    }
}

/// A rule that applied to a class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleMatch {
    pub class: String,
    pub rule: String,
}

/// Edits accumulated for one method.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodEdit {
    pub enter: Vec<Hook>,
    pub exit: Vec<Hook>,
    /// Rule replacing the body, if any.
    pub replace: Option<String>,
    /// Every rule that touched the method, in application order.
    pub rules: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Ruleset {
    rules: Vec<Rule>,
}

impl Ruleset {
    pub fn from_config(configs: Vec<RuleConfig>) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut rules = Vec::with_capacity(configs.len());
        for config in configs {
            let rule = Rule::from_config(config)?;
            if !seen.insert(rule.id.clone()) {
                bail!("duplicate rule id '{}'", rule.id);
            }
            rules.push(rule);
        }
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Ids of the rules whose class predicate holds, in declaration order.
    pub fn matches(&self, class: &ClassDescriptor<'_>) -> Vec<&str> {
        self.rules
            .iter()
            .filter(|r| r.matches(class))
            .map(|r| r.id.as_str())
            .collect()
    }

    /// Records the edits of `rule_id` on `class`.
    ///
    /// Rules already listed in the class's marker attribute are skipped, so
    /// applying a ruleset to its own output changes nothing.
    pub fn apply<'a>(
        &self,
        rule_id: &str,
        mut class: ParsedClass<'a>,
    ) -> Result<ParsedClass<'a>, ConflictingRuleError> {
        let Some(rule) = self.rules.iter().find(|r| r.id == rule_id) else {
            return Ok(class);
        };
        if class.applied_rules.iter().any(|r| r == rule_id)
            || class.newly_applied.iter().any(|r| r == rule_id)
        {
            return Ok(class);
        }

        let targets: Vec<usize> = class
            .methods
            .iter()
            .enumerate()
            .filter(|(_, m)| rule.selector.accepts(m))
            // A replaced `<init>` would never call its super constructor.
            .filter(|(_, m)| !(rule.action == Action::Replace && m.name == "<init>"))
            .map(|(i, _)| i)
            .collect();

        for i in &targets {
            let edit = class.edits.entry(*i).or_default();
            let first = match (&rule.action, &edit.replace) {
                (_, Some(replacing)) => Some(replacing.clone()),
                (Action::Replace, None) => edit.rules.first().cloned(),
                _ => None,
            };
            if let Some(first) = first {
                return Err(ConflictingRuleError {
                    class: class.dotted_name(),
                    method: class.methods[*i].signature(),
                    first,
                    second: rule.id.clone(),
                });
            }

            match &rule.action {
                Action::Enter(h) => edit.enter.push(h.clone()),
                Action::Exit(h) => edit.exit.push(h.clone()),
                Action::Replace => edit.replace = Some(rule.id.clone()),
            }
            edit.rules.push(rule.id.clone());
        }

        if !targets.is_empty() {
            class.newly_applied.push(rule.id.clone());
        }
        Ok(class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{self, ClassFixture};

    fn rules(json: &str) -> Ruleset {
        let configs: Vec<RuleConfig> = serde_json::from_str(json).unwrap();
        Ruleset::from_config(configs).unwrap()
    }

    const TRACE: &str = r#"[
        {"id": "trace", "classes": {"packagePrefix": "com.example"},
         "action": {"kind": "enterHook", "owner": "com.example.Tracer", "method": "enter"}},
        {"id": "timing", "classes": {"className": "com.example.Foo"},
         "methods": {"name": "compute"},
         "action": {"kind": "exitHook", "owner": "com/example/Tracer", "method": "exit"}}
    ]"#;

    #[test]
    fn parses_config_forms() {
        let set = rules(TRACE);
        assert_eq!(set.len(), 2);
        assert_eq!(
            set.rules[0].action,
            Action::Enter(Hook {
                owner: "com/example/Tracer".to_string(),
                method: "enter".to_string()
            })
        );
        assert_eq!(set.rules[0].predicate, Predicate::Package("com/example/".to_string()));
    }

    #[test]
    fn rejects_invalid_rules() {
        let bad_method: Vec<RuleConfig> = serde_json::from_str(
            r#"[{"id": "x", "classes": {"className": "a.B"},
                 "action": {"kind": "enterHook", "owner": "a.T", "method": "a.b"}}]"#,
        )
        .unwrap();
        assert!(Ruleset::from_config(bad_method).is_err());

        let dup: Vec<RuleConfig> = serde_json::from_str(
            r#"[{"id": "x", "classes": {"className": "a.B"}, "action": {"kind": "replaceBody"}},
                {"id": "x", "classes": {"className": "a.C"}, "action": {"kind": "replaceBody"}}]"#,
        )
        .unwrap();
        let err = Ruleset::from_config(dup).unwrap_err();
        assert!(err.to_string().contains("duplicate rule id 'x'"));

        let unknown = serde_json::from_str::<Vec<RuleConfig>>(
            r#"[{"id": "x", "classes": {"className": "a.B"}, "action": {"kind": "replaceBody"}, "extra": 1}]"#,
        );
        assert!(unknown.is_err());
    }

    #[test]
    fn matches_all_predicates_in_declaration_order() {
        let set = rules(
            r#"[
            {"id": "by-annotation", "classes": {"annotation": "com.example.Trace"}, "action": {"kind": "replaceBody"}},
            {"id": "by-package", "classes": {"packagePrefix": "com.example"}, "action": {"kind": "replaceBody"}},
            {"id": "by-name", "classes": {"className": "com.example.Foo"}, "action": {"kind": "replaceBody"}},
            {"id": "other", "classes": {"packagePrefix": "com.examples"}, "action": {"kind": "replaceBody"}}
        ]"#,
        );
        let annotations = vec!["Lcom/example/Trace;".to_string()];
        let class = ClassDescriptor {
            name: "com/example/Foo",
            annotations: &annotations,
        };
        assert_eq!(set.matches(&class), vec!["by-annotation", "by-package", "by-name"]);

        let nested = ClassDescriptor {
            name: "com/example/sub/Bar",
            annotations: &[],
        };
        assert_eq!(set.matches(&nested), vec!["by-package"]);
    }

    #[test]
    fn apply_records_edits_on_selected_methods_only() {
        let set = rules(TRACE);
        let bytes = fixture::sample_class("com/example/Foo");
        let mut class = ParsedClass::parse(&bytes).unwrap();
        let ids = set.matches(&ClassDescriptor::of(&class));
        for id in ids {
            class = set.apply(id, class).unwrap();
        }

        // <init> is skipped by default; run, compute, pick, guarded are entered.
        let edited: Vec<usize> = class.edits.keys().copied().collect();
        assert_eq!(edited, vec![1, 2, 3, 4]);
        let compute = &class.edits[&2];
        assert_eq!(compute.enter.len(), 1);
        assert_eq!(compute.exit.len(), 1);
        assert_eq!(compute.rules, vec!["trace", "timing"]);
        assert_eq!(class.newly_applied, vec!["trace", "timing"]);
    }

    #[test]
    fn replace_body_conflicts_with_hooks_on_the_same_method() {
        let set = rules(
            r#"[
            {"id": "trace", "classes": {"className": "a.B"},
             "action": {"kind": "enterHook", "owner": "a.T", "method": "enter"}},
            {"id": "stub", "classes": {"className": "a.B"}, "methods": {"name": "run"},
             "action": {"kind": "replaceBody"}}
        ]"#,
        );
        let bytes = fixture::sample_class("a/B");
        let class = ParsedClass::parse(&bytes).unwrap();
        let class = set.apply("trace", class).unwrap();
        let err = set.apply("stub", class).unwrap_err();
        assert_eq!(err.method, "run()V");
        assert_eq!((err.first.as_str(), err.second.as_str()), ("trace", "stub"));
    }

    #[test]
    fn already_applied_rules_are_skipped() {
        let set = rules(TRACE);
        let bytes = fixture::sample_class("com/example/Foo");
        let mut class = ParsedClass::parse(&bytes).unwrap();
        class.applied_rules.push("trace".to_string());
        let class = set.apply("trace", class).unwrap();
        assert!(!class.has_edits());
    }

    #[test]
    fn constructors_and_bodiless_methods_need_opt_in() {
        let mut fx = ClassFixture::new("a/B");
        let ctor = fixture::constructor(&mut fx);
        fx.method(ctor).method(fixture::MethodFixture::new(
            fixture::ACC_PUBLIC | fixture::ACC_ABSTRACT,
            "todo",
            "()V",
            None,
        ));
        let bytes = fx.build();

        let set = rules(
            r#"[{"id": "ctor", "classes": {"className": "a.B"},
                 "methods": {"includeConstructors": true},
                 "action": {"kind": "enterHook", "owner": "a.T", "method": "enter"}}]"#,
        );
        let class = set.apply("ctor", ParsedClass::parse(&bytes).unwrap()).unwrap();
        let edited: Vec<usize> = class.edits.keys().copied().collect();
        assert_eq!(edited, vec![0]);
    }
}
