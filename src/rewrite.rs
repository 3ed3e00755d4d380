//! Class rewriter.
//!
//! Serializes a `ParsedClass` with its recorded method edits applied. The
//! constant pool is written verbatim with new entries appended, untouched
//! methods and attributes are copied from their original byte spans, and
//! every edited method passes the local verifier before any bytes are
//! returned.

use crate::bytecode::{self, op};
use crate::classfile::{MARKER_ATTRIBUTE, MethodInfo, ParsedClass};
use crate::constant_pool::ConstantPool;
use crate::error::{VerificationError, VerifyFault};
use crate::relocate::{self, Insertion, MethodBody};
use crate::rules::{HOOK_DESCRIPTOR, Hook, MethodEdit};
use crate::verify;

/// Produces the rewritten class file; unedited classes come back unchanged.
pub fn rewrite(class: &ParsedClass<'_>) -> Result<Vec<u8>, VerificationError> {
    if !class.has_edits() {
        return Ok(class.bytes().to_vec());
    }

    let bytes = class.bytes();
    let mut pool = class.pool.clone();

    let mut methods = Vec::with_capacity(bytes.len());
    methods.extend_from_slice(&(class.methods.len() as u16).to_be_bytes());
    for (i, method) in class.methods.iter().enumerate() {
        match class.edits.get(&i) {
            Some(edit) => {
                write_edited_method(class, method, edit, &mut pool, &mut methods).map_err(
                    |fault| VerificationError {
                        class: class.dotted_name(),
                        method: method.signature(),
                        fault,
                    },
                )?;
            }
            None => methods.extend_from_slice(&bytes[method.span.clone()]),
        }
    }

    let marker = marker_attribute(class, &mut pool).ok_or_else(|| VerificationError {
        class: class.dotted_name(),
        method: "<class>".to_string(),
        fault: VerifyFault::ConstantPoolFull,
    })?;

    let mut out = Vec::with_capacity(bytes.len() + methods.len() / 4);
    out.extend_from_slice(&bytes[..8]);
    pool.write(bytes, &mut out);
    out.extend_from_slice(&class.access_flags.to_be_bytes());
    out.extend_from_slice(&class.this_class.to_be_bytes());
    out.extend_from_slice(&class.super_class.to_be_bytes());
    out.extend_from_slice(&(class.interfaces.len() as u16).to_be_bytes());
    for i in &class.interfaces {
        out.extend_from_slice(&i.to_be_bytes());
    }
    out.extend_from_slice(&bytes[class.fields_span()]);
    out.extend_from_slice(&methods);

    let kept: Vec<_> = class
        .attributes
        .iter()
        .filter(|a| a.name != MARKER_ATTRIBUTE)
        .collect();
    out.extend_from_slice(&(kept.len() as u16 + 1).to_be_bytes());
    for attr in kept {
        out.extend_from_slice(&bytes[attr.span()]);
    }
    out.extend_from_slice(&marker);
    Ok(out)
}

fn write_edited_method(
    class: &ParsedClass<'_>,
    method: &MethodInfo,
    edit: &MethodEdit,
    pool: &mut ConstantPool,
    out: &mut Vec<u8>,
) -> Result<(), VerifyFault> {
    let code = method
        .code
        .as_ref()
        .ok_or_else(|| VerifyFault::UnrelocatableAttribute("missing Code".to_string()))?;

    let mut body = if edit.replace.is_some() {
        default_return(&method.descriptor, code.max_locals)?
    } else {
        let site = format!("{}#{}", class.dotted_name(), method.signature());
        let prologue = hook_calls(&edit.enter, &site, pool)?;
        let epilogue = hook_calls(&edit.exit, &site, pool)?;
        relocate::relocate(
            class,
            code,
            Insertion {
                prologue: &prologue,
                epilogue: &epilogue,
            },
        )?
    };
    let computed = verify::verify(&body, pool)?;
    body.max_stack = body.max_stack.max(computed);

    let bytes = class.bytes();
    out.extend_from_slice(&method.access_flags.to_be_bytes());
    out.extend_from_slice(&method.name_index.to_be_bytes());
    out.extend_from_slice(&method.descriptor_index.to_be_bytes());
    out.extend_from_slice(&(method.attributes.len() as u16).to_be_bytes());
    for (i, attr) in method.attributes.iter().enumerate() {
        if i == code.attribute {
            let mut data = Vec::new();
            body.encode(&mut data);
            out.extend_from_slice(&attr.name_index.to_be_bytes());
            out.extend_from_slice(&(data.len() as u32).to_be_bytes());
            out.extend_from_slice(&data);
        } else {
            out.extend_from_slice(&bytes[attr.span()]);
        }
    }
    Ok(())
}

/// `ldc site; invokestatic owner.method(String)V` for each hook.
fn hook_calls(hooks: &[Hook], site: &str, pool: &mut ConstantPool) -> Result<Vec<u8>, VerifyFault> {
    let mut out = Vec::with_capacity(hooks.len() * 6);
    for hook in hooks {
        let string = pool.add_string(site).ok_or(VerifyFault::ConstantPoolFull)?;
        let target = pool
            .add_methodref(&hook.owner, &hook.method, HOOK_DESCRIPTOR)
            .ok_or(VerifyFault::ConstantPoolFull)?;
        match u8::try_from(string) {
            Ok(index) => out.extend_from_slice(&[op::LDC, index]),
            Err(_) => {
                out.push(op::LDC_W);
                out.extend_from_slice(&string.to_be_bytes());
            }
        }
        out.push(op::INVOKESTATIC);
        out.extend_from_slice(&target.to_be_bytes());
    }
    Ok(out)
}

/// A body returning the zero value of the method's return type.
fn default_return(descriptor: &str, max_locals: u16) -> Result<MethodBody, VerifyFault> {
    let ret = bytecode::return_descriptor(descriptor)
        .ok_or_else(|| VerifyFault::UnrelocatableAttribute(format!("descriptor {descriptor}")))?;
    let code = match ret.as_bytes().first() {
        Some(b'V') => vec![op::RETURN],
        Some(b'J') => vec![op::LCONST_0, op::LRETURN],
        Some(b'F') => vec![op::FCONST_0, op::FRETURN],
        Some(b'D') => vec![op::DCONST_0, op::DRETURN],
        Some(b'L') | Some(b'[') => vec![op::ACONST_NULL, op::ARETURN],
        _ => vec![op::ICONST_0, op::IRETURN],
    };
    Ok(MethodBody {
        max_stack: 0,
        max_locals,
        code,
        exception_table: Vec::new(),
        frames: Vec::new(),
        attributes: Vec::new(),
    })
}

/// The full `AmsInstrumented` attribute: prior rule ids, then new ones.
fn marker_attribute(class: &ParsedClass<'_>, pool: &mut ConstantPool) -> Option<Vec<u8>> {
    let name = pool.add_utf8(MARKER_ATTRIBUTE)?;
    let ids = class
        .applied_rules
        .iter()
        .chain(&class.newly_applied)
        .map(|id| pool.add_utf8(id))
        .collect::<Option<Vec<u16>>>()?;

    let mut out = Vec::with_capacity(8 + 2 * ids.len());
    out.extend_from_slice(&name.to_be_bytes());
    out.extend_from_slice(&(2 + 2 * ids.len() as u32).to_be_bytes());
    out.extend_from_slice(&(ids.len() as u16).to_be_bytes());
    for id in ids {
        out.extend_from_slice(&id.to_be_bytes());
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{self, ClassFixture, CodeFixture, MethodFixture};
    use crate::rules::{ClassDescriptor, RuleConfig, Ruleset};

    fn ruleset(json: &str) -> Ruleset {
        let configs: Vec<RuleConfig> = serde_json::from_str(json).unwrap();
        Ruleset::from_config(configs).unwrap()
    }

    const HOOKS: &str = r#"[
        {"id": "enter", "classes": {"packagePrefix": "com.example"},
         "action": {"kind": "enterHook", "owner": "com.example.Tracer", "method": "enter"}},
        {"id": "exit", "classes": {"packagePrefix": "com.example"},
         "action": {"kind": "exitHook", "owner": "com.example.Tracer", "method": "exit"}}
    ]"#;

    fn instrument(bytes: &[u8], rules: &Ruleset) -> Result<Vec<u8>, VerificationError> {
        let mut class = ParsedClass::parse(bytes).unwrap();
        let ids = rules.matches(&ClassDescriptor::of(&class));
        for id in ids {
            class = rules.apply(id, class).unwrap();
        }
        rewrite(&class)
    }

    #[test]
    fn class_without_edits_is_byte_identical() {
        let bytes = fixture::sample_class("org/other/Foo");
        let out = instrument(&bytes, &ruleset(HOOKS)).unwrap();
        assert_eq!(out, bytes);
    }

    #[test]
    fn hooks_are_inserted_and_the_class_stays_readable() {
        let bytes = fixture::sample_class("com/example/Foo");
        let out = instrument(&bytes, &ruleset(HOOKS)).unwrap();
        let original = ParsedClass::parse(&bytes).unwrap();
        let rewritten = ParsedClass::parse(&out).unwrap();

        assert_eq!(rewritten.applied_rules, vec!["enter", "exit"]);
        assert_eq!(rewritten.methods.len(), original.methods.len());

        // Untouched constructor copied verbatim.
        assert_eq!(
            &out[rewritten.methods[0].span.clone()],
            &bytes[original.methods[0].span.clone()]
        );

        // Original pool entries keep their indices.
        for index in 1..original.pool.count() as u16 {
            assert_eq!(original.pool.get(index), rewritten.pool.get(index));
        }

        // compute(I)I: ldc; invokestatic enter; ...; ldc; invokestatic exit; ireturn
        let compute = &rewritten.methods[2];
        let code = compute.code.as_ref().unwrap();
        let body = rewritten.code_bytes(code);
        assert_eq!(body[0], op::LDC);
        assert_eq!(body[2], op::INVOKESTATIC);
        assert_eq!(body.len(), 8 + 5 + 2 * 5);
        assert_eq!(code.max_stack, 2);

        let site = match rewritten.pool.get(body[1] as u16) {
            Some(crate::constant_pool::Constant::String(utf8)) => rewritten.pool.utf8(*utf8).unwrap(),
            other => panic!("expected a string constant, got {other:?}"),
        };
        assert_eq!(site, "com.example.Foo#compute(I)I");
    }

    #[test]
    fn rewriting_twice_is_byte_identical() {
        let rules = ruleset(HOOKS);
        let bytes = fixture::sample_class("com/example/Foo");
        let once = instrument(&bytes, &rules).unwrap();
        let twice = instrument(&once, &rules).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn new_rules_extend_the_marker() {
        let bytes = fixture::sample_class("com/example/Foo");
        let once = instrument(&bytes, &ruleset(HOOKS)).unwrap();
        let stub = ruleset(
            r#"[{"id": "stub", "classes": {"className": "com.example.Foo"},
                 "methods": {"name": "pick"}, "action": {"kind": "replaceBody"}}]"#,
        );
        let twice = instrument(&once, &stub).unwrap();
        let class = ParsedClass::parse(&twice).unwrap();
        assert_eq!(class.applied_rules, vec!["enter", "exit", "stub"]);
        let pick = class.methods[3].code.as_ref().unwrap();
        assert_eq!(class.code_bytes(pick), &[op::ICONST_0, op::IRETURN]);
        assert!(pick.exception_table.is_empty());
        assert!(pick.attributes.is_empty());
        assert_eq!(pick.max_stack, 1);
    }

    #[test]
    fn replace_body_uses_the_return_type_default() {
        for (desc, code) in [
            ("()V", vec![op::RETURN]),
            ("()J", vec![op::LCONST_0, op::LRETURN]),
            ("()Ljava/lang/String;", vec![op::ACONST_NULL, op::ARETURN]),
            ("()[I", vec![op::ACONST_NULL, op::ARETURN]),
            ("(D)Z", vec![op::ICONST_0, op::IRETURN]),
        ] {
            assert_eq!(default_return(desc, 1).unwrap().code, code, "{desc}");
        }
    }

    #[test]
    fn unverifiable_result_is_reported_not_written() {
        let mut fx = ClassFixture::new("com/example/Broken");
        fx.method(MethodFixture::new(
            fixture::ACC_PUBLIC | fixture::ACC_STATIC,
            "bad",
            "()V",
            Some(CodeFixture {
                max_stack: 1,
                max_locals: 0,
                code: vec![0x57, op::RETURN],
                ..CodeFixture::default()
            }),
        ));
        let bytes = fx.build();
        let err = instrument(&bytes, &ruleset(HOOKS)).unwrap_err();
        assert_eq!(err.class, "com.example.Broken");
        assert_eq!(err.method, "bad()V");
        assert!(matches!(err.fault, VerifyFault::StackUnderflow { .. }));
    }

    #[test]
    fn wide_pool_indices_use_ldc_w() {
        let mut fx = ClassFixture::new("com/example/Big");
        for i in 0..300 {
            fx.utf8(&format!("filler{i}"));
        }
        fx.method(fixture::run_method());
        let bytes = fx.build();
        let out = instrument(&bytes, &ruleset(HOOKS)).unwrap();
        let class = ParsedClass::parse(&out).unwrap();
        let code = class.methods[0].code.as_ref().unwrap();
        assert_eq!(class.code_bytes(code)[0], op::LDC_W);
    }
}
