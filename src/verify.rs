//! Local verifier for rewritten method bodies.
//!
//! Runs a dataflow over the new code before anything is written, tracking
//! the verification category of every operand stack slot. It checks what the
//! runtime verifier would reject at block boundaries: underflow, operands of
//! the wrong category, depth or type disagreement at merge points, and
//! StackMapTable frames whose declared stack no longer matches the code.

use std::collections::HashMap;

use crate::bytecode::{self, StackType, op};
use crate::constant_pool::ConstantPool;
use crate::error::VerifyFault;
use crate::relocate::MethodBody;
use crate::stackmap::{Frame, FrameKind, VerificationType};

/// Returns the maximum operand stack depth reached, in slots.
pub fn verify(body: &MethodBody, pool: &ConstantPool) -> Result<u16, VerifyFault> {
    let code = &body.code;
    if code.len() > u16::MAX as usize {
        return Err(VerifyFault::CodeTooLarge(code.len()));
    }
    if code.is_empty() {
        return Err(VerifyFault::FallsOffEnd);
    }

    let insts = bytecode::decode(code)?;
    let index: HashMap<u32, usize> = insts
        .iter()
        .enumerate()
        .map(|(i, inst)| (inst.offset, i))
        .collect();

    let mut declared = HashMap::with_capacity(body.frames.len());
    for frame in &body.frames {
        if !index.contains_key(&frame.offset) {
            return Err(VerifyFault::MalformedStackMap(format!(
                "frame at {} is not an instruction boundary",
                frame.offset
            )));
        }
        declared.insert(frame.offset, frame_stack(frame));
    }

    let mut states: Vec<Option<Vec<StackType>>> = vec![None; insts.len()];
    let mut work = Vec::new();
    let mut max = 0u16;

    let enter = |at: u32,
                 from: u32,
                 stack: &[StackType],
                 states: &mut Vec<Option<Vec<StackType>>>,
                 work: &mut Vec<usize>|
     -> Result<(), VerifyFault> {
        let i = *index.get(&at).ok_or(VerifyFault::BadBranchTarget {
            offset: from,
            target: at as i64,
        })?;
        if let Some(frame) = declared.get(&at) {
            check_frame(at, frame, stack)?;
        }
        match &states[i] {
            Some(existing) => merge(at, existing, stack),
            None => {
                states[i] = Some(stack.to_vec());
                work.push(i);
                Ok(())
            }
        }
    };

    enter(0, 0, &[], &mut states, &mut work)?;
    for e in &body.exception_table {
        let handler = e.handler_pc as u32;
        enter(handler, handler, &[StackType::Reference], &mut states, &mut work)?;
        max = max.max(1);
    }

    while let Some(i) = work.pop() {
        let inst = &insts[i];
        let before = states[i].clone().unwrap_or_default();
        let mut stack = before.clone();
        bytecode::apply_effect(code, inst, pool, &mut stack)?;
        if stack.len() > u16::MAX as usize {
            return Err(VerifyFault::StackTooDeep(stack.len() as u32));
        }
        max = max.max(stack.len() as u16);

        for target in bytecode::branch_targets(code, inst)? {
            if target < 0 || target > u32::MAX as i64 {
                return Err(VerifyFault::BadBranchTarget {
                    offset: inst.offset,
                    target,
                });
            }
            enter(target as u32, inst.offset, &stack, &mut states, &mut work)?;
        }

        if !bytecode::ends_flow(inst.opcode) {
            let after = inst.offset + inst.len;
            if after as usize >= code.len() {
                return Err(VerifyFault::FallsOffEnd);
            }
            // The subroutine's return address is gone once it comes back.
            let fallthrough = if matches!(inst.opcode, op::JSR | op::JSR_W) {
                &before
            } else {
                &stack
            };
            enter(after, inst.offset, fallthrough, &mut states, &mut work)?;
        }
    }

    Ok(max)
}

fn stack_type(t: &VerificationType) -> StackType {
    match t {
        VerificationType::Top => StackType::Top,
        VerificationType::Integer => StackType::Int,
        VerificationType::Float => StackType::Float,
        VerificationType::Long => StackType::Long,
        VerificationType::Double => StackType::Double,
        VerificationType::Null
        | VerificationType::UninitializedThis
        | VerificationType::Object(_) => StackType::Reference,
        VerificationType::Uninitialized(at) => StackType::Uninitialized(*at),
    }
}

/// Operand stack a frame declares, one entry per slot.
fn frame_stack(frame: &Frame) -> Vec<StackType> {
    let types: &[VerificationType] = match &frame.kind {
        FrameKind::SameLocals1(t) => std::slice::from_ref(t),
        FrameKind::Full { stack, .. } => stack,
        _ => &[],
    };
    types
        .iter()
        .flat_map(|t| std::iter::repeat_n(stack_type(t), t.slots() as usize))
        .collect()
}

fn check_frame(at: u32, declared: &[StackType], computed: &[StackType]) -> Result<(), VerifyFault> {
    if declared.len() != computed.len() {
        return Err(VerifyFault::FrameMismatch {
            offset: at,
            declared: declared.len() as u16,
            computed: computed.len() as u16,
        });
    }
    for (slot, (d, c)) in declared.iter().zip(computed).enumerate() {
        if *d != StackType::Top && d != c {
            return Err(VerifyFault::FrameTypeMismatch {
                offset: at,
                slot: slot as u16,
                declared: *d,
                computed: *c,
            });
        }
    }
    Ok(())
}

fn merge(at: u32, existing: &[StackType], found: &[StackType]) -> Result<(), VerifyFault> {
    if existing.len() != found.len() {
        return Err(VerifyFault::InconsistentStack {
            offset: at,
            expected: existing.len() as u16,
            found: found.len() as u16,
        });
    }
    match existing.iter().zip(found).position(|(e, f)| e != f) {
        Some(slot) => Err(VerifyFault::InconsistentTypes {
            offset: at,
            slot: slot as u16,
            expected: existing[slot],
            found: found[slot],
        }),
        None => Ok(()),
    }
}
