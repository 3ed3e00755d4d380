//! JVM instruction set facts: lengths, branch targets, stack effects and
//! descriptor slot sizes.

use std::fmt;

use crate::constant_pool::{Constant, ConstantPool};
use crate::error::VerifyFault;

pub mod op {
    pub const NOP: u8 = 0x00;
    pub const ACONST_NULL: u8 = 0x01;
    pub const ICONST_0: u8 = 0x03;
    pub const LCONST_0: u8 = 0x09;
    pub const FCONST_0: u8 = 0x0b;
    pub const DCONST_0: u8 = 0x0e;
    pub const LDC: u8 = 0x12;
    pub const LDC_W: u8 = 0x13;
    pub const LDC2_W: u8 = 0x14;
    pub const IFEQ: u8 = 0x99;
    pub const IF_ACMPNE: u8 = 0xa6;
    pub const GOTO: u8 = 0xa7;
    pub const JSR: u8 = 0xa8;
    pub const RET: u8 = 0xa9;
    pub const TABLESWITCH: u8 = 0xaa;
    pub const LOOKUPSWITCH: u8 = 0xab;
    pub const IRETURN: u8 = 0xac;
    pub const LRETURN: u8 = 0xad;
    pub const FRETURN: u8 = 0xae;
    pub const DRETURN: u8 = 0xaf;
    pub const ARETURN: u8 = 0xb0;
    pub const RETURN: u8 = 0xb1;
    pub const GETSTATIC: u8 = 0xb2;
    pub const PUTSTATIC: u8 = 0xb3;
    pub const GETFIELD: u8 = 0xb4;
    pub const PUTFIELD: u8 = 0xb5;
    pub const INVOKEVIRTUAL: u8 = 0xb6;
    pub const INVOKESPECIAL: u8 = 0xb7;
    pub const INVOKESTATIC: u8 = 0xb8;
    pub const INVOKEINTERFACE: u8 = 0xb9;
    pub const INVOKEDYNAMIC: u8 = 0xba;
    pub const NEW: u8 = 0xbb;
    pub const ATHROW: u8 = 0xbf;
    pub const WIDE: u8 = 0xc4;
    pub const MULTIANEWARRAY: u8 = 0xc5;
    pub const IFNULL: u8 = 0xc6;
    pub const IFNONNULL: u8 = 0xc7;
    pub const GOTO_W: u8 = 0xc8;
    pub const JSR_W: u8 = 0xc9;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub offset: u32,
    pub opcode: u8,
    pub len: u32,
}

/// Decoded `tableswitch`/`lookupswitch` operands; offsets are relative to
/// the switch opcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Switch {
    pub default: i32,
    /// `tableswitch` low bound; `None` for `lookupswitch`.
    pub low: Option<i32>,
    /// Keys are only meaningful for `lookupswitch`.
    pub cases: Vec<(i32, i32)>,
}

impl Switch {
    pub fn encoded_len(&self, offset: u32) -> u32 {
        let pad = switch_padding(offset);
        let body = match self.low {
            Some(_) => 12 + 4 * self.cases.len() as u32,
            None => 8 + 8 * self.cases.len() as u32,
        };
        1 + pad + body
    }

    pub fn encode(&self, opcode: u8, offset: u32, out: &mut Vec<u8>) {
        out.push(opcode);
        for _ in 0..switch_padding(offset) {
            out.push(0);
        }
        out.extend_from_slice(&self.default.to_be_bytes());
        match self.low {
            Some(low) => {
                let high = low + self.cases.len() as i32 - 1;
                out.extend_from_slice(&low.to_be_bytes());
                out.extend_from_slice(&high.to_be_bytes());
                for (_, target) in &self.cases {
                    out.extend_from_slice(&target.to_be_bytes());
                }
            }
            None => {
                out.extend_from_slice(&(self.cases.len() as i32).to_be_bytes());
                for (key, target) in &self.cases {
                    out.extend_from_slice(&key.to_be_bytes());
                    out.extend_from_slice(&target.to_be_bytes());
                }
            }
        }
    }
}

pub fn switch_padding(offset: u32) -> u32 {
    (4 - (offset + 1) % 4) % 4
}

pub fn read_i16(code: &[u8], pos: usize) -> Option<i16> {
    code.get(pos..pos + 2).map(|b| i16::from_be_bytes([b[0], b[1]]))
}

pub fn read_u16(code: &[u8], pos: usize) -> Option<u16> {
    code.get(pos..pos + 2).map(|b| u16::from_be_bytes([b[0], b[1]]))
}

pub fn read_i32(code: &[u8], pos: usize) -> Option<i32> {
    code.get(pos..pos + 4)
        .map(|b| i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

/// Length of fixed-size instructions; `Some(0)` marks variable-length ones.
fn fixed_length(opcode: u8) -> Option<u32> {
    Some(match opcode {
        0x00..=0x0f | 0x1a..=0x35 | 0x3b..=0x83 | 0x85..=0x98 => 1,
        0xac..=0xb1 | 0xbe | 0xbf | 0xc2 | 0xc3 => 1,
        0x10 | 0x12 | 0x15..=0x19 | 0x36..=0x3a | 0xa9 | 0xbc => 2,
        0x11 | 0x13 | 0x14 | 0x84 | 0x99..=0xa8 | 0xb2..=0xb8 => 3,
        0xbb | 0xbd | 0xc0 | 0xc1 | 0xc6 | 0xc7 => 3,
        0xc5 => 4,
        0xb9 | 0xba | 0xc8 | 0xc9 => 5,
        0xaa | 0xab | 0xc4 => 0,
        _ => return None,
    })
}

pub fn read_switch(code: &[u8], offset: u32) -> Result<Switch, VerifyFault> {
    let truncated = VerifyFault::InvalidOpcode {
        offset,
        opcode: code.get(offset as usize).copied().unwrap_or(0),
    };
    let opcode = code[offset as usize];
    let base = (offset + 1 + switch_padding(offset)) as usize;
    let default = read_i32(code, base).ok_or(truncated.clone())?;
    if opcode == op::TABLESWITCH {
        let low = read_i32(code, base + 4).ok_or(truncated.clone())?;
        let high = read_i32(code, base + 8).ok_or(truncated.clone())?;
        if high < low {
            return Err(truncated);
        }
        let count = (high as i64 - low as i64 + 1) as usize;
        if base + 12 + 4 * count > code.len() {
            return Err(truncated);
        }
        let cases = (0..count)
            .map(|i| {
                let target = read_i32(code, base + 12 + 4 * i).unwrap_or_default();
                (low.wrapping_add(i as i32), target)
            })
            .collect();
        Ok(Switch {
            default,
            low: Some(low),
            cases,
        })
    } else {
        let pairs = read_i32(code, base + 4).ok_or(truncated.clone())?;
        if pairs < 0 || base + 8 + 8 * pairs as usize > code.len() {
            return Err(truncated);
        }
        let cases = (0..pairs as usize)
            .map(|i| {
                let at = base + 8 + 8 * i;
                (
                    read_i32(code, at).unwrap_or_default(),
                    read_i32(code, at + 4).unwrap_or_default(),
                )
            })
            .collect();
        Ok(Switch {
            default,
            low: None,
            cases,
        })
    }
}

pub fn instruction_length(code: &[u8], offset: u32) -> Result<u32, VerifyFault> {
    let opcode = code[offset as usize];
    let invalid = VerifyFault::InvalidOpcode { offset, opcode };
    let len = match fixed_length(opcode) {
        None => return Err(invalid),
        Some(0) if opcode == op::WIDE => match code.get(offset as usize + 1).copied() {
            Some(0x84) => 6,
            Some(0x15..=0x19) | Some(0x36..=0x3a) | Some(op::RET) => 4,
            _ => return Err(invalid),
        },
        Some(0) => read_switch(code, offset)?.encoded_len(offset),
        Some(n) => n,
    };
    if offset as usize + len as usize > code.len() {
        return Err(invalid);
    }
    Ok(len)
}

/// Splits a code array into instructions, failing on truncated operands or
/// unknown opcodes.
pub fn decode(code: &[u8]) -> Result<Vec<Instruction>, VerifyFault> {
    let mut out = Vec::new();
    let mut offset = 0u32;
    while (offset as usize) < code.len() {
        let len = instruction_length(code, offset)?;
        out.push(Instruction {
            offset,
            opcode: code[offset as usize],
            len,
        });
        offset += len;
    }
    Ok(out)
}

pub fn is_return(opcode: u8) -> bool {
    (op::IRETURN..=op::RETURN).contains(&opcode)
}

/// Two-byte relative branches.
pub fn is_short_branch(opcode: u8) -> bool {
    (op::IFEQ..=op::JSR).contains(&opcode) || opcode == op::IFNULL || opcode == op::IFNONNULL
}

pub fn is_wide_branch(opcode: u8) -> bool {
    opcode == op::GOTO_W || opcode == op::JSR_W
}

pub fn is_switch(opcode: u8) -> bool {
    opcode == op::TABLESWITCH || opcode == op::LOOKUPSWITCH
}

/// Control never continues to the next instruction.
pub fn ends_flow(opcode: u8) -> bool {
    is_return(opcode)
        || is_switch(opcode)
        || matches!(opcode, op::GOTO | op::GOTO_W | op::RET | op::ATHROW)
}

/// Absolute branch targets of `inst` (may be out of range on bad input).
pub fn branch_targets(code: &[u8], inst: &Instruction) -> Result<Vec<i64>, VerifyFault> {
    let at = inst.offset as usize;
    let base = inst.offset as i64;
    if is_short_branch(inst.opcode) {
        let rel = read_i16(code, at + 1).ok_or(VerifyFault::FallsOffEnd)?;
        Ok(vec![base + rel as i64])
    } else if is_wide_branch(inst.opcode) {
        let rel = read_i32(code, at + 1).ok_or(VerifyFault::FallsOffEnd)?;
        Ok(vec![base + rel as i64])
    } else if is_switch(inst.opcode) {
        let switch = read_switch(code, inst.offset)?;
        let mut targets = vec![base + switch.default as i64];
        targets.extend(switch.cases.iter().map(|(_, t)| base + *t as i64));
        Ok(targets)
    } else {
        Ok(Vec::new())
    }
}

/// Verification category of one operand stack slot. Long and double values
/// fill two slots of the same category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackType {
    Int,
    Float,
    Long,
    Double,
    Reference,
    ReturnAddress,
    /// Result of the `new` at this offset, before its constructor ran.
    Uninitialized(u32),
    /// Declared `top`; stands for any value.
    Top,
}

impl fmt::Display for StackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int => f.write_str("int"),
            Self::Float => f.write_str("float"),
            Self::Long => f.write_str("long"),
            Self::Double => f.write_str("double"),
            Self::Reference => f.write_str("reference"),
            Self::ReturnAddress => f.write_str("returnAddress"),
            Self::Uninitialized(at) => write!(f, "uninitialized({at})"),
            Self::Top => f.write_str("top"),
        }
    }
}

/// Operands of a fixed-shape instruction: popped codes (deepest first),
/// then pushed codes. Codes follow descriptors (`I F J D`), with `A` a
/// reference, `a` anything `astore` takes and `R` a return address.
fn signature(opcode: u8) -> Option<(&'static str, &'static str)> {
    Some(match opcode {
        0x00 | 0x84 | 0xa7 | 0xa9 | 0xb1 | 0xc8 => ("", ""),
        0x01 => ("", "A"),
        0x02..=0x08 | 0x10 | 0x11 => ("", "I"),
        0x09 | 0x0a => ("", "J"),
        0x0b..=0x0d => ("", "F"),
        0x0e | 0x0f => ("", "D"),
        0x15 | 0x1a..=0x1d => ("", "I"),
        0x16 | 0x1e..=0x21 => ("", "J"),
        0x17 | 0x22..=0x25 => ("", "F"),
        0x18 | 0x26..=0x29 => ("", "D"),
        0x19 | 0x2a..=0x2d => ("", "A"),
        0x2e | 0x33..=0x35 => ("AI", "I"),
        0x2f => ("AI", "J"),
        0x30 => ("AI", "F"),
        0x31 => ("AI", "D"),
        0x32 => ("AI", "A"),
        0x36 | 0x3b..=0x3e => ("I", ""),
        0x37 | 0x3f..=0x42 => ("J", ""),
        0x38 | 0x43..=0x46 => ("F", ""),
        0x39 | 0x47..=0x4a => ("D", ""),
        0x3a | 0x4b..=0x4e => ("a", ""),
        0x4f | 0x54..=0x56 => ("AII", ""),
        0x50 => ("AIJ", ""),
        0x51 => ("AIF", ""),
        0x52 => ("AID", ""),
        0x53 => ("AIA", ""),
        0x60..=0x73 => match (opcode - 0x60) % 4 {
            0 => ("II", "I"),
            1 => ("JJ", "J"),
            2 => ("FF", "F"),
            _ => ("DD", "D"),
        },
        0x74 => ("I", "I"),
        0x75 => ("J", "J"),
        0x76 => ("F", "F"),
        0x77 => ("D", "D"),
        0x78 | 0x7a | 0x7c | 0x7e | 0x80 | 0x82 => ("II", "I"),
        0x79 | 0x7b | 0x7d => ("JI", "J"),
        0x7f | 0x81 | 0x83 => ("JJ", "J"),
        0x85 => ("I", "J"),
        0x86 => ("I", "F"),
        0x87 => ("I", "D"),
        0x88 => ("J", "I"),
        0x89 => ("J", "F"),
        0x8a => ("J", "D"),
        0x8b => ("F", "I"),
        0x8c => ("F", "J"),
        0x8d => ("F", "D"),
        0x8e => ("D", "I"),
        0x8f => ("D", "J"),
        0x90 => ("D", "F"),
        0x91..=0x93 => ("I", "I"),
        0x94 => ("JJ", "I"),
        0x95 | 0x96 => ("FF", "I"),
        0x97 | 0x98 => ("DD", "I"),
        0x99..=0x9e | 0xaa..=0xac => ("I", ""),
        0x9f..=0xa4 => ("II", ""),
        0xa5 | 0xa6 => ("AA", ""),
        0xa8 | 0xc9 => ("", "R"),
        0xad => ("J", ""),
        0xae => ("F", ""),
        0xaf => ("D", ""),
        0xb0 | 0xbf | 0xc2 | 0xc3 | 0xc6 | 0xc7 => ("A", ""),
        0xbc | 0xbd => ("I", "A"),
        0xbe | 0xc1 => ("A", "I"),
        0xc0 => ("A", "A"),
        _ => return None,
    })
}

/// Slots taken off the top by a stack manipulation opcode, and the order
/// they are put back in (indices into the taken slots, deepest first).
fn shuffle(opcode: u8) -> Option<(usize, &'static [usize])> {
    let order: &'static [usize] = match opcode {
        0x57 | 0x58 => &[],
        0x59 => &[0, 0],
        0x5a => &[1, 0, 1],
        0x5b => &[2, 0, 1, 2],
        0x5c => &[0, 1, 0, 1],
        0x5d => &[1, 2, 0, 1, 2],
        0x5e => &[2, 3, 0, 1, 2, 3],
        0x5f => &[1, 0],
        _ => return None,
    };
    let taken = match opcode {
        0x57 | 0x59 => 1,
        0x58 | 0x5a | 0x5c | 0x5f => 2,
        0x5b | 0x5d => 3,
        _ => 4,
    };
    Some((taken, order))
}

fn push(stack: &mut Vec<StackType>, code: u8) {
    match code {
        b'I' => stack.push(StackType::Int),
        b'F' => stack.push(StackType::Float),
        b'J' => stack.extend([StackType::Long; 2]),
        b'D' => stack.extend([StackType::Double; 2]),
        b'R' => stack.push(StackType::ReturnAddress),
        _ => stack.push(StackType::Reference),
    }
}

fn pop(stack: &mut Vec<StackType>, code: u8, offset: u32) -> Result<(), VerifyFault> {
    let (expected, slots) = match code {
        b'I' => ("int", 1),
        b'F' => ("float", 1),
        b'J' => ("long", 2),
        b'D' => ("double", 2),
        b'A' => ("reference", 1),
        _ => ("reference or returnAddress", 1),
    };
    for _ in 0..slots {
        let found = stack.pop().ok_or(VerifyFault::StackUnderflow { offset })?;
        let ok = match code {
            b'I' => found == StackType::Int,
            b'F' => found == StackType::Float,
            b'J' => found == StackType::Long,
            b'D' => found == StackType::Double,
            b'A' => found == StackType::Reference,
            _ => matches!(
                found,
                StackType::Reference | StackType::ReturnAddress | StackType::Uninitialized(_)
            ),
        };
        if !ok {
            return Err(VerifyFault::OperandType {
                offset,
                expected,
                found,
            });
        }
    }
    Ok(())
}

fn pop_all(stack: &mut Vec<StackType>, codes: &[u8], offset: u32) -> Result<(), VerifyFault> {
    codes.iter().rev().try_for_each(|c| pop(stack, *c, offset))
}

/// Applies one instruction to the operand stack, checking the category of
/// every slot it consumes.
pub fn apply_effect(
    code: &[u8],
    inst: &Instruction,
    pool: &ConstantPool,
    stack: &mut Vec<StackType>,
) -> Result<(), VerifyFault> {
    let at = inst.offset as usize;
    let offset = inst.offset;
    let unresolved = |index: u16| VerifyFault::UnresolvedConstant { offset, index };
    let invalid = |opcode: u8| VerifyFault::InvalidOpcode { offset, opcode };

    match inst.opcode {
        op::LDC | op::LDC_W | op::LDC2_W => {
            let index = if inst.opcode == op::LDC {
                code.get(at + 1).copied().unwrap_or(0) as u16
            } else {
                read_u16(code, at + 1).unwrap_or_default()
            };
            let kind = match pool.get(index) {
                Some(Constant::Integer(_)) => b'I',
                Some(Constant::Float(_)) => b'F',
                Some(Constant::Long(_)) => b'J',
                Some(Constant::Double(_)) => b'D',
                Some(
                    Constant::String(_)
                    | Constant::Class(_)
                    | Constant::MethodType(_)
                    | Constant::MethodHandle { .. },
                ) => b'A',
                Some(Constant::Dynamic { .. }) => pool
                    .reference_descriptor(index)
                    .and_then(field_code)
                    .ok_or_else(|| unresolved(index))?,
                _ => return Err(unresolved(index)),
            };
            let wide = matches!(kind, b'J' | b'D');
            if wide != (inst.opcode == op::LDC2_W) {
                return Err(unresolved(index));
            }
            push(stack, kind);
        }
        op::GETSTATIC | op::PUTSTATIC | op::GETFIELD | op::PUTFIELD => {
            let index = read_u16(code, at + 1).unwrap_or_default();
            let kind = pool
                .reference_descriptor(index)
                .and_then(field_code)
                .ok_or_else(|| unresolved(index))?;
            match inst.opcode {
                op::GETSTATIC => push(stack, kind),
                op::PUTSTATIC => pop(stack, kind, offset)?,
                op::GETFIELD => {
                    pop(stack, b'A', offset)?;
                    push(stack, kind);
                }
                _ => {
                    pop(stack, kind, offset)?;
                    pop(stack, b'A', offset)?;
                }
            }
        }
        op::INVOKEVIRTUAL
        | op::INVOKESPECIAL
        | op::INVOKESTATIC
        | op::INVOKEINTERFACE
        | op::INVOKEDYNAMIC => {
            let index = read_u16(code, at + 1).unwrap_or_default();
            let (args, ret) = pool
                .reference_descriptor(index)
                .and_then(method_codes)
                .ok_or_else(|| unresolved(index))?;
            pop_all(stack, &args, offset)?;
            let constructor =
                inst.opcode == op::INVOKESPECIAL && pool.reference_name(index) == Some("<init>");
            if constructor {
                match stack.pop() {
                    Some(StackType::Reference) => {}
                    Some(StackType::Uninitialized(created)) => {
                        for slot in stack.iter_mut() {
                            if *slot == StackType::Uninitialized(created) {
                                *slot = StackType::Reference;
                            }
                        }
                    }
                    Some(found) => {
                        return Err(VerifyFault::OperandType {
                            offset,
                            expected: "uninitialized reference",
                            found,
                        });
                    }
                    None => return Err(VerifyFault::StackUnderflow { offset }),
                }
            } else if !matches!(inst.opcode, op::INVOKESTATIC | op::INVOKEDYNAMIC) {
                pop(stack, b'A', offset)?;
            }
            if let Some(kind) = ret {
                push(stack, kind);
            }
        }
        op::NEW => stack.push(StackType::Uninitialized(offset)),
        op::MULTIANEWARRAY => {
            let dims = code.get(at + 3).copied().unwrap_or(0);
            for _ in 0..dims {
                pop(stack, b'I', offset)?;
            }
            push(stack, b'A');
        }
        op::WIDE => {
            let inner = code.get(at + 1).copied().unwrap_or(0);
            let (pops, pushes) = signature(inner).ok_or_else(|| invalid(inner))?;
            pop_all(stack, pops.as_bytes(), offset)?;
            pushes.bytes().for_each(|c| push(stack, c));
        }
        opcode => {
            if let Some((taken, order)) = shuffle(opcode) {
                if stack.len() < taken {
                    return Err(VerifyFault::StackUnderflow { offset });
                }
                let top = stack.split_off(stack.len() - taken);
                stack.extend(order.iter().map(|i| top[*i]));
            } else {
                let (pops, pushes) = signature(opcode).ok_or_else(|| invalid(opcode))?;
                pop_all(stack, pops.as_bytes(), offset)?;
                pushes.bytes().for_each(|c| push(stack, c));
            }
        }
    }
    Ok(())
}

/// Operand code (`I F J D A`) of one field type at `pos`, advancing past it.
fn type_code(desc: &[u8], pos: &mut usize) -> Option<u8> {
    let c = *desc.get(*pos)?;
    *pos += 1;
    match c {
        b'J' | b'D' | b'F' => Some(c),
        b'B' | b'C' | b'I' | b'S' | b'Z' => Some(b'I'),
        b'L' => {
            let end = desc[*pos..].iter().position(|b| *b == b';')?;
            *pos += end + 1;
            Some(b'A')
        }
        b'[' => {
            type_code(desc, pos)?;
            Some(b'A')
        }
        _ => None,
    }
}

fn field_code(desc: &str) -> Option<u8> {
    let mut pos = 0;
    let code = type_code(desc.as_bytes(), &mut pos)?;
    (pos == desc.len()).then_some(code)
}

/// Argument codes and optional return code of a method descriptor.
fn method_codes(desc: &str) -> Option<(Vec<u8>, Option<u8>)> {
    let bytes = desc.as_bytes();
    if bytes.first() != Some(&b'(') {
        return None;
    }
    let mut pos = 1;
    let mut args = Vec::new();
    while *bytes.get(pos)? != b')' {
        args.push(type_code(bytes, &mut pos)?);
    }
    pos += 1;
    let ret = if bytes.get(pos) == Some(&b'V') && pos + 1 == bytes.len() {
        None
    } else {
        Some(field_code(&desc[pos..])?)
    };
    Some((args, ret))
}

/// The return type part of a method descriptor.
pub fn return_descriptor(desc: &str) -> Option<&str> {
    desc.rfind(')').map(|i| &desc[i + 1..])
}
