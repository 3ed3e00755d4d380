//! Code relocation.
//!
//! Inserted code is laid out around the original instructions and every
//! offset the Code attribute carries is remapped onto the new layout. Two
//! maps are kept per original instruction: where its block starts (inserted
//! epilogue included, used by branches and tables) and where the instruction
//! itself lands (used by `Uninitialized` verification types).

use tracing::warn;

use crate::bytecode::{self, Instruction};
use crate::classfile::{self, ByteReader, CodeAttribute, ExceptionEntry, ParsedClass};
use crate::constant_pool::ConstantPool;
use crate::error::{MalformedClassError, VerifyFault};
use crate::stackmap::{self, Frame, VerificationType};

/// Code to insert into a method body. Neither block may contain branches.
#[derive(Debug, Clone, Copy, Default)]
pub struct Insertion<'b> {
    /// Runs once at method entry; never a branch target.
    pub prologue: &'b [u8],
    /// Runs before every return instruction.
    pub epilogue: &'b [u8],
}

impl Insertion<'_> {
    pub fn is_empty(&self) -> bool {
        self.prologue.is_empty() && self.epilogue.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAttribute {
    pub name_index: u16,
    pub data: Vec<u8>,
}

/// A complete Code attribute body ready for serialization.
#[derive(Debug, Clone)]
pub struct MethodBody {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exception_table: Vec<ExceptionEntry>,
    /// Frames with offsets into `code`; also encoded in `attributes`.
    pub frames: Vec<Frame>,
    pub attributes: Vec<RawAttribute>,
}

impl MethodBody {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.max_stack.to_be_bytes());
        out.extend_from_slice(&self.max_locals.to_be_bytes());
        out.extend_from_slice(&(self.code.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.code);
        out.extend_from_slice(&(self.exception_table.len() as u16).to_be_bytes());
        for e in &self.exception_table {
            for v in [e.start_pc, e.end_pc, e.handler_pc, e.catch_type] {
                out.extend_from_slice(&v.to_be_bytes());
            }
        }
        out.extend_from_slice(&(self.attributes.len() as u16).to_be_bytes());
        for attr in &self.attributes {
            out.extend_from_slice(&attr.name_index.to_be_bytes());
            out.extend_from_slice(&(attr.data.len() as u32).to_be_bytes());
            out.extend_from_slice(&attr.data);
        }
    }
}

struct OffsetMap {
    block: Vec<Option<u32>>,
    inst: Vec<Option<u32>>,
}

impl OffsetMap {
    /// Index `code.len()` maps to the new code length.
    fn block(&self, old: u32) -> Result<u32, VerifyFault> {
        self.block
            .get(old as usize)
            .copied()
            .flatten()
            .ok_or(VerifyFault::BadBranchTarget {
                offset: old,
                target: old as i64,
            })
    }

    fn pc(&self, old: u16) -> Result<u16, VerifyFault> {
        Ok(self.block(old as u32)? as u16)
    }

    fn branch(&self, from: u32, target: i64) -> Result<u32, VerifyFault> {
        let bad = VerifyFault::BadBranchTarget {
            offset: from,
            target,
        };
        if target < 0 || target as usize + 1 >= self.block.len() {
            return Err(bad);
        }
        self.block[target as usize].ok_or(bad)
    }

    fn instruction(&self, old: u32) -> Result<u32, VerifyFault> {
        self.inst
            .get(old as usize)
            .copied()
            .flatten()
            .ok_or_else(|| VerifyFault::MalformedStackMap(format!("uninitialized offset {old}")))
    }
}

/// Rebuilds `code` with `insertion` applied.
pub fn relocate(
    class: &ParsedClass<'_>,
    code: &CodeAttribute,
    insertion: Insertion<'_>,
) -> Result<MethodBody, VerifyFault> {
    let old = class.code_bytes(code);
    let insts = bytecode::decode(old)?;
    let map = layout(old, &insts, insertion)?;

    let mut out = Vec::with_capacity(old.len() + insertion.prologue.len());
    for inst in &insts {
        if inst.offset == 0 {
            out.extend_from_slice(insertion.prologue);
        }
        if bytecode::is_return(inst.opcode) {
            out.extend_from_slice(insertion.epilogue);
        }
        emit(old, inst, &map, &mut out)?;
    }

    let exception_table = code
        .exception_table
        .iter()
        .map(|e| {
            Ok(ExceptionEntry {
                start_pc: map.pc(e.start_pc)?,
                end_pc: map.pc(e.end_pc)?,
                handler_pc: map.pc(e.handler_pc)?,
                catch_type: e.catch_type,
            })
        })
        .collect::<Result<Vec<_>, VerifyFault>>()?;

    let mut frames = Vec::new();
    let mut attributes = Vec::with_capacity(code.attributes.len());
    for attr in &code.attributes {
        let data = class.attribute_data(attr);
        let data = match attr.name.as_str() {
            "StackMapTable" => {
                frames = stackmap::parse(data)?;
                for frame in &mut frames {
                    frame.offset = map.block(frame.offset)?;
                    for t in frame.types_mut() {
                        if let VerificationType::Uninitialized(at) = t {
                            *at = map.instruction(*at)?;
                        }
                    }
                }
                stackmap::encode(&frames)?
            }
            "LineNumberTable" => remap_table(data, 4, |entry| {
                let pc = read_u16(entry, 0)?;
                entry[0..2].copy_from_slice(&map.pc(pc)?.to_be_bytes());
                Ok(())
            })?,
            "LocalVariableTable" | "LocalVariableTypeTable" => remap_table(data, 10, |entry| {
                let start = read_u16(entry, 0)?;
                let length = read_u16(entry, 2)?;
                let new_start = map.pc(start)?;
                let new_end = map.block(start as u32 + length as u32)?;
                entry[0..2].copy_from_slice(&new_start.to_be_bytes());
                entry[2..4].copy_from_slice(&((new_end - new_start as u32) as u16).to_be_bytes());
                Ok(())
            })?,
            name @ ("RuntimeVisibleTypeAnnotations" | "RuntimeInvisibleTypeAnnotations") => {
                remap_type_annotations(name, data, &class.pool, &map)?
            }
            other => {
                warn!(attribute = other, "dropping code attribute that cannot be relocated");
                continue;
            }
        };
        attributes.push(RawAttribute {
            name_index: attr.name_index,
            data,
        });
    }

    Ok(MethodBody {
        max_stack: code.max_stack,
        max_locals: code.max_locals,
        code: out,
        exception_table,
        frames,
        attributes,
    })
}

fn layout(
    old: &[u8],
    insts: &[Instruction],
    insertion: Insertion<'_>,
) -> Result<OffsetMap, VerifyFault> {
    let mut block = vec![None; old.len() + 1];
    let mut inst = vec![None; old.len() + 1];
    let mut cur = 0u32;
    for i in insts {
        if i.offset == 0 {
            cur += insertion.prologue.len() as u32;
        }
        block[i.offset as usize] = Some(cur);
        if bytecode::is_return(i.opcode) {
            cur += insertion.epilogue.len() as u32;
        }
        inst[i.offset as usize] = Some(cur);
        cur += if bytecode::is_switch(i.opcode) {
            bytecode::read_switch(old, i.offset)?.encoded_len(cur)
        } else {
            i.len
        };
    }
    if cur > u16::MAX as u32 {
        return Err(VerifyFault::CodeTooLarge(cur as usize));
    }
    block[old.len()] = Some(cur);
    inst[old.len()] = Some(cur);
    Ok(OffsetMap { block, inst })
}

fn emit(old: &[u8], inst: &Instruction, map: &OffsetMap, out: &mut Vec<u8>) -> Result<(), VerifyFault> {
    let at = out.len() as i64;
    let from = inst.offset;
    let base = from as i64;
    let relative = |old_rel: i64| -> Result<i64, VerifyFault> {
        Ok(map.branch(from, base + old_rel)? as i64 - at)
    };
    let wide = |rel: i64| i32::try_from(rel).map_err(|_| VerifyFault::BranchOutOfRange { offset: from });

    if bytecode::is_short_branch(inst.opcode) {
        let rel = bytecode::read_i16(old, from as usize + 1).ok_or(VerifyFault::FallsOffEnd)?;
        let rel = i16::try_from(relative(rel as i64)?)
            .map_err(|_| VerifyFault::BranchOutOfRange { offset: from })?;
        out.push(inst.opcode);
        out.extend_from_slice(&rel.to_be_bytes());
    } else if bytecode::is_wide_branch(inst.opcode) {
        let rel = bytecode::read_i32(old, from as usize + 1).ok_or(VerifyFault::FallsOffEnd)?;
        out.push(inst.opcode);
        out.extend_from_slice(&wide(relative(rel as i64)?)?.to_be_bytes());
    } else if bytecode::is_switch(inst.opcode) {
        let mut switch = bytecode::read_switch(old, from)?;
        switch.default = wide(relative(switch.default as i64)?)?;
        for (_, target) in &mut switch.cases {
            *target = wide(relative(*target as i64)?)?;
        }
        switch.encode(inst.opcode, at as u32, out);
    } else {
        let start = from as usize;
        out.extend_from_slice(&old[start..start + inst.len as usize]);
    }
    Ok(())
}

fn read_u16(entry: &[u8], at: usize) -> Result<u16, VerifyFault> {
    bytecode::read_u16(entry, at).ok_or(VerifyFault::FallsOffEnd)
}

/// Rewrites a `u2 count` + fixed-size entry table in place.
fn remap_table(
    data: &[u8],
    entry_len: usize,
    mut remap: impl FnMut(&mut [u8]) -> Result<(), VerifyFault>,
) -> Result<Vec<u8>, VerifyFault> {
    let mut out = data.to_vec();
    let count = bytecode::read_u16(data, 0).unwrap_or(0) as usize;
    if out.len() != 2 + count * entry_len {
        return Err(VerifyFault::MalformedStackMap(
            "offset table length mismatch".to_string(),
        ));
    }
    for entry in out[2..].chunks_exact_mut(entry_len) {
        remap(entry)?;
    }
    Ok(out)
}

/// Rewrites the code offsets inside a type annotations attribute: local
/// variable ranges and the offsets of `instanceof`, `new`, casts and method
/// references.
fn remap_type_annotations(
    name: &str,
    data: &[u8],
    pool: &ConstantPool,
    map: &OffsetMap,
) -> Result<Vec<u8>, VerifyFault> {
    let bad = |reason: String| VerifyFault::UnrelocatableAttribute(format!("{name}: {reason}"));
    let malformed = |e: MalformedClassError| bad(e.to_string());
    let mut out = data.to_vec();
    let mut r = ByteReader::new(data);

    let count = r.u16("type annotations").map_err(malformed)?;
    for _ in 0..count {
        let target = r.u8("type annotation target").map_err(malformed)?;
        match target {
            // local_var_target / resource_variable
            0x40 | 0x41 => {
                let ranges = r.u16("local variable target").map_err(malformed)?;
                for _ in 0..ranges {
                    let at = r.pos();
                    let start = r.u16("local variable target").map_err(malformed)?;
                    let length = r.u16("local variable target").map_err(malformed)?;
                    r.u16("local variable target").map_err(malformed)?;
                    let new_start = map.pc(start)?;
                    let new_end = map.block(start as u32 + length as u32)?;
                    out[at..at + 2].copy_from_slice(&new_start.to_be_bytes());
                    out[at + 2..at + 4]
                        .copy_from_slice(&((new_end - new_start as u32) as u16).to_be_bytes());
                }
            }
            // catch_target indexes the exception table, whose order is kept.
            0x42 => {
                r.u16("catch target").map_err(malformed)?;
            }
            0x43..=0x4b => {
                let at = r.pos();
                let offset = r.u16("offset target").map_err(malformed)?;
                if target >= 0x47 {
                    r.u8("type argument index").map_err(malformed)?;
                }
                let moved = map
                    .instruction(offset as u32)
                    .map_err(|_| bad(format!("offset {offset} is not an instruction")))?;
                out[at..at + 2].copy_from_slice(&(moved as u16).to_be_bytes());
            }
            other => return Err(bad(format!("target type 0x{other:02x} inside Code"))),
        }
        let path = r.u8("type path").map_err(malformed)?;
        r.bytes(path as usize * 2, "type path").map_err(malformed)?;
        classfile::read_annotation(&mut r, pool).map_err(malformed)?;
    }
    if r.remaining() != 0 {
        return Err(bad(format!("{} trailing bytes", r.remaining())));
    }
    Ok(out)
}
