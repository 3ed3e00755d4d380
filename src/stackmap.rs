//! StackMapTable frames with absolute offsets.
//!
//! Frames are decoded into absolute bytecode offsets so relocation can move
//! them, then re-encoded choosing the compact form each delta allows.

use crate::classfile::ByteReader;
use crate::error::VerifyFault;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationType {
    Top,
    Integer,
    Float,
    Double,
    Long,
    Null,
    UninitializedThis,
    Object(u16),
    /// Offset of the `new` instruction that created the value.
    Uninitialized(u32),
}

impl VerificationType {
    pub fn slots(&self) -> u16 {
        match self {
            Self::Double | Self::Long => 2,
            _ => 1,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Self::Top => out.push(0),
            Self::Integer => out.push(1),
            Self::Float => out.push(2),
            Self::Double => out.push(3),
            Self::Long => out.push(4),
            Self::Null => out.push(5),
            Self::UninitializedThis => out.push(6),
            Self::Object(index) => {
                out.push(7);
                out.extend_from_slice(&index.to_be_bytes());
            }
            Self::Uninitialized(offset) => {
                out.push(8);
                out.extend_from_slice(&(*offset as u16).to_be_bytes());
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    Same,
    SameLocals1(VerificationType),
    Chop(u8),
    Append(Vec<VerificationType>),
    Full {
        locals: Vec<VerificationType>,
        stack: Vec<VerificationType>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub offset: u32,
    pub kind: FrameKind,
}

impl Frame {
    pub fn types_mut(&mut self) -> impl Iterator<Item = &mut VerificationType> {
        let (a, b): (&mut [VerificationType], &mut [VerificationType]) = match &mut self.kind {
            FrameKind::Same | FrameKind::Chop(_) => (&mut [], &mut []),
            FrameKind::SameLocals1(t) => (std::slice::from_mut(t), &mut []),
            FrameKind::Append(locals) => (locals.as_mut_slice(), &mut []),
            FrameKind::Full { locals, stack } => (locals.as_mut_slice(), stack.as_mut_slice()),
        };
        a.iter_mut().chain(b.iter_mut())
    }
}

fn malformed(reason: impl Into<String>) -> VerifyFault {
    VerifyFault::MalformedStackMap(reason.into())
}

fn read_type(r: &mut ByteReader<'_>) -> Result<VerificationType, VerifyFault> {
    let tag = r.u8("verification type").map_err(|e| malformed(e.to_string()))?;
    Ok(match tag {
        0 => VerificationType::Top,
        1 => VerificationType::Integer,
        2 => VerificationType::Float,
        3 => VerificationType::Double,
        4 => VerificationType::Long,
        5 => VerificationType::Null,
        6 => VerificationType::UninitializedThis,
        7 => VerificationType::Object(
            r.u16("verification type")
                .map_err(|e| malformed(e.to_string()))?,
        ),
        8 => VerificationType::Uninitialized(
            r.u16("verification type")
                .map_err(|e| malformed(e.to_string()))? as u32,
        ),
        other => return Err(malformed(format!("verification type tag {other}"))),
    })
}

fn read_types(r: &mut ByteReader<'_>, count: usize) -> Result<Vec<VerificationType>, VerifyFault> {
    (0..count).map(|_| read_type(r)).collect()
}

pub fn parse(data: &[u8]) -> Result<Vec<Frame>, VerifyFault> {
    let mut r = ByteReader::new(data);
    let read_u16 = |r: &mut ByteReader<'_>| r.u16("stack map frame").map_err(|e| malformed(e.to_string()));
    let count = read_u16(&mut r)?;
    let mut frames = Vec::with_capacity(count as usize);
    let mut previous: Option<u32> = None;

    for _ in 0..count {
        let frame_type = r
            .u8("stack map frame")
            .map_err(|e| malformed(e.to_string()))?;
        let (delta, kind) = match frame_type {
            0..=63 => (frame_type as u32, FrameKind::Same),
            64..=127 => (
                frame_type as u32 - 64,
                FrameKind::SameLocals1(read_type(&mut r)?),
            ),
            247 => {
                let delta = read_u16(&mut r)? as u32;
                (delta, FrameKind::SameLocals1(read_type(&mut r)?))
            }
            248..=250 => (read_u16(&mut r)? as u32, FrameKind::Chop(251 - frame_type)),
            251 => (read_u16(&mut r)? as u32, FrameKind::Same),
            252..=254 => {
                let delta = read_u16(&mut r)? as u32;
                let locals = read_types(&mut r, (frame_type - 251) as usize)?;
                (delta, FrameKind::Append(locals))
            }
            255 => {
                let delta = read_u16(&mut r)? as u32;
                let n = read_u16(&mut r)? as usize;
                let locals = read_types(&mut r, n)?;
                let n = read_u16(&mut r)? as usize;
                let stack = read_types(&mut r, n)?;
                (delta, FrameKind::Full { locals, stack })
            }
            other => return Err(malformed(format!("reserved frame type {other}"))),
        };
        let offset = match previous {
            None => delta,
            Some(p) => p + delta + 1,
        };
        previous = Some(offset);
        frames.push(Frame { offset, kind });
    }

    if r.remaining() > 0 {
        return Err(malformed("trailing bytes"));
    }
    Ok(frames)
}

/// Encodes frames (sorted by offset) into a StackMapTable body.
pub fn encode(frames: &[Frame]) -> Result<Vec<u8>, VerifyFault> {
    let mut out = Vec::new();
    out.extend_from_slice(&(frames.len() as u16).to_be_bytes());
    let mut previous: Option<u32> = None;

    for frame in frames {
        let delta = match previous {
            None => frame.offset,
            Some(p) if frame.offset > p => frame.offset - p - 1,
            Some(_) => return Err(malformed("frames out of order")),
        };
        if delta > u16::MAX as u32 {
            return Err(malformed("frame offset delta overflow"));
        }
        previous = Some(frame.offset);
        let delta16 = (delta as u16).to_be_bytes();

        match &frame.kind {
            FrameKind::Same if delta <= 63 => out.push(delta as u8),
            FrameKind::Same => {
                out.push(251);
                out.extend_from_slice(&delta16);
            }
            FrameKind::SameLocals1(t) if delta <= 63 => {
                out.push(64 + delta as u8);
                t.encode(&mut out);
            }
            FrameKind::SameLocals1(t) => {
                out.push(247);
                out.extend_from_slice(&delta16);
                t.encode(&mut out);
            }
            FrameKind::Chop(k) => {
                out.push(251 - k);
                out.extend_from_slice(&delta16);
            }
            FrameKind::Append(locals) => {
                out.push(251 + locals.len() as u8);
                out.extend_from_slice(&delta16);
                for t in locals {
                    t.encode(&mut out);
                }
            }
            FrameKind::Full { locals, stack } => {
                out.push(255);
                out.extend_from_slice(&delta16);
                out.extend_from_slice(&(locals.len() as u16).to_be_bytes());
                for t in locals {
                    t.encode(&mut out);
                }
                out.extend_from_slice(&(stack.len() as u16).to_be_bytes());
                for t in stack {
                    t.encode(&mut out);
                }
            }
        }
    }
    Ok(out)
}
