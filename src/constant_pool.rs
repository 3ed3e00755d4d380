//! Class file constant pool.
//!
//! The pool keeps the byte span it was parsed from so that serialization can
//! copy the original entries verbatim; new entries are only ever appended,
//! which keeps every existing index stable.

use std::ops::Range;

use crate::classfile::ByteReader;
use crate::error::MalformedClassError;

#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Utf8(String),
    Integer(i32),
    Float(u32),
    Long(i64),
    Double(u64),
    Class(u16),
    String(u16),
    Fieldref { class: u16, name_and_type: u16 },
    Methodref { class: u16, name_and_type: u16 },
    InterfaceMethodref { class: u16, name_and_type: u16 },
    NameAndType { name: u16, descriptor: u16 },
    MethodHandle { kind: u8, reference: u16 },
    MethodType(u16),
    Dynamic { bootstrap: u16, name_and_type: u16 },
    InvokeDynamic { bootstrap: u16, name_and_type: u16 },
    Module(u16),
    Package(u16),
    /// Slot 0 and the slot after a `Long`/`Double`.
    Unusable,
}

impl Constant {
    pub fn tag(&self) -> u8 {
        match self {
            Self::Utf8(_) => 1,
            Self::Integer(_) => 3,
            Self::Float(_) => 4,
            Self::Long(_) => 5,
            Self::Double(_) => 6,
            Self::Class(_) => 7,
            Self::String(_) => 8,
            Self::Fieldref { .. } => 9,
            Self::Methodref { .. } => 10,
            Self::InterfaceMethodref { .. } => 11,
            Self::NameAndType { .. } => 12,
            Self::MethodHandle { .. } => 15,
            Self::MethodType(_) => 16,
            Self::Dynamic { .. } => 17,
            Self::InvokeDynamic { .. } => 18,
            Self::Module(_) => 19,
            Self::Package(_) => 20,
            Self::Unusable => 0,
        }
    }

    fn is_wide(&self) -> bool {
        matches!(self, Self::Long(_) | Self::Double(_))
    }

    fn encode(&self, out: &mut Vec<u8>) {
        if matches!(self, Self::Unusable) {
            return;
        }
        out.push(self.tag());
        match self {
            Self::Utf8(s) => {
                let bytes = encode_modified_utf8(s);
                out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
                out.extend_from_slice(&bytes);
            }
            Self::Integer(v) => out.extend_from_slice(&v.to_be_bytes()),
            Self::Float(bits) => out.extend_from_slice(&bits.to_be_bytes()),
            Self::Long(v) => out.extend_from_slice(&v.to_be_bytes()),
            Self::Double(bits) => out.extend_from_slice(&bits.to_be_bytes()),
            Self::Class(i)
            | Self::String(i)
            | Self::MethodType(i)
            | Self::Module(i)
            | Self::Package(i) => out.extend_from_slice(&i.to_be_bytes()),
            Self::Fieldref {
                class,
                name_and_type,
            }
            | Self::Methodref {
                class,
                name_and_type,
            }
            | Self::InterfaceMethodref {
                class,
                name_and_type,
            } => {
                out.extend_from_slice(&class.to_be_bytes());
                out.extend_from_slice(&name_and_type.to_be_bytes());
            }
            Self::NameAndType { name, descriptor } => {
                out.extend_from_slice(&name.to_be_bytes());
                out.extend_from_slice(&descriptor.to_be_bytes());
            }
            Self::MethodHandle { kind, reference } => {
                out.push(*kind);
                out.extend_from_slice(&reference.to_be_bytes());
            }
            Self::Dynamic {
                bootstrap,
                name_and_type,
            }
            | Self::InvokeDynamic {
                bootstrap,
                name_and_type,
            } => {
                out.extend_from_slice(&bootstrap.to_be_bytes());
                out.extend_from_slice(&name_and_type.to_be_bytes());
            }
            Self::Unusable => {}
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConstantPool {
    entries: Vec<Constant>,
    original_len: usize,
    raw: Range<usize>,
}

impl ConstantPool {
    /// Parses `constant_pool_count` and the entries that follow it.
    pub(crate) fn parse(reader: &mut ByteReader<'_>) -> Result<Self, MalformedClassError> {
        let count = reader.u16("constant pool count")?;
        let start = reader.pos();
        let mut entries = Vec::with_capacity(count as usize);
        entries.push(Constant::Unusable);

        while entries.len() < count as usize {
            let index = entries.len() as u16;
            let tag = reader.u8("constant pool tag")?;
            let constant = match tag {
                1 => {
                    let len = reader.u16("utf8 length")? as usize;
                    Constant::Utf8(decode_modified_utf8(reader.bytes(len, "utf8 constant")?))
                }
                3 => Constant::Integer(reader.u32("integer constant")? as i32),
                4 => Constant::Float(reader.u32("float constant")?),
                5 => Constant::Long(reader.u64("long constant")? as i64),
                6 => Constant::Double(reader.u64("double constant")?),
                7 => Constant::Class(reader.u16("class constant")?),
                8 => Constant::String(reader.u16("string constant")?),
                9 | 10 | 11 => {
                    let class = reader.u16("member reference")?;
                    let name_and_type = reader.u16("member reference")?;
                    match tag {
                        9 => Constant::Fieldref {
                            class,
                            name_and_type,
                        },
                        10 => Constant::Methodref {
                            class,
                            name_and_type,
                        },
                        _ => Constant::InterfaceMethodref {
                            class,
                            name_and_type,
                        },
                    }
                }
                12 => Constant::NameAndType {
                    name: reader.u16("name and type")?,
                    descriptor: reader.u16("name and type")?,
                },
                15 => Constant::MethodHandle {
                    kind: reader.u8("method handle")?,
                    reference: reader.u16("method handle")?,
                },
                16 => Constant::MethodType(reader.u16("method type")?),
                17 | 18 => {
                    let bootstrap = reader.u16("dynamic constant")?;
                    let name_and_type = reader.u16("dynamic constant")?;
                    if tag == 17 {
                        Constant::Dynamic {
                            bootstrap,
                            name_and_type,
                        }
                    } else {
                        Constant::InvokeDynamic {
                            bootstrap,
                            name_and_type,
                        }
                    }
                }
                19 => Constant::Module(reader.u16("module constant")?),
                20 => Constant::Package(reader.u16("package constant")?),
                _ => return Err(MalformedClassError::BadConstantTag { index, tag }),
            };
            let wide = constant.is_wide();
            entries.push(constant);
            if wide {
                if entries.len() >= count as usize {
                    return Err(MalformedClassError::BadConstantRef {
                        index,
                        expected: "two-slot constant within the pool",
                    });
                }
                entries.push(Constant::Unusable);
            }
        }

        let pool = Self {
            original_len: entries.len(),
            entries,
            raw: start..reader.pos(),
        };
        pool.validate()?;
        Ok(pool)
    }

    /// Checks every cross reference before any entry is handed out.
    fn validate(&self) -> Result<(), MalformedClassError> {
        for (index, constant) in self.entries.iter().enumerate() {
            let index = index as u16;
            match constant {
                Constant::Class(i)
                | Constant::String(i)
                | Constant::MethodType(i)
                | Constant::Module(i)
                | Constant::Package(i) => {
                    self.expect(*i, "Utf8", |c| matches!(c, Constant::Utf8(_)))?;
                }
                Constant::Fieldref {
                    class,
                    name_and_type,
                }
                | Constant::Methodref {
                    class,
                    name_and_type,
                }
                | Constant::InterfaceMethodref {
                    class,
                    name_and_type,
                } => {
                    self.expect(*class, "Class", |c| matches!(c, Constant::Class(_)))?;
                    self.expect(*name_and_type, "NameAndType", |c| {
                        matches!(c, Constant::NameAndType { .. })
                    })?;
                }
                Constant::NameAndType { name, descriptor } => {
                    self.expect(*name, "Utf8", |c| matches!(c, Constant::Utf8(_)))?;
                    self.expect(*descriptor, "Utf8", |c| matches!(c, Constant::Utf8(_)))?;
                }
                Constant::MethodHandle { kind, reference } => match kind {
                    1..=4 => {
                        self.expect(*reference, "Fieldref", |c| {
                            matches!(c, Constant::Fieldref { .. })
                        })?;
                    }
                    5..=9 => {
                        self.expect(*reference, "Methodref", |c| {
                            matches!(
                                c,
                                Constant::Methodref { .. } | Constant::InterfaceMethodref { .. }
                            )
                        })?;
                    }
                    _ => {
                        return Err(MalformedClassError::BadConstantRef {
                            index,
                            expected: "method handle kind",
                        });
                    }
                },
                Constant::Dynamic { name_and_type, .. }
                | Constant::InvokeDynamic { name_and_type, .. } => {
                    self.expect(*name_and_type, "NameAndType", |c| {
                        matches!(c, Constant::NameAndType { .. })
                    })?;
                }
                Constant::Utf8(_)
                | Constant::Integer(_)
                | Constant::Float(_)
                | Constant::Long(_)
                | Constant::Double(_)
                | Constant::Unusable => {}
            }
        }
        Ok(())
    }

    fn expect(
        &self,
        index: u16,
        expected: &'static str,
        accept: impl Fn(&Constant) -> bool,
    ) -> Result<(), MalformedClassError> {
        match self.get(index) {
            Some(c) if accept(c) => Ok(()),
            _ => Err(MalformedClassError::BadConstantRef { index, expected }),
        }
    }

    /// `constant_pool_count` as written in the class file.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, index: u16) -> Option<&Constant> {
        match self.entries.get(index as usize) {
            Some(Constant::Unusable) | None => None,
            Some(c) => Some(c),
        }
    }

    pub fn utf8(&self, index: u16) -> Result<&str, MalformedClassError> {
        match self.get(index) {
            Some(Constant::Utf8(s)) => Ok(s),
            _ => Err(MalformedClassError::BadConstantRef {
                index,
                expected: "Utf8",
            }),
        }
    }

    /// Internal name (`a/b/C`) of a `Class` entry.
    pub fn class_name(&self, index: u16) -> Result<&str, MalformedClassError> {
        match self.get(index) {
            Some(Constant::Class(name)) => self.utf8(*name),
            _ => Err(MalformedClassError::BadConstantRef {
                index,
                expected: "Class",
            }),
        }
    }

    fn name_and_type(&self, index: u16) -> Option<(u16, u16)> {
        let name_and_type = match self.get(index)? {
            Constant::Fieldref { name_and_type, .. }
            | Constant::Methodref { name_and_type, .. }
            | Constant::InterfaceMethodref { name_and_type, .. }
            | Constant::Dynamic { name_and_type, .. }
            | Constant::InvokeDynamic { name_and_type, .. } => *name_and_type,
            _ => return None,
        };
        match self.get(name_and_type)? {
            Constant::NameAndType { name, descriptor } => Some((*name, *descriptor)),
            _ => None,
        }
    }

    /// Descriptor of a field, method, or dynamic reference.
    pub fn reference_descriptor(&self, index: u16) -> Option<&str> {
        let (_, descriptor) = self.name_and_type(index)?;
        self.utf8(descriptor).ok()
    }

    /// Member name of a field, method, or dynamic reference.
    pub fn reference_name(&self, index: u16) -> Option<&str> {
        let (name, _) = self.name_and_type(index)?;
        self.utf8(name).ok()
    }

    /// Entries appended since parsing, in index order.
    pub fn appended(&self) -> &[Constant] {
        &self.entries[self.original_len..]
    }

    /// Returns the index of an equal entry, appending one if none exists.
    pub fn add(&mut self, constant: Constant) -> Option<u16> {
        if let Some(pos) = self.entries.iter().position(|c| *c == constant) {
            return Some(pos as u16);
        }
        let slots = if constant.is_wide() { 2 } else { 1 };
        if self.entries.len() + slots > u16::MAX as usize {
            return None;
        }
        let index = self.entries.len() as u16;
        let wide = constant.is_wide();
        self.entries.push(constant);
        if wide {
            self.entries.push(Constant::Unusable);
        }
        Some(index)
    }

    pub fn add_utf8(&mut self, value: &str) -> Option<u16> {
        self.add(Constant::Utf8(value.to_string()))
    }

    pub fn add_class(&mut self, internal_name: &str) -> Option<u16> {
        let name = self.add_utf8(internal_name)?;
        self.add(Constant::Class(name))
    }

    pub fn add_string(&mut self, value: &str) -> Option<u16> {
        let utf8 = self.add_utf8(value)?;
        self.add(Constant::String(utf8))
    }

    pub fn add_methodref(&mut self, owner: &str, name: &str, descriptor: &str) -> Option<u16> {
        let class = self.add_class(owner)?;
        let name = self.add_utf8(name)?;
        let descriptor = self.add_utf8(descriptor)?;
        let name_and_type = self.add(Constant::NameAndType { name, descriptor })?;
        self.add(Constant::Methodref {
            class,
            name_and_type,
        })
    }

    /// Writes the count, the original entries verbatim, then appended ones.
    pub fn write(&self, class_bytes: &[u8], out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.entries.len() as u16).to_be_bytes());
        out.extend_from_slice(&class_bytes[self.raw.clone()]);
        for constant in self.appended() {
            constant.encode(out);
        }
    }
}

/// Decodes the JVM's modified UTF-8 (`C0 80` for NUL, surrogate pairs for
/// supplementary characters).
pub fn decode_modified_utf8(bytes: &[u8]) -> String {
    if let Ok(s) = std::str::from_utf8(bytes) {
        return s.to_string();
    }

    let mut units: Vec<u16> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b & 0x80 == 0 {
            units.push(b as u16);
            i += 1;
        } else if b & 0xE0 == 0xC0 && i + 1 < bytes.len() {
            units.push((((b & 0x1F) as u16) << 6) | (bytes[i + 1] & 0x3F) as u16);
            i += 2;
        } else if b & 0xF0 == 0xE0 && i + 2 < bytes.len() {
            units.push(
                (((b & 0x0F) as u16) << 12)
                    | (((bytes[i + 1] & 0x3F) as u16) << 6)
                    | (bytes[i + 2] & 0x3F) as u16,
            );
            i += 3;
        } else {
            units.push(0xFFFD);
            i += 1;
        }
    }
    String::from_utf16_lossy(&units)
}

pub fn encode_modified_utf8(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len());
    let mut buf = [0u16; 2];
    for ch in value.chars() {
        for unit in ch.encode_utf16(&mut buf).iter().copied() {
            match unit {
                0x0001..=0x007F => out.push(unit as u8),
                0x0000 | 0x0080..=0x07FF => {
                    out.push(0xC0 | (unit >> 6) as u8);
                    out.push(0x80 | (unit & 0x3F) as u8);
                }
                _ => {
                    out.push(0xE0 | (unit >> 12) as u8);
                    out.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                    out.push(0x80 | (unit & 0x3F) as u8);
                }
            }
        }
    }
    out
}
