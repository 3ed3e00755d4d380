//! Class file reader.
//!
//! `ParsedClass::parse` borrows the input buffer and records byte spans for
//! fields, methods and attributes, so the rewriter can copy anything it does
//! not touch without re-encoding it.

use serde::Serialize;
use std::collections::BTreeMap;
use std::ops::Range;

use crate::constant_pool::ConstantPool;
use crate::error::MalformedClassError;
use crate::rules::MethodEdit;

pub const MAGIC: u32 = 0xCAFE_BABE;
pub const MIN_MAJOR_VERSION: u16 = 45;
/// Java SE 25.
pub const MAX_MAJOR_VERSION: u16 = 69;

/// Class attribute recording which rules already rewrote the class.
pub const MARKER_ATTRIBUTE: &str = "AmsInstrumented";

pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            end: data.len(),
        }
    }

    /// Reader over `data[range]` that reports absolute positions.
    pub(crate) fn bounded(data: &'a [u8], range: Range<usize>) -> Self {
        Self {
            data,
            pos: range.start,
            end: range.end.min(data.len()),
        }
    }

    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.end.saturating_sub(self.pos)
    }

    pub(crate) fn bytes(
        &mut self,
        len: usize,
        context: &'static str,
    ) -> Result<&'a [u8], MalformedClassError> {
        if self.remaining() < len {
            return Err(MalformedClassError::Truncated {
                context,
                offset: self.pos,
            });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self, context: &'static str) -> Result<u8, MalformedClassError> {
        Ok(self.bytes(1, context)?[0])
    }

    pub(crate) fn u16(&mut self, context: &'static str) -> Result<u16, MalformedClassError> {
        let b = self.bytes(2, context)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self, context: &'static str) -> Result<u32, MalformedClassError> {
        let b = self.bytes(4, context)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn u64(&mut self, context: &'static str) -> Result<u64, MalformedClassError> {
        let hi = self.u32(context)? as u64;
        let lo = self.u32(context)? as u64;
        Ok((hi << 32) | lo)
    }
}

#[derive(Debug, Clone)]
pub struct Attribute {
    pub name_index: u16,
    pub name: String,
    /// Body span, excluding the 6-byte header.
    pub data: Range<usize>,
}

impl Attribute {
    /// Span including the name index and length header.
    pub fn span(&self) -> Range<usize> {
        self.data.start - 6..self.data.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    pub catch_type: u16,
}

#[derive(Debug, Clone)]
pub struct CodeAttribute {
    /// Position of the Code attribute within the method's attributes.
    pub attribute: usize,
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Range<usize>,
    pub exception_table: Vec<ExceptionEntry>,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone)]
pub struct MethodInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub name: String,
    pub descriptor: String,
    pub span: Range<usize>,
    pub attributes: Vec<Attribute>,
    pub code: Option<CodeAttribute>,
    /// Annotation type descriptors, e.g. `Lcom/example/Trace;`.
    pub annotations: Vec<String>,
}

impl MethodInfo {
    pub fn signature(&self) -> String {
        format!("{}{}", self.name, self.descriptor)
    }

    pub fn is_constructor(&self) -> bool {
        self.name == "<init>" || self.name == "<clinit>"
    }
}

#[derive(Debug, Clone)]
pub struct ParsedClass<'a> {
    bytes: &'a [u8],
    pub minor_version: u16,
    pub major_version: u16,
    pub pool: ConstantPool,
    pub access_flags: u16,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    /// Internal name, e.g. `com/example/Foo`.
    pub name: String,
    pub super_name: Option<String>,
    pub interface_names: Vec<String>,
    fields: Range<usize>,
    pub methods: Vec<MethodInfo>,
    pub attributes: Vec<Attribute>,
    pub annotations: Vec<String>,
    /// Rule ids recorded by a previous rewrite.
    pub applied_rules: Vec<String>,
    pub(crate) edits: BTreeMap<usize, MethodEdit>,
    pub(crate) newly_applied: Vec<String>,
}

impl<'a> ParsedClass<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self, MalformedClassError> {
        let mut r = ByteReader::new(bytes);
        let magic = r.u32("magic")?;
        if magic != MAGIC {
            return Err(MalformedClassError::BadMagic(magic));
        }
        let minor_version = r.u16("version")?;
        let major_version = r.u16("version")?;
        if !(MIN_MAJOR_VERSION..=MAX_MAJOR_VERSION).contains(&major_version) {
            return Err(MalformedClassError::UnsupportedVersion {
                major: major_version,
                minor: minor_version,
            });
        }

        let pool = ConstantPool::parse(&mut r)?;
        let access_flags = r.u16("access flags")?;
        let this_class = r.u16("this class")?;
        let name = pool.class_name(this_class)?.to_string();
        let super_class = r.u16("super class")?;
        let super_name = match super_class {
            0 => None,
            i => Some(pool.class_name(i)?.to_string()),
        };

        let interface_count = r.u16("interfaces")?;
        let mut interfaces = Vec::with_capacity(interface_count as usize);
        let mut interface_names = Vec::with_capacity(interface_count as usize);
        for _ in 0..interface_count {
            let i = r.u16("interfaces")?;
            interface_names.push(pool.class_name(i)?.to_string());
            interfaces.push(i);
        }

        let fields_start = r.pos();
        let field_count = r.u16("fields")?;
        for _ in 0..field_count {
            r.bytes(2, "field")?;
            let name = r.u16("field")?;
            let descriptor = r.u16("field")?;
            pool.utf8(name)?;
            pool.utf8(descriptor)?;
            read_attributes(&mut r, &pool)?;
        }
        let fields = fields_start..r.pos();

        let method_count = r.u16("methods")?;
        let mut methods = Vec::with_capacity(method_count as usize);
        for _ in 0..method_count {
            methods.push(read_method(&mut r, &pool, bytes)?);
        }

        let attributes = read_attributes(&mut r, &pool)?;
        if r.remaining() > 0 {
            return Err(MalformedClassError::TrailingBytes(r.remaining()));
        }

        let mut annotations = Vec::new();
        let mut applied_rules = Vec::new();
        for attr in &attributes {
            match attr.name.as_str() {
                "RuntimeVisibleAnnotations" | "RuntimeInvisibleAnnotations" => {
                    annotations.extend(read_annotation_types(bytes, attr, &pool)?);
                }
                MARKER_ATTRIBUTE => {
                    let mut m = ByteReader::bounded(bytes, attr.data.clone());
                    let count = m.u16("marker attribute")?;
                    for _ in 0..count {
                        applied_rules.push(pool.utf8(m.u16("marker attribute")?)?.to_string());
                    }
                }
                _ => {}
            }
        }

        Ok(Self {
            bytes,
            minor_version,
            major_version,
            pool,
            access_flags,
            this_class,
            super_class,
            interfaces,
            name,
            super_name,
            interface_names,
            fields,
            methods,
            attributes,
            annotations,
            applied_rules,
            edits: BTreeMap::new(),
            newly_applied: Vec::new(),
        })
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn dotted_name(&self) -> String {
        self.name.replace('/', ".")
    }

    /// `fields_count` through the end of the last field.
    pub fn fields_span(&self) -> Range<usize> {
        self.fields.clone()
    }

    pub fn code_bytes(&self, code: &CodeAttribute) -> &'a [u8] {
        &self.bytes[code.code.clone()]
    }

    pub fn attribute_data(&self, attr: &Attribute) -> &'a [u8] {
        &self.bytes[attr.data.clone()]
    }

    pub fn has_edits(&self) -> bool {
        !self.edits.is_empty()
    }

    /// Rules applied since parsing that selected at least one method.
    pub fn newly_applied(&self) -> &[String] {
        &self.newly_applied
    }

    pub fn summary(&self) -> ClassSummary {
        ClassSummary {
            name: self.dotted_name(),
            super_name: self.super_name.as_ref().map(|s| s.replace('/', ".")),
            interfaces: self
                .interface_names
                .iter()
                .map(|s| s.replace('/', "."))
                .collect(),
            version: format!("{}.{}", self.major_version, self.minor_version),
            constant_pool_count: self.pool.count(),
            annotations: self.annotations.clone(),
            methods: self
                .methods
                .iter()
                .map(|m| MethodSummary {
                    signature: m.signature(),
                    access_flags: m.access_flags,
                    code_length: m.code.as_ref().map(|c| c.code.len()),
                    annotations: m.annotations.clone(),
                })
                .collect(),
            applied_rules: self.applied_rules.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MethodSummary {
    pub signature: String,
    pub access_flags: u16,
    pub code_length: Option<usize>,
    pub annotations: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ClassSummary {
    pub name: String,
    pub super_name: Option<String>,
    pub interfaces: Vec<String>,
    pub version: String,
    pub constant_pool_count: usize,
    pub annotations: Vec<String>,
    pub methods: Vec<MethodSummary>,
    pub applied_rules: Vec<String>,
}

fn read_attributes(
    r: &mut ByteReader<'_>,
    pool: &ConstantPool,
) -> Result<Vec<Attribute>, MalformedClassError> {
    let count = r.u16("attributes")?;
    let mut attributes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name_index = r.u16("attribute header")?;
        let name = pool.utf8(name_index)?.to_string();
        let len = r.u32("attribute header")? as usize;
        let start = r.pos();
        r.bytes(len, "attribute body")?;
        attributes.push(Attribute {
            name_index,
            name,
            data: start..start + len,
        });
    }
    Ok(attributes)
}

fn read_method(
    r: &mut ByteReader<'_>,
    pool: &ConstantPool,
    bytes: &[u8],
) -> Result<MethodInfo, MalformedClassError> {
    let start = r.pos();
    let access_flags = r.u16("method")?;
    let name_index = r.u16("method")?;
    let descriptor_index = r.u16("method")?;
    let name = pool.utf8(name_index)?.to_string();
    let descriptor = pool.utf8(descriptor_index)?.to_string();
    let attributes = read_attributes(r, pool)?;

    let mut code = None;
    let mut annotations = Vec::new();
    for (i, attr) in attributes.iter().enumerate() {
        match attr.name.as_str() {
            "Code" => {
                let signature = format!("{name}{descriptor}");
                code = Some(read_code(bytes, attr, i, pool, &signature)?);
            }
            "RuntimeVisibleAnnotations" | "RuntimeInvisibleAnnotations" => {
                annotations.extend(read_annotation_types(bytes, attr, pool)?);
            }
            _ => {}
        }
    }

    Ok(MethodInfo {
        access_flags,
        name_index,
        descriptor_index,
        name,
        descriptor,
        span: start..r.pos(),
        attributes,
        code,
        annotations,
    })
}

fn read_code(
    bytes: &[u8],
    attr: &Attribute,
    index: usize,
    pool: &ConstantPool,
    method: &str,
) -> Result<CodeAttribute, MalformedClassError> {
    let bad = |reason: String| MalformedClassError::BadCode {
        method: method.to_string(),
        reason,
    };

    let mut r = ByteReader::bounded(bytes, attr.data.clone());
    let max_stack = r.u16("code attribute")?;
    let max_locals = r.u16("code attribute")?;
    let code_len = r.u32("code attribute")? as usize;
    if code_len == 0 || code_len > u16::MAX as usize {
        return Err(bad(format!("code length {code_len}")));
    }
    let code_start = r.pos();
    r.bytes(code_len, "code attribute")?;

    let entries = r.u16("exception table")?;
    let mut exception_table = Vec::with_capacity(entries as usize);
    for _ in 0..entries {
        let entry = ExceptionEntry {
            start_pc: r.u16("exception table")?,
            end_pc: r.u16("exception table")?,
            handler_pc: r.u16("exception table")?,
            catch_type: r.u16("exception table")?,
        };
        if entry.start_pc >= entry.end_pc
            || entry.end_pc as usize > code_len
            || entry.handler_pc as usize >= code_len
        {
            return Err(bad(format!("exception range {entry:?}")));
        }
        if entry.catch_type != 0 {
            pool.class_name(entry.catch_type)?;
        }
        exception_table.push(entry);
    }

    let attributes = read_attributes(&mut r, pool)?;
    if r.remaining() > 0 {
        return Err(bad(format!("{} unread bytes", r.remaining())));
    }

    Ok(CodeAttribute {
        attribute: index,
        max_stack,
        max_locals,
        code: code_start..code_start + code_len,
        exception_table,
        attributes,
    })
}

fn read_annotation_types(
    bytes: &[u8],
    attr: &Attribute,
    pool: &ConstantPool,
) -> Result<Vec<String>, MalformedClassError> {
    let mut r = ByteReader::bounded(bytes, attr.data.clone());
    let count = r.u16("annotations")?;
    let mut types = Vec::with_capacity(count as usize);
    for _ in 0..count {
        types.push(read_annotation(&mut r, pool)?);
    }
    Ok(types)
}

/// Reads one annotation, returning its type descriptor.
pub(crate) fn read_annotation(
    r: &mut ByteReader<'_>,
    pool: &ConstantPool,
) -> Result<String, MalformedClassError> {
    let type_index = r.u16("annotation")?;
    let descriptor = pool.utf8(type_index)?.to_string();
    let pairs = r.u16("annotation")?;
    for _ in 0..pairs {
        r.u16("annotation element")?;
        skip_element_value(r, pool)?;
    }
    Ok(descriptor)
}

fn skip_element_value(
    r: &mut ByteReader<'_>,
    pool: &ConstantPool,
) -> Result<(), MalformedClassError> {
    match r.u8("element value")? {
        b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' | b's' | b'c' => {
            r.u16("element value")?;
        }
        b'e' => {
            r.u16("element value")?;
            r.u16("element value")?;
        }
        b'@' => {
            read_annotation(r, pool)?;
        }
        b'[' => {
            let n = r.u16("element value")?;
            for _ in 0..n {
                skip_element_value(r, pool)?;
            }
        }
        _ => {
            return Err(MalformedClassError::Truncated {
                context: "element value tag",
                offset: r.pos() - 1,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{self, ClassFixture};

    #[test]
    fn parses_sample_class() {
        let bytes = fixture::sample_class("com/example/Foo");
        let class = ParsedClass::parse(&bytes).unwrap();
        assert_eq!(class.name, "com/example/Foo");
        assert_eq!(class.dotted_name(), "com.example.Foo");
        assert_eq!(class.super_name.as_deref(), Some("java/lang/Object"));
        assert_eq!(class.major_version, 52);

        let sigs: Vec<String> = class.methods.iter().map(|m| m.signature()).collect();
        assert_eq!(
            sigs,
            vec!["<init>()V", "run()V", "compute(I)I", "pick(I)I", "guarded()V"]
        );

        let compute = &class.methods[2];
        let code = compute.code.as_ref().unwrap();
        assert_eq!(code.max_stack, 1);
        assert_eq!(class.code_bytes(code).len(), 8);
        assert_eq!(code.attributes[0].name, "StackMapTable");

        let guarded = class.methods[4].code.as_ref().unwrap();
        assert_eq!(guarded.exception_table.len(), 1);
        assert_eq!(guarded.exception_table[0].handler_pc, 6);
    }

    #[test]
    fn reads_class_and_method_annotations() {
        let mut fx = ClassFixture::new("a/B");
        fx.annotate("Lcom/example/Trace;");
        let mut run = fixture::run_method();
        run.annotations.push("Lcom/example/Timed;".to_string());
        fx.method(run);
        let bytes = fx.build();

        let class = ParsedClass::parse(&bytes).unwrap();
        assert_eq!(class.annotations, vec!["Lcom/example/Trace;"]);
        assert_eq!(class.methods[0].annotations, vec!["Lcom/example/Timed;"]);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = fixture::sample_class("a/B");
        bytes[0] = 0;
        assert!(matches!(
            ParsedClass::parse(&bytes),
            Err(MalformedClassError::BadMagic(_))
        ));
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut fx = ClassFixture::new("a/B");
        fx.major = 99;
        let bytes = fx.build();
        assert!(matches!(
            ParsedClass::parse(&bytes),
            Err(MalformedClassError::UnsupportedVersion { major: 99, .. })
        ));
    }

    #[test]
    fn rejects_truncated_input_at_every_cut() {
        let bytes = fixture::sample_class("a/B");
        for cut in [3, 9, 40, bytes.len() / 2, bytes.len() - 1] {
            assert!(
                ParsedClass::parse(&bytes[..cut]).is_err(),
                "cut at {cut} should fail"
            );
        }
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut bytes = fixture::sample_class("a/B");
        bytes.push(0);
        assert_eq!(
            ParsedClass::parse(&bytes).unwrap_err(),
            MalformedClassError::TrailingBytes(1)
        );
    }

    #[test]
    fn method_spans_cover_raw_bytes() {
        let bytes = fixture::sample_class("a/B");
        let class = ParsedClass::parse(&bytes).unwrap();
        let first = &class.methods[0];
        let second = &class.methods[1];
        assert_eq!(first.span.end, second.span.start);
        let raw = &bytes[first.span.clone()];
        assert_eq!(u16::from_be_bytes([raw[2], raw[3]]), first.name_index);
    }
}
