//! Test-only class file builder.
//!
//! Produces small but well-formed class files so the reader, rewriter and
//! pipeline can be exercised without a JDK. Std-only, so integration tests can
//! include it by path.

#![allow(dead_code)]

use std::collections::HashMap;

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_ABSTRACT: u16 = 0x0400;

#[derive(Debug, Clone, Default)]
pub struct CodeFixture {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    /// `(start, end, handler, catch_type)`
    pub exceptions: Vec<[u16; 4]>,
    /// Raw StackMapTable body including the frame count.
    pub stack_map: Option<Vec<u8>>,
    /// `(start_pc, line)`
    pub line_numbers: Vec<(u16, u16)>,
    /// Any other Code attribute as `(name, body)`.
    pub extra_attributes: Vec<(String, Vec<u8>)>,
}

#[derive(Debug, Clone)]
pub struct MethodFixture {
    pub access: u16,
    pub name: String,
    pub descriptor: String,
    pub code: Option<CodeFixture>,
    pub annotations: Vec<String>,
}

impl MethodFixture {
    pub fn new(access: u16, name: &str, descriptor: &str, code: Option<CodeFixture>) -> Self {
        Self {
            access,
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            code,
            annotations: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClassFixture {
    pub major: u16,
    name: String,
    super_name: String,
    pool: Vec<Vec<u8>>,
    slots: u16,
    index: HashMap<Vec<u8>, u16>,
    methods: Vec<MethodFixture>,
    annotations: Vec<String>,
}

impl ClassFixture {
    pub fn new(name: &str) -> Self {
        Self {
            major: 52,
            name: name.to_string(),
            super_name: "java/lang/Object".to_string(),
            pool: Vec::new(),
            slots: 1,
            index: HashMap::new(),
            methods: Vec::new(),
            annotations: Vec::new(),
        }
    }

    fn entry(&mut self, bytes: Vec<u8>) -> u16 {
        if let Some(i) = self.index.get(&bytes) {
            return *i;
        }
        let i = self.slots;
        self.slots += if matches!(bytes[0], 5 | 6) { 2 } else { 1 };
        self.index.insert(bytes.clone(), i);
        self.pool.push(bytes);
        i
    }

    pub fn utf8(&mut self, s: &str) -> u16 {
        let mut b = vec![1];
        b.extend_from_slice(&(s.len() as u16).to_be_bytes());
        b.extend_from_slice(s.as_bytes());
        self.entry(b)
    }

    pub fn class(&mut self, name: &str) -> u16 {
        let n = self.utf8(name);
        let mut b = vec![7];
        b.extend_from_slice(&n.to_be_bytes());
        self.entry(b)
    }

    pub fn string(&mut self, s: &str) -> u16 {
        let n = self.utf8(s);
        let mut b = vec![8];
        b.extend_from_slice(&n.to_be_bytes());
        self.entry(b)
    }

    pub fn long(&mut self, v: i64) -> u16 {
        let mut b = vec![5];
        b.extend_from_slice(&v.to_be_bytes());
        self.entry(b)
    }

    pub fn methodref(&mut self, owner: &str, name: &str, descriptor: &str) -> u16 {
        let c = self.class(owner);
        let n = self.utf8(name);
        let d = self.utf8(descriptor);
        let mut nat = vec![12];
        nat.extend_from_slice(&n.to_be_bytes());
        nat.extend_from_slice(&d.to_be_bytes());
        let nat = self.entry(nat);
        let mut b = vec![10];
        b.extend_from_slice(&c.to_be_bytes());
        b.extend_from_slice(&nat.to_be_bytes());
        self.entry(b)
    }

    pub fn annotate(&mut self, descriptor: &str) -> &mut Self {
        self.annotations.push(descriptor.to_string());
        self
    }

    pub fn method(&mut self, method: MethodFixture) -> &mut Self {
        self.methods.push(method);
        self
    }

    fn annotations_attr(&mut self, descriptors: &[String], out: &mut Vec<u8>) {
        let name = self.utf8("RuntimeVisibleAnnotations");
        let types: Vec<u16> = descriptors.iter().map(|d| self.utf8(d)).collect();
        out.extend_from_slice(&name.to_be_bytes());
        out.extend_from_slice(&(2 + 4 * types.len() as u32).to_be_bytes());
        out.extend_from_slice(&(types.len() as u16).to_be_bytes());
        for t in types {
            out.extend_from_slice(&t.to_be_bytes());
            out.extend_from_slice(&0u16.to_be_bytes());
        }
    }

    fn code_attr(&mut self, code: &CodeFixture, out: &mut Vec<u8>) {
        let name = self.utf8("Code");
        let mut body = Vec::new();
        body.extend_from_slice(&code.max_stack.to_be_bytes());
        body.extend_from_slice(&code.max_locals.to_be_bytes());
        body.extend_from_slice(&(code.code.len() as u32).to_be_bytes());
        body.extend_from_slice(&code.code);
        body.extend_from_slice(&(code.exceptions.len() as u16).to_be_bytes());
        for e in &code.exceptions {
            for v in e {
                body.extend_from_slice(&v.to_be_bytes());
            }
        }

        let mut attrs = Vec::new();
        let mut attr_count = 0u16;
        if let Some(map) = &code.stack_map {
            let n = self.utf8("StackMapTable");
            attrs.extend_from_slice(&n.to_be_bytes());
            attrs.extend_from_slice(&(map.len() as u32).to_be_bytes());
            attrs.extend_from_slice(map);
            attr_count += 1;
        }
        if !code.line_numbers.is_empty() {
            let n = self.utf8("LineNumberTable");
            attrs.extend_from_slice(&n.to_be_bytes());
            attrs.extend_from_slice(&(2 + 4 * code.line_numbers.len() as u32).to_be_bytes());
            attrs.extend_from_slice(&(code.line_numbers.len() as u16).to_be_bytes());
            for (pc, line) in &code.line_numbers {
                attrs.extend_from_slice(&pc.to_be_bytes());
                attrs.extend_from_slice(&line.to_be_bytes());
            }
            attr_count += 1;
        }
        for (name, data) in &code.extra_attributes {
            let n = self.utf8(name);
            attrs.extend_from_slice(&n.to_be_bytes());
            attrs.extend_from_slice(&(data.len() as u32).to_be_bytes());
            attrs.extend_from_slice(data);
            attr_count += 1;
        }
        body.extend_from_slice(&attr_count.to_be_bytes());
        body.extend_from_slice(&attrs);

        out.extend_from_slice(&name.to_be_bytes());
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
    }

    pub fn build(&self) -> Vec<u8> {
        let mut this = self.clone();
        let this_class = this.class(&self.name);
        let super_class = this.class(&self.super_name);

        let mut methods = Vec::new();
        for m in self.methods.clone() {
            let name = this.utf8(&m.name);
            let desc = this.utf8(&m.descriptor);
            methods.extend_from_slice(&m.access.to_be_bytes());
            methods.extend_from_slice(&name.to_be_bytes());
            methods.extend_from_slice(&desc.to_be_bytes());
            let count = m.code.is_some() as u16 + !m.annotations.is_empty() as u16;
            methods.extend_from_slice(&count.to_be_bytes());
            if let Some(code) = &m.code {
                this.code_attr(code, &mut methods);
            }
            if !m.annotations.is_empty() {
                this.annotations_attr(&m.annotations, &mut methods);
            }
        }

        let mut class_attrs = Vec::new();
        let class_attr_count = !self.annotations.is_empty() as u16;
        if !self.annotations.is_empty() {
            this.annotations_attr(&self.annotations, &mut class_attrs);
        }

        let mut out = Vec::new();
        out.extend_from_slice(&0xCAFEBABEu32.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&self.major.to_be_bytes());
        out.extend_from_slice(&this.slots.to_be_bytes());
        for entry in &this.pool {
            out.extend_from_slice(entry);
        }
        out.extend_from_slice(&(ACC_PUBLIC | 0x0020).to_be_bytes());
        out.extend_from_slice(&this_class.to_be_bytes());
        out.extend_from_slice(&super_class.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&(self.methods.len() as u16).to_be_bytes());
        out.extend_from_slice(&methods);
        out.extend_from_slice(&class_attr_count.to_be_bytes());
        out.extend_from_slice(&class_attrs);
        out
    }
}

/// `<init>`: `aload_0; invokespecial Object.<init>; return`
pub fn constructor(fx: &mut ClassFixture) -> MethodFixture {
    let init = fx.methodref("java/lang/Object", "<init>", "()V");
    let [hi, lo] = init.to_be_bytes();
    MethodFixture::new(
        ACC_PUBLIC,
        "<init>",
        "()V",
        Some(CodeFixture {
            max_stack: 1,
            max_locals: 1,
            code: vec![0x2a, 0xb7, hi, lo, 0xb1],
            ..CodeFixture::default()
        }),
    )
}

/// `run()V`: `return`
pub fn run_method() -> MethodFixture {
    MethodFixture::new(
        ACC_PUBLIC,
        "run",
        "()V",
        Some(CodeFixture {
            max_stack: 0,
            max_locals: 1,
            code: vec![0xb1],
            line_numbers: vec![(0, 10)],
            ..CodeFixture::default()
        }),
    )
}

/// `compute(I)I`: `return x > 0 ? x : 0`, with a frame at the join.
pub fn compute_method() -> MethodFixture {
    MethodFixture::new(
        ACC_PUBLIC,
        "compute",
        "(I)I",
        Some(CodeFixture {
            max_stack: 1,
            max_locals: 2,
            code: vec![0x1b, 0x9e, 0x00, 0x05, 0x1b, 0xac, 0x03, 0xac],
            stack_map: Some(vec![0x00, 0x01, 6]),
            line_numbers: vec![(0, 20), (6, 21)],
            ..CodeFixture::default()
        }),
    )
}

/// `pick(I)I`: a `tableswitch` over `0..=1` whose padding depends on its offset.
pub fn pick_method() -> MethodFixture {
    let mut code = vec![0x1b, 0xaa, 0x00, 0x00];
    for v in [27i32, 0, 1, 23, 25] {
        code.extend_from_slice(&v.to_be_bytes());
    }
    code.extend_from_slice(&[0x04, 0xac, 0x05, 0xac, 0x03, 0xac]);
    MethodFixture::new(
        ACC_PUBLIC,
        "pick",
        "(I)I",
        Some(CodeFixture {
            max_stack: 1,
            max_locals: 2,
            code,
            stack_map: Some(vec![0x00, 0x03, 24, 1, 1]),
            ..CodeFixture::default()
        }),
    )
}

/// `static guarded()V`: `try { Helper.foo(); } catch (Throwable t) {}`
pub fn guarded_method(fx: &mut ClassFixture) -> MethodFixture {
    let foo = fx.methodref("a/Helper", "foo", "()V");
    let throwable = fx.class("java/lang/Throwable");
    let [fh, fl] = foo.to_be_bytes();
    let [th, tl] = throwable.to_be_bytes();
    MethodFixture::new(
        ACC_PUBLIC | ACC_STATIC,
        "guarded",
        "()V",
        Some(CodeFixture {
            max_stack: 1,
            max_locals: 1,
            code: vec![0xb8, fh, fl, 0xa7, 0x00, 0x04, 0x4b, 0xb1],
            exceptions: vec![[0, 3, 6, throwable]],
            stack_map: Some(vec![0x00, 0x02, 64 + 6, 7, th, tl, 0]),
            ..CodeFixture::default()
        }),
    )
}

/// A class exercising every fixture method.
pub fn sample_class(name: &str) -> Vec<u8> {
    let mut fx = ClassFixture::new(name);
    let ctor = constructor(&mut fx);
    let guarded = guarded_method(&mut fx);
    fx.method(ctor)
        .method(run_method())
        .method(compute_method())
        .method(pick_method())
        .method(guarded);
    fx.build()
}
