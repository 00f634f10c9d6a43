//! JVM class file container
//!
//! Reads and writes the class file structure, and decodes individual
//! `Code` attributes into the [`crate::bytecode`] instruction model. Only
//! the method being rewritten is ever decoded; every other member and
//! attribute is carried through as raw bytes.
//!
//! After a method body is replaced, its frame metadata is re-derived from
//! the new instruction stream: `max_stack` by dataflow, every offset table
//! from label positions, and local accesses are checked against the
//! declared `max_locals`.

pub mod code;
pub mod constant_pool;
pub mod opcodes;
pub mod reader;
pub mod stack;

use thiserror::Error;

use crate::bytecode::{Label, MethodBody};
pub use code::Code;
pub use constant_pool::ConstantPool;
use reader::{ByteReader, ByteWriter};

const MAGIC: u32 = 0xCAFE_BABE;

/// The input bytes are not a well-formed class file
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassFormatError {
    #[error("not a class file (magic {0:#010x})")]
    BadMagic(u32),

    #[error("truncated input: wanted {wanted} bytes at offset {offset}")]
    Truncated { offset: usize, wanted: usize },

    #[error("unknown constant pool tag {tag} at offset {offset}")]
    UnknownConstantTag { tag: u8, offset: usize },

    #[error("invalid constant pool index {index}")]
    BadConstantIndex { index: u16 },

    #[error("constant #{index} is not a {expected}")]
    WrongConstantKind { index: u16, expected: &'static str },

    #[error("invalid modified UTF-8 in constant #{index}")]
    InvalidUtf8 { index: u16 },

    #[error("invalid constant pool: {0}")]
    InvalidConstantPool(String),

    #[error("constant pool is full")]
    ConstantPoolFull,

    #[error("unknown opcode {opcode:#04x} at bytecode offset {offset}")]
    UnknownOpcode { opcode: u8, offset: u32 },

    #[error("branch at offset {offset} targets {target}, outside the code")]
    BadBranchTarget { offset: u32, target: i64 },

    #[error("invalid bytecode: {0}")]
    InvalidCode(String),

    #[error("reserved stack map frame type {0}")]
    ReservedFrameType(u8),

    #[error("attribute {name} has an inconsistent length")]
    AttributeLength { name: String },

    #[error("{0} trailing bytes after the class file")]
    TrailingBytes(usize),
}

/// A rewritten method body cannot be turned back into valid bytecode
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("local slot {slot} (width {width}) exceeds max_locals {max_locals}")]
    LocalOutOfRange {
        slot: u16,
        width: u16,
        max_locals: u16,
    },

    #[error("label {0} is referenced but never placed")]
    MissingLabel(Label),

    #[error("label {0} is placed more than once")]
    DuplicateLabel(Label),

    #[error("branch offset {offset} does not fit in 16 bits")]
    BranchOutOfRange { offset: i64 },

    #[error("code length {0} exceeds 65535 bytes")]
    CodeTooLarge(usize),

    #[error("method body has no instructions")]
    EmptyCode,

    #[error("raw instruction with opcode {opcode:#04x} is not position independent")]
    InvalidRaw { opcode: u8 },

    #[error("operand stack underflow at instruction {index}")]
    StackUnderflow { index: usize },

    #[error("stack height mismatch at instruction {index}: {existing} vs {incoming}")]
    StackMismatch {
        index: usize,
        existing: u32,
        incoming: u32,
    },

    #[error("operand stack exceeds 65535 slots")]
    StackOverflow,

    #[error("control falls off the end of the code")]
    FallsOffEnd,

    #[error("stack map frames out of order at offset {offset}")]
    FrameOrder { offset: u32 },

    #[error("malformed descriptor {0}")]
    BadDescriptor(String),

    #[error(transparent)]
    ConstantPool(#[from] ClassFormatError),
}

/// Result type for class file parsing
pub type Result<T> = std::result::Result<T, ClassFormatError>;

/// Attribute kept as its raw payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    /// Constant pool index of the attribute name
    pub name: u16,
    pub data: Vec<u8>,
}

/// A field or method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub access_flags: u16,
    pub name: u16,
    pub descriptor: u16,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub constant_pool: ConstantPool,
    pub access_flags: u16,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<Member>,
    pub methods: Vec<Member>,
    pub attributes: Vec<Attribute>,
}

impl ClassFile {
    /// Empty public class (Java 6 format) with the given internal names
    pub fn new(name: &str, super_name: &str) -> Result<Self> {
        let mut constant_pool = ConstantPool::new();
        let this_class = constant_pool.add_class(name)?;
        let super_class = constant_pool.add_class(super_name)?;
        Ok(Self {
            minor_version: 0,
            major_version: 50,
            constant_pool,
            access_flags: 0x0021,
            this_class,
            super_class,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            attributes: Vec::new(),
        })
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes);
        let magic = reader.u32()?;
        if magic != MAGIC {
            return Err(ClassFormatError::BadMagic(magic));
        }
        let minor_version = reader.u16()?;
        let major_version = reader.u16()?;
        let constant_pool = ConstantPool::parse(&mut reader)?;
        let access_flags = reader.u16()?;
        let this_class = reader.u16()?;
        let super_class = reader.u16()?;

        let interface_count = reader.u16()?;
        let interfaces = (0..interface_count)
            .map(|_| reader.u16())
            .collect::<Result<Vec<_>>>()?;
        let fields = parse_members(&mut reader)?;
        let methods = parse_members(&mut reader)?;
        let attributes = parse_attributes(&mut reader)?;

        if reader.remaining() != 0 {
            return Err(ClassFormatError::TrailingBytes(reader.remaining()));
        }

        let class = Self {
            minor_version,
            major_version,
            constant_pool,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        };
        class.name()?;
        Ok(class)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = ByteWriter::new();
        out.u32(MAGIC);
        out.u16(self.minor_version);
        out.u16(self.major_version);
        self.constant_pool.write(&mut out);
        out.u16(self.access_flags);
        out.u16(self.this_class);
        out.u16(self.super_class);
        out.u16(self.interfaces.len() as u16);
        for interface in &self.interfaces {
            out.u16(*interface);
        }
        write_members(&mut out, &self.fields);
        write_members(&mut out, &self.methods);
        write_attributes(&mut out, &self.attributes);
        out.into_bytes()
    }

    /// Internal name of this class (e.g. `net/minecraft/launchwrapper/LaunchClassLoader`)
    pub fn name(&self) -> Result<&str> {
        self.constant_pool.class_name(self.this_class)
    }

    /// Index of the method with this exact name and descriptor
    pub fn find_method(&self, name: &str, descriptor: &str) -> Result<Option<usize>> {
        for (index, method) in self.methods.iter().enumerate() {
            if self.constant_pool.utf8(method.name)? == name
                && self.constant_pool.utf8(method.descriptor)? == descriptor
            {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    /// `name+descriptor` of a method, for diagnostics
    pub fn method_signature(&self, index: usize) -> Result<String> {
        let method = &self.methods[index];
        Ok(format!(
            "{}{}",
            self.constant_pool.utf8(method.name)?,
            self.constant_pool.utf8(method.descriptor)?
        ))
    }

    fn code_attribute_position(&self, index: usize) -> Result<Option<usize>> {
        for (position, attribute) in self.methods[index].attributes.iter().enumerate() {
            if self.constant_pool.utf8(attribute.name)? == "Code" {
                return Ok(Some(position));
            }
        }
        Ok(None)
    }

    /// Decoded `Code` of a method; `None` for abstract and native methods
    pub fn method_code(&self, index: usize) -> Result<Option<Code>> {
        match self.code_attribute_position(index)? {
            Some(position) => {
                let data = &self.methods[index].attributes[position].data;
                Code::decode(data, &self.constant_pool).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Replace a method's `Code`, re-deriving its frame metadata
    ///
    /// Returns the recomputed `max_stack`. On error the class is left
    /// untouched apart from constants that may have been appended.
    pub fn set_method_code(
        &mut self,
        index: usize,
        code: &Code,
    ) -> std::result::Result<u16, VerifyError> {
        let data = code.encode(&mut self.constant_pool)?;
        let max_stack = u16::from_be_bytes([data[0], data[1]]);

        match self.code_attribute_position(index)? {
            Some(position) => self.methods[index].attributes[position].data = data,
            None => {
                let name = self.constant_pool.add_utf8("Code")?;
                self.methods[index].attributes.push(Attribute { name, data });
            }
        }
        Ok(max_stack)
    }

    /// Append a method, encoding `body` as its `Code` when present
    pub fn add_method(
        &mut self,
        access_flags: u16,
        name: &str,
        descriptor: &str,
        body: Option<&MethodBody>,
    ) -> std::result::Result<usize, VerifyError> {
        let name = self.constant_pool.add_utf8(name)?;
        let descriptor = self.constant_pool.add_utf8(descriptor)?;
        self.methods.push(Member {
            access_flags,
            name,
            descriptor,
            attributes: Vec::new(),
        });
        let index = self.methods.len() - 1;
        if let Some(body) = body {
            if let Err(err) = self.set_method_code(index, &Code::new(body.clone())) {
                self.methods.pop();
                return Err(err);
            }
        }
        Ok(index)
    }
}

fn parse_attributes(reader: &mut ByteReader<'_>) -> Result<Vec<Attribute>> {
    let count = reader.u16()?;
    let mut attributes = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let name = reader.u16()?;
        let len = reader.u32()? as usize;
        let data = reader.bytes(len)?.to_vec();
        attributes.push(Attribute { name, data });
    }
    Ok(attributes)
}

fn parse_members(reader: &mut ByteReader<'_>) -> Result<Vec<Member>> {
    let count = reader.u16()?;
    let mut members = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        members.push(Member {
            access_flags: reader.u16()?,
            name: reader.u16()?,
            descriptor: reader.u16()?,
            attributes: parse_attributes(reader)?,
        });
    }
    Ok(members)
}

fn write_attributes(out: &mut ByteWriter, attributes: &[Attribute]) {
    out.u16(attributes.len() as u16);
    for attribute in attributes {
        out.u16(attribute.name);
        out.u32(attribute.data.len() as u32);
        out.bytes(&attribute.data);
    }
}

fn write_members(out: &mut ByteWriter, members: &[Member]) {
    out.u16(members.len() as u16);
    for member in members {
        out.u16(member.access_flags);
        out.u16(member.name);
        out.u16(member.descriptor);
        write_attributes(out, &member.attributes);
    }
}
