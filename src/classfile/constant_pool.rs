//! Constant pool: parsing, lookup, and append-only extension

use super::reader::{ByteReader, ByteWriter};
use super::{ClassFormatError, Result};
use crate::bytecode::MemberRef;

const TAG_UTF8: u8 = 1;
const TAG_INTEGER: u8 = 3;
const TAG_FLOAT: u8 = 4;
const TAG_LONG: u8 = 5;
const TAG_DOUBLE: u8 = 6;
const TAG_CLASS: u8 = 7;
const TAG_STRING: u8 = 8;
const TAG_FIELDREF: u8 = 9;
const TAG_METHODREF: u8 = 10;
const TAG_INTERFACE_METHODREF: u8 = 11;
const TAG_NAME_AND_TYPE: u8 = 12;
const TAG_METHOD_HANDLE: u8 = 15;
const TAG_METHOD_TYPE: u8 = 16;
const TAG_DYNAMIC: u8 = 17;
const TAG_INVOKE_DYNAMIC: u8 = 18;
const TAG_MODULE: u8 = 19;
const TAG_PACKAGE: u8 = 20;

/// A single constant pool entry
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Utf8(String),
    Integer(i32),
    Float(u32),
    Long(i64),
    Double(u64),
    Class { name: u16 },
    String { value: u16 },
    FieldRef { class: u16, name_and_type: u16 },
    MethodRef { class: u16, name_and_type: u16 },
    InterfaceMethodRef { class: u16, name_and_type: u16 },
    NameAndType { name: u16, descriptor: u16 },
    MethodHandle { kind: u8, reference: u16 },
    MethodType { descriptor: u16 },
    Dynamic { bootstrap: u16, name_and_type: u16 },
    InvokeDynamic { bootstrap: u16, name_and_type: u16 },
    Module { name: u16 },
    Package { name: u16 },
    /// Second slot of a Long/Double, or index 0
    Unusable,
}

impl Constant {
    fn is_wide(&self) -> bool {
        matches!(self, Constant::Long(_) | Constant::Double(_))
    }
}

/// Indexed constant pool; index 0 is never valid
#[derive(Debug, Clone, PartialEq)]
pub struct ConstantPool {
    entries: Vec<Constant>,
}

impl Default for ConstantPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConstantPool {
    pub fn new() -> Self {
        Self {
            entries: vec![Constant::Unusable],
        }
    }

    /// Value written as `constant_pool_count`
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn parse(reader: &mut ByteReader<'_>) -> Result<Self> {
        let count = reader.u16()?;
        if count == 0 {
            return Err(ClassFormatError::InvalidConstantPool(
                "constant_pool_count is zero".to_string(),
            ));
        }
        let mut entries = Vec::with_capacity(usize::from(count));
        entries.push(Constant::Unusable);

        while entries.len() < usize::from(count) {
            let offset = reader.position();
            let tag = reader.u8()?;
            let constant = match tag {
                TAG_UTF8 => {
                    let len = reader.u16()?;
                    let bytes = reader.bytes(usize::from(len))?;
                    Constant::Utf8(decode_modified_utf8(bytes).ok_or(
                        ClassFormatError::InvalidUtf8 {
                            index: entries.len() as u16,
                        },
                    )?)
                }
                TAG_INTEGER => Constant::Integer(reader.u32()? as i32),
                TAG_FLOAT => Constant::Float(reader.u32()?),
                TAG_LONG => Constant::Long(reader.u64()? as i64),
                TAG_DOUBLE => Constant::Double(reader.u64()?),
                TAG_CLASS => Constant::Class { name: reader.u16()? },
                TAG_STRING => Constant::String {
                    value: reader.u16()?,
                },
                TAG_FIELDREF => Constant::FieldRef {
                    class: reader.u16()?,
                    name_and_type: reader.u16()?,
                },
                TAG_METHODREF => Constant::MethodRef {
                    class: reader.u16()?,
                    name_and_type: reader.u16()?,
                },
                TAG_INTERFACE_METHODREF => Constant::InterfaceMethodRef {
                    class: reader.u16()?,
                    name_and_type: reader.u16()?,
                },
                TAG_NAME_AND_TYPE => Constant::NameAndType {
                    name: reader.u16()?,
                    descriptor: reader.u16()?,
                },
                TAG_METHOD_HANDLE => Constant::MethodHandle {
                    kind: reader.u8()?,
                    reference: reader.u16()?,
                },
                TAG_METHOD_TYPE => Constant::MethodType {
                    descriptor: reader.u16()?,
                },
                TAG_DYNAMIC => Constant::Dynamic {
                    bootstrap: reader.u16()?,
                    name_and_type: reader.u16()?,
                },
                TAG_INVOKE_DYNAMIC => Constant::InvokeDynamic {
                    bootstrap: reader.u16()?,
                    name_and_type: reader.u16()?,
                },
                TAG_MODULE => Constant::Module { name: reader.u16()? },
                TAG_PACKAGE => Constant::Package { name: reader.u16()? },
                other => {
                    return Err(ClassFormatError::UnknownConstantTag { tag: other, offset });
                }
            };
            let wide = constant.is_wide();
            entries.push(constant);
            if wide {
                if entries.len() >= usize::from(count) {
                    return Err(ClassFormatError::InvalidConstantPool(
                        "Long/Double constant in the last slot".to_string(),
                    ));
                }
                entries.push(Constant::Unusable);
            }
        }

        Ok(Self { entries })
    }

    pub(crate) fn write(&self, out: &mut ByteWriter) {
        out.u16(self.entries.len() as u16);
        for constant in &self.entries[1..] {
            match constant {
                Constant::Utf8(s) => {
                    let bytes = encode_modified_utf8(s);
                    out.u8(TAG_UTF8);
                    out.u16(bytes.len() as u16);
                    out.bytes(&bytes);
                }
                Constant::Integer(v) => {
                    out.u8(TAG_INTEGER);
                    out.u32(*v as u32);
                }
                Constant::Float(bits) => {
                    out.u8(TAG_FLOAT);
                    out.u32(*bits);
                }
                Constant::Long(v) => {
                    out.u8(TAG_LONG);
                    out.u64(*v as u64);
                }
                Constant::Double(bits) => {
                    out.u8(TAG_DOUBLE);
                    out.u64(*bits);
                }
                Constant::Class { name } => {
                    out.u8(TAG_CLASS);
                    out.u16(*name);
                }
                Constant::String { value } => {
                    out.u8(TAG_STRING);
                    out.u16(*value);
                }
                Constant::FieldRef {
                    class,
                    name_and_type,
                } => write_pair(out, TAG_FIELDREF, *class, *name_and_type),
                Constant::MethodRef {
                    class,
                    name_and_type,
                } => write_pair(out, TAG_METHODREF, *class, *name_and_type),
                Constant::InterfaceMethodRef {
                    class,
                    name_and_type,
                } => write_pair(out, TAG_INTERFACE_METHODREF, *class, *name_and_type),
                Constant::NameAndType { name, descriptor } => {
                    write_pair(out, TAG_NAME_AND_TYPE, *name, *descriptor)
                }
                Constant::MethodHandle { kind, reference } => {
                    out.u8(TAG_METHOD_HANDLE);
                    out.u8(*kind);
                    out.u16(*reference);
                }
                Constant::MethodType { descriptor } => {
                    out.u8(TAG_METHOD_TYPE);
                    out.u16(*descriptor);
                }
                Constant::Dynamic {
                    bootstrap,
                    name_and_type,
                } => write_pair(out, TAG_DYNAMIC, *bootstrap, *name_and_type),
                Constant::InvokeDynamic {
                    bootstrap,
                    name_and_type,
                } => write_pair(out, TAG_INVOKE_DYNAMIC, *bootstrap, *name_and_type),
                Constant::Module { name } => {
                    out.u8(TAG_MODULE);
                    out.u16(*name);
                }
                Constant::Package { name } => {
                    out.u8(TAG_PACKAGE);
                    out.u16(*name);
                }
                Constant::Unusable => {}
            }
        }
    }

    pub fn get(&self, index: u16) -> Result<&Constant> {
        match self.entries.get(usize::from(index)) {
            Some(Constant::Unusable) | None => Err(ClassFormatError::BadConstantIndex { index }),
            Some(constant) => Ok(constant),
        }
    }

    pub fn utf8(&self, index: u16) -> Result<&str> {
        match self.get(index)? {
            Constant::Utf8(s) => Ok(s),
            _ => Err(self.wrong_kind(index, "Utf8")),
        }
    }

    /// Internal name of a `Class` constant
    pub fn class_name(&self, index: u16) -> Result<&str> {
        match self.get(index)? {
            Constant::Class { name } => self.utf8(*name),
            _ => Err(self.wrong_kind(index, "Class")),
        }
    }

    /// `(name, descriptor)` of a `NameAndType` constant
    pub fn name_and_type(&self, index: u16) -> Result<(&str, &str)> {
        match self.get(index)? {
            Constant::NameAndType { name, descriptor } => {
                Ok((self.utf8(*name)?, self.utf8(*descriptor)?))
            }
            _ => Err(self.wrong_kind(index, "NameAndType")),
        }
    }

    /// Resolve a method reference; the flag is true for `InterfaceMethodref`
    pub fn member_ref(&self, index: u16) -> Result<(MemberRef, bool)> {
        let (class, name_and_type, interface) = match self.get(index)? {
            Constant::MethodRef {
                class,
                name_and_type,
            } => (*class, *name_and_type, false),
            Constant::InterfaceMethodRef {
                class,
                name_and_type,
            } => (*class, *name_and_type, true),
            _ => return Err(self.wrong_kind(index, "Methodref")),
        };
        let owner = self.class_name(class)?;
        let (name, descriptor) = self.name_and_type(name_and_type)?;
        Ok((MemberRef::new(owner, name, descriptor), interface))
    }

    /// Descriptor of the `NameAndType` behind a field, method or dynamic constant
    pub fn ref_descriptor(&self, index: u16) -> Result<&str> {
        let name_and_type = match self.get(index)? {
            Constant::FieldRef { name_and_type, .. }
            | Constant::MethodRef { name_and_type, .. }
            | Constant::InterfaceMethodRef { name_and_type, .. }
            | Constant::Dynamic { name_and_type, .. }
            | Constant::InvokeDynamic { name_and_type, .. } => *name_and_type,
            _ => return Err(self.wrong_kind(index, "member reference")),
        };
        Ok(self.name_and_type(name_and_type)?.1)
    }

    fn wrong_kind(&self, index: u16, expected: &'static str) -> ClassFormatError {
        ClassFormatError::WrongConstantKind { index, expected }
    }

    fn find(&self, wanted: &Constant) -> Option<u16> {
        self.entries
            .iter()
            .position(|c| c == wanted)
            .map(|i| i as u16)
    }

    fn push(&mut self, constant: Constant) -> Result<u16> {
        if let Some(index) = self.find(&constant) {
            return Ok(index);
        }
        let index = self.entries.len();
        if index >= usize::from(u16::MAX) {
            return Err(ClassFormatError::ConstantPoolFull);
        }
        self.entries.push(constant);
        Ok(index as u16)
    }

    /// Find or append a `Utf8` constant
    pub fn add_utf8(&mut self, value: &str) -> Result<u16> {
        if let Some(index) = self
            .entries
            .iter()
            .position(|c| matches!(c, Constant::Utf8(s) if s == value))
        {
            return Ok(index as u16);
        }
        self.push(Constant::Utf8(value.to_string()))
    }

    /// Find or append a `Class` constant for an internal name
    pub fn add_class(&mut self, name: &str) -> Result<u16> {
        let name = self.add_utf8(name)?;
        self.push(Constant::Class { name })
    }

    pub fn add_name_and_type(&mut self, name: &str, descriptor: &str) -> Result<u16> {
        let name = self.add_utf8(name)?;
        let descriptor = self.add_utf8(descriptor)?;
        self.push(Constant::NameAndType { name, descriptor })
    }

    /// Find or append a `Methodref` / `InterfaceMethodref` constant
    pub fn add_member_ref(&mut self, target: &MemberRef, interface: bool) -> Result<u16> {
        let class = self.add_class(&target.owner)?;
        let name_and_type = self.add_name_and_type(&target.name, &target.descriptor)?;
        if interface {
            self.push(Constant::InterfaceMethodRef {
                class,
                name_and_type,
            })
        } else {
            self.push(Constant::MethodRef {
                class,
                name_and_type,
            })
        }
    }

    pub fn add_string(&mut self, value: &str) -> Result<u16> {
        let value = self.add_utf8(value)?;
        self.push(Constant::String { value })
    }
}

fn write_pair(out: &mut ByteWriter, tag: u8, a: u16, b: u16) {
    out.u8(tag);
    out.u16(a);
    out.u16(b);
}

/// Decode the JVM's modified UTF-8 (`None` on malformed input or lone surrogates)
pub fn decode_modified_utf8(bytes: &[u8]) -> Option<String> {
    let mut units: Vec<u16> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match b {
            0x01..=0x7f => {
                units.push(u16::from(b));
                i += 1;
            }
            0xc0..=0xdf => {
                let b2 = *bytes.get(i + 1)?;
                if b2 & 0xc0 != 0x80 {
                    return None;
                }
                units.push((u16::from(b & 0x1f) << 6) | u16::from(b2 & 0x3f));
                i += 2;
            }
            0xe0..=0xef => {
                let b2 = *bytes.get(i + 1)?;
                let b3 = *bytes.get(i + 2)?;
                if b2 & 0xc0 != 0x80 || b3 & 0xc0 != 0x80 {
                    return None;
                }
                units.push(
                    (u16::from(b & 0x0f) << 12)
                        | (u16::from(b2 & 0x3f) << 6)
                        | u16::from(b3 & 0x3f),
                );
                i += 3;
            }
            _ => return None,
        }
    }
    String::from_utf16(&units).ok()
}

/// Encode a string in the JVM's modified UTF-8
pub fn encode_modified_utf8(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len());
    for unit in value.encode_utf16() {
        match unit {
            0x0001..=0x007f => out.push(unit as u8),
            0x0000 | 0x0080..=0x07ff => {
                out.push(0xc0 | ((unit >> 6) & 0x1f) as u8);
                out.push(0x80 | (unit & 0x3f) as u8);
            }
            _ => {
                out.push(0xe0 | ((unit >> 12) & 0x0f) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3f) as u8);
                out.push(0x80 | (unit & 0x3f) as u8);
            }
        }
    }
    out
}
