//! Instruction model for a single method body
//!
//! The rewriter only needs to tell apart five kinds of instruction: invokes,
//! local loads, local stores, type checks and everything else. Invokes and
//! type checks carry symbolic references so they can be matched by name;
//! everything else is opaque and passed through untouched.

use serde::Serialize;
use std::fmt;

use crate::classfile::opcodes;

/// Index of a local-variable slot in a method frame
pub type Slot = u16;

/// Owner, member name and descriptor of a method call target
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct MemberRef {
    /// Internal name of the owning type (e.g. `java/lang/Object`)
    pub owner: String,
    pub name: String,
    pub descriptor: String,
}

impl MemberRef {
    pub fn new(
        owner: impl Into<String>,
        name: impl Into<String>,
        descriptor: impl Into<String>,
    ) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            descriptor: descriptor.into(),
        }
    }
}

impl fmt::Display for MemberRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.owner, self.name, self.descriptor)
    }
}

/// Dispatch flavour of an invoke instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum InvokeKind {
    Virtual,
    Special,
    Static,
    Interface,
}

impl InvokeKind {
    pub fn opcode(self) -> u8 {
        match self {
            InvokeKind::Virtual => opcodes::INVOKEVIRTUAL,
            InvokeKind::Special => opcodes::INVOKESPECIAL,
            InvokeKind::Static => opcodes::INVOKESTATIC,
            InvokeKind::Interface => opcodes::INVOKEINTERFACE,
        }
    }

    pub fn from_opcode(opcode: u8) -> Option<Self> {
        match opcode {
            opcodes::INVOKEVIRTUAL => Some(InvokeKind::Virtual),
            opcodes::INVOKESPECIAL => Some(InvokeKind::Special),
            opcodes::INVOKESTATIC => Some(InvokeKind::Static),
            opcodes::INVOKEINTERFACE => Some(InvokeKind::Interface),
            _ => None,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        opcodes::mnemonic(self.opcode())
    }
}

/// Value category moved by a local load or store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ValueKind {
    Int,
    Long,
    Float,
    Double,
    Reference,
}

impl ValueKind {
    /// Number of local slots (and stack slots) one value occupies
    pub fn width(self) -> u16 {
        match self {
            ValueKind::Long | ValueKind::Double => 2,
            _ => 1,
        }
    }

    /// Position in the `i, l, f, d, a` opcode families
    pub(crate) fn family_index(self) -> u8 {
        match self {
            ValueKind::Int => 0,
            ValueKind::Long => 1,
            ValueKind::Float => 2,
            ValueKind::Double => 3,
            ValueKind::Reference => 4,
        }
    }

    pub(crate) fn from_family_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(ValueKind::Int),
            1 => Some(ValueKind::Long),
            2 => Some(ValueKind::Float),
            3 => Some(ValueKind::Double),
            4 => Some(ValueKind::Reference),
            _ => None,
        }
    }

    fn prefix(self) -> char {
        match self {
            ValueKind::Int => 'i',
            ValueKind::Long => 'l',
            ValueKind::Float => 'f',
            ValueKind::Double => 'd',
            ValueKind::Reference => 'a',
        }
    }
}

/// Which type-check instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TypeCheckOp {
    CheckCast,
    InstanceOf,
}

/// Branch target marker inside an instruction stream
///
/// Labels are pseudo-instructions: they occupy no bytes and name the
/// position of the instruction that follows them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Label(pub u32);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// An instruction the rewriter does not inspect
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Opaque {
    /// Position marker (zero bytes)
    Label(Label),
    /// Position-independent instruction, stored as its exact encoding
    Raw(Vec<u8>),
    /// Conditional or unconditional jump (`if*`, `goto`, `jsr` and wide forms)
    Jump { opcode: u8, target: Label },
    TableSwitch {
        default: Label,
        low: i32,
        high: i32,
        targets: Vec<Label>,
    },
    LookupSwitch {
        default: Label,
        pairs: Vec<(i32, Label)>,
    },
}

/// One element of a method's instruction stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Instruction {
    Invoke {
        kind: InvokeKind,
        target: MemberRef,
        /// Owner is an interface (resolved through `InterfaceMethodref`)
        interface: bool,
    },
    LoadLocal { kind: ValueKind, slot: Slot },
    StoreLocal { kind: ValueKind, slot: Slot },
    TypeCheck { op: TypeCheckOp, class: String },
    Opaque(Opaque),
}

impl Instruction {
    pub fn invoke_static(target: MemberRef) -> Self {
        Instruction::Invoke {
            kind: InvokeKind::Static,
            target,
            interface: false,
        }
    }

    pub fn aload(slot: Slot) -> Self {
        Instruction::LoadLocal {
            kind: ValueKind::Reference,
            slot,
        }
    }

    pub fn astore(slot: Slot) -> Self {
        Instruction::StoreLocal {
            kind: ValueKind::Reference,
            slot,
        }
    }

    pub fn checkcast(class: impl Into<String>) -> Self {
        Instruction::TypeCheck {
            op: TypeCheckOp::CheckCast,
            class: class.into(),
        }
    }

    pub fn label(label: Label) -> Self {
        Instruction::Opaque(Opaque::Label(label))
    }

    /// Single-byte instruction with no operands (`nop`, `areturn`, ...)
    pub fn simple(opcode: u8) -> Self {
        Instruction::Opaque(Opaque::Raw(vec![opcode]))
    }

    pub fn is_label(&self) -> bool {
        matches!(self, Instruction::Opaque(Opaque::Label(_)))
    }

    /// Local slot touched by this instruction and how many slots it spans
    pub fn local_access(&self) -> Option<(Slot, u16)> {
        match self {
            Instruction::LoadLocal { kind, slot } | Instruction::StoreLocal { kind, slot } => {
                Some((*slot, kind.width()))
            }
            Instruction::Opaque(Opaque::Raw(bytes)) => raw_local_access(bytes),
            _ => None,
        }
    }
}

/// Locals used by raw `iinc`, `ret` and their `wide` forms
fn raw_local_access(bytes: &[u8]) -> Option<(Slot, u16)> {
    match bytes {
        [opcodes::IINC | opcodes::RET, slot, ..] => Some((u16::from(*slot), 1)),
        [opcodes::WIDE, opcodes::IINC | opcodes::RET, hi, lo, ..] => {
            Some((u16::from_be_bytes([*hi, *lo]), 1))
        }
        _ => None,
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Invoke {
                kind,
                target,
                interface,
            } => {
                write!(f, "{} {}", kind.mnemonic(), target)?;
                if *interface && *kind != InvokeKind::Interface {
                    write!(f, " (itf)")?;
                }
                Ok(())
            }
            Instruction::LoadLocal { kind, slot } => write!(f, "{}load {}", kind.prefix(), slot),
            Instruction::StoreLocal { kind, slot } => write!(f, "{}store {}", kind.prefix(), slot),
            Instruction::TypeCheck { op, class } => match op {
                TypeCheckOp::CheckCast => write!(f, "checkcast {}", class),
                TypeCheckOp::InstanceOf => write!(f, "instanceof {}", class),
            },
            Instruction::Opaque(op) => match op {
                Opaque::Label(label) => write!(f, "{}:", label),
                Opaque::Raw(bytes) => match bytes.split_first() {
                    Some((opcode, [])) => write!(f, "{}", opcodes::mnemonic(*opcode)),
                    Some((opcode, operands)) => {
                        write!(f, "{} #{}", opcodes::mnemonic(*opcode), hex::encode(operands))
                    }
                    None => write!(f, "<empty>"),
                },
                Opaque::Jump { opcode, target } => {
                    write!(f, "{} {}", opcodes::mnemonic(*opcode), target)
                }
                Opaque::TableSwitch {
                    default,
                    low,
                    high,
                    ..
                } => write!(f, "tableswitch {}..={} default {}", low, high, default),
                Opaque::LookupSwitch { default, pairs } => {
                    write!(f, "lookupswitch [{} keys] default {}", pairs.len(), default)
                }
            },
        }
    }
}

/// Ordered instruction sequence of one method plus its declared frame sizes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MethodBody {
    pub instructions: Vec<Instruction>,
    pub max_locals: u16,
    pub max_stack: u16,
}

impl MethodBody {
    pub fn new(instructions: Vec<Instruction>, max_locals: u16, max_stack: u16) -> Self {
        Self {
            instructions,
            max_locals,
            max_stack,
        }
    }

    /// Instructions excluding label markers
    pub fn code(&self) -> impl Iterator<Item = &Instruction> {
        self.instructions.iter().filter(|insn| !insn.is_label())
    }
}

/// Argument and return sizes of a method descriptor, in stack slots
///
/// Returns `None` for a malformed descriptor.
pub fn descriptor_slots(descriptor: &str) -> Option<(u16, u16)> {
    let inner = descriptor.strip_prefix('(')?;
    let (params, ret) = inner.split_once(')')?;

    let mut args = 0u16;
    let mut chars = params.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            'J' | 'D' => args += 2,
            'B' | 'C' | 'F' | 'I' | 'S' | 'Z' => args += 1,
            'L' => {
                chars.by_ref().find(|&c| c == ';')?;
                args += 1;
            }
            '[' => {
                while chars.peek() == Some(&'[') {
                    chars.next();
                }
                match chars.next()? {
                    'L' => {
                        chars.by_ref().find(|&c| c == ';')?;
                    }
                    'B' | 'C' | 'D' | 'F' | 'I' | 'J' | 'S' | 'Z' => {}
                    _ => return None,
                }
                args += 1;
            }
            _ => return None,
        }
    }

    Some((args, field_slots(ret)?))
}

/// Stack slots taken by a field or return type descriptor (`V` is zero)
pub fn field_slots(descriptor: &str) -> Option<u16> {
    match descriptor.chars().next()? {
        'V' => Some(0),
        'J' | 'D' => Some(2),
        'B' | 'C' | 'F' | 'I' | 'S' | 'Z' | 'L' | '[' => Some(1),
        _ => None,
    }
}
