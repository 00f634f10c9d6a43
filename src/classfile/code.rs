//! `Code` attribute: bytecode <-> label-anchored instruction stream
//!
//! Decoding places a [`Label`] in front of every instruction that something
//! refers to by offset (branches, switches, exception ranges, debug tables,
//! stack map frames). Encoding lays the stream out again from scratch, so
//! every offset-bearing table is re-derived from label positions instead of
//! being patched in place.
//!
//! StackMapTable frames are re-anchored, not re-inferred: each frame keeps
//! the verification types it was decoded with and only its offset follows
//! its label. That holds as long as inserted code leaves the locals and the
//! operand stack unchanged at every existing frame, which is true of a
//! `load` followed by a static call consuming it.
//!
//! Short branches that no longer reach their target are widened: `goto`
//! and `jsr` become `goto_w` and `jsr_w`, and a conditional jump becomes
//! the negated condition skipping over a `goto_w`. With a StackMapTable
//! present, a conditional is only widened when a frame already sits at its
//! fall-through.

use std::collections::{BTreeSet, HashMap, HashSet};

use super::constant_pool::ConstantPool;
use super::opcodes::{self, Length};
use super::reader::{ByteReader, ByteWriter};
use super::{stack, Attribute, ClassFormatError, Result, VerifyError};
use crate::bytecode::{
    descriptor_slots, Instruction, InvokeKind, Label, MethodBody, Opaque, TypeCheckOp, ValueKind,
};

const MAX_CODE_LENGTH: usize = 65535;

/// Code attributes that carry bytecode offsets this codec does not track
const DROPPED_ATTRIBUTES: [&str; 2] = [
    "RuntimeVisibleTypeAnnotations",
    "RuntimeInvisibleTypeAnnotations",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionHandler {
    pub start: Label,
    pub end: Label,
    pub handler: Label,
    /// Constant pool index of the caught class, 0 for `finally`
    pub catch_type: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineNumber {
    pub start: Label,
    pub line: u16,
}

/// Entry of a LocalVariableTable or LocalVariableTypeTable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVariable {
    pub start: Label,
    pub end: Label,
    pub name: u16,
    pub descriptor: u16,
    pub index: u16,
}

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
    /// Result of the `new` instruction at this label
    Uninitialized(Label),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    Same,
    SameLocals1StackItem(VerificationType),
    Chop(u8),
    Append(Vec<VerificationType>),
    Full {
        locals: Vec<VerificationType>,
        stack: Vec<VerificationType>,
    },
}

/// Stack map frame anchored at a label
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub label: Label,
    pub kind: FrameKind,
}

/// Attribute nested inside `Code`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeAttribute {
    LineNumbers {
        name: u16,
        entries: Vec<LineNumber>,
    },
    /// LocalVariableTable and LocalVariableTypeTable share a layout
    LocalVariables {
        name: u16,
        entries: Vec<LocalVariable>,
    },
    StackMap {
        name: u16,
        frames: Vec<Frame>,
    },
    Other(Attribute),
}

/// Decoded `Code` attribute of one method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Code {
    pub body: MethodBody,
    pub handlers: Vec<ExceptionHandler>,
    pub attributes: Vec<CodeAttribute>,
}

impl Code {
    /// Code with no exception handlers and no nested attributes
    pub fn new(body: MethodBody) -> Self {
        Self {
            body,
            handlers: Vec::new(),
            attributes: Vec::new(),
        }
    }

    /// Decode the payload of a `Code` attribute
    pub fn decode(data: &[u8], pool: &ConstantPool) -> Result<Self> {
        let mut reader = ByteReader::new(data);
        let max_stack = reader.u16()?;
        let max_locals = reader.u16()?;
        let code_length = reader.u32()? as usize;
        if code_length == 0 || code_length > MAX_CODE_LENGTH {
            return Err(ClassFormatError::InvalidCode(format!(
                "code_length {} out of range",
                code_length
            )));
        }
        let bytecode = reader.bytes(code_length)?;

        let mut referenced = BTreeSet::new();
        let decoded = decode_instructions(bytecode, pool, &mut referenced)?;

        let handler_count = reader.u16()?;
        let mut handlers = Vec::with_capacity(usize::from(handler_count));
        for _ in 0..handler_count {
            let start = reader.u16()?;
            let end = reader.u16()?;
            let handler = reader.u16()?;
            let catch_type = reader.u16()?;
            handlers.push(ExceptionHandler {
                start: mark(&mut referenced, u32::from(start)),
                end: mark(&mut referenced, u32::from(end)),
                handler: mark(&mut referenced, u32::from(handler)),
                catch_type,
            });
        }

        let attribute_count = reader.u16()?;
        let mut attributes = Vec::with_capacity(usize::from(attribute_count));
        for _ in 0..attribute_count {
            let name = reader.u16()?;
            let len = reader.u32()? as usize;
            let payload = reader.bytes(len)?;
            let attr_name = pool.utf8(name)?;
            let attribute = match attr_name {
                "LineNumberTable" => CodeAttribute::LineNumbers {
                    name,
                    entries: decode_line_numbers(payload, &mut referenced)?,
                },
                "LocalVariableTable" | "LocalVariableTypeTable" => CodeAttribute::LocalVariables {
                    name,
                    entries: decode_local_variables(payload, &mut referenced)?,
                },
                "StackMapTable" => CodeAttribute::StackMap {
                    name,
                    frames: decode_frames(payload, &mut referenced)?,
                },
                other if DROPPED_ATTRIBUTES.contains(&other) => {
                    tracing::debug!("dropping offset-bearing code attribute {}", other);
                    continue;
                }
                _ => CodeAttribute::Other(Attribute {
                    name,
                    data: payload.to_vec(),
                }),
            };
            attributes.push(attribute);
        }
        if reader.remaining() != 0 {
            return Err(ClassFormatError::AttributeLength {
                name: "Code".to_string(),
            });
        }

        let instructions = place_labels(decoded, &referenced, code_length as u32)?;

        Ok(Self {
            body: MethodBody::new(instructions, max_locals, max_stack),
            handlers,
            attributes,
        })
    }

    /// Lay the code out again and serialize the `Code` attribute payload
    ///
    /// `max_stack` is always re-derived from the instruction stream; the
    /// value stored in `self.body` is ignored. Constants needed by new
    /// instructions are appended to `pool`.
    pub fn encode(&self, pool: &mut ConstantPool) -> std::result::Result<Vec<u8>, VerifyError> {
        stack::verify_locals(&self.body)?;
        let max_stack = stack::max_stack(self, pool)?;
        let layout = Layout::compute(&self.body.instructions, self.frame_labels().as_ref())?;

        let mut code = ByteWriter::new();
        for (index, (insn, &pc)) in self.body.instructions.iter().zip(&layout.offsets).enumerate() {
            let wide = layout.widened.contains(&index);
            encode_instruction(insn, pc, wide, &layout, pool, &mut code)?;
        }
        debug_assert_eq!(code.len(), layout.length);

        let mut out = ByteWriter::new();
        out.u16(max_stack);
        out.u16(self.body.max_locals);
        out.u32(layout.length as u32);
        out.bytes(&code.into_bytes());

        out.u16(self.handlers.len() as u16);
        for handler in &self.handlers {
            out.u16(layout.offset16(handler.start)?);
            out.u16(layout.offset16(handler.end)?);
            out.u16(layout.offset16(handler.handler)?);
            out.u16(handler.catch_type);
        }

        out.u16(self.attributes.len() as u16);
        for attribute in &self.attributes {
            let (name, payload) = match attribute {
                CodeAttribute::LineNumbers { name, entries } => {
                    (*name, encode_line_numbers(entries, &layout)?)
                }
                CodeAttribute::LocalVariables { name, entries } => {
                    (*name, encode_local_variables(entries, &layout)?)
                }
                CodeAttribute::StackMap { name, frames } => {
                    (*name, encode_frames(frames, &layout)?)
                }
                CodeAttribute::Other(attr) => (attr.name, attr.data.clone()),
            };
            out.u16(name);
            out.u32(payload.len() as u32);
            out.bytes(&payload);
        }

        Ok(out.into_bytes())
    }

    /// Labels carrying a stack map frame; `None` without a StackMapTable
    fn frame_labels(&self) -> Option<HashSet<Label>> {
        let mut labels = None;
        for attribute in &self.attributes {
            if let CodeAttribute::StackMap { frames, .. } = attribute {
                labels
                    .get_or_insert_with(HashSet::new)
                    .extend(frames.iter().map(|frame| frame.label));
            }
        }
        labels
    }
}

fn mark(referenced: &mut BTreeSet<u32>, offset: u32) -> Label {
    referenced.insert(offset);
    Label(offset)
}

fn branch_target(
    referenced: &mut BTreeSet<u32>,
    pc: usize,
    delta: i64,
    code_length: usize,
) -> Result<Label> {
    let target = pc as i64 + delta;
    if target < 0 || target >= code_length as i64 {
        return Err(ClassFormatError::BadBranchTarget {
            offset: pc as u32,
            target,
        });
    }
    Ok(mark(referenced, target as u32))
}

/// Decode every instruction, recording branch targets in `referenced`
fn decode_instructions(
    code: &[u8],
    pool: &ConstantPool,
    referenced: &mut BTreeSet<u32>,
) -> Result<Vec<(u32, Instruction)>> {
    let mut reader = ByteReader::new(code);
    let mut out = Vec::new();

    while reader.remaining() > 0 {
        let pc = reader.position();
        let opcode = reader.u8()?;
        let insn = match opcode {
            opcodes::ILOAD..=opcodes::ALOAD => Instruction::LoadLocal {
                kind: family(opcode - opcodes::ILOAD, pc)?,
                slot: u16::from(reader.u8()?),
            },
            opcodes::ILOAD_0..=opcodes::ALOAD_3 => {
                let n = opcode - opcodes::ILOAD_0;
                Instruction::LoadLocal {
                    kind: family(n / 4, pc)?,
                    slot: u16::from(n % 4),
                }
            }
            opcodes::ISTORE..=opcodes::ASTORE => Instruction::StoreLocal {
                kind: family(opcode - opcodes::ISTORE, pc)?,
                slot: u16::from(reader.u8()?),
            },
            opcodes::ISTORE_0..=opcodes::ASTORE_3 => {
                let n = opcode - opcodes::ISTORE_0;
                Instruction::StoreLocal {
                    kind: family(n / 4, pc)?,
                    slot: u16::from(n % 4),
                }
            }
            opcodes::INVOKEVIRTUAL..=opcodes::INVOKEINTERFACE => {
                let index = reader.u16()?;
                if opcode == opcodes::INVOKEINTERFACE {
                    reader.bytes(2)?;
                }
                let (target, interface) = pool.member_ref(index)?;
                Instruction::Invoke {
                    kind: InvokeKind::from_opcode(opcode).ok_or(ClassFormatError::UnknownOpcode {
                        opcode,
                        offset: pc as u32,
                    })?,
                    target,
                    interface,
                }
            }
            opcodes::CHECKCAST | opcodes::INSTANCEOF => {
                let index = reader.u16()?;
                let op = if opcode == opcodes::CHECKCAST {
                    TypeCheckOp::CheckCast
                } else {
                    TypeCheckOp::InstanceOf
                };
                Instruction::TypeCheck {
                    op,
                    class: pool.class_name(index)?.to_string(),
                }
            }
            op if opcodes::is_short_jump(op) => {
                let delta = i64::from(reader.u16()? as i16);
                Instruction::Opaque(Opaque::Jump {
                    opcode: op,
                    target: branch_target(referenced, pc, delta, code.len())?,
                })
            }
            op if opcodes::is_wide_jump(op) => {
                let delta = i64::from(reader.i32()?);
                Instruction::Opaque(Opaque::Jump {
                    opcode: op,
                    target: branch_target(referenced, pc, delta, code.len())?,
                })
            }
            opcodes::TABLESWITCH => {
                skip_padding(&mut reader)?;
                let default = branch_target(referenced, pc, i64::from(reader.i32()?), code.len())?;
                let low = reader.i32()?;
                let high = reader.i32()?;
                if high < low {
                    return Err(ClassFormatError::InvalidCode(format!(
                        "tableswitch at {} has high {} < low {}",
                        pc, high, low
                    )));
                }
                let count = (i64::from(high) - i64::from(low) + 1) as usize;
                if count > reader.remaining() / 4 {
                    return Err(ClassFormatError::Truncated {
                        offset: reader.position(),
                        wanted: count * 4,
                    });
                }
                let mut targets = Vec::with_capacity(count);
                for _ in 0..count {
                    let delta = i64::from(reader.i32()?);
                    targets.push(branch_target(referenced, pc, delta, code.len())?);
                }
                Instruction::Opaque(Opaque::TableSwitch {
                    default,
                    low,
                    high,
                    targets,
                })
            }
            opcodes::LOOKUPSWITCH => {
                skip_padding(&mut reader)?;
                let default = branch_target(referenced, pc, i64::from(reader.i32()?), code.len())?;
                let npairs = reader.i32()?;
                if npairs < 0 || npairs as usize > reader.remaining() / 8 {
                    return Err(ClassFormatError::InvalidCode(format!(
                        "lookupswitch at {} has {} pairs",
                        pc, npairs
                    )));
                }
                let mut pairs = Vec::with_capacity(npairs as usize);
                for _ in 0..npairs {
                    let key = reader.i32()?;
                    let delta = i64::from(reader.i32()?);
                    pairs.push((key, branch_target(referenced, pc, delta, code.len())?));
                }
                Instruction::Opaque(Opaque::LookupSwitch { default, pairs })
            }
            opcodes::WIDE => {
                let modified = reader.u8()?;
                match modified {
                    opcodes::ILOAD..=opcodes::ALOAD => Instruction::LoadLocal {
                        kind: family(modified - opcodes::ILOAD, pc)?,
                        slot: reader.u16()?,
                    },
                    opcodes::ISTORE..=opcodes::ASTORE => Instruction::StoreLocal {
                        kind: family(modified - opcodes::ISTORE, pc)?,
                        slot: reader.u16()?,
                    },
                    opcodes::IINC => {
                        reader.bytes(4)?;
                        Instruction::Opaque(Opaque::Raw(code[pc..pc + 6].to_vec()))
                    }
                    opcodes::RET => {
                        reader.bytes(2)?;
                        Instruction::Opaque(Opaque::Raw(code[pc..pc + 4].to_vec()))
                    }
                    other => {
                        return Err(ClassFormatError::UnknownOpcode {
                            opcode: other,
                            offset: pc as u32 + 1,
                        });
                    }
                }
            }
            op => match opcodes::length(op) {
                Some(Length::Fixed(len)) => {
                    reader.bytes(len - 1)?;
                    Instruction::Opaque(Opaque::Raw(code[pc..pc + len].to_vec()))
                }
                _ => {
                    return Err(ClassFormatError::UnknownOpcode {
                        opcode: op,
                        offset: pc as u32,
                    });
                }
            },
        };
        out.push((pc as u32, insn));
    }

    Ok(out)
}

fn family(index: u8, pc: usize) -> Result<ValueKind> {
    ValueKind::from_family_index(index).ok_or(ClassFormatError::InvalidCode(format!(
        "bad load/store family at {}",
        pc
    )))
}

/// Switch operands start at the next multiple of four from the code start
fn skip_padding(reader: &mut ByteReader<'_>) -> Result<()> {
    while reader.position() % 4 != 0 {
        reader.u8()?;
    }
    Ok(())
}

/// Interleave label markers with the decoded instructions
fn place_labels(
    decoded: Vec<(u32, Instruction)>,
    referenced: &BTreeSet<u32>,
    code_length: u32,
) -> Result<Vec<Instruction>> {
    let mut instructions = Vec::with_capacity(decoded.len() + referenced.len());
    let mut pending = referenced.iter().copied().peekable();

    for (pc, insn) in decoded {
        while let Some(&offset) = pending.peek() {
            if offset > pc {
                break;
            }
            if offset < pc {
                return Err(ClassFormatError::InvalidCode(format!(
                    "offset {} is not an instruction boundary",
                    offset
                )));
            }
            instructions.push(Instruction::label(Label(offset)));
            pending.next();
        }
        instructions.push(insn);
    }

    for offset in pending {
        if offset != code_length {
            return Err(ClassFormatError::InvalidCode(format!(
                "offset {} is outside the code",
                offset
            )));
        }
        instructions.push(Instruction::label(Label(offset)));
    }

    Ok(instructions)
}

fn decode_line_numbers(data: &[u8], referenced: &mut BTreeSet<u32>) -> Result<Vec<LineNumber>> {
    let mut reader = ByteReader::new(data);
    let count = reader.u16()?;
    let mut entries = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let start = reader.u16()?;
        let line = reader.u16()?;
        entries.push(LineNumber {
            start: mark(referenced, u32::from(start)),
            line,
        });
    }
    Ok(entries)
}

fn decode_local_variables(
    data: &[u8],
    referenced: &mut BTreeSet<u32>,
) -> Result<Vec<LocalVariable>> {
    let mut reader = ByteReader::new(data);
    let count = reader.u16()?;
    let mut entries = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let start = u32::from(reader.u16()?);
        let length = u32::from(reader.u16()?);
        entries.push(LocalVariable {
            start: mark(referenced, start),
            end: mark(referenced, start + length),
            name: reader.u16()?,
            descriptor: reader.u16()?,
            index: reader.u16()?,
        });
    }
    Ok(entries)
}

fn decode_verification_type(
    reader: &mut ByteReader<'_>,
    referenced: &mut BTreeSet<u32>,
) -> Result<VerificationType> {
    let tag = reader.u8()?;
    Ok(match tag {
        0 => VerificationType::Top,
        1 => VerificationType::Integer,
        2 => VerificationType::Float,
        3 => VerificationType::Double,
        4 => VerificationType::Long,
        5 => VerificationType::Null,
        6 => VerificationType::UninitializedThis,
        7 => VerificationType::Object(reader.u16()?),
        8 => VerificationType::Uninitialized(mark(referenced, u32::from(reader.u16()?))),
        other => {
            return Err(ClassFormatError::InvalidCode(format!(
                "unknown verification type tag {}",
                other
            )));
        }
    })
}

fn decode_types(
    reader: &mut ByteReader<'_>,
    count: usize,
    referenced: &mut BTreeSet<u32>,
) -> Result<Vec<VerificationType>> {
    (0..count)
        .map(|_| decode_verification_type(reader, referenced))
        .collect()
}

fn decode_frames(data: &[u8], referenced: &mut BTreeSet<u32>) -> Result<Vec<Frame>> {
    let mut reader = ByteReader::new(data);
    let count = reader.u16()?;
    let mut frames = Vec::with_capacity(usize::from(count));
    let mut offset: Option<u32> = None;

    for _ in 0..count {
        let frame_type = reader.u8()?;
        let (delta, kind) = match frame_type {
            0..=63 => (u32::from(frame_type), FrameKind::Same),
            64..=127 => {
                let item = decode_verification_type(&mut reader, referenced)?;
                (
                    u32::from(frame_type - 64),
                    FrameKind::SameLocals1StackItem(item),
                )
            }
            247 => {
                let delta = u32::from(reader.u16()?);
                let item = decode_verification_type(&mut reader, referenced)?;
                (delta, FrameKind::SameLocals1StackItem(item))
            }
            248..=250 => (u32::from(reader.u16()?), FrameKind::Chop(251 - frame_type)),
            251 => (u32::from(reader.u16()?), FrameKind::Same),
            252..=254 => {
                let delta = u32::from(reader.u16()?);
                let locals = decode_types(&mut reader, usize::from(frame_type - 251), referenced)?;
                (delta, FrameKind::Append(locals))
            }
            255 => {
                let delta = u32::from(reader.u16()?);
                let local_count = usize::from(reader.u16()?);
                let locals = decode_types(&mut reader, local_count, referenced)?;
                let stack_count = usize::from(reader.u16()?);
                let stack = decode_types(&mut reader, stack_count, referenced)?;
                (delta, FrameKind::Full { locals, stack })
            }
            reserved => return Err(ClassFormatError::ReservedFrameType(reserved)),
        };

        let position = match offset {
            None => delta,
            Some(previous) => previous + delta + 1,
        };
        offset = Some(position);
        frames.push(Frame {
            label: mark(referenced, position),
            kind,
        });
    }

    Ok(frames)
}

/// Byte offset of every instruction in a stream, plus label positions
struct Layout {
    offsets: Vec<u32>,
    labels: HashMap<Label, u32>,
    length: usize,
    /// Indices of short jumps encoded in their long form
    widened: BTreeSet<usize>,
}

impl Layout {
    /// Lay out `instructions`, widening short jumps until every one fits
    fn compute(
        instructions: &[Instruction],
        frame_labels: Option<&HashSet<Label>>,
    ) -> std::result::Result<Self, VerifyError> {
        let mut widened = BTreeSet::new();
        loop {
            let layout = Self::place(instructions, widened)?;
            let mut overflowing = Vec::new();
            for (index, insn) in instructions.iter().enumerate() {
                let Instruction::Opaque(Opaque::Jump { opcode, target }) = insn else {
                    continue;
                };
                if !opcodes::is_short_jump(*opcode) || layout.widened.contains(&index) {
                    continue;
                }
                let delta = layout.relative(*target, layout.offsets[index])?;
                if i16::try_from(delta).is_ok() {
                    continue;
                }
                if !can_widen(instructions, index, *opcode, frame_labels) {
                    return Err(VerifyError::BranchOutOfRange { offset: delta });
                }
                tracing::debug!(index, delta, "widening out-of-range branch");
                overflowing.push(index);
            }
            if overflowing.is_empty() {
                return Ok(layout);
            }
            widened = layout.widened;
            widened.extend(overflowing);
        }
    }

    fn place(
        instructions: &[Instruction],
        widened: BTreeSet<usize>,
    ) -> std::result::Result<Self, VerifyError> {
        let mut offsets = Vec::with_capacity(instructions.len());
        let mut labels = HashMap::new();
        let mut pc = 0usize;

        for (index, insn) in instructions.iter().enumerate() {
            offsets.push(pc as u32);
            if let Instruction::Opaque(Opaque::Label(label)) = insn {
                if labels.insert(*label, pc as u32).is_some() {
                    return Err(VerifyError::DuplicateLabel(*label));
                }
            }
            pc += encoded_size(insn, pc, widened.contains(&index))?;
            if pc > MAX_CODE_LENGTH {
                return Err(VerifyError::CodeTooLarge(pc));
            }
        }
        if pc == 0 {
            return Err(VerifyError::EmptyCode);
        }

        Ok(Self {
            offsets,
            labels,
            length: pc,
            widened,
        })
    }

    fn offset(&self, label: Label) -> std::result::Result<u32, VerifyError> {
        self.labels
            .get(&label)
            .copied()
            .ok_or(VerifyError::MissingLabel(label))
    }

    fn offset16(&self, label: Label) -> std::result::Result<u16, VerifyError> {
        // code length is capped at 65535, so every offset fits
        self.offset(label).map(|offset| offset as u16)
    }

    fn relative(&self, label: Label, pc: u32) -> std::result::Result<i64, VerifyError> {
        Ok(i64::from(self.offset(label)?) - i64::from(pc))
    }
}

/// A widened conditional branches to its fall-through, which then needs a frame
fn can_widen(
    instructions: &[Instruction],
    index: usize,
    opcode: u8,
    frame_labels: Option<&HashSet<Label>>,
) -> bool {
    if opcodes::long_form(opcode).is_some() {
        return true;
    }
    let Some(frame_labels) = frame_labels else {
        return true;
    };
    instructions[index + 1..]
        .iter()
        .map_while(|insn| match insn {
            Instruction::Opaque(Opaque::Label(label)) => Some(label),
            _ => None,
        })
        .any(|label| frame_labels.contains(label))
}

fn switch_padding(pc: usize) -> usize {
    (4 - (pc + 1) % 4) % 4
}

fn local_size(slot: u16) -> usize {
    match slot {
        0..=3 => 1,
        4..=255 => 2,
        _ => 4,
    }
}

fn encoded_size(
    insn: &Instruction,
    pc: usize,
    wide: bool,
) -> std::result::Result<usize, VerifyError> {
    Ok(match insn {
        Instruction::Invoke { kind, .. } => {
            if *kind == InvokeKind::Interface {
                5
            } else {
                3
            }
        }
        Instruction::LoadLocal { slot, .. } | Instruction::StoreLocal { slot, .. } => {
            local_size(*slot)
        }
        Instruction::TypeCheck { .. } => 3,
        Instruction::Opaque(op) => match op {
            Opaque::Label(_) => 0,
            Opaque::Raw(bytes) => {
                check_raw(bytes)?;
                bytes.len()
            }
            Opaque::Jump { opcode, .. } => {
                if opcodes::is_wide_jump(*opcode) {
                    5
                } else if opcodes::is_short_jump(*opcode) && wide {
                    // goto_w, or a negated short jump over a goto_w
                    if opcodes::long_form(*opcode).is_some() {
                        5
                    } else {
                        8
                    }
                } else if opcodes::is_short_jump(*opcode) {
                    3
                } else {
                    return Err(VerifyError::InvalidRaw { opcode: *opcode });
                }
            }
            Opaque::TableSwitch { targets, .. } => 1 + switch_padding(pc) + 12 + 4 * targets.len(),
            Opaque::LookupSwitch { pairs, .. } => 1 + switch_padding(pc) + 8 + 8 * pairs.len(),
        },
    })
}

/// Raw bytes must be one complete, position-independent instruction
fn check_raw(bytes: &[u8]) -> std::result::Result<(), VerifyError> {
    let Some(&opcode) = bytes.first() else {
        return Err(VerifyError::InvalidRaw { opcode: 0 });
    };
    let ok = match opcodes::length(opcode) {
        Some(Length::Fixed(len)) => {
            len == bytes.len() && !opcodes::is_short_jump(opcode) && !opcodes::is_wide_jump(opcode)
        }
        Some(Length::Wide) => matches!(
            (bytes.get(1).copied(), bytes.len()),
            (Some(opcodes::IINC), 6) | (Some(opcodes::RET), 4)
        ),
        Some(Length::Switch) | None => false,
    };
    if ok {
        Ok(())
    } else {
        Err(VerifyError::InvalidRaw { opcode })
    }
}

fn encode_local(base: u8, short_base: u8, kind: ValueKind, slot: u16, out: &mut ByteWriter) {
    let family = kind.family_index();
    match slot {
        0..=3 => out.u8(short_base + family * 4 + slot as u8),
        4..=255 => {
            out.u8(base + family);
            out.u8(slot as u8);
        }
        _ => {
            out.u8(opcodes::WIDE);
            out.u8(base + family);
            out.u16(slot);
        }
    }
}

fn encode_instruction(
    insn: &Instruction,
    pc: u32,
    wide: bool,
    layout: &Layout,
    pool: &mut ConstantPool,
    out: &mut ByteWriter,
) -> std::result::Result<(), VerifyError> {
    match insn {
        Instruction::Invoke {
            kind,
            target,
            interface,
        } => {
            let index = pool.add_member_ref(target, *interface)?;
            out.u8(kind.opcode());
            out.u16(index);
            if *kind == InvokeKind::Interface {
                let (args, _) = descriptor_slots(&target.descriptor)
                    .ok_or_else(|| VerifyError::BadDescriptor(target.descriptor.clone()))?;
                out.u8((args + 1) as u8);
                out.u8(0);
            }
        }
        Instruction::LoadLocal { kind, slot } => {
            encode_local(opcodes::ILOAD, opcodes::ILOAD_0, *kind, *slot, out)
        }
        Instruction::StoreLocal { kind, slot } => {
            encode_local(opcodes::ISTORE, opcodes::ISTORE_0, *kind, *slot, out)
        }
        Instruction::TypeCheck { op, class } => {
            let index = pool.add_class(class)?;
            out.u8(match op {
                TypeCheckOp::CheckCast => opcodes::CHECKCAST,
                TypeCheckOp::InstanceOf => opcodes::INSTANCEOF,
            });
            out.u16(index);
        }
        Instruction::Opaque(op) => match op {
            Opaque::Label(_) => {}
            Opaque::Raw(bytes) => out.bytes(bytes),
            Opaque::Jump { opcode, target } => {
                let delta = layout.relative(*target, pc)?;
                if opcodes::is_wide_jump(*opcode) {
                    out.u8(*opcode);
                    out.i32(delta as i32);
                } else if !wide {
                    let short = i16::try_from(delta)
                        .map_err(|_| VerifyError::BranchOutOfRange { offset: delta })?;
                    out.u8(*opcode);
                    out.u16(short as u16);
                } else if let Some(long) = opcodes::long_form(*opcode) {
                    out.u8(long);
                    out.i32(delta as i32);
                } else {
                    let negated = opcodes::negate(*opcode)
                        .ok_or(VerifyError::InvalidRaw { opcode: *opcode })?;
                    // skip the 3-byte negated jump and the 5-byte goto_w
                    out.u8(negated);
                    out.u16(8);
                    out.u8(opcodes::GOTO_W);
                    out.i32((delta - 3) as i32);
                }
            }
            Opaque::TableSwitch {
                default,
                low,
                high,
                targets,
            } => {
                out.u8(opcodes::TABLESWITCH);
                pad(pc, out);
                out.i32(layout.relative(*default, pc)? as i32);
                out.i32(*low);
                out.i32(*high);
                for target in targets {
                    out.i32(layout.relative(*target, pc)? as i32);
                }
            }
            Opaque::LookupSwitch { default, pairs } => {
                out.u8(opcodes::LOOKUPSWITCH);
                pad(pc, out);
                out.i32(layout.relative(*default, pc)? as i32);
                out.i32(pairs.len() as i32);
                for (key, target) in pairs {
                    out.i32(*key);
                    out.i32(layout.relative(*target, pc)? as i32);
                }
            }
        },
    }
    Ok(())
}

fn pad(pc: u32, out: &mut ByteWriter) {
    for _ in 0..switch_padding(pc as usize) {
        out.u8(0);
    }
}

fn encode_line_numbers(
    entries: &[LineNumber],
    layout: &Layout,
) -> std::result::Result<Vec<u8>, VerifyError> {
    let mut out = ByteWriter::new();
    out.u16(entries.len() as u16);
    for entry in entries {
        out.u16(layout.offset16(entry.start)?);
        out.u16(entry.line);
    }
    Ok(out.into_bytes())
}

fn encode_local_variables(
    entries: &[LocalVariable],
    layout: &Layout,
) -> std::result::Result<Vec<u8>, VerifyError> {
    let mut out = ByteWriter::new();
    out.u16(entries.len() as u16);
    for entry in entries {
        let start = layout.offset16(entry.start)?;
        let end = layout.offset16(entry.end)?;
        out.u16(start);
        out.u16(end.saturating_sub(start));
        out.u16(entry.name);
        out.u16(entry.descriptor);
        out.u16(entry.index);
    }
    Ok(out.into_bytes())
}

fn encode_verification_type(
    vtype: &VerificationType,
    layout: &Layout,
    out: &mut ByteWriter,
) -> std::result::Result<(), VerifyError> {
    match vtype {
        VerificationType::Top => out.u8(0),
        VerificationType::Integer => out.u8(1),
        VerificationType::Float => out.u8(2),
        VerificationType::Double => out.u8(3),
        VerificationType::Long => out.u8(4),
        VerificationType::Null => out.u8(5),
        VerificationType::UninitializedThis => out.u8(6),
        VerificationType::Object(index) => {
            out.u8(7);
            out.u16(*index);
        }
        VerificationType::Uninitialized(label) => {
            out.u8(8);
            out.u16(layout.offset16(*label)?);
        }
    }
    Ok(())
}

fn encode_frames(frames: &[Frame], layout: &Layout) -> std::result::Result<Vec<u8>, VerifyError> {
    let mut out = ByteWriter::new();
    out.u16(frames.len() as u16);
    let mut previous: Option<u32> = None;

    for frame in frames {
        let offset = layout.offset(frame.label)?;
        let delta = match previous {
            None => offset,
            Some(prev) => offset
                .checked_sub(prev + 1)
                .ok_or(VerifyError::FrameOrder { offset })?,
        };
        previous = Some(offset);
        let delta16 = u16::try_from(delta).map_err(|_| VerifyError::FrameOrder { offset })?;

        match &frame.kind {
            FrameKind::Same if delta16 <= 63 => out.u8(delta16 as u8),
            FrameKind::Same => {
                out.u8(251);
                out.u16(delta16);
            }
            FrameKind::SameLocals1StackItem(item) => {
                if delta16 <= 63 {
                    out.u8(64 + delta16 as u8);
                } else {
                    out.u8(247);
                    out.u16(delta16);
                }
                encode_verification_type(item, layout, &mut out)?;
            }
            FrameKind::Chop(k) => {
                out.u8(251 - k);
                out.u16(delta16);
            }
            FrameKind::Append(locals) => {
                out.u8(251 + locals.len() as u8);
                out.u16(delta16);
                for local in locals {
                    encode_verification_type(local, layout, &mut out)?;
                }
            }
            FrameKind::Full { locals, stack } => {
                out.u8(255);
                out.u16(delta16);
                out.u16(locals.len() as u16);
                for local in locals {
                    encode_verification_type(local, layout, &mut out)?;
                }
                out.u16(stack.len() as u16);
                for item in stack {
                    encode_verification_type(item, layout, &mut out)?;
                }
            }
        }
    }

    Ok(out.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::MemberRef;

    fn pool_with_refs() -> (ConstantPool, u16, u16) {
        let mut pool = ConstantPool::new();
        let method = pool
            .add_member_ref(&MemberRef::new("a/B", "run", "(Ljava/lang/Object;)V"), false)
            .unwrap();
        let class = pool.add_class("a/T").unwrap();
        (pool, method, class)
    }

    fn code_bytes(max_stack: u16, max_locals: u16, code: &[u8], tail: &[u8]) -> Vec<u8> {
        let mut out = ByteWriter::new();
        out.u16(max_stack);
        out.u16(max_locals);
        out.u32(code.len() as u32);
        out.bytes(code);
        out.bytes(tail);
        out.into_bytes()
    }

    #[test]
    fn test_decode_typed_instructions() {
        let (pool, method, class) = pool_with_refs();
        let [mh, ml] = method.to_be_bytes();
        let [ch, cl] = class.to_be_bytes();
        let bytecode = [
            opcodes::ALOAD_0,
            opcodes::CHECKCAST,
            ch,
            cl,
            opcodes::ASTORE,
            5,
            opcodes::ALOAD,
            5,
            opcodes::INVOKESTATIC,
            mh,
            ml,
            opcodes::RETURN,
        ];
        let data = code_bytes(1, 6, &bytecode, &[0, 0, 0, 0]);
        let code = Code::decode(&data, &pool).unwrap();

        assert_eq!(
            code.body.instructions,
            vec![
                Instruction::aload(0),
                Instruction::checkcast("a/T"),
                Instruction::astore(5),
                Instruction::aload(5),
                Instruction::invoke_static(MemberRef::new("a/B", "run", "(Ljava/lang/Object;)V")),
                Instruction::simple(opcodes::RETURN),
            ]
        );
        assert_eq!(code.body.max_locals, 6);
        assert_eq!(code.body.max_stack, 1);
    }

    #[test]
    fn test_decode_places_branch_labels() {
        let pool = ConstantPool::new();
        // 0: iload_0  1: ifeq +4 (-> 5)  4: nop  5: return
        let bytecode = [
            opcodes::ILOAD_0,
            opcodes::IFEQ,
            0,
            4,
            opcodes::NOP,
            opcodes::RETURN,
        ];
        let data = code_bytes(1, 1, &bytecode, &[0, 0, 0, 0]);
        let code = Code::decode(&data, &pool).unwrap();

        assert_eq!(
            code.body.instructions,
            vec![
                Instruction::LoadLocal {
                    kind: ValueKind::Int,
                    slot: 0
                },
                Instruction::Opaque(Opaque::Jump {
                    opcode: opcodes::IFEQ,
                    target: Label(5)
                }),
                Instruction::simple(opcodes::NOP),
                Instruction::label(Label(5)),
                Instruction::simple(opcodes::RETURN),
            ]
        );
    }

    #[test]
    fn test_branch_into_middle_of_instruction_rejected() {
        let pool = ConstantPool::new();
        // goto +2 lands inside the sipush operand
        let bytecode = [opcodes::GOTO, 0, 4, opcodes::SIPUSH, 0, 1, opcodes::RETURN];
        let data = code_bytes(1, 0, &bytecode, &[0, 0, 0, 0]);
        assert!(matches!(
            Code::decode(&data, &pool),
            Err(ClassFormatError::InvalidCode(_))
        ));
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        let pool = ConstantPool::new();
        let data = code_bytes(0, 0, &[0xfe], &[0, 0, 0, 0]);
        assert!(matches!(
            Code::decode(&data, &pool),
            Err(ClassFormatError::UnknownOpcode { opcode: 0xfe, offset: 0 })
        ));
    }

    #[test]
    fn test_roundtrip_preserves_bytes() {
        let (mut pool, method, _) = pool_with_refs();
        let [mh, ml] = method.to_be_bytes();
        // 0: aload_0 1: ifnull +7 (->8) 4: aload_0 5: invokestatic 8: return
        let bytecode = [
            opcodes::ALOAD_0,
            opcodes::IFNULL,
            0,
            7,
            opcodes::ALOAD_0,
            opcodes::INVOKESTATIC,
            mh,
            ml,
            opcodes::RETURN,
        ];
        let data = code_bytes(1, 1, &bytecode, &[0, 0, 0, 0]);
        let code = Code::decode(&data, &pool).unwrap();
        let encoded = code.encode(&mut pool).unwrap();
        assert_eq!(encoded, data);
    }

    #[test]
    fn test_insertion_shifts_branches_and_tables() {
        let (mut pool, _, _) = pool_with_refs();
        let probe = MemberRef::new("a/Agent", "before", "(Ljava/lang/Object;)V");
        let mut code = Code::new(MethodBody::new(
            vec![
                Instruction::label(Label(0)),
                Instruction::aload(0),
                Instruction::Opaque(Opaque::Jump {
                    opcode: opcodes::IFNULL,
                    target: Label(9),
                }),
                Instruction::label(Label(4)),
                Instruction::simple(opcodes::NOP),
                Instruction::label(Label(9)),
                Instruction::simple(opcodes::RETURN),
            ],
            1,
            0,
        ));
        code.handlers.push(ExceptionHandler {
            start: Label(0),
            end: Label(9),
            handler: Label(9),
            catch_type: 0,
        });
        let line_name = pool.add_utf8("LineNumberTable").unwrap();
        code.attributes.push(CodeAttribute::LineNumbers {
            name: line_name,
            entries: vec![LineNumber {
                start: Label(4),
                line: 10,
            }],
        });

        // insert aload_0 + invokestatic before the nop
        code.body
            .instructions
            .insert(4, Instruction::invoke_static(probe));
        code.body.instructions.insert(4, Instruction::aload(0));

        let encoded = code.encode(&mut pool).unwrap();
        let decoded = Code::decode(&encoded, &pool).unwrap();

        let jump = decoded
            .body
            .instructions
            .iter()
            .find_map(|insn| match insn {
                Instruction::Opaque(Opaque::Jump { target, .. }) => Some(*target),
                _ => None,
            })
            .unwrap();
        // layout: 0 aload_0, 1 ifnull, 4 aload_0, 5 invokestatic, 8 nop, 9 return
        assert_eq!(jump, Label(9));
        assert_eq!(decoded.handlers[0].start, Label(0));
        assert_eq!(decoded.handlers[0].end, Label(9));
        match &decoded.attributes[0] {
            CodeAttribute::LineNumbers { entries, .. } => assert_eq!(entries[0].start, Label(4)),
            other => panic!("unexpected attribute {:?}", other),
        }
        // handler entry pushes the exception; invoke pushes one argument
        assert_eq!(decoded.body.max_stack, 1);
    }

    #[test]
    fn test_table_switch_padding_roundtrip() {
        let mut pool = ConstantPool::new();
        // 0: iload_0 1: tableswitch pad(2) default low high t0 t1 -> targets at end
        let mut bytecode = vec![opcodes::ILOAD_0, opcodes::TABLESWITCH, 0, 0];
        let return_at: i32 = 4 + 12 + 8;
        for v in [return_at - 1, 0, 1, return_at - 1, return_at - 1] {
            bytecode.extend_from_slice(&v.to_be_bytes());
        }
        bytecode.push(opcodes::RETURN);
        let data = code_bytes(1, 1, &bytecode, &[0, 0, 0, 0]);
        let code = Code::decode(&data, &pool).unwrap();
        assert!(code.body.instructions.iter().any(|insn| matches!(
            insn,
            Instruction::Opaque(Opaque::TableSwitch { low: 0, high: 1, .. })
        )));
        assert_eq!(code.encode(&mut pool).unwrap(), data);
    }

    #[test]
    fn test_stack_map_frames_follow_labels() {
        let mut pool = ConstantPool::new();
        let name = pool.add_utf8("StackMapTable").unwrap();
        let mut code = Code::new(MethodBody::new(
            vec![
                Instruction::LoadLocal {
                    kind: ValueKind::Int,
                    slot: 0,
                },
                Instruction::Opaque(Opaque::Jump {
                    opcode: opcodes::IFEQ,
                    target: Label(100),
                }),
                Instruction::simple(opcodes::NOP),
                Instruction::label(Label(100)),
                Instruction::simple(opcodes::RETURN),
            ],
            1,
            0,
        ));
        code.attributes.push(CodeAttribute::StackMap {
            name,
            frames: vec![Frame {
                label: Label(100),
                kind: FrameKind::Same,
            }],
        });

        let encoded = code.encode(&mut pool).unwrap();
        let decoded = Code::decode(&encoded, &pool).unwrap();
        match &decoded.attributes[0] {
            CodeAttribute::StackMap { frames, .. } => {
                assert_eq!(frames.len(), 1);
                assert_eq!(frames[0].label, Label(5));
                assert_eq!(frames[0].kind, FrameKind::Same);
            }
            other => panic!("unexpected attribute {:?}", other),
        }
    }

    #[test]
    fn test_missing_label_is_verify_error() {
        let mut pool = ConstantPool::new();
        let code = Code::new(MethodBody::new(
            vec![
                Instruction::Opaque(Opaque::Jump {
                    opcode: opcodes::GOTO,
                    target: Label(7),
                }),
                Instruction::simple(opcodes::RETURN),
            ],
            0,
            0,
        ));
        assert!(matches!(
            code.encode(&mut pool),
            Err(VerifyError::MissingLabel(Label(7)))
        ));
    }

    #[test]
    fn test_wide_slots_encode_with_wide_prefix() {
        let mut pool = ConstantPool::new();
        let code = Code::new(MethodBody::new(
            vec![
                Instruction::simple(opcodes::ACONST_NULL),
                Instruction::astore(300),
                Instruction::aload(300),
                Instruction::simple(opcodes::ARETURN),
            ],
            301,
            0,
        ));
        let encoded = code.encode(&mut pool).unwrap();
        let decoded = Code::decode(&encoded, &pool).unwrap();
        assert_eq!(decoded.body.instructions, code.body.instructions);
        // code_length: 1 + 4 + 4 + 1
        assert_eq!(&encoded[4..8], &10u32.to_be_bytes());
    }

    #[test]
    fn test_raw_jump_rejected() {
        let mut pool = ConstantPool::new();
        let code = Code::new(MethodBody::new(
            vec![Instruction::Opaque(Opaque::Raw(vec![opcodes::GOTO, 0, 0]))],
            0,
            0,
        ));
        assert!(matches!(
            code.encode(&mut pool),
            Err(VerifyError::InvalidRaw { opcode: opcodes::GOTO })
        ));
    }

    fn padding(count: usize) -> Vec<Instruction> {
        vec![Instruction::simple(opcodes::NOP); count]
    }

    fn jumps(code: &Code) -> Vec<(u8, Label)> {
        code.body
            .instructions
            .iter()
            .filter_map(|insn| match insn {
                Instruction::Opaque(Opaque::Jump { opcode, target }) => Some((*opcode, *target)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_far_goto_widens_to_goto_w() {
        let mut pool = ConstantPool::new();
        let mut instructions = vec![Instruction::label(Label(0))];
        instructions.extend(padding(40_000));
        instructions.push(Instruction::Opaque(Opaque::Jump {
            opcode: opcodes::GOTO,
            target: Label(0),
        }));
        let code = Code::new(MethodBody::new(instructions, 0, 0));

        let encoded = code.encode(&mut pool).unwrap();
        let decoded = Code::decode(&encoded, &pool).unwrap();
        assert_eq!(jumps(&decoded), vec![(opcodes::GOTO_W, Label(0))]);
    }

    #[test]
    fn test_far_conditional_negates_over_goto_w() {
        let mut pool = ConstantPool::new();
        let mut instructions = vec![
            Instruction::aload(0),
            Instruction::Opaque(Opaque::Jump {
                opcode: opcodes::IFNULL,
                target: Label(1),
            }),
        ];
        instructions.extend(padding(40_000));
        instructions.push(Instruction::label(Label(1)));
        instructions.push(Instruction::simple(opcodes::RETURN));
        let code = Code::new(MethodBody::new(instructions, 1, 0));

        let encoded = code.encode(&mut pool).unwrap();
        let decoded = Code::decode(&encoded, &pool).unwrap();
        // 0 aload_0, 1 ifnonnull +8, 4 goto_w, 9 padding, 40009 return
        assert_eq!(
            jumps(&decoded),
            vec![(opcodes::IFNONNULL, Label(9)), (opcodes::GOTO_W, Label(40_009))]
        );
        assert_eq!(decoded.body.max_stack, 1);
    }

    #[test]
    fn test_near_branches_stay_short() {
        let mut pool = ConstantPool::new();
        let mut instructions = vec![
            Instruction::aload(0),
            Instruction::Opaque(Opaque::Jump {
                opcode: opcodes::IFNULL,
                target: Label(1),
            }),
        ];
        instructions.extend(padding(32_000));
        instructions.push(Instruction::label(Label(1)));
        instructions.push(Instruction::simple(opcodes::RETURN));
        let code = Code::new(MethodBody::new(instructions, 1, 0));

        let decoded = Code::decode(&code.encode(&mut pool).unwrap(), &pool).unwrap();
        assert_eq!(jumps(&decoded), vec![(opcodes::IFNULL, Label(32_004))]);
    }

    fn framed_far_conditional(frame_at_fall_through: bool) -> (ConstantPool, Code) {
        let mut pool = ConstantPool::new();
        let name = pool.add_utf8("StackMapTable").unwrap();
        let mut instructions = vec![
            Instruction::aload(0),
            Instruction::Opaque(Opaque::Jump {
                opcode: opcodes::IFNULL,
                target: Label(2),
            }),
        ];
        let mut frames = Vec::new();
        if frame_at_fall_through {
            instructions.push(Instruction::label(Label(1)));
            frames.push(Frame {
                label: Label(1),
                kind: FrameKind::Same,
            });
        }
        instructions.extend(padding(40_000));
        instructions.push(Instruction::label(Label(2)));
        instructions.push(Instruction::simple(opcodes::RETURN));
        frames.push(Frame {
            label: Label(2),
            kind: FrameKind::Same,
        });
        let mut code = Code::new(MethodBody::new(instructions, 1, 0));
        code.attributes.push(CodeAttribute::StackMap { name, frames });
        (pool, code)
    }

    #[test]
    fn test_far_conditional_without_fall_through_frame_rejected() {
        let (mut pool, code) = framed_far_conditional(false);
        assert!(matches!(
            code.encode(&mut pool),
            Err(VerifyError::BranchOutOfRange { .. })
        ));
    }

    #[test]
    fn test_far_conditional_with_fall_through_frame_widens() {
        let (mut pool, code) = framed_far_conditional(true);
        let decoded = Code::decode(&code.encode(&mut pool).unwrap(), &pool).unwrap();
        let ops: Vec<u8> = jumps(&decoded).into_iter().map(|(op, _)| op).collect();
        assert_eq!(ops, vec![opcodes::IFNONNULL, opcodes::GOTO_W]);
    }
}
