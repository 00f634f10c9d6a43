//! Frame metadata re-derived from an instruction stream
//!
//! `max_stack` is computed by a depth-only dataflow over every control-flow
//! edge, with each exception handler entered at depth one. Local accesses are
//! checked against the declared `max_locals`.

use std::collections::HashMap;

use super::code::Code;
use super::constant_pool::ConstantPool;
use super::opcodes;
use super::VerifyError;
use crate::bytecode::{
    descriptor_slots, field_slots, Instruction, InvokeKind, Label, MethodBody, Opaque, ValueKind,
};

type Result<T> = std::result::Result<T, VerifyError>;

/// Reject any load, store, `iinc` or `ret` outside the declared frame
pub fn verify_locals(body: &MethodBody) -> Result<()> {
    for insn in &body.instructions {
        if let Some((slot, width)) = insn.local_access() {
            if u32::from(slot) + u32::from(width) > u32::from(body.max_locals) {
                return Err(VerifyError::LocalOutOfRange {
                    slot,
                    width,
                    max_locals: body.max_locals,
                });
            }
        }
    }
    Ok(())
}

/// Maximum operand stack depth reachable in `code`
pub fn max_stack(code: &Code, pool: &ConstantPool) -> Result<u16> {
    let instructions = &code.body.instructions;
    let positions: HashMap<Label, usize> = instructions
        .iter()
        .enumerate()
        .filter_map(|(i, insn)| match insn {
            Instruction::Opaque(Opaque::Label(label)) => Some((*label, i)),
            _ => None,
        })
        .collect();
    let position = |label: Label| -> Result<usize> {
        positions
            .get(&label)
            .copied()
            .ok_or(VerifyError::MissingLabel(label))
    };

    let mut heights: Vec<Option<u32>> = vec![None; instructions.len()];
    let mut work: Vec<(usize, u32)> = vec![(0, 0)];
    for handler in &code.handlers {
        work.push((position(handler.handler)?, 1));
    }
    let mut max = 0u32;

    while let Some((start, height)) = work.pop() {
        let mut index = start;
        let mut height = height;
        loop {
            let insn = instructions.get(index).ok_or(VerifyError::FallsOffEnd)?;
            match heights[index] {
                Some(existing) if existing == height => break,
                Some(existing) => {
                    return Err(VerifyError::StackMismatch {
                        index,
                        existing,
                        incoming: height,
                    });
                }
                None => heights[index] = Some(height),
            }

            let (pop, push) = effect(insn, pool)?;
            if height < pop {
                return Err(VerifyError::StackUnderflow { index });
            }
            let after = height - pop + push;
            max = max.max(after);

            match insn {
                Instruction::Opaque(Opaque::Jump { opcode, target }) => {
                    let target = position(*target)?;
                    match *opcode {
                        opcodes::GOTO | opcodes::GOTO_W => {
                            work.push((target, after));
                            break;
                        }
                        opcodes::JSR | opcodes::JSR_W => {
                            // the subroutine sees the return address; the
                            // instruction after jsr resumes at the old height
                            work.push((target, after));
                            height = after - 1;
                        }
                        _ => {
                            work.push((target, after));
                            height = after;
                        }
                    }
                }
                Instruction::Opaque(Opaque::TableSwitch {
                    default, targets, ..
                }) => {
                    work.push((position(*default)?, after));
                    for target in targets {
                        work.push((position(*target)?, after));
                    }
                    break;
                }
                Instruction::Opaque(Opaque::LookupSwitch { default, pairs }) => {
                    work.push((position(*default)?, after));
                    for (_, target) in pairs {
                        work.push((position(*target)?, after));
                    }
                    break;
                }
                Instruction::Opaque(Opaque::Raw(bytes))
                    if bytes.first().is_some_and(|&op| opcodes::ends_block(op))
                        || bytes.get(..2) == Some(&[opcodes::WIDE, opcodes::RET][..]) =>
                {
                    break;
                }
                _ => height = after,
            }
            index += 1;
        }
    }

    u16::try_from(max).map_err(|_| VerifyError::StackOverflow)
}

/// `(pop, push)` of one instruction, in stack slots
fn effect(insn: &Instruction, pool: &ConstantPool) -> Result<(u32, u32)> {
    Ok(match insn {
        Instruction::Invoke { kind, target, .. } => {
            let (args, ret) = descriptor_slots(&target.descriptor)
                .ok_or_else(|| VerifyError::BadDescriptor(target.descriptor.clone()))?;
            let receiver = u32::from(*kind != InvokeKind::Static);
            (u32::from(args) + receiver, u32::from(ret))
        }
        Instruction::LoadLocal { kind, .. } => (0, u32::from(kind.width())),
        Instruction::StoreLocal { kind, .. } => (u32::from(kind.width()), 0),
        Instruction::TypeCheck { .. } => (1, 1),
        Instruction::Opaque(op) => match op {
            Opaque::Label(_) => (0, 0),
            Opaque::Jump { opcode, .. } => match *opcode {
                opcodes::GOTO | opcodes::GOTO_W => (0, 0),
                opcodes::JSR | opcodes::JSR_W => (0, 1),
                0x9f..=opcodes::IF_ACMPNE => (2, 0),
                _ => (1, 0),
            },
            Opaque::TableSwitch { .. } | Opaque::LookupSwitch { .. } => (1, 0),
            Opaque::Raw(bytes) => raw_effect(bytes, pool)?,
        },
    })
}

fn width(index: u8) -> u32 {
    ValueKind::from_family_index(index).map_or(1, |kind| u32::from(kind.width()))
}

fn cp_index(bytes: &[u8]) -> u16 {
    match bytes {
        [_, hi, lo, ..] => u16::from_be_bytes([*hi, *lo]),
        _ => 0,
    }
}

fn member_descriptor<'p>(bytes: &[u8], pool: &'p ConstantPool) -> Result<&'p str> {
    Ok(pool.ref_descriptor(cp_index(bytes))?)
}

fn raw_effect(bytes: &[u8], pool: &ConstantPool) -> Result<(u32, u32)> {
    let opcode = bytes.first().copied().unwrap_or(opcodes::NOP);
    Ok(match opcode {
        opcodes::NOP => (0, 0),
        opcodes::ACONST_NULL..=0x08 => (0, 1),
        0x09 | 0x0a => (0, 2),
        0x0b..=0x0d => (0, 1),
        0x0e | 0x0f => (0, 2),
        opcodes::BIPUSH | opcodes::SIPUSH | opcodes::LDC | opcodes::LDC_W => (0, 1),
        opcodes::LDC2_W => (0, 2),
        opcodes::ILOAD..=opcodes::ALOAD => (0, width(opcode - opcodes::ILOAD)),
        opcodes::ILOAD_0..=opcodes::ALOAD_3 => (0, width((opcode - opcodes::ILOAD_0) / 4)),
        0x2f | 0x31 => (2, 2),
        0x2e..=0x35 => (2, 1),
        opcodes::ISTORE..=opcodes::ASTORE => (width(opcode - opcodes::ISTORE), 0),
        opcodes::ISTORE_0..=opcodes::ASTORE_3 => (width((opcode - opcodes::ISTORE_0) / 4), 0),
        0x50 | 0x52 => (4, 0),
        0x4f..=0x56 => (3, 0),
        opcodes::POP => (1, 0),
        0x58 => (2, 0),
        opcodes::DUP => (1, 2),
        0x5a => (2, 3),
        0x5b => (3, 4),
        0x5c => (2, 4),
        0x5d => (3, 5),
        0x5e => (4, 6),
        0x5f => (2, 2),
        // add, sub, mul, div, rem in i/l/f/d order
        opcodes::IADD..=0x73 => {
            if (opcode - opcodes::IADD) % 2 == 0 {
                (2, 1)
            } else {
                (4, 2)
            }
        }
        // neg
        0x74..=0x77 => {
            if (opcode - 0x74) % 2 == 0 {
                (1, 1)
            } else {
                (2, 2)
            }
        }
        // shl, shr, ushr
        0x78..=0x7d => {
            if (opcode - 0x78) % 2 == 0 {
                (2, 1)
            } else {
                (3, 2)
            }
        }
        // and, or, xor
        0x7e..=0x83 => {
            if (opcode - 0x7e) % 2 == 0 {
                (2, 1)
            } else {
                (4, 2)
            }
        }
        opcodes::IINC => (0, 0),
        0x85 | 0x87 | 0x8c | 0x8d => (1, 2),
        0x86 | 0x8b | 0x91..=0x93 => (1, 1),
        0x88 | 0x89 | 0x8e | 0x90 => (2, 1),
        0x8a | 0x8f => (2, 2),
        0x94 | 0x97 | 0x98 => (4, 1),
        0x95 | 0x96 => (2, 1),
        opcodes::IFEQ..=0x9e => (1, 0),
        0x9f..=opcodes::IF_ACMPNE => (2, 0),
        opcodes::GOTO | opcodes::RET => (0, 0),
        opcodes::JSR => (0, 1),
        opcodes::TABLESWITCH | opcodes::LOOKUPSWITCH => (1, 0),
        0xad | 0xaf => (2, 0),
        opcodes::IRETURN..=opcodes::ARETURN => (1, 0),
        opcodes::RETURN => (0, 0),
        opcodes::GETSTATIC | opcodes::PUTSTATIC | opcodes::GETFIELD | opcodes::PUTFIELD => {
            let descriptor = member_descriptor(bytes, pool)?;
            let size = u32::from(
                field_slots(descriptor)
                    .ok_or_else(|| VerifyError::BadDescriptor(descriptor.to_string()))?,
            );
            match opcode {
                opcodes::GETSTATIC => (0, size),
                opcodes::PUTSTATIC => (size, 0),
                opcodes::GETFIELD => (1, size),
                _ => (1 + size, 0),
            }
        }
        opcodes::INVOKEVIRTUAL..=opcodes::INVOKEDYNAMIC => {
            let descriptor = member_descriptor(bytes, pool)?;
            let (args, ret) = descriptor_slots(descriptor)
                .ok_or_else(|| VerifyError::BadDescriptor(descriptor.to_string()))?;
            let receiver = u32::from(
                opcode != opcodes::INVOKESTATIC && opcode != opcodes::INVOKEDYNAMIC,
            );
            (u32::from(args) + receiver, u32::from(ret))
        }
        opcodes::NEW => (0, 1),
        opcodes::NEWARRAY | opcodes::ANEWARRAY | opcodes::ARRAYLENGTH => (1, 1),
        opcodes::ATHROW => (1, 0),
        opcodes::CHECKCAST | opcodes::INSTANCEOF => (1, 1),
        opcodes::MONITORENTER | opcodes::MONITOREXIT => (1, 0),
        opcodes::WIDE => match bytes.get(1).copied() {
            Some(modified @ opcodes::ILOAD..=opcodes::ALOAD) => {
                (0, width(modified - opcodes::ILOAD))
            }
            Some(modified @ opcodes::ISTORE..=opcodes::ASTORE) => {
                (width(modified - opcodes::ISTORE), 0)
            }
            _ => (0, 0),
        },
        opcodes::MULTIANEWARRAY => (u32::from(bytes.get(3).copied().unwrap_or(1)), 1),
        opcodes::IFNULL | opcodes::IFNONNULL => (1, 0),
        opcodes::GOTO_W => (0, 0),
        opcodes::JSR_W => (0, 1),
        _ => return Err(VerifyError::InvalidRaw { opcode }),
    })
}
