//! Integration tests for patching serialized class files

mod utils;

use metronome::bytecode::{Instruction, InvokeKind, Opaque};
use metronome::classfile::{ClassFile, VerifyError};
use metronome::config::{PatchTarget, RewriteConfig, PROBE_OWNER, TARGET_CLASS};
use metronome::patcher::{ClassPatcher, PassReason, PatchError, PatchOutcome, Patched};
use utils::{launch_class_loader, looping_code, target_body, MAX_LOCALS};

fn patch(bytes: &[u8]) -> Patched {
    match ClassPatcher::default().patch(TARGET_CLASS, bytes).unwrap() {
        PatchOutcome::Patched(patched) => patched,
        PatchOutcome::Unchanged(reason) => panic!("unchanged: {}", reason),
    }
}

#[test]
fn test_patched_class_reparses() {
    let bytes = launch_class_loader(&looping_code());
    let patched = patch(&bytes);
    let class = ClassFile::parse(&patched.bytes).unwrap();
    assert_eq!(class.name().unwrap(), TARGET_CLASS);
    assert_eq!(class.methods.len(), 2);
    assert!(patched.bytes.len() > bytes.len());
}

#[test]
fn test_max_stack_recomputed() {
    let patched = patch(&launch_class_loader(&looping_code()));
    // receiver plus three arguments at the transform call
    assert_eq!(patched.max_stack_before, 4);
    // the instance probe loads the transformer on top of the call arguments
    assert_eq!(patched.max_stack_after, 5);

    let class = ClassFile::parse(&patched.bytes).unwrap();
    let target = PatchTarget::default();
    let index = class
        .find_method(&target.method_name, &target.method_descriptor)
        .unwrap()
        .unwrap();
    let code = class.method_code(index).unwrap().unwrap();
    assert_eq!(code.body.max_stack, 5);
    assert_eq!(code.body.max_locals, MAX_LOCALS);
}

#[test]
fn test_handler_range_still_covers_transformer_call() {
    let patched = patch(&launch_class_loader(&looping_code()));
    let class = ClassFile::parse(&patched.bytes).unwrap();
    let target = PatchTarget::default();
    let index = class
        .find_method(&target.method_name, &target.method_descriptor)
        .unwrap()
        .unwrap();
    let code = class.method_code(index).unwrap().unwrap();
    assert_eq!(code.handlers.len(), 1);

    let instructions = &code.body.instructions;
    let position = |label| {
        instructions
            .iter()
            .position(|i| *i == Instruction::label(label))
            .unwrap()
    };
    let start = position(code.handlers[0].start);
    let end = position(code.handlers[0].end);
    let handler = position(code.handlers[0].handler);

    let call = instructions
        .iter()
        .position(|i| matches!(i, Instruction::Invoke { kind: InvokeKind::Interface, .. }))
        .unwrap();
    assert!(start < call && call < end);
    assert!(end < handler);
    assert_eq!(
        instructions[handler + 1],
        Instruction::simple(metronome::classfile::opcodes::ATHROW)
    );
}

#[test]
fn test_loop_branches_resolve_after_insertion() {
    let patched = patch(&launch_class_loader(&looping_code()));
    let body = target_body(&patched.bytes);
    let labels: Vec<_> = body
        .instructions
        .iter()
        .filter_map(|i| match i {
            Instruction::Opaque(Opaque::Label(label)) => Some(*label),
            _ => None,
        })
        .collect();
    for insn in &body.instructions {
        if let Instruction::Opaque(Opaque::Jump { target, .. }) = insn {
            assert!(labels.contains(target), "dangling jump to {}", target);
        }
    }
    // goto jumps back to the loop head, which is still followed by `aload 4`
    let goto_target = body
        .instructions
        .iter()
        .find_map(|i| match i {
            Instruction::Opaque(Opaque::Jump { opcode, target })
                if *opcode == metronome::classfile::opcodes::GOTO =>
            {
                Some(*target)
            }
            _ => None,
        })
        .unwrap();
    let head = body
        .instructions
        .iter()
        .position(|i| *i == Instruction::label(goto_target))
        .unwrap();
    assert_eq!(body.instructions[head + 1], Instruction::aload(4));
}

#[test]
fn test_probe_references_added_to_pool() {
    let patched = patch(&launch_class_loader(&looping_code()));
    let body = target_body(&patched.bytes);
    let probes = body
        .code()
        .filter(|i| matches!(i, Instruction::Invoke { target, .. } if target.owner == PROBE_OWNER))
        .count();
    assert_eq!(probes, 4);
}

#[test]
fn test_other_methods_untouched() {
    let bytes = launch_class_loader(&looping_code());
    let original = ClassFile::parse(&bytes).unwrap();
    let patched = ClassFile::parse(&patch(&bytes).bytes).unwrap();
    let init = original.find_method("<init>", "()V").unwrap().unwrap();
    assert_eq!(original.methods[init], patched.methods[init]);
}

#[test]
fn test_name_slot_beyond_max_locals_fails_verification() {
    let config = RewriteConfig {
        name_slot: MAX_LOCALS + 1,
        ..Default::default()
    };
    let patcher = ClassPatcher::new(PatchTarget::default(), config);
    let err = patcher
        .patch(TARGET_CLASS, &launch_class_loader(&looping_code()))
        .unwrap_err();
    assert!(matches!(
        err,
        PatchError::Verification {
            source: VerifyError::LocalOutOfRange { slot: 9, .. },
            ..
        }
    ));
    assert!(err.to_string().contains("runTransformers"));
}

#[test]
fn test_renamed_target_passes_through() {
    let bytes = launch_class_loader(&looping_code());
    let target = PatchTarget {
        class_name: "some/other/Loader".to_string(),
        ..Default::default()
    };
    let outcome = ClassPatcher::new(target, RewriteConfig::default())
        .patch(TARGET_CLASS, &bytes)
        .unwrap();
    assert!(matches!(outcome, PatchOutcome::Unchanged(PassReason::OtherClass)));
}
