// Shared fixtures for integration tests
//
// Builds synthetic class-loader method bodies and runs rewritten bodies on a
// small stub runtime that only understands loads, stores and invokes.

#![allow(dead_code)]

use std::collections::HashMap;
use std::time::Duration;

use metronome::bytecode::{
    descriptor_slots, Instruction, InvokeKind, Label, MemberRef, MethodBody, Opaque, Slot,
};
use metronome::classfile::code::{Code, ExceptionHandler};
use metronome::classfile::{opcodes, ClassFile};
use metronome::config::{
    PatchTarget, LOG_DESCRIPTOR, LOG_NAME, LOG_OWNER, PROBE_OWNER, TARGET_CLASS, TRANSFORMER_TYPE,
    TRANSFORM_NAME,
};
use metronome::timing::{Clock, ManualClock, StartPolicy, TimingAggregator};

pub const CLASS_BEING_LOADED: &str = "net.minecraft.client.Minecraft";
pub const TRANSFORMER_CLASS: &str = "com.example.DeobfuscationTransformer";
pub const TRANSFORMER_SLOT: Slot = 7;
pub const MAX_LOCALS: u16 = 8;

pub fn null() -> Instruction {
    Instruction::simple(opcodes::ACONST_NULL)
}

pub fn log_call() -> Instruction {
    Instruction::invoke_static(MemberRef::new(LOG_OWNER, LOG_NAME, LOG_DESCRIPTOR))
}

/// `LogWrapper.finest(null, null)`
pub fn log_site() -> Vec<Instruction> {
    vec![null(), null(), log_call()]
}

pub fn transform_call() -> Instruction {
    Instruction::Invoke {
        kind: InvokeKind::Interface,
        target: MemberRef::new(
            TRANSFORMER_TYPE,
            TRANSFORM_NAME,
            "(Ljava/lang/String;Ljava/lang/String;[B)[B",
        ),
        interface: true,
    }
}

/// `basicClass = ((IClassTransformer) transformer).transform(name, transformedName, basicClass)`
pub fn transformer_triple() -> Vec<Instruction> {
    vec![
        Instruction::aload(4),
        Instruction::checkcast(TRANSFORMER_TYPE),
        Instruction::astore(TRANSFORMER_SLOT),
        Instruction::aload(TRANSFORMER_SLOT),
        Instruction::aload(1),
        Instruction::aload(2),
        Instruction::aload(3),
        transform_call(),
        Instruction::astore(3),
    ]
}

/// Straight-line `runTransformers` shape: four log sites, one transformer
pub fn linear_body() -> MethodBody {
    let mut instructions = vec![Instruction::aload(1), Instruction::astore(6)];
    for _ in 0..4 {
        instructions.extend(log_site());
    }
    instructions.extend(transformer_triple());
    instructions.push(Instruction::aload(3));
    instructions.push(Instruction::simple(opcodes::ARETURN));
    MethodBody::new(instructions, MAX_LOCALS, 0)
}

/// `runTransformers` with a transformer loop wrapped in a catch-all handler
pub fn looping_code() -> Code {
    let (try_start, loop_head, exit, handler) = (Label(0), Label(1), Label(2), Label(3));
    let mut instructions = vec![
        Instruction::label(try_start),
        Instruction::aload(1),
        Instruction::astore(6),
    ];
    for _ in 0..4 {
        instructions.extend(log_site());
    }
    // slot 4 holds the next transformer, or null when the loop is done
    instructions.extend([
        Instruction::label(loop_head),
        Instruction::aload(4),
        Instruction::Opaque(Opaque::Jump {
            opcode: opcodes::IFNULL,
            target: exit,
        }),
    ]);
    instructions.extend(transformer_triple());
    instructions.extend([
        null(),
        Instruction::astore(4),
        Instruction::Opaque(Opaque::Jump {
            opcode: opcodes::GOTO,
            target: loop_head,
        }),
        Instruction::label(exit),
        Instruction::aload(3),
        Instruction::simple(opcodes::ARETURN),
        Instruction::label(handler),
        Instruction::simple(opcodes::ATHROW),
    ]);

    let mut code = Code::new(MethodBody::new(instructions, MAX_LOCALS, 0));
    code.handlers.push(ExceptionHandler {
        start: try_start,
        end: exit,
        handler,
        catch_type: 0,
    });
    code
}

/// Serialized `LaunchClassLoader` whose `runTransformers` has `code`
pub fn launch_class_loader(code: &Code) -> Vec<u8> {
    let mut class = ClassFile::new(TARGET_CLASS, "java/net/URLClassLoader").unwrap();
    let target = PatchTarget::default();
    let index = class
        .add_method(0x0002, &target.method_name, &target.method_descriptor, None)
        .unwrap();
    class.set_method_code(index, code).unwrap();
    class.add_method(0x0001, "<init>", "()V", None).unwrap();
    class.to_bytes()
}

/// Decoded `runTransformers` body of a serialized class
pub fn target_body(bytes: &[u8]) -> MethodBody {
    let class = ClassFile::parse(bytes).unwrap();
    let target = PatchTarget::default();
    let index = class
        .find_method(&target.method_name, &target.method_descriptor)
        .unwrap()
        .unwrap();
    class.method_code(index).unwrap().unwrap().body
}

/// Value tracked by the stub runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StubValue {
    Null,
    ClassName(String),
    Transformer(String),
    Bytes,
}

/// A probe call observed by the stub runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeCall {
    pub method: String,
    pub descriptor: String,
    pub argument: String,
}

/// Executes a method body in straight-line order
///
/// Jumps are never taken. Probe invokes are routed to a timing aggregator
/// driven by a manual clock; every other invoke advances the clock.
pub struct StubRuntime {
    pub clock: ManualClock,
    pub aggregator: TimingAggregator<ManualClock>,
    pub probes: Vec<ProbeCall>,
    pub log_cost: Duration,
    pub transform_cost: Duration,
}

impl StubRuntime {
    pub fn new() -> Self {
        let clock = ManualClock::new();
        Self {
            aggregator: TimingAggregator::with_clock(clock.clone(), StartPolicy::SingleSlot),
            clock,
            probes: Vec::new(),
            log_cost: Duration::from_millis(1),
            transform_cost: Duration::from_millis(5),
        }
    }

    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    /// Run `body` with the locals `runTransformers` sees on entry
    pub fn run(&mut self, body: &MethodBody) {
        let mut locals: HashMap<Slot, StubValue> = HashMap::new();
        locals.insert(1, StubValue::ClassName(CLASS_BEING_LOADED.to_string()));
        locals.insert(2, StubValue::ClassName(CLASS_BEING_LOADED.to_string()));
        locals.insert(3, StubValue::Bytes);
        locals.insert(4, StubValue::Transformer(TRANSFORMER_CLASS.to_string()));
        let mut stack: Vec<StubValue> = Vec::new();

        for insn in body.code() {
            match insn {
                Instruction::LoadLocal { slot, .. } => {
                    stack.push(locals.get(slot).cloned().unwrap_or(StubValue::Null));
                }
                Instruction::StoreLocal { slot, .. } => {
                    let value = stack.pop().expect("store with empty stack");
                    locals.insert(*slot, value);
                }
                Instruction::TypeCheck { .. } => {}
                Instruction::Invoke { kind, target, .. } => {
                    self.invoke(*kind, target, &mut stack);
                }
                Instruction::Opaque(Opaque::Raw(bytes)) if bytes[0] == opcodes::ACONST_NULL => {
                    stack.push(StubValue::Null);
                }
                Instruction::Opaque(Opaque::Raw(bytes))
                    if bytes[0] == opcodes::ARETURN || bytes[0] == opcodes::ATHROW =>
                {
                    return;
                }
                Instruction::Opaque(Opaque::Jump { opcode, .. }) => {
                    if *opcode != opcodes::GOTO && *opcode != opcodes::GOTO_W {
                        stack.pop();
                    }
                }
                Instruction::Opaque(_) => {}
            }
        }
    }

    fn invoke(&mut self, kind: InvokeKind, target: &MemberRef, stack: &mut Vec<StubValue>) {
        let (args, ret) = descriptor_slots(&target.descriptor).expect("bad descriptor");
        let receiver = usize::from(kind != InvokeKind::Static);
        let mut popped: Vec<StubValue> = (0..usize::from(args) + receiver)
            .map(|_| stack.pop().expect("invoke with short stack"))
            .collect();
        popped.reverse();

        if target.owner == PROBE_OWNER {
            let argument = match &popped[0] {
                StubValue::ClassName(name) => name.clone(),
                StubValue::Transformer(class) => class.clone(),
                other => panic!("probe called with {:?}", other),
            };
            match target.name.as_str() {
                "before" => self.aggregator.before(&argument),
                "after" => self.aggregator.after(&argument),
                other => panic!("unknown probe {}", other),
            }
            self.probes.push(ProbeCall {
                method: target.name.clone(),
                descriptor: target.descriptor.clone(),
                argument,
            });
            return;
        }

        if target.name == TRANSFORM_NAME {
            self.clock.advance(self.transform_cost);
        } else {
            self.clock.advance(self.log_cost);
        }
        if ret > 0 {
            stack.push(StubValue::Bytes);
        }
    }

    pub fn calls(&self, method: &str) -> Vec<&ProbeCall> {
        self.probes.iter().filter(|p| p.method == method).collect()
    }
}
