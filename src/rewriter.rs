//! Pattern-matching method body rewriter
//!
//! A single forward pass over one method's instruction stream that inserts
//! timing probes around two call-site shapes:
//!
//! - diagnostic-log calls: the log sites right after the prologue get a
//!   `before(name)` and an `after(name)` probe loading the class name from a
//!   fixed local slot
//! - transformer calls: once a transformer instance has been captured into a
//!   local slot, each apply call is bracketed with `before(instance)` and
//!   `after(instance)`
//!
//! The pass never fails and never removes or reorders input instructions.
//! Whether the result is loadable is decided later, when the container
//! re-derives the method's frame metadata.

use serde::Serialize;

use crate::bytecode::{Instruction, MethodBody, Slot, TypeCheckOp, ValueKind};
use crate::config::{Phase, RewriteConfig};

/// Matching state threaded through one rewrite pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PatchState {
    /// Diagnostic-log sites seen so far
    pub match_ordinal: u32,
    /// Slot last identified as holding a transformer instance
    pub captured_slot: Option<Slot>,
    /// The next reference store is captured
    pub capture_armed: bool,
}

/// What a probe measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    /// Keyed by the class name in the fixed slot
    ClassName,
    /// Keyed by the runtime type of the captured transformer
    Transformer,
}

/// One inserted `load` + `invoke` pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeSite {
    pub kind: ProbeKind,
    pub phase: Phase,
    /// Local slot loaded as the probe argument
    pub slot: Slot,
    /// Index of the matched instruction in the input body
    pub source_index: usize,
}

/// Summary of a rewrite pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RewriteReport {
    pub log_sites_seen: u32,
    pub transform_sites_seen: u32,
    pub probes: Vec<ProbeSite>,
    pub captured_slot: Option<Slot>,
    /// Indices of inserted instructions in the output body
    pub inserted: Vec<usize>,
}

impl RewriteReport {
    pub fn is_unchanged(&self) -> bool {
        self.probes.is_empty()
    }

    pub fn count(&self, kind: ProbeKind, phase: Phase) -> usize {
        self.probes
            .iter()
            .filter(|p| p.kind == kind && p.phase == phase)
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewrite {
    pub body: MethodBody,
    pub report: RewriteReport,
    pub state: PatchState,
}

pub struct Rewriter<'c> {
    config: &'c RewriteConfig,
}

impl<'c> Rewriter<'c> {
    pub fn new(config: &'c RewriteConfig) -> Self {
        Self { config }
    }

    /// Rewrite one method body
    ///
    /// `max_locals` and `max_stack` are copied from the input; the container
    /// recomputes `max_stack` and checks every slot against `max_locals`.
    pub fn rewrite(&self, body: &MethodBody) -> Rewrite {
        let mut emitter = Emitter {
            out: Vec::with_capacity(body.instructions.len() + 8),
            report: RewriteReport::default(),
        };
        let state = body
            .instructions
            .iter()
            .enumerate()
            .fold(PatchState::default(), |state, (index, insn)| {
                self.step(state, index, insn, &mut emitter)
            });

        emitter.report.log_sites_seen = state.match_ordinal;
        emitter.report.captured_slot = state.captured_slot;
        Rewrite {
            body: MethodBody::new(emitter.out, body.max_locals, body.max_stack),
            report: emitter.report,
            state,
        }
    }

    fn in_transform_phase(&self, state: &PatchState) -> bool {
        state.match_ordinal > self.config.transform_phase_after
    }

    fn step(
        &self,
        mut state: PatchState,
        index: usize,
        insn: &Instruction,
        emitter: &mut Emitter,
    ) -> PatchState {
        match insn {
            Instruction::Invoke { target, .. } if self.config.log_call.matches(target) => {
                emitter.pass(insn);
                let phase = if state.match_ordinal == self.config.open_ordinal() {
                    Some(Phase::Before)
                } else if state.match_ordinal == self.config.close_ordinal() {
                    Some(Phase::After)
                } else {
                    None
                };
                if let Some(phase) = phase {
                    tracing::trace!(ordinal = state.match_ordinal, ?phase, "class name probe");
                    emitter.probe(
                        ProbeSite {
                            kind: ProbeKind::ClassName,
                            phase,
                            slot: self.config.name_slot,
                            source_index: index,
                        },
                        self.config,
                    );
                }
                state.match_ordinal += 1;
            }
            Instruction::TypeCheck {
                op: TypeCheckOp::CheckCast,
                class,
            } if *class == self.config.transformer_type && self.in_transform_phase(&state) => {
                emitter.pass(insn);
                state.capture_armed = true;
            }
            Instruction::StoreLocal {
                kind: ValueKind::Reference,
                slot,
            } if state.capture_armed => {
                emitter.pass(insn);
                tracing::trace!(slot, "captured transformer slot");
                state.captured_slot = Some(*slot);
                state.capture_armed = false;
            }
            Instruction::Invoke { target, .. } if self.config.transform_call.matches(target) => {
                emitter.report.transform_sites_seen += 1;
                match state.captured_slot {
                    Some(slot) if self.in_transform_phase(&state) => {
                        let site = |phase| ProbeSite {
                            kind: ProbeKind::Transformer,
                            phase,
                            slot,
                            source_index: index,
                        };
                        emitter.probe(site(Phase::Before), self.config);
                        emitter.pass(insn);
                        emitter.probe(site(Phase::After), self.config);
                    }
                    _ => emitter.pass(insn),
                }
            }
            _ => emitter.pass(insn),
        }
        state
    }
}

struct Emitter {
    out: Vec<Instruction>,
    report: RewriteReport,
}

impl Emitter {
    fn pass(&mut self, insn: &Instruction) {
        self.out.push(insn.clone());
    }

    fn probe(&mut self, site: ProbeSite, config: &RewriteConfig) {
        let target = match site.kind {
            ProbeKind::ClassName => config.name_probe(site.phase),
            ProbeKind::Transformer => config.instance_probe(site.phase),
        };
        self.report.inserted.push(self.out.len());
        self.out.push(Instruction::aload(site.slot));
        self.report.inserted.push(self.out.len());
        self.out.push(Instruction::invoke_static(target));
        self.report.probes.push(site);
    }
}

/// Rewrite with the default configuration
pub fn rewrite(body: &MethodBody) -> Rewrite {
    Rewriter::new(&RewriteConfig::default()).rewrite(body)
}
