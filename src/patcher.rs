//! Selective class patcher
//!
//! Applies the [`Rewriter`] to the one target method of the one target
//! class. Anything else is handed back untouched. After rewriting, the
//! method's `Code` attribute is rebuilt from the new instruction stream,
//! so a rewrite that cannot be verified fails here rather than at load.

use thiserror::Error;

use crate::bytecode::MethodBody;
use crate::classfile::{ClassFile, ClassFormatError, VerifyError};
use crate::config::{PatchTarget, RewriteConfig};
use crate::rewriter::{RewriteReport, Rewriter};

#[derive(Error, Debug)]
pub enum PatchError {
    #[error("cannot parse class {class}: {source}")]
    Malformed {
        class: String,
        #[source]
        source: ClassFormatError,
    },

    #[error("rewritten method {class}.{method} failed verification: {source}")]
    Verification {
        class: String,
        method: String,
        #[source]
        source: VerifyError,
    },
}

impl PatchError {
    pub fn class(&self) -> &str {
        match self {
            PatchError::Malformed { class, .. } | PatchError::Verification { class, .. } => class,
        }
    }
}

pub type Result<T> = std::result::Result<T, PatchError>;

/// Why a class was handed back unchanged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassReason {
    OtherClass,
    MethodMissing,
    /// Target method is abstract or native
    NoCode,
    /// Target method contains none of the actionable call sites
    NoMatches {
        log_sites_seen: u32,
        transform_sites_seen: u32,
    },
}

impl std::fmt::Display for PassReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            PassReason::OtherClass => "not the target class",
            PassReason::MethodMissing => "target method not found",
            PassReason::NoCode => "target method has no code",
            PassReason::NoMatches { .. } => "no recognized call sites in target method",
        };
        f.write_str(text)
    }
}

/// A successfully rewritten class
#[derive(Debug, Clone)]
pub struct Patched {
    pub bytes: Vec<u8>,
    /// Target method body after rewriting
    pub body: MethodBody,
    pub report: RewriteReport,
    pub max_stack_before: u16,
    pub max_stack_after: u16,
}

#[derive(Debug, Clone)]
pub enum PatchOutcome {
    Unchanged(PassReason),
    Patched(Patched),
}

impl PatchOutcome {
    pub fn is_patched(&self) -> bool {
        matches!(self, PatchOutcome::Patched(_))
    }

    /// Bytes to hand back to the loader
    pub fn into_bytes(self, original: &[u8]) -> Vec<u8> {
        match self {
            PatchOutcome::Unchanged(_) => original.to_vec(),
            PatchOutcome::Patched(patched) => patched.bytes,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClassPatcher {
    target: PatchTarget,
    config: RewriteConfig,
}

impl ClassPatcher {
    pub fn new(target: PatchTarget, config: RewriteConfig) -> Self {
        Self { target, config }
    }

    pub fn target(&self) -> &PatchTarget {
        &self.target
    }

    pub fn config(&self) -> &RewriteConfig {
        &self.config
    }

    /// Whether `class_name` names the target (slash or dot separated)
    pub fn is_target(&self, class_name: &str) -> bool {
        class_name.len() == self.target.class_name.len()
            && class_name
                .bytes()
                .zip(self.target.class_name.bytes())
                .all(|(a, b)| a == b || (a == b'.' && b == b'/'))
    }

    /// Patch `bytes` if `class_name` is the target class
    pub fn patch(&self, class_name: &str, bytes: &[u8]) -> Result<PatchOutcome> {
        if !self.is_target(class_name) {
            return Ok(PatchOutcome::Unchanged(PassReason::OtherClass));
        }
        let malformed = |source| PatchError::Malformed {
            class: class_name.to_string(),
            source,
        };

        let mut class = ClassFile::parse(bytes).map_err(malformed)?;
        let Some(index) = class
            .find_method(&self.target.method_name, &self.target.method_descriptor)
            .map_err(malformed)?
        else {
            tracing::debug!(class = class_name, "{}", PassReason::MethodMissing);
            return Ok(PatchOutcome::Unchanged(PassReason::MethodMissing));
        };
        let Some(mut code) = class.method_code(index).map_err(malformed)? else {
            tracing::debug!(class = class_name, "{}", PassReason::NoCode);
            return Ok(PatchOutcome::Unchanged(PassReason::NoCode));
        };

        let rewrite = Rewriter::new(&self.config).rewrite(&code.body);
        if rewrite.report.is_unchanged() {
            let reason = PassReason::NoMatches {
                log_sites_seen: rewrite.report.log_sites_seen,
                transform_sites_seen: rewrite.report.transform_sites_seen,
            };
            tracing::warn!(
                class = class_name,
                method = %self.target.signature(),
                log_sites = rewrite.report.log_sites_seen,
                "{}, leaving class unpatched",
                reason
            );
            return Ok(PatchOutcome::Unchanged(reason));
        }

        let max_stack_before = code.body.max_stack;
        code.body = rewrite.body;
        let max_stack_after =
            class
                .set_method_code(index, &code)
                .map_err(|source| PatchError::Verification {
                    class: class_name.to_string(),
                    method: self.target.signature(),
                    source,
                })?;

        tracing::info!(
            class = class_name,
            probes = rewrite.report.probes.len(),
            max_stack_before,
            max_stack_after,
            "patched {}",
            self.target.signature()
        );
        Ok(PatchOutcome::Patched(Patched {
            bytes: class.to_bytes(),
            body: code.body,
            report: rewrite.report,
            max_stack_before,
            max_stack_after,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Instruction, MemberRef};
    use crate::classfile::opcodes;
    use crate::config::{LOG_DESCRIPTOR, LOG_NAME, LOG_OWNER, TARGET_CLASS};

    fn log_call() -> Instruction {
        Instruction::invoke_static(MemberRef::new(LOG_OWNER, LOG_NAME, LOG_DESCRIPTOR))
    }

    fn class_with(body: Option<MethodBody>) -> Vec<u8> {
        let mut class = ClassFile::new(TARGET_CLASS, "java/net/URLClassLoader").unwrap();
        let target = PatchTarget::default();
        class
            .add_method(
                0x0002,
                &target.method_name,
                &target.method_descriptor,
                body.as_ref(),
            )
            .unwrap();
        class.to_bytes()
    }

    fn logging_body(sites: usize, max_locals: u16) -> MethodBody {
        let mut instructions = Vec::new();
        for _ in 0..sites {
            instructions.push(Instruction::simple(opcodes::ACONST_NULL));
            instructions.push(Instruction::simple(opcodes::ACONST_NULL));
            instructions.push(log_call());
        }
        instructions.push(Instruction::simple(opcodes::ACONST_NULL));
        instructions.push(Instruction::simple(opcodes::ARETURN));
        MethodBody::new(instructions, max_locals, 2)
    }

    #[test]
    fn test_other_class_passes_through() {
        let patcher = ClassPatcher::default();
        let outcome = patcher.patch("java/lang/String", b"not even a class").unwrap();
        assert!(matches!(outcome, PatchOutcome::Unchanged(PassReason::OtherClass)));
    }

    #[test]
    fn test_dotted_name_is_target() {
        let patcher = ClassPatcher::default();
        assert!(patcher.is_target("net.minecraft.launchwrapper.LaunchClassLoader"));
        assert!(patcher.is_target(TARGET_CLASS));
        assert!(!patcher.is_target("net/minecraft/launchwrapper/LaunchClassLoaderX"));
    }

    #[test]
    fn test_malformed_target_is_error() {
        let patcher = ClassPatcher::default();
        let err = patcher.patch(TARGET_CLASS, &[0xca, 0xfe]).unwrap_err();
        assert!(matches!(err, PatchError::Malformed { .. }));
        assert_eq!(err.class(), TARGET_CLASS);
    }

    #[test]
    fn test_missing_method_passes_through() {
        let mut class = ClassFile::new(TARGET_CLASS, "java/lang/Object").unwrap();
        class.add_method(0x0001, "other", "()V", None).unwrap();
        let outcome = ClassPatcher::default()
            .patch(TARGET_CLASS, &class.to_bytes())
            .unwrap();
        assert!(matches!(outcome, PatchOutcome::Unchanged(PassReason::MethodMissing)));
    }

    #[test]
    fn test_abstract_method_passes_through() {
        let outcome = ClassPatcher::default()
            .patch(TARGET_CLASS, &class_with(None))
            .unwrap();
        assert!(matches!(outcome, PatchOutcome::Unchanged(PassReason::NoCode)));
    }

    #[test]
    fn test_no_matches_returns_original_bytes() {
        let bytes = class_with(Some(logging_body(0, 7)));
        let outcome = ClassPatcher::default().patch(TARGET_CLASS, &bytes).unwrap();
        assert!(matches!(
            outcome,
            PatchOutcome::Unchanged(PassReason::NoMatches {
                log_sites_seen: 0,
                transform_sites_seen: 0,
            })
        ));
        assert_eq!(outcome.into_bytes(&bytes), bytes);
    }

    #[test]
    fn test_no_matches_counts_prologue_site() {
        let bytes = class_with(Some(logging_body(1, 7)));
        let outcome = ClassPatcher::default().patch(TARGET_CLASS, &bytes).unwrap();
        assert!(matches!(
            outcome,
            PatchOutcome::Unchanged(PassReason::NoMatches {
                log_sites_seen: 1,
                transform_sites_seen: 0,
            })
        ));
    }

    #[test]
    fn test_patch_inserts_name_probes() {
        let bytes = class_with(Some(logging_body(3, 7)));
        let outcome = ClassPatcher::default().patch(TARGET_CLASS, &bytes).unwrap();
        let PatchOutcome::Patched(patched) = outcome else {
            panic!("expected a patched class");
        };
        assert_eq!(patched.report.probes.len(), 2);
        assert_eq!(patched.max_stack_before, 2);
        assert_eq!(patched.max_stack_after, 2);

        let class = ClassFile::parse(&patched.bytes).unwrap();
        let index = class
            .find_method("runTransformers", "(Ljava/lang/String;Ljava/lang/String;[B)[B")
            .unwrap()
            .unwrap();
        let code = class.method_code(index).unwrap().unwrap();
        assert_eq!(code.body.instructions, patched.body.instructions);
        assert_eq!(code.body.max_locals, 7);
    }

    #[test]
    fn test_name_slot_out_of_range_is_verification_error() {
        let bytes = class_with(Some(logging_body(3, 4)));
        let err = ClassPatcher::default()
            .patch(TARGET_CLASS, &bytes)
            .unwrap_err();
        match err {
            PatchError::Verification {
                class,
                method,
                source,
            } => {
                assert_eq!(class, TARGET_CLASS);
                assert_eq!(method, "runTransformers(Ljava/lang/String;Ljava/lang/String;[B)[B");
                assert!(matches!(source, VerifyError::LocalOutOfRange { slot: 6, .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
