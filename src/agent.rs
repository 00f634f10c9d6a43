//! Load-time interceptor and agent registration
//!
//! The host runtime is modelled by two traits: [`Instrumentation`] accepts
//! transformer registrations, and [`ClassFileTransformer`] is called for
//! every class load. [`LoadInterceptor`] forwards only the target class to
//! the [`ClassPatcher`]; [`premain`] registers it once per process.

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use crate::config::{PatchTarget, RewriteConfig};
use crate::patcher::{ClassPatcher, PatchError, PatchOutcome};

/// Class loader a load event comes from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoaderContext {
    /// Loader name, when the host has one
    pub name: Option<String>,
}

/// Called by the host for each class it loads
pub trait ClassFileTransformer: Send + Sync {
    /// Return the bytes to define, borrowed when unchanged
    ///
    /// An error aborts this one class load; how the host reacts is up to it.
    fn transform<'a>(
        &self,
        loader: Option<&LoaderContext>,
        class_name: &str,
        bytes: &'a [u8],
    ) -> Result<Cow<'a, [u8]>, PatchError>;
}

/// Host class-transformation facility
pub trait Instrumentation {
    fn add_transformer(&self, transformer: Arc<dyn ClassFileTransformer>, can_retransform: bool);
}

/// Transformer that patches the target class and passes everything else
#[derive(Debug, Default)]
pub struct LoadInterceptor {
    patcher: ClassPatcher,
}

impl LoadInterceptor {
    pub fn new(patcher: ClassPatcher) -> Self {
        Self { patcher }
    }

    pub fn patcher(&self) -> &ClassPatcher {
        &self.patcher
    }
}

impl ClassFileTransformer for LoadInterceptor {
    fn transform<'a>(
        &self,
        loader: Option<&LoaderContext>,
        class_name: &str,
        bytes: &'a [u8],
    ) -> Result<Cow<'a, [u8]>, PatchError> {
        if !self.patcher.is_target(class_name) {
            return Ok(Cow::Borrowed(bytes));
        }

        let loader_name = loader.and_then(|l| l.name.as_deref()).unwrap_or("<bootstrap>");
        tracing::debug!(class = class_name, loader = loader_name, "intercepted target class");

        match self.patcher.patch(class_name, bytes) {
            Ok(PatchOutcome::Patched(patched)) => Ok(Cow::Owned(patched.bytes)),
            Ok(PatchOutcome::Unchanged(reason)) => {
                tracing::debug!(class = class_name, %reason, "target class left unchanged");
                Ok(Cow::Borrowed(bytes))
            }
            Err(err) => {
                match &err {
                    PatchError::Malformed { class, source } => {
                        tracing::error!(
                            class = %class,
                            error = %source,
                            "cannot parse target class"
                        );
                    }
                    PatchError::Verification {
                        class,
                        method,
                        source,
                    } => {
                        tracing::error!(
                            class = %class,
                            method = %method,
                            error = %source,
                            "rewritten method failed verification"
                        );
                    }
                }
                Err(err)
            }
        }
    }
}

/// Registers one interceptor with a host, at most once
#[derive(Debug)]
pub struct Agent {
    interceptor: Arc<LoadInterceptor>,
    installed: AtomicBool,
}

impl Agent {
    pub fn new(target: PatchTarget, config: RewriteConfig) -> Self {
        Self {
            interceptor: Arc::new(LoadInterceptor::new(ClassPatcher::new(target, config))),
            installed: AtomicBool::new(false),
        }
    }

    pub fn interceptor(&self) -> &Arc<LoadInterceptor> {
        &self.interceptor
    }

    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::SeqCst)
    }

    /// Register with `instrumentation`; returns false if already registered
    pub fn install(&self, instrumentation: &dyn Instrumentation) -> bool {
        if self.installed.swap(true, Ordering::SeqCst) {
            tracing::debug!("agent already installed");
            return false;
        }
        instrumentation.add_transformer(self.interceptor.clone(), true);
        tracing::info!(
            target_class = %self.interceptor.patcher().target().class_name,
            "metronome agent installed"
        );
        true
    }
}

impl Default for Agent {
    fn default() -> Self {
        Self::new(PatchTarget::default(), RewriteConfig::default())
    }
}

static AGENT: OnceLock<Agent> = OnceLock::new();

/// Process-wide agent
pub fn agent() -> &'static Agent {
    AGENT.get_or_init(Agent::default)
}

/// Agent entry point; the argument string is accepted and ignored
pub fn premain(_args: Option<&str>, instrumentation: &dyn Instrumentation) -> bool {
    agent().install(instrumentation)
}
