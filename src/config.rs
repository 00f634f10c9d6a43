//! Rewrite configuration
//!
//! The defaults are the production values for the LaunchWrapper class
//! loader. Every field can be overridden for other loaders or for tests.
//!
//! # Example
//!
//! ```
//! use metronome::config::RewriteConfig;
//!
//! let config = RewriteConfig::default();
//! assert_eq!(config.name_slot, 6);
//! assert!(config.validate().is_ok());
//! ```

use serde::{Deserialize, Serialize};

use crate::bytecode::{MemberRef, Slot};

pub const TARGET_CLASS: &str = "net/minecraft/launchwrapper/LaunchClassLoader";
pub const TARGET_METHOD: &str = "runTransformers";
pub const TARGET_DESCRIPTOR: &str = "(Ljava/lang/String;Ljava/lang/String;[B)[B";

pub const LOG_OWNER: &str = "net/minecraft/launchwrapper/LogWrapper";
pub const LOG_NAME: &str = "finest";
pub const LOG_DESCRIPTOR: &str = "(Ljava/lang/String;[Ljava/lang/Object;)V";

pub const TRANSFORMER_TYPE: &str = "net/minecraft/launchwrapper/IClassTransformer";
pub const TRANSFORM_NAME: &str = "transform";

pub const PROBE_OWNER: &str = "org/spongepowered/metronome/Agent";
pub const PROBE_BEFORE: &str = "before";
pub const PROBE_AFTER: &str = "after";
pub const NAME_PROBE_DESCRIPTOR: &str = "(Ljava/lang/String;)V";
pub const INSTANCE_PROBE_DESCRIPTOR: &str = "(Ljava/lang/Object;)V";

/// Class and method the patcher rewrites
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchTarget {
    /// Internal (slash-separated) class name
    pub class_name: String,
    pub method_name: String,
    pub method_descriptor: String,
}

impl Default for PatchTarget {
    fn default() -> Self {
        Self {
            class_name: TARGET_CLASS.to_string(),
            method_name: TARGET_METHOD.to_string(),
            method_descriptor: TARGET_DESCRIPTOR.to_string(),
        }
    }
}

impl PatchTarget {
    /// `name+descriptor`, as used in diagnostics
    pub fn signature(&self) -> String {
        format!("{}{}", self.method_name, self.method_descriptor)
    }
}

/// Invoke target to match; `descriptor: None` matches any descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSite {
    pub owner: String,
    pub name: String,
    pub descriptor: Option<String>,
}

impl CallSite {
    pub fn new(owner: &str, name: &str, descriptor: Option<&str>) -> Self {
        Self {
            owner: owner.to_string(),
            name: name.to_string(),
            descriptor: descriptor.map(str::to_string),
        }
    }

    pub fn matches(&self, target: &MemberRef) -> bool {
        self.owner == target.owner
            && self.name == target.name
            && self
                .descriptor
                .as_deref()
                .map_or(true, |d| d == target.descriptor)
    }
}

/// Everything the rewriter needs to recognize sites and emit probes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteConfig {
    /// Diagnostic-log call marking the per-class region
    pub log_call: CallSite,

    /// Per-transformer apply call
    pub transform_call: CallSite,

    /// Class named by the type check that precedes the transformer store
    pub transformer_type: String,

    /// Owner of the static `before`/`after` probe methods
    pub probe_owner: String,

    /// Local slot holding the class name inside the target method
    ///
    /// Default: 6
    pub name_slot: Slot,

    /// Leading diagnostic-log sites that are not part of the timed region
    ///
    /// Sites are numbered from 0 in encounter order. Site `prologue_markers`
    /// opens the region and the next one closes it. Default: 1
    pub prologue_markers: u32,

    /// Transformer probes are only emitted once the number of log sites
    /// seen exceeds this
    ///
    /// Default: 3
    pub transform_phase_after: u32,
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            log_call: CallSite::new(LOG_OWNER, LOG_NAME, Some(LOG_DESCRIPTOR)),
            transform_call: CallSite::new(TRANSFORMER_TYPE, TRANSFORM_NAME, None),
            transformer_type: TRANSFORMER_TYPE.to_string(),
            probe_owner: PROBE_OWNER.to_string(),
            name_slot: 6,
            prologue_markers: 1,
            transform_phase_after: 3,
        }
    }
}

impl RewriteConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.transform_phase_after < self.prologue_markers + 2 {
            return Err(format!(
                "transform_phase_after ({}) must leave room for the {} prologue marker(s) and both name probes",
                self.transform_phase_after, self.prologue_markers
            ));
        }
        for (field, value) in [
            ("probe_owner", &self.probe_owner),
            ("transformer_type", &self.transformer_type),
            ("log_call.owner", &self.log_call.owner),
            ("transform_call.owner", &self.transform_call.owner),
        ] {
            if value.is_empty() || value.contains('.') {
                return Err(format!(
                    "{} must be an internal class name, got {:?}",
                    field, value
                ));
            }
        }
        Ok(())
    }

    /// Ordinal of the log site that gets the opening name probe
    pub fn open_ordinal(&self) -> u32 {
        self.prologue_markers
    }

    /// Ordinal of the log site that gets the closing name probe
    pub fn close_ordinal(&self) -> u32 {
        self.prologue_markers + 1
    }

    pub fn name_probe(&self, phase: Phase) -> MemberRef {
        MemberRef::new(&self.probe_owner, phase.method(), NAME_PROBE_DESCRIPTOR)
    }

    pub fn instance_probe(&self, phase: Phase) -> MemberRef {
        MemberRef::new(&self.probe_owner, phase.method(), INSTANCE_PROBE_DESCRIPTOR)
    }
}

/// Which side of a timed region a probe marks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Before,
    After,
}

impl Phase {
    pub fn method(self) -> &'static str {
        match self {
            Phase::Before => PROBE_BEFORE,
            Phase::After => PROBE_AFTER,
        }
    }
}
