//! JSON output format for `inspect`

use serde::Serialize;

use crate::bytecode::{MethodBody, Slot};
use crate::patcher::{PassReason, Patched};
use crate::rewriter::ProbeSite;

/// One line of the rewritten listing
#[derive(Debug, Clone, Serialize)]
pub struct JsonInstruction {
    pub index: usize,
    /// Disassembled instruction (e.g. "aload 6")
    pub text: String,
    /// Added by the rewriter
    pub inserted: bool,
}

/// Result of inspecting one class file
#[derive(Debug, Clone, Serialize)]
pub struct JsonInspection {
    pub class: String,
    pub method: String,
    pub patched: bool,
    /// Why nothing was patched
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_stack_before: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_stack_after: Option<u16>,
    pub log_sites_seen: u32,
    pub transform_sites_seen: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub captured_slot: Option<Slot>,
    pub probes: Vec<ProbeSite>,
    pub instructions: Vec<JsonInstruction>,
}

impl JsonInspection {
    pub fn patched(class: &str, method: &str, patched: &Patched) -> Self {
        Self {
            class: class.to_string(),
            method: method.to_string(),
            patched: true,
            reason: None,
            max_stack_before: Some(patched.max_stack_before),
            max_stack_after: Some(patched.max_stack_after),
            log_sites_seen: patched.report.log_sites_seen,
            transform_sites_seen: patched.report.transform_sites_seen,
            captured_slot: patched.report.captured_slot,
            probes: patched.report.probes.clone(),
            instructions: listing(&patched.body, &patched.report.inserted),
        }
    }

    pub fn unchanged(class: &str, method: &str, reason: PassReason) -> Self {
        let (log_sites_seen, transform_sites_seen) = match reason {
            PassReason::NoMatches {
                log_sites_seen,
                transform_sites_seen,
            } => (log_sites_seen, transform_sites_seen),
            _ => (0, 0),
        };
        Self {
            class: class.to_string(),
            method: method.to_string(),
            patched: false,
            reason: Some(reason.to_string()),
            max_stack_before: None,
            max_stack_after: None,
            log_sites_seen,
            transform_sites_seen,
            captured_slot: None,
            probes: Vec::new(),
            instructions: Vec::new(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Human-readable rendering; inserted instructions are marked with `+`
    pub fn to_text(&self) -> String {
        let mut out = format!("{}.{}\n", self.class, self.method);
        if let Some(reason) = &self.reason {
            out.push_str(&format!("unchanged: {}\n", reason));
            out.push_str(&format!(
                "log sites: {}  transform sites: {}\n",
                self.log_sites_seen, self.transform_sites_seen
            ));
            return out;
        }
        for insn in &self.instructions {
            let marker = if insn.inserted { '+' } else { ' ' };
            out.push_str(&format!("{} {:>5}  {}\n", marker, insn.index, insn.text));
        }
        out.push_str(&format!(
            "\nlog sites: {}  transform sites: {}  probes: {}\n",
            self.log_sites_seen,
            self.transform_sites_seen,
            self.probes.len()
        ));
        if let Some(slot) = self.captured_slot {
            out.push_str(&format!("captured transformer slot: {}\n", slot));
        }
        if let (Some(before), Some(after)) = (self.max_stack_before, self.max_stack_after) {
            out.push_str(&format!("max_stack: {} -> {}\n", before, after));
        }
        out
    }
}

fn listing(body: &MethodBody, inserted: &[usize]) -> Vec<JsonInstruction> {
    body.instructions
        .iter()
        .enumerate()
        .map(|(index, insn)| JsonInstruction {
            index,
            text: insn.to_string(),
            inserted: inserted.binary_search(&index).is_ok(),
        })
        .collect()
}
