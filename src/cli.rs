//! CLI argument parsing for Metronome

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::config::RewriteConfig;

/// Output format for `inspect`
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable listing (default)
    Text,
    /// JSON format for machine parsing
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "metronome")]
#[command(version)]
#[command(
    about = "Instrument class-loader transformer calls with timing probes",
    long_about = None
)]
pub struct Cli {
    /// Enable debug tracing output to stderr
    #[arg(long, global = true)]
    pub debug: bool,

    /// Local slot holding the class name in the target method
    #[arg(long = "name-slot", value_name = "SLOT", global = true)]
    pub name_slot: Option<u16>,

    /// Number of leading log sites to skip before the timed region
    #[arg(long = "prologue-markers", value_name = "N", global = true)]
    pub prologue_markers: Option<u32>,

    /// Log sites that must be seen before transformer calls are probed
    #[arg(long = "transform-phase-after", value_name = "N", global = true)]
    pub transform_phase_after: Option<u32>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Rewrite a .class file, writing the result to OUTPUT
    Patch {
        /// Input .class file
        input: PathBuf,

        /// Output .class file
        #[arg(short, long, value_name = "OUTPUT")]
        output: PathBuf,

        /// Class name to patch as (defaults to the name inside the file)
        #[arg(long = "class-name", value_name = "NAME")]
        class_name: Option<String>,
    },

    /// Show the target method after rewriting, without writing anything
    Inspect {
        /// Input .class file
        input: PathBuf,

        /// Output format (text or json)
        #[arg(long = "format", value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

impl Cli {
    /// Default rewrite configuration with command-line overrides applied
    pub fn rewrite_config(&self) -> RewriteConfig {
        let mut config = RewriteConfig::default();
        if let Some(slot) = self.name_slot {
            config.name_slot = slot;
        }
        if let Some(markers) = self.prologue_markers {
            config.prologue_markers = markers;
        }
        if let Some(after) = self.transform_phase_after {
            config.transform_phase_after = after;
        }
        config
    }
}
