use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use metronome::classfile::ClassFile;
use metronome::cli::{Cli, Command, OutputFormat};
use metronome::config::PatchTarget;
use metronome::json_output::JsonInspection;
use metronome::patcher::{ClassPatcher, PatchOutcome};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

fn read_class(path: &Path) -> Result<(Vec<u8>, String)> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let class = ClassFile::parse(&bytes)
        .with_context(|| format!("{} is not a valid class file", path.display()))?;
    let name = class.name()?.to_string();
    Ok((bytes, name))
}

fn run_patch(
    patcher: &ClassPatcher,
    input: &Path,
    output: &Path,
    class_name: Option<String>,
) -> Result<()> {
    let (bytes, file_name) = read_class(input)?;
    let class_name = class_name.unwrap_or(file_name);

    let outcome = patcher.patch(&class_name, &bytes)?;
    match &outcome {
        PatchOutcome::Patched(patched) => eprintln!(
            "patched {}.{}: {} probe(s), max_stack {} -> {}",
            class_name,
            patcher.target().signature(),
            patched.report.probes.len(),
            patched.max_stack_before,
            patched.max_stack_after
        ),
        PatchOutcome::Unchanged(reason) => {
            eprintln!("{} passed through unchanged: {}", class_name, reason)
        }
    }

    fs::write(output, outcome.into_bytes(&bytes))
        .with_context(|| format!("failed to write {}", output.display()))?;
    Ok(())
}

fn run_inspect(patcher: &ClassPatcher, input: &Path, format: OutputFormat) -> Result<()> {
    let (bytes, class_name) = read_class(input)?;
    // Inspect always rewrites the method found in the file
    let patcher = ClassPatcher::new(
        PatchTarget {
            class_name: class_name.clone(),
            ..patcher.target().clone()
        },
        patcher.config().clone(),
    );
    let method = patcher.target().signature();

    let inspection = match patcher.patch(&class_name, &bytes)? {
        PatchOutcome::Patched(patched) => JsonInspection::patched(&class_name, &method, &patched),
        PatchOutcome::Unchanged(reason) => JsonInspection::unchanged(&class_name, &method, reason),
    };

    match format {
        OutputFormat::Text => print!("{}", inspection.to_text()),
        OutputFormat::Json => println!("{}", inspection.to_json()?),
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();

    // Initialize tracing if --debug flag is set
    init_tracing(args.debug);

    let config = args.rewrite_config();
    if let Err(msg) = config.validate() {
        anyhow::bail!("Invalid rewrite configuration: {}", msg);
    }
    let patcher = ClassPatcher::new(PatchTarget::default(), config);

    match args.command {
        Command::Patch {
            input,
            output,
            class_name,
        } => run_patch(&patcher, &input, &output, class_name),
        Command::Inspect { input, format } => run_inspect(&patcher, &input, format),
    }
}
