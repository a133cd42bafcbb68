//! flowlint: static security analysis for GitHub Actions workflows.

use std::process::ExitCode;

use anstream::println;
use anyhow::{Context as _, Result, anyhow};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, ValueEnum};

use crate::config::Config;
use crate::finding::Severity;
use crate::registry::input::{InputKey, InputRegistry};
use crate::registry::{AuditRegistry, FindingRegistry};
use crate::state::AuditState;

mod audit;
mod conditions;
mod config;
mod finding;
mod fix;
mod models;
mod output;
mod registry;
mod shell;
mod state;
mod taint;
mod utils;

#[derive(Copy, Clone, Debug, Default, ValueEnum)]
enum OutputFormat {
    /// Cargo-style annotated snippets.
    #[default]
    Plain,
    /// A JSON array of findings.
    Json,
}

/// Static security analysis for GitHub Actions workflows.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Workflow files or repository directories to analyze.
    #[arg(required = true)]
    inputs: Vec<Utf8PathBuf>,

    /// Path to a flowlint.yml configuration file.
    #[arg(long)]
    config: Option<Utf8PathBuf>,

    /// Apply available auto-fixes in place.
    #[arg(long)]
    fix: bool,

    /// Ignore findings below this severity.
    #[arg(long, value_enum)]
    min_severity: Option<Severity>,

    /// The output format.
    #[arg(long, value_enum, default_value_t)]
    format: OutputFormat,

    /// Fail on malformed inputs instead of skipping them.
    #[arg(long)]
    strict: bool,

    #[command(flatten)]
    verbose: clap_verbosity_flag::Verbosity,
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(args.verbose.tracing_level_filter())
        .init();

    match run(&args) {
        Ok(exit) => exit,
        Err(e) => {
            anstream::eprintln!("fatal: {e:?}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<ExitCode> {
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => {
            let default = Utf8Path::new("flowlint.yml");
            if default.is_file() {
                Config::load(default)?
            } else {
                Config::default()
            }
        }
    };

    let mut inputs = InputRegistry::new(args.strict);
    collect_inputs(&args.inputs, &mut inputs)?;

    if inputs.len() == 0 {
        return Err(anyhow!("no workflow files found in the given inputs"));
    }

    let repo_root = find_repo_root(&args.inputs);
    let state = AuditState::new(repo_root, config.extra_allowed_endpoints.clone());
    let audits = AuditRegistry::default_audits(&state)?;

    tracing::debug!(
        "running {naudits} audits over {ninputs} inputs",
        naudits = audits.len(),
        ninputs = inputs.len()
    );

    let mut findings = FindingRegistry::new(&config, args.min_severity);
    for (_, workflow) in inputs.iter_inputs() {
        findings.extend(audits.audit_workflow(workflow));
    }

    // Fixes apply in rule-registration order (the accumulation order);
    // emission order is positional.
    if args.fix {
        fix::apply_fixes(&findings, &inputs)?;
    }

    findings.sort();

    match args.format {
        OutputFormat::Plain => output::plain::render_findings(&inputs, &findings),
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&output::json::render_findings(&findings))?
            );
        }
    }

    Ok(findings.exit_code())
}

/// Collects workflow inputs: explicit files are taken as-is, while
/// directories contribute their `.github/workflows` contents.
fn collect_inputs(paths: &[Utf8PathBuf], registry: &mut InputRegistry) -> Result<()> {
    for path in paths {
        if path.is_file() {
            register_file(registry, path, None)?;
        } else if path.is_dir() {
            let workflows = path.join(".github").join("workflows");
            if !workflows.is_dir() {
                tracing::warn!("{path} has no .github/workflows directory");
                continue;
            }

            // `ignore` respects .gitignore and friends while walking.
            for entry in ignore::WalkBuilder::new(&workflows).build() {
                let entry = entry?;
                let Some(file) = Utf8Path::from_path(entry.path()) else {
                    continue;
                };

                if file.is_file()
                    && matches!(file.extension(), Some("yml") | Some("yaml"))
                {
                    register_file(registry, &file.to_path_buf(), Some(path))?;
                }
            }
        } else {
            return Err(anyhow!("input {path} is neither a file nor a directory"));
        }
    }

    Ok(())
}

fn register_file(
    registry: &mut InputRegistry,
    path: &Utf8PathBuf,
    prefix: Option<&Utf8PathBuf>,
) -> Result<()> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("couldn't read {path}"))?;
    let key = InputKey::local(path.clone(), prefix.cloned())?;
    registry.register(contents, key)
}

/// The nearest ancestor (or given directory) containing `.github`, used
/// to resolve reusable workflows and the dependabot config.
fn find_repo_root(paths: &[Utf8PathBuf]) -> Option<Utf8PathBuf> {
    for path in paths {
        if path.is_dir() && path.join(".github").is_dir() {
            return Some(path.clone());
        }

        let mut ancestor = path.parent();
        while let Some(dir) = ancestor {
            if dir.join(".github").is_dir() {
                return Some(dir.to_path_buf());
            }
            ancestor = dir.parent();
        }
    }

    None
}
