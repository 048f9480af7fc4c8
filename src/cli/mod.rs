//! ST-090: CLI subcommands: init, validate, synth, plan, apply, destroy,
//! inspect, import, unlock.

use crate::core::orchestrator::{Outcome, RunReport};
use crate::core::project::{self, Project};
use crate::core::synth::Ir;
use crate::engine::CancelHandle;
use crate::error::{Error, Result};
use crate::state::{Lock, StateBackend};
use clap::{Args, Subcommand, ValueEnum};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Namespace file and template selection shared by most commands.
#[derive(Args, Debug, Clone)]
pub struct Target {
    /// Path to strata.yaml
    #[arg(short, long, default_value = "strata.yaml")]
    pub file: PathBuf,

    /// Restrict to one template
    #[arg(short, long)]
    pub template: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new strata project
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Namespace name
        #[arg(short, long, default_value = "default")]
        namespace: String,
    },

    /// Validate strata.yaml and every declaration without running the engine
    Validate {
        /// Path to strata.yaml
        #[arg(short, long, default_value = "strata.yaml")]
        file: PathBuf,
    },

    /// Write the engine configuration for each template
    Synth {
        #[command(flatten)]
        target: Target,

        /// Output directory (default: .strata/synth next to strata.yaml)
        #[arg(long)]
        out: Option<PathBuf>,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,
    },

    /// Show what the engine would change (takes no lock)
    Plan {
        #[command(flatten)]
        target: Target,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,
    },

    /// Apply changes, template by template in dependency order
    Apply {
        #[command(flatten)]
        target: Target,

        /// Skip the confirmation prompt
        #[arg(long)]
        auto_approve: bool,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,
    },

    /// Destroy managed infrastructure, dependents first
    Destroy {
        #[command(flatten)]
        target: Target,

        /// Skip the confirmation prompt
        #[arg(long)]
        auto_approve: bool,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,
    },

    /// Show stored state and lock status
    Inspect {
        #[command(flatten)]
        target: Target,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,
    },

    /// Adopt an existing object into a template's state
    Import {
        /// Path to strata.yaml
        #[arg(short, long, default_value = "strata.yaml")]
        file: PathBuf,

        /// Template owning the resource
        #[arg(short, long)]
        template: String,

        /// Resource address (`type.name`)
        address: String,

        /// Provider-side id of the existing object
        id: String,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,
    },

    /// Remove a stale or abandoned lock
    Unlock {
        /// Path to strata.yaml
        #[arg(short, long, default_value = "strata.yaml")]
        file: PathBuf,

        /// Template whose lock to remove
        #[arg(short, long)]
        template: String,

        /// Id of the lock to remove; must match the current lock
        #[arg(long)]
        lock_id: String,

        /// Skip the confirmation prompt
        #[arg(long)]
        auto_approve: bool,
    },
}

/// Dispatch a CLI command.
pub async fn dispatch(cmd: Commands) -> Result<()> {
    match cmd {
        Commands::Init { path, namespace } => cmd_init(&path, &namespace),
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Synth {
            target,
            out,
            output,
        } => cmd_synth(&target, out.as_deref(), output),
        Commands::Plan { target, output } => cmd_plan(&target, output).await,
        Commands::Apply {
            target,
            auto_approve,
            output,
        } => cmd_apply(&target, auto_approve, output, interrupt_on_ctrl_c()).await,
        Commands::Destroy {
            target,
            auto_approve,
            output,
        } => cmd_destroy(&target, auto_approve, output, interrupt_on_ctrl_c()).await,
        Commands::Inspect { target, output } => cmd_inspect(&target, output),
        Commands::Import {
            file,
            template,
            address,
            id,
            output,
        } => cmd_import(&file, &template, &address, &id, output, interrupt_on_ctrl_c()).await,
        Commands::Unlock {
            file,
            template,
            lock_id,
            auto_approve,
        } => cmd_unlock(&file, &template, &lock_id, auto_approve),
    }
}

/// Cancellation handle tripped by the first Ctrl-C.
fn interrupt_on_ctrl_c() -> CancelHandle {
    let cancel = CancelHandle::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupt received; waiting for the engine to stop...");
            trigger.cancel();
        }
    });
    cancel
}

fn confirm(prompt: &str, auto_approve: bool) -> Result<bool> {
    if auto_approve {
        return Ok(true);
    }
    dialoguer::Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()
        .map_err(|e| Error::Aborted(format!("{} (use --auto-approve in non-interactive sessions)", e)))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cmd_init(path: &Path, namespace: &str) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config_path = project::init_project(path, namespace)?;
    println!("Initialized strata project at {}", path.display());
    println!("  Created: {}", config_path.display());
    println!("  Created: {}/", path.join(project::STRATA_DIR).join("state").display());
    Ok(())
}

/// Load, evaluate and synthesize: everything short of the engine.
fn prepare(file: &Path, template: Option<&str>) -> Result<(Project, Vec<Ir>)> {
    let project = Project::load(file)?;
    let eval = project.evaluate()?;
    for e in &eval.module_errors {
        eprintln!("  ERROR: {}", e);
    }
    let irs = project.synthesize(&eval, template)?;
    Ok((project, irs))
}

fn cmd_validate(file: &Path) -> Result<()> {
    let (project, irs) = prepare(file, None)?;
    let resources: usize = irs.iter().map(Ir::resource_count).sum();
    println!(
        "OK: {} ({} templates, {} resources)",
        project.namespace(),
        irs.len(),
        resources
    );
    Ok(())
}

#[derive(Serialize)]
struct SynthEntry {
    template: String,
    path: PathBuf,
    fingerprint: String,
    resources: usize,
}

fn cmd_synth(target: &Target, out: Option<&Path>, output: OutputFormat) -> Result<()> {
    let (project, irs) = prepare(&target.file, target.template.as_deref())?;
    let out_dir = out
        .map(Path::to_path_buf)
        .unwrap_or_else(|| project.root().join(project::STRATA_DIR).join("synth"));
    let paths = project.write_ir(&out_dir, &irs)?;
    let entries: Vec<SynthEntry> = irs
        .iter()
        .zip(paths)
        .map(|(ir, path)| SynthEntry {
            template: ir.template().to_string(),
            path,
            fingerprint: ir.fingerprint(),
            resources: ir.resource_count(),
        })
        .collect();
    match output {
        OutputFormat::Json => print_json(&entries),
        OutputFormat::Text => {
            for e in &entries {
                println!(
                    "{}: {} resources -> {} ({})",
                    e.template,
                    e.resources,
                    e.path.display(),
                    e.fingerprint
                );
            }
            Ok(())
        }
    }
}

fn print_report(report: &RunReport, show_engine_output: bool) {
    if show_engine_output && !report.plan_output.trim().is_empty() {
        println!("{}", report.plan_output.trim_end());
    }
    let outcome = match report.outcome {
        Outcome::NoChanges => "no changes".to_string(),
        Outcome::ChangesPlanned => match report.summary {
            Some(s) => format!("{} to add, {} to change, {} to destroy", s.add, s.change, s.destroy),
            None => "changes pending".to_string(),
        },
        Outcome::ChangesApplied => match report.serial {
            Some(serial) => format!("applied (state serial {})", serial),
            None => "applied".to_string(),
        },
        Outcome::Imported => "imported".to_string(),
    };
    println!(
        "{}/{}: {} ({:.1}s)",
        report.namespace, report.template, outcome, report.duration_seconds
    );
    if let Some(cost) = &report.cost {
        println!("  Estimated cost: {:.2} {}/month", cost.monthly_total, cost.currency);
    }
}

fn finish(reports: &[RunReport], output: OutputFormat, show_engine_output: bool) -> Result<()> {
    match output {
        OutputFormat::Json => print_json(&reports),
        OutputFormat::Text => {
            for r in reports {
                print_report(r, show_engine_output);
            }
            Ok(())
        }
    }
}

async fn cmd_plan(target: &Target, output: OutputFormat) -> Result<()> {
    let (project, irs) = prepare(&target.file, target.template.as_deref())?;
    let backend = project.open_backend()?;
    let orch = project.orchestrator(backend.as_ref(), CancelHandle::new());
    let mut reports = Vec::new();
    for ir in &irs {
        reports.push(orch.plan(&project.key(ir.template()), ir).await?);
    }
    finish(&reports, output, true)
}

async fn cmd_apply(
    target: &Target,
    auto_approve: bool,
    output: OutputFormat,
    cancel: CancelHandle,
) -> Result<()> {
    let (project, irs) = prepare(&target.file, target.template.as_deref())?;
    let names: Vec<&str> = irs.iter().map(Ir::template).collect();
    let prompt = format!(
        "Apply {} template(s) [{}] in namespace '{}'?",
        irs.len(),
        names.join(", "),
        project.namespace()
    );
    if !confirm(&prompt, auto_approve)? {
        println!("Apply cancelled.");
        return Ok(());
    }

    let backend = project.open_backend()?;
    let orch = project.orchestrator(backend.as_ref(), cancel);
    let mut reports = Vec::new();
    for ir in &irs {
        let report = orch.apply(&project.key(ir.template()), ir).await?;
        if output == OutputFormat::Text {
            print_report(&report, false);
        }
        reports.push(report);
    }
    match output {
        OutputFormat::Json => print_json(&reports),
        OutputFormat::Text => {
            let applied = reports
                .iter()
                .filter(|r| r.outcome == Outcome::ChangesApplied)
                .count();
            println!();
            println!(
                "Apply complete: {} changed, {} unchanged.",
                applied,
                reports.len() - applied
            );
            Ok(())
        }
    }
}

async fn cmd_destroy(
    target: &Target,
    auto_approve: bool,
    output: OutputFormat,
    cancel: CancelHandle,
) -> Result<()> {
    let (project, mut irs) = prepare(&target.file, target.template.as_deref())?;
    // dependents go first
    irs.reverse();
    let names: Vec<&str> = irs.iter().map(Ir::template).collect();
    let prompt = format!(
        "Destroy every resource in [{}] of namespace '{}'? This cannot be undone",
        names.join(", "),
        project.namespace()
    );
    if !confirm(&prompt, auto_approve)? {
        println!("Destroy cancelled.");
        return Ok(());
    }

    let backend = project.open_backend()?;
    let orch = project.orchestrator(backend.as_ref(), cancel);
    let mut reports = Vec::new();
    for ir in &irs {
        reports.push(orch.destroy(&project.key(ir.template()), ir).await?);
    }
    finish(&reports, output, false)
}

async fn cmd_import(
    file: &Path,
    template: &str,
    address: &str,
    id: &str,
    output: OutputFormat,
    cancel: CancelHandle,
) -> Result<()> {
    let (project, irs) = prepare(file, Some(template))?;
    let ir = irs
        .first()
        .ok_or_else(|| Error::UnknownTemplate(template.to_string()))?;
    let backend = project.open_backend()?;
    let orch = project.orchestrator(backend.as_ref(), cancel);
    let report = orch.import(&project.key(template), ir, address, id).await?;
    finish(&[report], output, false)
}

#[derive(Serialize)]
struct InspectEntry {
    template: String,
    state: Option<StateSummary>,
    lock: Option<Lock>,
}

#[derive(Serialize)]
struct StateSummary {
    serial: u64,
    generated_at: String,
    generator: String,
    ir_fingerprint: String,
    outputs: BTreeMap<String, serde_json::Value>,
}

fn inspect_entries(project: &Project, backend: &dyn StateBackend, template: Option<&str>) -> Result<Vec<InspectEntry>> {
    let templates: Vec<String> = match template {
        Some(t) if !project.config().templates.contains_key(t) => {
            return Err(Error::UnknownTemplate(t.to_string()))
        }
        Some(t) => vec![t.to_string()],
        None => project.config().templates.keys().cloned().collect(),
    };
    templates
        .into_iter()
        .map(|t| {
            let key = project.key(&t);
            let state = backend.read(&key)?.map(|r| StateSummary {
                serial: r.serial,
                generated_at: r.generated_at,
                generator: r.generator,
                ir_fingerprint: r.ir_fingerprint,
                outputs: r.outputs,
            });
            let lock = backend.lock_info(&key)?;
            Ok(InspectEntry {
                template: t,
                state,
                lock,
            })
        })
        .collect()
}

fn cmd_inspect(target: &Target, output: OutputFormat) -> Result<()> {
    let project = Project::load(&target.file)?;
    let backend = project.open_backend()?;
    let entries = inspect_entries(&project, backend.as_ref(), target.template.as_deref())?;
    if output == OutputFormat::Json {
        return print_json(&entries);
    }

    println!("Namespace: {} [{}]", project.namespace(), backend.describe());
    let now = crate::audit::eventlog::unix_now();
    for e in &entries {
        println!("{}:", e.template);
        match &e.state {
            Some(s) => {
                println!("  Serial:      {}", s.serial);
                println!("  Generated:   {}", s.generated_at);
                println!("  Generator:   {}", s.generator);
                println!("  Fingerprint: {}", s.ir_fingerprint);
                for (name, value) in &s.outputs {
                    println!("    {} = {}", name, value);
                }
            }
            None => println!("  (not applied)"),
        }
        if let Some(lock) = &e.lock {
            println!(
                "  LOCKED by {} (lock {}, held {}s, ttl {}s)",
                lock.owner,
                lock.id,
                lock.age(now),
                lock.ttl_secs
            );
        }
    }
    Ok(())
}

fn cmd_unlock(file: &Path, template: &str, lock_id: &str, auto_approve: bool) -> Result<()> {
    let project = Project::load(file)?;
    if !project.config().templates.contains_key(template) {
        return Err(Error::UnknownTemplate(template.to_string()));
    }
    let backend = project.open_backend()?;
    let key = project.key(template);
    let prompt = format!(
        "Remove lock {} on {}? Only do this if its owner is no longer running",
        lock_id, key
    );
    if !confirm(&prompt, auto_approve)? {
        println!("Unlock cancelled.");
        return Ok(());
    }
    let orch = project.orchestrator(backend.as_ref(), CancelHandle::new());
    let removed = orch.force_unlock(&key, lock_id)?;
    println!("Removed lock {} held by {} on {}", removed.id, removed.owner, key);
    Ok(())
}
