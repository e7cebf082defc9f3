//! Kiln CLI - Incremental build driver
//!
//! Commands:
//! - kiln run [targets]    - Execute the manifest's steps (incremental, parallel)
//! - kiln plan [targets]   - Show the execution order without running anything
//! - kiln hash <file>      - Fingerprint a single file
//! - kiln clear-cache      - Forget execution history and cached results

mod manifest;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kiln_core::hasher::Normalizer;
use kiln_core::{
    load_config, BuildListener, BuildRequest, CancellationToken, DigestAlgorithm, Engine, EngineConfig,
    FailurePolicy, Fingerprinter, NodeId, NodeOutcome, NodeState, Sensitivity,
};
use tracing::Level;

use crate::manifest::{load_manifest, MANIFEST_FILE};

/// Kiln - Incremental build execution engine
#[derive(Parser)]
#[command(name = "kiln", version, about = "Incremental, parallel build runner")]
struct Cli {
    /// More log output (repeatable)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Only print errors
    #[arg(short, long, global = true)]
    quiet: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the requested steps and their dependencies
    Run {
        /// Steps to build (default: all)
        targets: Vec<String>,
        /// Steps to leave out
        #[arg(short = 'x', long = "exclude")]
        exclude: Vec<String>,
        /// Max concurrent steps (default: CPU cores)
        #[arg(short, long)]
        workers: Option<usize>,
        /// Keep building independent steps after a failure
        #[arg(long = "continue")]
        keep_going: bool,
        /// Neither read nor write the build cache
        #[arg(long)]
        no_build_cache: bool,
        #[arg(short, long)]
        manifest: Option<PathBuf>,
    },
    /// Show the execution plan
    Plan {
        targets: Vec<String>,
        #[arg(short = 'x', long = "exclude")]
        exclude: Vec<String>,
        #[arg(short, long)]
        manifest: Option<PathBuf>,
    },
    /// Fingerprint a file
    Hash {
        file: PathBuf,
        #[arg(long, value_enum, default_value_t = SensitivityArg::Absolute)]
        sensitivity: SensitivityArg,
        /// Root for relative sensitivity (default: current directory)
        #[arg(long)]
        root: Option<PathBuf>,
        /// Digest algorithm id (blake3, sha1, sha256, sha512)
        #[arg(long, default_value = "blake3")]
        algorithm: String,
        #[arg(long)]
        normalize_line_endings: bool,
    },
    /// Clear execution history and the build cache
    ClearCache {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
        #[arg(short, long)]
        manifest: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SensitivityArg {
    Absolute,
    Relative,
    NameOnly,
    Content,
    Classpath,
}

impl From<SensitivityArg> for Normalizer {
    fn from(arg: SensitivityArg) -> Self {
        match arg {
            SensitivityArg::Absolute => Normalizer::AbsolutePath,
            SensitivityArg::Relative => Normalizer::RelativePath,
            SensitivityArg::NameOnly => Normalizer::NameOnly,
            SensitivityArg::Content => Normalizer::ContentOnly,
            SensitivityArg::Classpath => Normalizer::Classpath,
        }
    }
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => Level::ERROR,
        (false, 0) => Level::WARN,
        (false, 1) => Level::INFO,
        (false, 2) => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);
    let cwd = std::env::current_dir()?;

    match cli.command {
        Commands::Run {
            targets,
            exclude,
            workers,
            keep_going,
            no_build_cache,
            manifest,
        } => {
            let project = Project::locate(&cwd, manifest);
            let mut config = load_config(&project.root)?;
            if workers.is_some() {
                config.workers = workers;
            }
            if keep_going {
                config.failure_policy = FailurePolicy::Continue;
            }
            if no_build_cache {
                config.build_cache.enabled = false;
            }
            let ok = run(&project, config, targets, exclude, cli.quiet).await?;
            if !ok {
                std::process::exit(1);
            }
        }

        Commands::Plan {
            targets,
            exclude,
            manifest,
        } => {
            show_plan(&Project::locate(&cwd, manifest), targets, exclude)?;
        }

        Commands::Hash {
            file,
            sensitivity,
            root,
            algorithm,
            normalize_line_endings,
        } => {
            let algorithm: DigestAlgorithm = algorithm.parse()?;
            let mut policy = Sensitivity::new(sensitivity.into());
            if normalize_line_endings {
                policy = policy.normalize_line_endings();
            }
            let root = root.unwrap_or_else(|| cwd.clone());
            let file = if file.is_absolute() { file } else { cwd.join(file) };

            let fingerprint = Fingerprinter::new(algorithm).fingerprint(&file, &root, &policy)?;
            println!("🔑 {} ({})", fingerprint, algorithm);
        }

        Commands::ClearCache { yes, manifest } => {
            let confirmed = yes
                || dialoguer::Confirm::new()
                    .with_prompt("Delete execution history and cached build results?")
                    .default(false)
                    .interact()?;
            if !confirmed {
                println!("Aborted");
                return Ok(());
            }
            let project = Project::locate(&cwd, manifest);
            let engine = Engine::open(&project.root, load_config(&project.root)?)?;
            engine.clear_cache()?;
            println!("🗑️  Cache cleared!");
        }
    }

    Ok(())
}

fn request_of(targets: Vec<String>, exclude: Vec<String>) -> BuildRequest {
    let request = if targets.is_empty() {
        BuildRequest::all()
    } else {
        BuildRequest::targets(targets)
    };
    exclude.into_iter().fold(request, |request, id| request.exclude(id))
}

/// A manifest and the directory it lives in
///
/// The directory is the project root: steps run there, relative paths
/// resolve against it, and config and engine state are read from it.
struct Project {
    manifest: PathBuf,
    root: PathBuf,
}

impl Project {
    fn locate(cwd: &Path, manifest: Option<PathBuf>) -> Self {
        let manifest = cwd.join(manifest.unwrap_or_else(|| PathBuf::from(MANIFEST_FILE)));
        let root = manifest
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| cwd.to_path_buf());
        Self { manifest, root }
    }

    fn graph(&self) -> Result<kiln_core::WorkGraph> {
        load_manifest(&self.manifest)?.into_graph(&self.root)
    }
}

/// Prints one line per node as it starts and finishes
struct ConsoleListener {
    quiet: bool,
}

impl BuildListener for ConsoleListener {
    fn node_started(&self, node: &NodeId) {
        if !self.quiet {
            println!("▶ {}", node);
        }
    }

    fn node_finished(&self, outcome: &NodeOutcome) {
        if self.quiet && outcome.state != NodeState::Failed {
            return;
        }
        match outcome.state {
            NodeState::Succeeded => println!("✓ {} ({:?})", outcome.node, outcome.duration),
            NodeState::Skipped => match outcome.skip_reason {
                Some(reason) => println!("⏭ {} {}", outcome.node, reason),
                None => println!("⏭ {}", outcome.node),
            },
            NodeState::Failed => match &outcome.failure {
                Some(failure) => println!("❌ {} failed: {}", outcome.node, failure),
                None => println!("❌ {} failed", outcome.node),
            },
            NodeState::Cancelled => match &outcome.cancel_reason {
                Some(reason) => println!("⊘ {} cancelled: {}", outcome.node, reason),
                None => println!("⊘ {} cancelled", outcome.node),
            },
            _ => {}
        }
    }
}

/// Execute the manifest; returns whether every node succeeded or was skipped
async fn run(
    project: &Project,
    config: EngineConfig,
    targets: Vec<String>,
    exclude: Vec<String>,
    quiet: bool,
) -> Result<bool> {
    let start = Instant::now();
    let graph = project.graph()?;
    let engine = Engine::open(&project.root, config).context("Failed to open engine state")?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted; waiting for running steps...");
            on_interrupt.cancel();
        }
    });

    let listener = Arc::new(ConsoleListener { quiet });
    let result = engine
        .build_with(graph, &request_of(targets, exclude), &cancel, listener)
        .await?;
    let elapsed = start.elapsed();

    // Summary
    println!();
    let executed = result.count(NodeState::Succeeded);
    let skipped = result.count(NodeState::Skipped);
    let failures = result.failures();
    if result.is_success() {
        println!("✅ {} executed, {} up to date in {:?}", executed, skipped, elapsed);
    } else {
        println!(
            "❌ {} executed, {} up to date, {} failed, {} cancelled in {:?}",
            executed,
            skipped,
            failures.len(),
            result.count(NodeState::Cancelled),
            elapsed
        );
        for outcome in failures {
            if let Some(failure) = &outcome.failure {
                println!("   • {}: {}", outcome.node, failure);
            }
        }
    }
    Ok(result.is_success())
}

/// Show the linearized plan with predecessors and resources
fn show_plan(project: &Project, targets: Vec<String>, exclude: Vec<String>) -> Result<()> {
    let graph = project.graph()?;
    let engine = Engine::in_memory(EngineConfig::default());
    let plan = engine.plan(graph, &request_of(targets, exclude))?;

    println!("🔨 Execution order ({} steps):", plan.len());
    for (i, id) in plan.order().into_iter().enumerate() {
        let predecessors: Vec<String> = plan.predecessors(id).iter().map(|p| p.to_string()).collect();
        let resources: Vec<&str> = plan.resources_of(id).into_iter().map(|r| r.name.as_str()).collect();
        print!("   {}. {}", i + 1, id);
        if !predecessors.is_empty() {
            print!("  after: {}", predecessors.join(", "));
        }
        if !resources.is_empty() {
            print!("  holds: {}", resources.join(", "));
        }
        println!();
    }
    Ok(())
}
