//! CLI surface and node orchestration.
//!
//! The same binary plays every role in a deployment. Flags select which
//! lifecycle operations run: `-s` serves workers and clients, `-g` registers
//! as a worker with an upstream coordinator, `-r` issues trials through an
//! upstream coordinator, and `-x` runs experiments from this node. `-i`
//! skips execution entirely and feeds previously collected results into the
//! output (and optional analysis) path.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use royale_core::{Analysis, AnalysisType, Experiment, Runner, Trial};
use serde::Serialize;
use serde_json::Value as Json;
use tracing::{debug, info};

const EXPERIMENT_EXTENSION: &str = ".experiment.json";

#[derive(Parser, Debug)]
#[command(name = "royale", about = "Experiment runner for the Royale SMC system")]
pub struct Cli {
    /// Load every file ending .experiment.json in DIR as an experiment.
    #[arg(short = 'd', long = "directory", value_name = "DIR")]
    pub directory: Vec<PathBuf>,

    /// Load one experiment file, JSON format.
    #[arg(short = 'f', long = "file", value_name = "FILE")]
    pub file: Vec<PathBuf>,

    /// Load one experiment definition from inline JSON.
    #[arg(short = 'j', long = "json", value_name = "JSON")]
    pub json: Vec<String>,

    /// Change directory at startup, before loading anything.
    #[arg(short = 'C', long = "cd", value_name = "DIR")]
    pub cd: Option<PathBuf>,

    /// Run the named experiment and print the JSON results to stdout.
    #[arg(short = 'x', long = "exec", value_name = "NAME")]
    pub exec: Vec<String>,

    /// Run every --exec experiment N times before exiting.
    #[arg(short = 'R', long = "repeat", value_name = "N", default_value_t = 1)]
    pub repeat: u32,

    /// Listen for workers and clients on "host:port" (default host
    /// 127.0.0.1).
    #[arg(short = 's', long = "serve", value_name = "HOST:PORT")]
    pub serve: Option<String>,

    /// Register as a worker with the given coordinator.
    #[arg(short = 'g', long = "register", value_name = "HOST:PORT")]
    pub register: Option<String>,

    /// Issue trials through the given upstream coordinator instead of
    /// running locally.
    #[arg(short = 'r', long = "remote", value_name = "HOST:PORT")]
    pub remote: Option<String>,

    /// Run every --exec as a batch over all registered workers. Requires
    /// --remote.
    #[arg(short = 'B', long = "batch")]
    pub batch: bool,

    /// Skip execution; read results JSON from FILE ("-" reads stdin).
    #[arg(short = 'i', long = "input", value_name = "FILE")]
    pub input: Option<String>,

    /// Analyze the results with the named engine: logistic_regression
    /// (logreg).
    #[arg(short = 'A', long = "analysis", value_name = "NAME")]
    pub analysis: Option<String>,

    /// Pretty-print JSON output with an N-space indent.
    #[arg(
        short = 'P',
        long = "pretty",
        value_name = "N",
        default_value_t = -1,
        num_args = 0..=1,
        default_missing_value = "2"
    )]
    pub pretty: i32,

    /// Log level: 0 (off), 1 (critical), 2 (err), 3 (warn), 4 (info),
    /// 5 (debug), or 6 (trace).
    #[arg(short = 'l', long = "log", value_name = "N", default_value_t = 4)]
    pub log: i32,
}

pub async fn run(args: Cli) -> Result<()> {
    if let Some(cd) = &args.cd {
        std::env::set_current_dir(cd)
            .with_context(|| format!("changing directory to {}", cd.display()))?;
    }

    let runner = Arc::new(Runner::new());
    for dir in &args.directory {
        load_directory(&runner, dir)?;
    }
    for file in &args.file {
        info!(file = %file.display(), "adding experiment file");
        let doc = std::fs::read_to_string(file)
            .with_context(|| format!("reading {}", file.display()))?;
        add_json(&runner, &doc, None)?;
    }
    for doc in &args.json {
        add_json(&runner, doc, None)?;
    }

    let mut keep_serving = false;
    if let Some(endpoint) = &args.serve {
        let (host, port) = parse_host_port(endpoint)?;
        Arc::clone(&runner).launch_listener(&host, port).await?;
        keep_serving = true;
    }

    let mut register_task = None;
    if let Some(endpoint) = &args.register {
        let (host, port) = parse_host_port(endpoint)?;
        let worker = Arc::clone(&runner);
        register_task = Some(tokio::spawn(async move {
            worker.register_with(&host, port).await
        }));
    }

    if let Some(input) = &args.input {
        let doc = if input == "-" {
            std::io::read_to_string(std::io::stdin()).context("reading results from stdin")?
        } else {
            std::fs::read_to_string(input).with_context(|| format!("reading {input}"))?
        };
        let results: Vec<Trial> = serde_json::from_str(&doc).context("parsing results JSON")?;
        use_results(&args, results)?;
    } else {
        if let Some(endpoint) = &args.remote {
            let (host, port) = parse_host_port(endpoint)?;
            let conn = Runner::connect_to(&host, port).await?;
            runner.set_remote(conn);
        } else if args.batch {
            bail!("-B/--batch requires -r/--remote");
        }
        if !args.exec.is_empty() {
            let results = run_execs(&runner, &args).await?;
            use_results(&args, results)?;
        }
    }

    // A worker serves its upstream until the coordinator closes the
    // connection; a listener serves forever.
    match register_task {
        Some(task) if !keep_serving => task.await??,
        Some(task) => {
            task.await??;
            std::future::pending::<()>().await;
        }
        None if keep_serving => std::future::pending::<()>().await,
        None => {}
    }

    Ok(())
}

async fn run_execs(runner: &Runner, args: &Cli) -> Result<Vec<Trial>> {
    let mut results = Vec::new();
    for name in &args.exec {
        for _ in 0..args.repeat {
            if args.batch {
                results.extend(runner.run_batch(name).await?);
            } else {
                results.push(runner.run_trial(name).await?);
            }
        }
    }
    Ok(results)
}

fn use_results(args: &Cli, results: Vec<Trial>) -> Result<()> {
    let doc = match &args.analysis {
        Some(name) => {
            let analysis_type = AnalysisType::from_name(name)
                .ok_or_else(|| anyhow!("unknown analysis engine {name:?}"))?;
            debug!(engine = %name, trials = results.len(), "running analysis");
            let mut analysis = Analysis::new(analysis_type, results);
            analysis.run();
            serde_json::to_value(&analysis.status)?
        }
        None => serde_json::to_value(&results)?,
    };
    println!("{}", dump(&doc, args.pretty)?);
    Ok(())
}

fn load_directory(runner: &Runner, dir: &Path) -> Result<()> {
    debug!(dir = %dir.display(), "adding experiments from directory");
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("reading directory {}", dir.display()))?
    {
        let path = entry?.path();
        let is_experiment = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(EXPERIMENT_EXTENSION));
        if !is_experiment {
            debug!(file = %path.display(), "skipping non-experiment file");
            continue;
        }
        info!(file = %path.display(), "adding experiment file");
        let doc = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        add_json(runner, &doc, Some(dir))?;
    }
    Ok(())
}

/// Parses one experiment definition and adds it to the runner. A definition
/// loaded from a directory that does not pick its own working directory
/// inherits the directory it was loaded from.
fn add_json(runner: &Runner, doc: &str, inherit_cd: Option<&Path>) -> Result<()> {
    let parsed: Json = serde_json::from_str(doc).context("parsing experiment JSON")?;
    let cd_given = parsed.get("cd").is_some();
    let mut exp: Experiment = serde_json::from_value(parsed)?;
    if let Some(dir) = inherit_cd.filter(|_| !cd_given) {
        exp.cd = dir.display().to_string();
    }
    runner.add_experiment(exp)?;
    Ok(())
}

fn parse_host_port(input: &str) -> Result<(String, u16)> {
    let (host, port) = match input.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port),
        None => ("127.0.0.1".to_string(), input),
    };
    let port = port
        .parse::<u16>()
        .with_context(|| format!("invalid port in {input:?}"))?;
    Ok((host, port))
}

/// Renders a JSON document, optionally pretty with an N-space indent.
fn dump(value: &Json, pretty: i32) -> Result<String> {
    if pretty < 0 {
        return Ok(value.to_string());
    }
    let indent = vec![b' '; pretty as usize];
    let formatter = serde_json::ser::PrettyFormatter::with_indent(&indent);
    let mut out = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    value.serialize(&mut serializer)?;
    Ok(String::from_utf8(out)?)
}
