//! `tussis` command-line host.
//!
//! ```text
//! tussis classify [--config F] [--model DIR]... FILE...
//! tussis evaluate [--config F] [--model DIR]... --corpus DIR [--workers N] [--output F]
//! tussis inspect  --model DIR
//! ```
//!
//! Results go to stdout as JSON; logs go to stderr (`RUST_LOG`, default
//! `tussis=info`).

mod evaluate;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::{info, warn};
use tussis_core::{
    Classification, ModelManifest, ModelRegistry, PipelineConfig, TussisEngine,
};

const USAGE: &str = "\
usage:
  tussis classify [--config F] [--model DIR]... FILE...
  tussis evaluate [--config F] [--model DIR]... --corpus DIR [--workers N] [--output F]
  tussis inspect  --model DIR";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Classify {
        files: Vec<PathBuf>,
    },
    Evaluate {
        corpus: PathBuf,
        workers: usize,
        output: Option<PathBuf>,
    },
    Inspect,
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Cli {
    config: Option<PathBuf>,
    models: Vec<PathBuf>,
    command: Command,
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .clamp(1, 8)
}

fn parse_args<I>(args: I) -> Result<Cli>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    let Some(sub) = args.next() else {
        return Ok(Cli {
            config: None,
            models: Vec::new(),
            command: Command::Help,
        });
    };

    let mut config = None;
    let mut models = Vec::new();
    let mut files = Vec::new();
    let mut corpus = None;
    let mut workers = default_workers();
    let mut output = None;

    while let Some(arg) = args.next() {
        let mut value = |flag: &str| {
            args.next()
                .with_context(|| format!("{flag} needs a value"))
        };
        match arg.as_str() {
            "--config" => config = Some(PathBuf::from(value("--config")?)),
            "--model" => models.push(PathBuf::from(value("--model")?)),
            "--corpus" => corpus = Some(PathBuf::from(value("--corpus")?)),
            "--output" => output = Some(PathBuf::from(value("--output")?)),
            "--workers" => {
                let raw = value("--workers")?;
                workers = raw
                    .parse()
                    .with_context(|| format!("--workers: '{raw}' is not a number"))?;
            }
            "-h" | "--help" => {
                return Ok(Cli {
                    config,
                    models,
                    command: Command::Help,
                })
            }
            flag if flag.starts_with("--") => bail!("unknown option {flag}"),
            _ => files.push(PathBuf::from(&arg)),
        }
    }

    let command = match sub.as_str() {
        "classify" => {
            if files.is_empty() {
                bail!("classify needs at least one audio file");
            }
            Command::Classify { files }
        }
        "evaluate" => Command::Evaluate {
            corpus: corpus.context("evaluate needs --corpus DIR")?,
            workers,
            output,
        },
        "inspect" => {
            if models.len() != 1 {
                bail!("inspect needs exactly one --model DIR");
            }
            Command::Inspect
        }
        "help" | "-h" | "--help" => Command::Help,
        other => bail!("unknown command '{other}'"),
    };
    Ok(Cli {
        config,
        models,
        command,
    })
}

fn build_engine(cli: &Cli) -> Result<Arc<TussisEngine>> {
    let mut config = PipelineConfig::resolve(cli.config.as_deref())?;
    if !cli.models.is_empty() {
        config.model_paths = cli.models.clone();
        config.normalize();
    }
    let registry = ModelRegistry::load_onnx(&config)?;
    Ok(Arc::new(TussisEngine::new(config, registry)?))
}

#[derive(Serialize)]
struct FileResult<'a> {
    file: &'a Path,
    #[serde(flatten)]
    classification: Classification,
}

#[derive(Serialize)]
struct FileError<'a> {
    file: &'a Path,
    error: String,
}

fn classify(cli: &Cli, files: &[PathBuf]) -> Result<bool> {
    let engine = build_engine(cli)?;
    let mut all_ok = true;
    for file in files {
        let line = match engine.classify_file(file) {
            Ok(classification) => serde_json::to_string(&FileResult {
                file,
                classification,
            })?,
            Err(e) => {
                all_ok = false;
                serde_json::to_string(&FileError {
                    file,
                    error: e.to_string(),
                })?
            }
        };
        println!("{line}");
    }
    info!(counters = ?engine.counters(), "done");
    Ok(all_ok)
}

fn evaluate_corpus(cli: &Cli, corpus: &Path, workers: usize, output: Option<&Path>) -> Result<bool> {
    let clips = evaluate::collect_corpus(corpus)?;
    let engine = build_engine(cli)?;
    let report = evaluate::evaluate(engine, clips, workers);
    let json = serde_json::to_string_pretty(&report)?;
    match output {
        Some(path) => {
            std::fs::write(path, &json)
                .with_context(|| format!("writing {}", path.display()))?;
            info!(path = %path.display(), "evaluation report written");
        }
        None => println!("{json}"),
    }
    if !report.failures.is_empty() {
        warn!(failed = report.failures.len(), "some clips could not be processed");
    }
    Ok(report.failures.is_empty())
}

#[derive(Serialize)]
struct Inspection {
    manifest: ModelManifest,
    model_file: PathBuf,
    checksum_ok: Option<bool>,
}

fn inspect(dir: &Path) -> Result<bool> {
    let manifest = ModelManifest::load(dir)?;
    let model_file = manifest.model_path(dir);
    let checksum_ok = if manifest.sha256.is_some() {
        Some(manifest.verify_checksum(dir).is_ok())
    } else {
        None
    };
    let ok = checksum_ok != Some(false);
    println!(
        "{}",
        serde_json::to_string_pretty(&Inspection {
            manifest,
            model_file,
            checksum_ok,
        })?
    );
    Ok(ok)
}

fn run(cli: Cli) -> Result<bool> {
    match &cli.command {
        Command::Classify { files } => classify(&cli, files),
        Command::Evaluate {
            corpus,
            workers,
            output,
        } => evaluate_corpus(&cli, corpus, *workers, output.as_deref()),
        Command::Inspect => inspect(&cli.models[0]),
        Command::Help => {
            println!("{USAGE}");
            Ok(true)
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tussis=info")),
        )
        .init();

    let cli = match parse_args(std::env::args().skip(1)) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("error: {e:#}\n\n{USAGE}");
            return ExitCode::from(2);
        }
    };
    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
