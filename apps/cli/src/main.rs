//! `sliceup` command-line entry point.

mod app;
mod config;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;
use clap::{Args, Parser, Subcommand};
use sliceup_engine::{EngineConfig, MergeMode, ResumeState};
use sliceup_protocol::TaskStatus;
use tracing_subscriber::EnvFilter;

use crate::app::{Outcome, Target, TargetOptions};
use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "sliceup")]
#[command(about = "Chunked, resumable, content-addressed uploads")]
#[command(version)]
struct Cli {
    /// Config file (default: ~/.config/sliceup/config.toml)
    #[arg(long, global = true, env = "SLICEUP_CONFIG")]
    config: Option<PathBuf>,

    /// Debug logging for sliceup crates
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct TargetArgs {
    /// Upload server base URL (overrides config)
    #[arg(long, env = "SLICEUP_SERVER", conflicts_with = "local_dir")]
    server: Option<String>,

    /// Local chunk store directory (overrides config)
    #[arg(long, env = "SLICEUP_LOCAL_DIR")]
    local_dir: Option<PathBuf>,

    /// Extra request header, repeatable
    #[arg(long = "header", value_name = "NAME=VALUE", value_parser = parse_header)]
    headers: Vec<(String, String)>,
}

impl TargetArgs {
    fn options(&self) -> TargetOptions {
        TargetOptions {
            server: self.server.clone(),
            local_dir: self.local_dir.clone(),
            headers: self.headers.clone(),
        }
    }
}

#[derive(Args, Debug, Clone)]
struct EngineArgs {
    /// Chunk size in bytes
    #[arg(long)]
    chunk_size: Option<u64>,

    /// Maximum concurrent uploads
    #[arg(long)]
    concurrency: Option<usize>,

    /// Stop before merging; merge later with `sliceup merge`
    #[arg(long)]
    manual_merge: bool,

    /// Suppress per-chunk progress lines
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Args, Debug, Clone)]
struct SessionArgs {
    /// Slice id of the server session
    #[arg(long)]
    slice_id: String,

    /// MD5 fingerprint of the whole file
    #[arg(long)]
    fingerprint: String,
}

impl SessionArgs {
    fn state(&self) -> ResumeState {
        ResumeState {
            fingerprint: self.fingerprint.clone(),
            slice_id: self.slice_id.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upload one or more files
    Upload {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[command(flatten)]
        engine: EngineArgs,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Continue an interrupted upload without hashing again
    Resume {
        file: PathBuf,
        #[command(flatten)]
        session: SessionArgs,
        #[command(flatten)]
        engine: EngineArgs,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Show the server view of an upload session
    Status {
        slice_id: String,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Merge a session whose chunks are all uploaded
    Merge {
        file: PathBuf,
        #[command(flatten)]
        session: SessionArgs,
        /// Chunk size the file was uploaded with
        #[arg(long)]
        chunk_size: Option<u64>,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Delete chunk data of stale sessions in a local store
    Clean {
        /// Remove sessions not touched for this many hours
        #[arg(long, default_value_t = 24)]
        older_than_hours: u64,
        #[command(flatten)]
        target: TargetArgs,
    },
}

fn parse_header(s: &str) -> Result<(String, String), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got `{s}`"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty header name in `{s}`"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

fn engine_config(config: &Config, args: &EngineArgs) -> EngineConfig {
    let mut engine = config.engine.to_engine_config();
    if let Some(size) = args.chunk_size {
        engine.chunk_size = size;
    }
    if let Some(limit) = args.concurrency {
        engine.concurrency_limit = limit;
    }
    if args.manual_merge {
        engine.merge_mode = MergeMode::Manual;
    }
    engine
}

fn report(outcomes: &[Outcome]) -> anyhow::Result<()> {
    for outcome in outcomes {
        println!("{}: {} {}", outcome.file_name, outcome.status, outcome.detail);
    }
    let failed = outcomes
        .iter()
        .filter(|o| matches!(o.status, TaskStatus::Failed | TaskStatus::Cancelled))
        .count();
    if failed > 0 {
        bail!("{failed} of {} uploads did not finish", outcomes.len());
    }
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Upload {
            files,
            engine,
            target,
        } => {
            let target = Target::open(&target.options(), &config).await?;
            let outcomes =
                app::upload(&target, engine_config(&config, &engine), &files, !engine.quiet)
                    .await?;
            report(&outcomes)
        }
        Commands::Resume {
            file,
            session,
            engine,
            target,
        } => {
            let target = Target::open(&target.options(), &config).await?;
            let outcomes = app::resume(
                &target,
                engine_config(&config, &engine),
                &file,
                session.state(),
                !engine.quiet,
            )
            .await?;
            report(&outcomes)
        }
        Commands::Status { slice_id, target } => {
            let target = Target::open(&target.options(), &config).await?;
            let status = app::status(&target, &slice_id).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Commands::Merge {
            file,
            session,
            chunk_size,
            target,
        } => {
            let target = Target::open(&target.options(), &config).await?;
            let chunk_size = chunk_size.unwrap_or(config.engine.chunk_size);
            let record = app::merge(&target, &file, chunk_size, session.state()).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        Commands::Clean {
            older_than_hours,
            target,
        } => {
            let target = Target::open(&target.options(), &config).await?;
            let max_age = Duration::from_secs(older_than_hours.saturating_mul(3600));
            let report = app::clean(&target, max_age).await?;
            println!(
                "removed {} sessions, freed {} bytes",
                report.sessions_removed, report.bytes_freed
            );
            Ok(())
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "info,sliceup=debug"
    } else {
        "warn,sliceup=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "starting sliceup");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cli))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_upload() {
        let cli = Cli::try_parse_from([
            "sliceup",
            "upload",
            "a.bin",
            "b.bin",
            "--server",
            "http://localhost:8080",
            "--header",
            "Authorization=Bearer x",
            "--chunk-size",
            "4096",
            "--manual-merge",
        ])
        .unwrap();
        let Commands::Upload {
            files,
            engine,
            target,
        } = cli.command
        else {
            panic!("expected upload");
        };
        assert_eq!(files, vec![PathBuf::from("a.bin"), PathBuf::from("b.bin")]);
        assert_eq!(target.server.as_deref(), Some("http://localhost:8080"));
        assert_eq!(
            target.headers,
            vec![("Authorization".to_string(), "Bearer x".to_string())]
        );

        let config = engine_config(&Config::default(), &engine);
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.merge_mode, MergeMode::Manual);
        assert_eq!(config.concurrency_limit, 3);
    }

    #[test]
    fn upload_requires_files() {
        assert!(Cli::try_parse_from(["sliceup", "upload", "--local-dir", "/tmp/x"]).is_err());
    }

    #[test]
    fn server_and_local_dir_conflict() {
        let result = Cli::try_parse_from([
            "sliceup",
            "status",
            "s1",
            "--server",
            "http://x",
            "--local-dir",
            "/tmp/x",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn parses_merge_and_clean() {
        let cli = Cli::try_parse_from([
            "sliceup",
            "merge",
            "a.bin",
            "--slice-id",
            "s1",
            "--fingerprint",
            "abc",
            "--local-dir",
            "/tmp/x",
        ])
        .unwrap();
        let Commands::Merge { session, chunk_size, .. } = cli.command else {
            panic!("expected merge");
        };
        assert_eq!(session.state().slice_id, "s1");
        assert_eq!(chunk_size, None);

        let cli =
            Cli::try_parse_from(["sliceup", "clean", "--older-than-hours", "48", "-v"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(
            cli.command,
            Commands::Clean {
                older_than_hours: 48,
                ..
            }
        ));
    }

    #[test]
    fn header_parsing() {
        assert_eq!(
            parse_header("X-Token = abc=def").unwrap(),
            ("X-Token".to_string(), "abc=def".to_string())
        );
        assert!(parse_header("novalue").is_err());
        assert!(parse_header("=x").is_err());
    }

    #[test]
    fn report_fails_on_unfinished_uploads() {
        let ok = Outcome {
            file_name: "a".into(),
            status: TaskStatus::Completed,
            detail: String::new(),
        };
        assert!(report(std::slice::from_ref(&ok)).is_ok());

        let failed = Outcome {
            status: TaskStatus::Failed,
            ..ok.clone()
        };
        assert!(report(&[ok, failed]).is_err());
    }
}
