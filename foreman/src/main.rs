//! Foreman CLI.
//!
//! `serve` runs the orchestrator and composer against the configured bus.
//! `plan` and `apply` expose the patch engine for local use, and
//! `check-config` validates a `foreman.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use foreman::core::patch::{Eol, Patch, PatchError, PatchOptions, plan_patch};
use foreman::exit_codes;
use foreman::io::config::load_config;
use foreman::io::patch::apply_patch;
use foreman::logging;
use foreman::serve::serve;

#[derive(Parser)]
#[command(
    name = "foreman",
    version,
    about = "Task orchestration and patch composition for coding agents"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator, composer and presence monitor until Ctrl-C.
    Serve {
        #[arg(long, default_value = "foreman.toml")]
        config: PathBuf,
    },
    /// Print the deterministic execution plan for a patch file.
    Plan {
        patch: PathBuf,
        /// Workspace root paths are resolved against.
        #[arg(long, default_value = ".")]
        root: PathBuf,
    },
    /// Apply a patch file to a directory and print the report.
    Apply {
        patch: PathBuf,
        #[arg(long)]
        root: PathBuf,
        /// Report what would change without touching the filesystem.
        #[arg(long)]
        dry_run: bool,
        /// Write through temporary files renamed into place.
        #[arg(long)]
        atomic: bool,
        /// Skip writes and renames onto existing paths.
        #[arg(long)]
        no_overwrite: bool,
        #[arg(long, default_value = "none", value_parser = parse_eol)]
        eol: Eol,
    },
    /// Load and validate a config file.
    CheckConfig { path: PathBuf },
}

fn main() {
    logging::init("warn");
    let code = match run() {
        Ok(()) => exit_codes::OK,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_code(&err)
        }
    };
    std::process::exit(code);
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config } => {
            let cfg = load_config(&config)?;
            runtime()?.block_on(serve(cfg))
        }
        Command::Plan { patch, root } => cmd_plan(&patch, root),
        Command::Apply {
            patch,
            root,
            dry_run,
            atomic,
            no_overwrite,
            eol,
        } => {
            let mut opts = PatchOptions::new(root);
            opts.dry_run = dry_run;
            opts.atomic = atomic;
            opts.overwrite = !no_overwrite;
            opts.eol = eol;
            runtime()?.block_on(cmd_apply(&patch, opts))
        }
        Command::CheckConfig { path } => {
            load_config(&path)?;
            println!("ok");
            Ok(())
        }
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start tokio runtime")
}

fn cmd_plan(path: &Path, root: PathBuf) -> Result<()> {
    let patch = read_patch(path)?;
    let plan = plan_patch(&patch, &PatchOptions::new(root))?;
    print_json(&plan)
}

async fn cmd_apply(path: &Path, opts: PatchOptions) -> Result<()> {
    let patch = read_patch(path)?;
    let report = apply_patch(&patch, &opts).await?;
    print_json(&report)
}

fn read_patch(path: &Path) -> Result<Patch> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse patch {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}

fn parse_eol(raw: &str) -> Result<Eol, String> {
    Eol::parse(raw).ok_or_else(|| format!("unknown eol '{raw}' (expected lf, crlf or none)"))
}

fn exit_code(err: &anyhow::Error) -> i32 {
    let unsafe_path = err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<PatchError>(),
            Some(PatchError::UnsafePath { .. })
        )
    });
    if unsafe_path {
        exit_codes::UNSAFE_PATCH
    } else {
        exit_codes::INVALID
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn parse_apply_flags() {
        let cli = Cli::parse_from([
            "foreman",
            "apply",
            "patch.json",
            "--root",
            "work",
            "--dry-run",
            "--no-overwrite",
            "--eol",
            "crlf",
        ]);
        match cli.command {
            Command::Apply {
                root,
                dry_run,
                atomic,
                no_overwrite,
                eol,
                ..
            } => {
                assert_eq!(root, PathBuf::from("work"));
                assert!(dry_run && no_overwrite && !atomic);
                assert_eq!(eol, Eol::Crlf);
            }
            _ => panic!("expected apply"),
        }
    }

    #[test]
    fn parse_rejects_unknown_eol() {
        let parsed =
            Cli::try_parse_from(["foreman", "apply", "p.json", "--root", ".", "--eol", "cr"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn parse_serve_default_config() {
        let cli = Cli::parse_from(["foreman", "serve"]);
        assert!(
            matches!(cli.command, Command::Serve { config } if config == PathBuf::from("foreman.toml"))
        );
    }

    #[test]
    fn unsafe_paths_map_to_their_own_exit_code() {
        let err = anyhow::Error::new(PatchError::UnsafePath {
            path: "../x".to_string(),
            reason: "escapes root",
        })
        .context("apply");
        assert_eq!(exit_code(&err), exit_codes::UNSAFE_PATCH);
        assert_eq!(exit_code(&anyhow!("bad config")), exit_codes::INVALID);
    }

    #[test]
    fn plan_rejects_escaping_paths() {
        let temp = tempfile::tempdir().expect("tempdir");
        let patch = temp.path().join("patch.json");
        fs::write(&patch, r#"{"files":[{"path":"../evil","content":"x"}]}"#).expect("write");
        let err = cmd_plan(&patch, temp.path().to_path_buf()).expect_err("unsafe");
        assert_eq!(exit_code(&err), exit_codes::UNSAFE_PATCH);
    }
}
