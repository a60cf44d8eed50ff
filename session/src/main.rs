//! Command-line tools for the iteration session protocol.
//!
//! `replay` folds a recorded envelope log into a session and prints the
//! result; `config` loads, validates and optionally initializes the config
//! file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use session::exit_codes;
use session::io::config::{DEFAULT_CONFIG_PATH, SessionConfig, load_config, write_config};
use session::replay::{render_summary, replay_file};

#[derive(Parser)]
#[command(
    name = "session",
    version,
    about = "Replay and inspect iteration session envelope logs"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fold an envelope log (JSON Lines) into a fresh session and print it.
    Replay {
        /// Path to the envelope log.
        log: PathBuf,
        /// Iteration to replay; defaults to the first one the log names.
        #[arg(long)]
        iteration: Option<String>,
        /// Print the session snapshot as JSON instead of a summary.
        #[arg(long)]
        json: bool,
        /// Config file (TOML). Missing file means defaults.
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
    /// Print the effective configuration.
    Config {
        /// Config file (TOML).
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        path: PathBuf,
        /// Write the default config if the file is missing.
        #[arg(long)]
        init: bool,
    },
}

fn main() {
    session::logging::init();
    if let Err(err) = run() {
        eprintln!("{:#}", err);
        std::process::exit(exit_codes::INVALID);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Replay {
            log,
            iteration,
            json,
            config,
        } => cmd_replay(&config, &log, iteration.as_deref(), json),
        Command::Config { path, init } => cmd_config(&path, init),
    }
}

fn cmd_replay(config_path: &Path, log: &Path, iteration: Option<&str>, json: bool) -> Result<()> {
    let cfg = load_config(config_path)?;
    let report = replay_file(log, iteration, &cfg.session_options(), Utc::now())?;
    if json {
        let payload =
            serde_json::to_string_pretty(&report.snapshot).context("serialize snapshot")?;
        println!("{payload}");
    } else {
        print!("{}", render_summary(&report));
    }
    Ok(())
}

fn cmd_config(config_path: &Path, init: bool) -> Result<()> {
    if init && !config_path.exists() {
        write_config(config_path, &SessionConfig::default())?;
        eprintln!("wrote {}", config_path.display());
    }
    let cfg = load_config(config_path)?;
    let rendered = toml::to_string_pretty(&cfg).context("serialize config toml")?;
    print!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_replay_with_flags() {
        let cli = Cli::parse_from(["session", "replay", "log.jsonl", "--iteration", "it-1", "--json"]);
        let Command::Replay {
            log,
            iteration,
            json,
            config,
        } = cli.command
        else {
            panic!("expected replay");
        };
        assert_eq!(log, PathBuf::from("log.jsonl"));
        assert_eq!(iteration.as_deref(), Some("it-1"));
        assert!(json);
        assert_eq!(config, PathBuf::from(DEFAULT_CONFIG_PATH));
    }

    #[test]
    fn parse_config_init() {
        let cli = Cli::parse_from(["session", "config", "--init", "--path", "x.toml"]);
        assert!(matches!(
            cli.command,
            Command::Config { ref path, init: true } if path == &PathBuf::from("x.toml")
        ));
    }

    #[test]
    fn config_init_writes_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".pipeline").join("config.toml");
        cmd_config(&path, true).expect("init");
        assert!(path.is_file());
        assert_eq!(load_config(&path).expect("load"), SessionConfig::default());
    }

    #[test]
    fn replay_reports_missing_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = cmd_replay(
            &temp.path().join("config.toml"),
            &temp.path().join("missing.jsonl"),
            None,
            false,
        )
        .expect_err("missing log");
        assert!(format!("{err:#}").contains("missing.jsonl"));
    }
}
