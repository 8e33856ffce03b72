//! Command-line interface for inspecting report store contents

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::baseline::Engine;

#[derive(Parser, Debug)]
#[command(name = "rstore", about = "Inspect report runs, manifests and baselines", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the manifest of a report run directory
    Manifest {
        /// Path to the run directory (contains manifest.json)
        run_dir: PathBuf,
    },

    /// List persisted chapters of a run in order
    Chapters {
        /// Path to the run directory
        run_dir: PathBuf,
    },

    /// Baseline snapshot operations
    Baseline {
        #[command(subcommand)]
        command: BaselineCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum BaselineCommand {
    /// Snapshot current artifact counts into the baseline file
    Init {
        /// Baseline JSON file
        #[arg(long, default_value = "logs/report_baseline.json")]
        file: PathBuf,

        /// Engine artifact directories as engine=path pairs
        #[arg(long = "dir", value_parser = parse_engine_dir)]
        dirs: Vec<(Engine, PathBuf)>,
    },

    /// Check whether every engine has produced new artifacts
    Check {
        #[arg(long, default_value = "logs/report_baseline.json")]
        file: PathBuf,

        #[arg(long = "dir", value_parser = parse_engine_dir)]
        dirs: Vec<(Engine, PathBuf)>,
    },
}

fn parse_engine_dir(raw: &str) -> Result<(Engine, PathBuf), String> {
    let (engine, path) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected engine=path, got '{raw}'"))?;
    Ok((engine.parse()?, PathBuf::from(path)))
}

/// Collect engine=path pairs into the map the baseline store expects.
pub fn engine_dirs(pairs: &[(Engine, PathBuf)]) -> BTreeMap<Engine, PathBuf> {
    pairs.iter().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_engine_dir() {
        let (engine, path) = parse_engine_dir("insight=reports/insight").unwrap();
        assert_eq!(engine, Engine::Insight);
        assert_eq!(path, PathBuf::from("reports/insight"));
    }

    #[test]
    fn test_parse_engine_dir_rejects_bad_input() {
        assert!(parse_engine_dir("no-equals").is_err());
        assert!(parse_engine_dir("martian=reports").is_err());
    }

    #[test]
    fn test_cli_parses_manifest_command() {
        let cli = Cli::try_parse_from(["rstore", "manifest", "final_reports/chapters/r1"]).unwrap();
        match cli.command {
            Command::Manifest { run_dir } => {
                assert_eq!(run_dir, PathBuf::from("final_reports/chapters/r1"));
            }
            _ => panic!("expected Manifest command"),
        }
    }

    #[test]
    fn test_cli_parses_baseline_check() {
        let cli = Cli::try_parse_from([
            "rstore",
            "baseline",
            "check",
            "--dir",
            "insight=a",
            "--dir",
            "media=b",
            "--dir",
            "query=c",
        ])
        .unwrap();
        match cli.command {
            Command::Baseline {
                command: BaselineCommand::Check { dirs, .. },
            } => assert_eq!(dirs.len(), 3),
            _ => panic!("expected baseline check"),
        }
    }
}
