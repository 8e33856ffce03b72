//! rstore - report store inspection CLI

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};

use reportstore::cli::{BaselineCommand, Cli, Command, engine_dirs};
use reportstore::{BaselineStore, ChapterStore};

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Manifest { run_dir } => {
            let store = ChapterStore::new(
                run_dir
                    .parent()
                    .ok_or_else(|| eyre::eyre!("run directory has no parent"))?,
            )?;
            let manifest = store
                .manifest(&run_dir)
                .context("Failed to read manifest")?;
            println!("{}", serde_json::to_string_pretty(&manifest)?);
        }
        Command::Chapters { run_dir } => {
            let store = ChapterStore::new(
                run_dir
                    .parent()
                    .ok_or_else(|| eyre::eyre!("run directory has no parent"))?,
            )?;
            let manifest = store
                .manifest(&run_dir)
                .context("Failed to read manifest")?;
            for record in &manifest.chapters {
                let status = format!("{:?}", record.status).to_lowercase();
                let status = match record.status {
                    reportstore::ChapterStatus::Ready => status.green(),
                    reportstore::ChapterStatus::Invalid => status.red(),
                    reportstore::ChapterStatus::Streaming => status.yellow(),
                };
                println!(
                    "{:>4}  {:<12} {:<10} {}",
                    record.order, record.chapter_id, status, record.title
                );
            }
        }
        Command::Baseline { command } => match command {
            BaselineCommand::Init { file, dirs } => {
                let store = BaselineStore::open(&file);
                let counts = store
                    .initialize(&engine_dirs(&dirs))
                    .context("Failed to initialize baseline")?;
                println!("{}", serde_json::to_string_pretty(&counts)?);
            }
            BaselineCommand::Check { file, dirs } => {
                let store = BaselineStore::open(&file);
                let readiness = store.check_new_files(&engine_dirs(&dirs));
                println!("{}", serde_json::to_string_pretty(&readiness)?);
                if !readiness.ready {
                    std::process::exit(1);
                }
            }
        },
    }

    Ok(())
}
