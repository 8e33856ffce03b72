//! Command-line interface for the BettaFish supervisor

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "bf",
    about = "BettaFish - multi-agent public opinion analysis supervisor",
    version
)]
pub struct Cli {
    /// Log level override (TRACE/DEBUG/INFO/WARN/ERROR)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the supervisor HTTP server
    Serve {
        /// Bind host override
        #[arg(long)]
        host: Option<String>,

        /// Bind port override
        #[arg(long)]
        port: Option<u16>,
    },

    /// Generate one report from the latest engine artifacts, without the
    /// HTTP server
    Report {
        /// Report topic; derived from artifacts when omitted
        #[arg(long)]
        query: Option<String>,

        /// Path to a custom Markdown template
        #[arg(long)]
        template: Option<PathBuf>,

        /// Skip the baseline readiness gate
        #[arg(long)]
        force: bool,
    },

    /// Run the forum aggregator in the foreground
    Forum,

    /// Query a running supervisor's status
    Status,

    /// Configuration inspection and updates
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the current configuration (secrets masked)
    Show,

    /// Update keys in the .env file, e.g. `bf config set PORT=8080`
    Set {
        /// KEY=VALUE pairs
        #[arg(required = true, value_parser = parse_pair)]
        pairs: Vec<(String, String)>,
    },
}

fn parse_pair(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    if key.trim().is_empty() {
        return Err("empty key".to_string());
    }
    Ok((key.trim().to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_parses() {
        let cli = Cli::try_parse_from(["bf", "serve", "--port", "8080"]).unwrap();
        match cli.command {
            Command::Serve { port, host } => {
                assert_eq!(port, Some(8080));
                assert!(host.is_none());
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn test_report_parses() {
        let cli = Cli::try_parse_from(["bf", "report", "--query", "市政热点", "--force"]).unwrap();
        match cli.command {
            Command::Report { query, force, .. } => {
                assert_eq!(query.as_deref(), Some("市政热点"));
                assert!(force);
            }
            _ => panic!("expected report"),
        }
    }

    #[test]
    fn test_config_set_pairs() {
        let cli =
            Cli::try_parse_from(["bf", "config", "set", "PORT=8080", "HOST=127.0.0.1"]).unwrap();
        match cli.command {
            Command::Config {
                command: ConfigCommand::Set { pairs },
            } => {
                assert_eq!(pairs.len(), 2);
                assert_eq!(pairs[0], ("PORT".to_string(), "8080".to_string()));
            }
            _ => panic!("expected config set"),
        }
    }

    #[test]
    fn test_config_set_rejects_bare_word() {
        assert!(Cli::try_parse_from(["bf", "config", "set", "PORT"]).is_err());
    }
}
