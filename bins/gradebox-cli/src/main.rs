mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use gradebox_common::types::{CallerRole, SecurityLevel};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "gradebox-cli")]
#[command(about = "Gradebox CLI - Inspect languages, check submissions, and maintain sandboxes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List supported languages
    Languages,

    /// Run the static security scan on a source file
    Scan {
        /// Language id (e.g., python, java, cpp)
        #[arg(short, long)]
        language: String,

        /// Source file to scan
        #[arg(short, long)]
        file: PathBuf,

        /// Security level (low, medium, high, maximum); defaults to GRADEBOX_SECURITY_LEVEL
        #[arg(short = 's', long)]
        level: Option<SecurityLevel>,
    },

    /// Compile or syntax-check a source file without running it
    Validate {
        /// Language id
        #[arg(short, long)]
        language: String,

        /// Source file to check
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Execute a source file against a JSON file of test cases
    Run {
        /// Language id
        #[arg(short, long)]
        language: String,

        /// Source file to execute
        #[arg(short, long)]
        file: PathBuf,

        /// Test cases: a JSON array, or an object with test_cases and resource_limits
        #[arg(short, long)]
        tests: PathBuf,

        /// Security level; defaults to GRADEBOX_SECURITY_LEVEL
        #[arg(short = 's', long)]
        level: Option<SecurityLevel>,

        /// Role to run as; candidates do not see hidden test output
        #[arg(short, long, default_value = "grader")]
        role: CallerRole,

        /// Print the full result as JSON
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Rebuild every sandbox image from its Dockerfile
    RebuildImages,

    /// Remove sandboxes left behind by a crashed instance
    Cleanup,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Languages => {
            commands::list_languages()?;
        }
        Commands::Scan {
            language,
            file,
            level,
        } => {
            commands::scan_file(&language, &file, level)?;
        }
        Commands::Validate { language, file } => {
            commands::validate_file(&language, &file).await?;
        }
        Commands::Run {
            language,
            file,
            tests,
            level,
            role,
            json,
        } => {
            commands::run_file(&language, &file, &tests, level, role, json).await?;
        }
        Commands::RebuildImages => {
            commands::rebuild_images().await?;
        }
        Commands::Cleanup => {
            commands::cleanup_sandboxes().await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parses_run() {
        let cli = Cli::try_parse_from([
            "gradebox-cli", "run", "-l", "python", "-f", "sum.py", "-t", "tests.json", "-s", "max",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                language,
                level,
                role,
                json,
                ..
            } => {
                assert_eq!(language, "python");
                assert_eq!(level, Some(SecurityLevel::Maximum));
                assert_eq!(role, CallerRole::Grader);
                assert!(!json);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_rejects_unknown_level() {
        assert!(Cli::try_parse_from([
            "gradebox-cli", "scan", "-l", "python", "-f", "a.py", "-s", "paranoid",
        ])
        .is_err());
    }
}
