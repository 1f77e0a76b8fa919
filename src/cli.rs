//! CLI interface for voicebridge

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::phonebook::Phonebook;

#[derive(Parser)]
#[command(name = "voicebridge")]
#[command(about = "Real-time telephony voice agent", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the voice agent server (default when no command given)
    Serve {
        /// Config file path (defaults to the platform config dir)
        #[arg(short, long)]
        config: Option<std::path::PathBuf>,
    },
    /// Inspect the effective configuration
    Config {
        /// Print the resolved configuration as TOML
        #[arg(long)]
        show: bool,
    },
    /// Validate the phonebook file
    Phonebook,
}

/// Parse arguments and dispatch
pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Commands::Serve { config: None }) => {
            let config = Config::load()?;
            crate::server::start(config).await
        }
        Some(Commands::Serve {
            config: Some(path),
        }) => {
            let config = Config::load_from(&path)?;
            crate::server::start(config).await
        }
        Some(Commands::Config { show }) => {
            let config = Config::load()?;
            if show {
                // Credentials are #[serde(skip)] and never serialize
                println!("{}", toml::to_string_pretty(&config)?);
            } else {
                println!("Config file: {}", Config::default_path().display());
            }
            Ok(())
        }
        Some(Commands::Phonebook) => {
            let config = Config::load()?;
            let book = Phonebook::load(&config.phonebook.path)?;
            println!(
                "{}: {} entries",
                config.phonebook.path.display(),
                book.len()
            );
            Ok(())
        }
    }
}
