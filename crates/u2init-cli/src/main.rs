use clap::{Parser, Subcommand};
use clap_complete::Shell;
use log::error;
use std::path::PathBuf;
use u2init_core::bootstrap::InitOptions;
use u2init_core::config::{Config, default_config_path};

mod commands;
mod logger;

#[derive(Parser)]
#[command(name = "u2init")]
#[command(about = "Prepare Android devices for uiautomator2", long_about = None)]
#[command(version)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Log debug details
    #[arg(short, long, global = true)]
    verbose: bool,

    /// ADB binary to use instead of the configured one
    #[arg(long, global = true)]
    adb: Option<PathBuf>,

    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install minicap, the uiautomator APKs and atx-agent on every connected device
    Init {
        /// Address atx-agent reports to (host:port)
        #[arg(short, long)]
        server: Option<String>,

        /// app-uiautomator.apk release to install
        #[arg(long)]
        apk_version: Option<String>,

        /// atx-agent release to install
        #[arg(long)]
        agent_version: Option<String>,

        /// Only initialize these serials (repeatable)
        #[arg(long = "serial")]
        serials: Vec<String>,

        /// Give up on the whole run after this many seconds
        #[arg(long, value_name = "SECS")]
        deadline: Option<u64>,
    },

    /// List connected Android devices
    Devices,

    /// Install an APK through the atx-agent running on a device
    Install {
        /// Device address, port 7912 when omitted
        addr: String,

        /// URL the agent downloads the APK from
        apk_url: String,
    },

    /// Print the effective configuration
    Config {
        /// Save it to the configuration file instead
        #[arg(long)]
        write: bool,
    },

    /// Generate shell completion script
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = cli.command {
        commands::generate_completions(shell);
        return Ok(());
    }

    let config_path = cli.config.unwrap_or_else(default_config_path);
    let loaded = Config::load(&config_path);
    let mut config = loaded.as_ref().cloned().unwrap_or_default();
    if let Some(adb) = cli.adb {
        config.adb_path = adb;
    }

    logger::setup_logger(cli.verbose, &config.cache_dir.join("logs"))?;
    if let Err(e) = loaded {
        error!("{}: {e}", config_path.display());
        error!("Using default configuration");
    }

    match cli.command {
        Commands::Init {
            server,
            apk_version,
            agent_version,
            serials,
            deadline,
        } => {
            let defaults = InitOptions::from_config(&config);
            let options = InitOptions {
                server,
                apk_version: apk_version.unwrap_or(defaults.apk_version),
                agent_version: agent_version.unwrap_or(defaults.agent_version),
                serials,
            };
            commands::init(&config, &options, deadline)?;
        }
        Commands::Devices => commands::devices(&config)?,
        Commands::Install { addr, apk_url } => commands::install(&config, &addr, &apk_url)?,
        Commands::Config { write } => {
            commands::show_config(&config, write.then_some(config_path.as_path()))?;
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}
