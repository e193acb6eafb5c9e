//! Weft - userspace mesh-networking agent
//!
//! SOCKS5 ingress, transit relay and exit nodes over multiplexed encrypted
//! peer links, with flood-learned prefix routing.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;

use weft::{Agent, Config, Identity};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const BUILD_TIMESTAMP: &str = env!("WEFT_BUILD_TIMESTAMP");
const GIT_REV: &str = env!("WEFT_GIT_REV");

#[derive(Parser)]
#[command(name = "weft")]
#[command(version = VERSION)]
#[command(about = "Userspace mesh-networking agent", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent
    Run {
        /// Data directory override
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Print the agent ID from a data directory
    Id {
        /// Data directory
        #[arg(long, default_value = ".weft")]
        data_dir: PathBuf,
    },

    /// Generate keys: management keypair, command-signing keypair, or a
    /// bcrypt password hash for SOCKS5 auth
    Keygen {
        /// What to generate (management, signing, password)
        #[arg(default_value = "management")]
        what: String,

        /// Password to hash (with `keygen password`)
        #[arg(long, env = "WEFT_PASSWORD")]
        password: Option<String>,
    },

    /// Print build information
    Version,
}

fn load_config(cli: &Cli) -> Result<Config> {
    match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(Config::default()),
    }
}

fn main() {
    let exit_code = match run() {
        Ok(()) => 0,
        Err(e) => {
            // Configuration and startup problems exit 1, runtime faults 2.
            let message = format!("{:#}", e);
            eprintln!("error: {}", message);
            let config_error = e
                .downcast_ref::<weft::WeftError>()
                .map(|err| {
                    matches!(
                        err,
                        weft::WeftError::Config(_) | weft::WeftError::InvalidIdentity(_)
                    )
                })
                .unwrap_or(false)
                || message.contains("loading config");
            if config_error {
                1
            } else {
                2
            }
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(&cli)?;
    weft::logging::init(&config.agent.log_level, &config.agent.log_format, cli.verbose);

    match cli.command {
        Commands::Run { data_dir } => {
            if let Some(data_dir) = data_dir {
                config.agent.data_dir = data_dir;
            }
            info!("weft {} ({} {})", VERSION, GIT_REV, BUILD_TIMESTAMP);

            let runtime = tokio::runtime::Runtime::new().context("starting runtime")?;
            runtime.block_on(async {
                let agent = Agent::new(config)?;
                let handle = agent.handle();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("[AGENT] Interrupt received, shutting down");
                        handle.shutdown();
                    }
                });
                agent.run().await
            })?;
            Ok(())
        }

        Commands::Id { data_dir } => {
            let identity = Identity::load_or_create(&data_dir, "")?;
            println!("{}", identity.id);
            println!("short: {}", identity.id.short());
            println!(
                "x25519 public: {}",
                BASE64.encode(identity.public_key().as_bytes())
            );
            Ok(())
        }

        Commands::Keygen { what, password } => match what.as_str() {
            "management" => {
                let secret = x25519_dalek::StaticSecret::random_from_rng(rand::thread_rng());
                let public = x25519_dalek::PublicKey::from(&secret);
                println!("public_key = \"{}\"", BASE64.encode(public.as_bytes()));
                println!("private_key = \"{}\"", BASE64.encode(secret.to_bytes()));
                println!();
                println!("# Put public_key in [management] on every node;");
                println!("# private_key only on operator nodes.");
                Ok(())
            }
            "signing" => {
                let key = ed25519_dalek::SigningKey::generate(&mut rand::thread_rng());
                println!(
                    "signing_public_key = \"{}\"",
                    BASE64.encode(key.verifying_key().as_bytes())
                );
                println!("# private (keep offline): {}", BASE64.encode(key.to_bytes()));
                Ok(())
            }
            "password" => {
                let password = password.context("--password (or WEFT_PASSWORD) required")?;
                println!("{}", weft::socks::hash_password(&password)?);
                Ok(())
            }
            other => anyhow::bail!("unknown keygen target: {}", other),
        },

        Commands::Version => {
            println!("weft {}", VERSION);
            println!("built: {}", BUILD_TIMESTAMP);
            println!("revision: {}", GIT_REV);
            Ok(())
        }
    }
}
