//! popgen - synthetic population runs: generate, archive, serve

use anyhow::Context;
use clap::{Parser, Subcommand};
use popgen_core::{AuthMode, BindMode, GenerationRequest, Identity, PopgenConfig, Role, RunId};
use popgen_gateway::{build_manager, start_gateway};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "popgen",
    about = "Synthetic population generation runs - generate, archive, serve"
)]
struct Cli {
    /// Config file (default: $POPGEN_CONFIG or ./popgen.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
        #[arg(short, long)]
        bind: Option<String>,
        /// Generator installation directory
        #[arg(long)]
        generator_root: Option<PathBuf>,
        #[arg(long)]
        no_auth: bool,
    },
    /// Run the generator once and record the run
    Generate {
        #[arg(short = 'p', long)]
        population: Option<i64>,
        /// M or F
        #[arg(short, long)]
        gender: Option<String>,
        #[arg(long)]
        min_age: Option<i64>,
        #[arg(long)]
        max_age: Option<i64>,
        #[arg(long)]
        state: Option<String>,
        #[arg(long)]
        city: Option<String>,
        /// Owner recorded for the run
        #[arg(long, default_value = "cli")]
        owner: String,
        #[arg(long)]
        generator_root: Option<PathBuf>,
    },
    /// Delete a run's artifacts and its record
    Purge {
        run_id: String,
        /// Remove artifacts only, for runs missing from the registry
        #[arg(long)]
        files_only: bool,
    },
    /// Print the effective configuration as TOML
    Config,
    /// Show version
    Version,
}

fn init_tracing(log_file: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "popgen=info,tower_http=info".into());

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let name = path
                .file_name()
                .with_context(|| format!("invalid log file {}", path.display()))?;
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(guard)
}

fn load_config(path: Option<PathBuf>, generator_root: Option<PathBuf>) -> PopgenConfig {
    let path = path.unwrap_or_else(PopgenConfig::default_path);
    let mut config = PopgenConfig::load(&path);
    if let Some(root) = generator_root
        .or_else(|| std::env::var("POPGEN_GENERATOR_ROOT").ok().map(PathBuf::from))
    {
        config.generator.root = root;
    }
    config
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            port,
            bind,
            generator_root,
            no_auth,
        } => {
            let _guard = init_tracing(cli.log_file.as_deref())?;
            let mut config = load_config(cli.config, generator_root);
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(bind) = bind {
                config.server.bind = BindMode::parse(&bind);
            }
            if no_auth {
                config.auth.mode = AuthMode::None;
            }
            start_gateway(config).await?;
        }

        Commands::Generate {
            population,
            gender,
            min_age,
            max_age,
            state,
            city,
            owner,
            generator_root,
        } => {
            let _guard = init_tracing(cli.log_file.as_deref())?;
            let config = load_config(cli.config, generator_root);
            let manager = build_manager(&config)?;
            let request = GenerationRequest {
                population_size: population,
                gender,
                min_age,
                max_age,
                state,
                city,
            };
            let run = manager
                .start_generation(&Identity::new(owner, Role::User), &request)
                .await?;
            println!("{}", serde_json::to_string_pretty(&run)?);
        }

        Commands::Purge { run_id, files_only } => {
            let _guard = init_tracing(cli.log_file.as_deref())?;
            let config = load_config(cli.config, None);
            let manager = build_manager(&config)?;
            if files_only {
                manager.cache().purge(&RunId::parse(run_id.as_str())?).await?;
            } else {
                manager
                    .delete_run(&Identity::new("cli", Role::Admin), &run_id)
                    .await?;
            }
            println!("purged {}", run_id);
        }

        Commands::Config => {
            let config = load_config(cli.config, None);
            print!("{}", config.to_toml());
        }

        Commands::Version => {
            println!("popgen v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
