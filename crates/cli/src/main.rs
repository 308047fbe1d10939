mod auth_commands;
mod config_commands;

use {
    anyhow::Context,
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "wagate", about = "wagate: WhatsApp HTTP gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Directory holding wagate.{toml,yaml,json}.
    #[arg(long, global = true, env = "WAGATE_CONFIG_DIR")]
    config_dir: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server.
    Serve {
        #[arg(long)]
        bind: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Stored WhatsApp credentials.
    Auth {
        #[command(subcommand)]
        action: auth_commands::AuthAction,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

/// Discover config, apply env overrides and validate.
fn load_config() -> anyhow::Result<wagate_config::WagateConfig> {
    let mut config = wagate_config::discover_and_load();
    wagate_config::apply_env_overrides(&mut config);
    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    if let Some(dir) = &cli.config_dir {
        wagate_config::set_config_dir(dir.clone());
    }

    info!(version = env!("CARGO_PKG_VERSION"), "wagate starting");

    match cli.command {
        Commands::Serve { bind, port } => {
            let mut config = load_config()?;
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            wagate_gateway::start_gateway(config).await
        },
        Commands::Auth { action } => auth_commands::handle_auth(action, &load_config()?).await,
        Commands::Config { action } => config_commands::handle_config(action, &load_config()?),
    }
}
