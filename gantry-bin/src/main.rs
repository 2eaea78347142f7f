use clap::{Parser, Subcommand};
use gantry_config::ConfigLoader;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gantry", version, about = "OpenAI-compatible LLM gateway")]
struct Cli {
    /// Path to gantry.toml (defaults to ./gantry.toml or $GANTRY_CONFIG).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the gateway (the default when no subcommand is given).
    Serve {
        /// Override the configured listen port.
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Load and validate the configuration, then exit.
    CheckConfig,
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("gantry={level},info")));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let loader = ConfigLoader::load(cli.config.as_deref())?;
    let mut config = loader.get();
    init_tracing(&config.logging.level, config.logging.json);

    match cli.command.unwrap_or(Command::Serve { port: None }) {
        Command::Serve { port } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            gantry_server::serve(config).await?;
        }
        Command::CheckConfig => {
            // Load already validated; print the effective summary.
            println!(
                "config ok — {} provider(s), router policy {:?}, listen {}",
                config.providers.len(),
                config.router.policy,
                config.server.listen_addr()
            );
        }
    }

    Ok(())
}
