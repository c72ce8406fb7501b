use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use fngate::config::EmulatorConfig;
use fngate::logger::init_tracing;
use fngate::registry::StaticRegistry;
use fngate::server::FunctionsEmulator;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "fngate",
    about = "Local emulator gateway for serverless functions",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the gateway
    Serve(ServeArgs),

    /// Run one diagnostic load and print the trigger table as JSON
    Triggers(ServeArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 5001)]
    port: u16,

    #[arg(long, default_value = "demo")]
    project_id: String,

    /// Directory holding the functions source
    #[arg(long, default_value = ".")]
    functions_dir: PathBuf,

    /// Binary used to launch workers
    #[arg(long, default_value = "node")]
    node_binary: String,

    /// Worker entry script
    #[arg(long)]
    runtime_entry: PathBuf,

    /// Host of a running firestore emulator
    #[arg(long, default_value = "localhost")]
    firestore_host: String,

    /// Port of a running firestore emulator; omit if none is running
    #[arg(long)]
    firestore_port: Option<u16>,

    /// Feature flags passed to workers as disabled
    #[arg(long = "disable-feature")]
    disabled_features: Vec<String>,

    /// Log level when RUST_LOG is unset (e.g. error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Directory for rolling log files
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Optional .env file loaded before anything else
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl ServeArgs {
    fn into_parts(self) -> (EmulatorConfig, Arc<StaticRegistry>, Option<PathBuf>, String) {
        let registry = StaticRegistry::new();
        if let Some(port) = self.firestore_port {
            registry.insert("firestore", self.firestore_host.clone(), port);
        }
        let config = EmulatorConfig {
            host: self.host,
            port: self.port,
            project_id: self.project_id,
            functions_dir: self.functions_dir,
            node_binary: self.node_binary,
            runtime_entry: self.runtime_entry,
            disabled_features: self.disabled_features,
        };
        (config, Arc::new(registry), self.log_dir, self.log_level)
    }
}

fn load_env_file(path: Option<&PathBuf>) {
    if let Some(path) = path {
        if path.exists() {
            dotenvy::from_path(path).ok();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Triggers(args) => triggers(args).await,
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    load_env_file(args.env_file.as_ref());
    let (config, registry, log_dir, log_level) = args.into_parts();
    let _guard = init_tracing(&log_level, log_dir)?;

    let emulator = FunctionsEmulator::new(config, registry);
    emulator.start().await.context("failed to start gateway")?;
    emulator.connect().await.context("failed to load triggers")?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    emulator.stop();
    Ok(())
}

async fn triggers(args: ServeArgs) -> anyhow::Result<()> {
    load_env_file(args.env_file.as_ref());
    let (config, registry, log_dir, log_level) = args.into_parts();
    let _guard = init_tracing(&log_level, log_dir)?;

    let emulator = FunctionsEmulator::new(config, registry);
    emulator.connect().await.context("failed to load triggers")?;
    let table = emulator.triggers().await;
    println!("{}", serde_json::to_string_pretty(&table)?);
    emulator.stop();
    Ok(())
}
