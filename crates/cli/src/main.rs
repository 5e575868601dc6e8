use std::process::ExitCode;

use clap::Parser;
use cli::{
    CliError, CliOverrides, GatewayOverrides, MemoryOverrides, SelectionOverrides,
    bootstrap_gateway, load_agent_config,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use types::init_tracing;

#[derive(Debug, Clone, Parser, PartialEq, Eq)]
#[command(name = "wayfarer", about = "Wayfarer agent gateway")]
struct WayfarerArgs {
    /// Config profile to select from profile-aware config files.
    #[arg(long, env = "WAYFARER_PROFILE")]
    profile: Option<String>,
    /// Address the HTTP gateway binds to.
    #[arg(long)]
    bind: Option<String>,
    #[arg(long)]
    model: Option<String>,
    /// Enables durable memory backed by a local libsql file.
    #[arg(long = "memory-db")]
    memory_db: Option<String>,
    /// Prints the resolved configuration as TOML and exits.
    #[arg(long)]
    print_config: bool,
}

impl WayfarerArgs {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            selection: self.model.clone().map(|model| SelectionOverrides {
                model: Some(model),
                ..SelectionOverrides::default()
            }),
            memory: self.memory_db.clone().map(|db_path| MemoryOverrides {
                enabled: Some(true),
                db_path: Some(db_path),
                ..MemoryOverrides::default()
            }),
            gateway: self.bind.clone().map(|bind_address| GatewayOverrides {
                bind_address: Some(bind_address),
                ..GatewayOverrides::default()
            }),
            ..CliOverrides::default()
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(error) = run().await {
        eprintln!("wayfarer error: {error}");
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

async fn run() -> Result<(), CliError> {
    init_tracing();
    let args = WayfarerArgs::parse();
    let config = load_agent_config(args.profile.as_deref(), args.overrides())?;
    if args.print_config {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let app = bootstrap_gateway(config).await?;
    let bind_address = app.config.gateway.bind_address.clone();
    let listener = TcpListener::bind(&bind_address)
        .await
        .map_err(|source| CliError::BindGateway {
            address: bind_address.clone(),
            source,
        })?;

    let shutdown = CancellationToken::new();
    let maintenance = app.spawn_maintenance(shutdown.clone());
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::warn!(%error, "failed to listen for ctrl-c");
        }
        info!("shutdown requested");
        signal.cancel();
    });

    let router = gateway::router(app.coordinator.clone());
    gateway::serve(listener, router, shutdown.clone())
        .await
        .map_err(CliError::ServeGateway)?;
    shutdown.cancel();
    let _ = maintenance.await;
    info!("gateway stopped");
    Ok(())
}
