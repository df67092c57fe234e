//! coordinator: serve the built-in engine, or talk to a running server.
//!
//! # Usage
//!
//! ```bash
//! coordinator serve --config coordinator.toml
//! coordinator serve --listen unix:/tmp/coordinator.sock --workers 4
//! coordinator devices --endpoint 127.0.0.1:7070
//! coordinator reset --endpoint 127.0.0.1:7070 --container experiments
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use coordinator_rpc::messages::{ListDevicesRequest, ResetRequest};
use coordinator_rpc::{Client, Endpoint, Method, ServerBuilder, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "coordinator")]
#[command(about = "Asynchronous RPC front door for a computation coordinator")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a coordinator with the in-memory engine.
    Serve {
        /// TOML configuration file.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override the listen endpoint (host:port or unix:/path).
        #[arg(long)]
        listen: Option<Endpoint>,
        /// Override the number of event-loop workers.
        #[arg(long)]
        workers: Option<usize>,
        /// Override the standing RunStep slot count.
        #[arg(long)]
        run_step_slots: Option<usize>,
    },
    /// Print the devices a server reports, as JSON.
    Devices {
        #[arg(long, default_value = coordinator_rpc::config::DEFAULT_LISTEN)]
        endpoint: Endpoint,
    },
    /// Drop every session on a server.
    Reset {
        #[arg(long, default_value = coordinator_rpc::config::DEFAULT_LISTEN)]
        endpoint: Endpoint,
        /// Resource container to clear; may be repeated.
        #[arg(long)]
        container: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match args.command {
        Command::Serve {
            config,
            listen,
            workers,
            run_step_slots,
        } => serve(config, listen, workers, run_step_slots).await,
        Command::Devices { endpoint } => {
            let client = Client::connect(&endpoint)
                .await
                .with_context(|| format!("cannot connect to {endpoint}"))?;
            let devices = client.list_devices(&ListDevicesRequest {}).await?;
            println!("{}", serde_json::to_string_pretty(&devices)?);
            Ok(())
        }
        Command::Reset {
            endpoint,
            container,
        } => {
            let client = Client::connect(&endpoint)
                .await
                .with_context(|| format!("cannot connect to {endpoint}"))?;
            client.reset(&ResetRequest { container }).await?;
            println!("{}", serde_json::json!({ "reset": true, "endpoint": endpoint }));
            Ok(())
        }
    }
}

async fn serve(
    config: Option<PathBuf>,
    listen: Option<Endpoint>,
    workers: Option<usize>,
    run_step_slots: Option<usize>,
) -> anyhow::Result<()> {
    let config = match config {
        Some(path) => ServerConfig::load(&path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => ServerConfig::default(),
    };

    let mut builder = ServerBuilder::from_config(config);
    if let Some(listen) = listen {
        builder = builder.listen(listen);
    }
    if let Some(workers) = workers {
        builder = builder.workers(workers);
    }
    if let Some(slots) = run_step_slots {
        builder = builder.standing(Method::RunStep, slots);
    }

    let server = builder.serve_local().await?;
    println!(
        "{}",
        serde_json::json!({ "listening": server.local_endpoint() })
    );

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            tracing::info!("interrupt received");
        }
        _ = server.closed() => {}
    }

    server.shutdown().await?;
    Ok(())
}
