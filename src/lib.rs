pub mod commands;
pub mod config;
mod error;
pub mod host;
pub mod instance;
pub mod orchestrator;
pub mod paths;
pub mod pool;
pub mod process;
pub mod store;
mod validation;
pub mod world;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser as _;
use commands::{run_operator_command, Cli, Command};
use config::{load_config, with_config_mut, AppConfig};
pub use error::{AppError, ErrorKind, Result};
use host::{heartbeat_loop, mark_dead, register_host, Host};
use orchestrator::HostOrchestrator;
use pool::WorkerPool;
use store::{blocking, FleetStore, JsonStore};

/// Time workers get to return on their own before being aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Binary entry point. Without a subcommand the process serves the local
/// host; operator subcommands run once against the shared store.
#[allow(clippy::expect_used)]
pub fn run() {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Some(data_dir) = &cli.home {
        std::env::set_var(paths::HOME_ENV, data_dir);
    }

    let result = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .expect("Failed to build tokio runtime");
            runtime.block_on(serve())
        }
        command => run_operator_command(command),
    };

    if let Err(e) = result {
        log::error!("Fleetkeeper stopped: {}", e);
        std::process::exit(1);
    }
}

async fn serve() -> Result<()> {
    paths::ensure_data_dirs()?;
    let config = load_config()?;
    let store: Arc<dyn FleetStore> = Arc::new(JsonStore::open(paths::store_path())?);
    let host = {
        let config = Arc::clone(&config);
        blocking(&store, move |store| ensure_local_host(store, &config)).await?
    };
    log::info!(
        "Serving host {} ({}) from {:?}",
        host.name,
        host.id,
        paths::get_data_dir()
    );

    let pool = WorkerPool::new();
    pool.run(vec![
        (
            "heartbeat".to_string(),
            heartbeat_loop(Arc::clone(&store), host.id.clone()),
        ),
        (
            format!("orchestrator:{}", host.name),
            HostOrchestrator::new(host.id.clone(), Arc::clone(&store), load_config()?)
                .into_loop_body(),
        ),
    ])?;

    tokio::signal::ctrl_c().await?;
    log::info!("Interrupt received, stopping workers...");

    for report in pool.shutdown(SHUTDOWN_GRACE).await {
        log::info!("{}: {:?}", report.name, report.exit);
    }
    let host_id = host.id.clone();
    blocking(&store, move |store| mark_dead(store, &host_id)).await?;
    Ok(())
}

/// Look up the host this process serves, registering it on first start.
fn ensure_local_host(store: &dyn FleetStore, config: &AppConfig) -> Result<Host> {
    if let Some(id) = &config.host_id {
        match store.host(id) {
            Ok(host) => return Ok(host),
            Err(e) if e.kind() == ErrorKind::HostNotFound => {
                log::warn!("Configured host {} is not in the store, registering anew", id);
            }
            Err(e) => return Err(e),
        }
    }

    let host = register_host(
        store,
        &config.host_name,
        &config.host_address,
        config.host_base_dir(),
        config.heartbeat_interval(),
    )?;
    let id = host.id.clone();
    with_config_mut(move |config| {
        config.host_id = Some(id);
        Ok(())
    })?;
    Ok(host)
}
