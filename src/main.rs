use std::error::Error;
use std::sync::Arc;

use envconfig::Envconfig;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::lib::{
    api, config::Config, containers::docker::DockerRuntime, supervisor::Supervisor,
};

mod lib {
    pub mod api;
    pub mod backup;
    pub mod config;
    pub mod containers;
    pub mod error;
    pub mod health;
    pub mod scheduler;
    pub mod supervisor;
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config = load_config(Config::init_from_env)?;

    let runtime = DockerRuntime::connect(&config.docker.socket_path)
        .inspect_err(|e| error!(error = %e, "cannot connect to container runtime"))?;
    let supervisor = Supervisor::new(config.clone(), Arc::new(runtime));
    supervisor.start().await?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            info!("received shutdown signal");
            shutdown.cancel();
        }
    });

    let served = api::serve(
        Arc::new(supervisor.app_state()),
        &config.bind(),
        shutdown.clone(),
    )
    .await;
    if let Err(e) = &served {
        error!(error = %e, "api server failed");
    }

    supervisor.shutdown().await;
    served?;
    Ok(())
}

/// Reads the configuration and brings up tracing in the format it asks for.
/// An invalid configuration is logged with the default format before it is
/// returned.
fn load_config<F>(read: F) -> Result<Config, envconfig::Error>
where
    F: FnOnce() -> Result<Config, envconfig::Error>,
{
    match read() {
        Ok(config) => {
            init_tracing(config.json_logs());
            Ok(config)
        }
        Err(e) => {
            init_tracing(false);
            error!(error = %e, "invalid configuration, aborting start-up");
            Err(e)
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = installed {
        eprintln!("tracing already initialised: {e}");
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        tokio::select! {
            _ = ctrl_c() => {},
            _ = terminate() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c().await;
    }
}

async fn ctrl_c() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(?err, "failed to install Ctrl+C handler");
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(err) => warn!(?err, "failed to install SIGTERM handler"),
    }
}
