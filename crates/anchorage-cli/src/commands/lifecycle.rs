use anyhow::{Context, Result};

use anchorage_store::{
    BackendMode, Config, DockerProvisioner, HealthProbe, HttpHealthProbe, LifecycleController,
    Provisioner,
};

/// Bring the backend up, then hold it until Ctrl-C.
pub async fn run_up(config: &Config) -> Result<()> {
    let controller =
        LifecycleController::from_config(config).context("Invalid backend configuration")?;

    println!("Starting backing store ({})...", config.mode);
    let handle = controller
        .ensure_ready()
        .await
        .context("Backing store did not become ready")?;

    println!("✓ Backing store ready at {}", handle.endpoint());
    if handle.is_managed() {
        println!("  Container: {}", config.container_name);
        println!("  Data: {}", config.data_dir.display());
    }
    println!("\nPress Ctrl-C to stop.");

    let mut states = controller.subscribe();
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                println!("  State: {state}");
                if state.is_terminal() {
                    break;
                }
            }
        }
    }

    println!("\nShutting down...");
    log::info!("Shutting down the backing store");
    controller.shutdown().await.context("Shutdown failed")?;
    log::info!("Backing store stopped");
    println!("✓ Stopped");
    Ok(())
}

/// Probe the configured backend once and report what was found.
pub async fn show_status(config: &Config) -> Result<()> {
    println!("\nAnchorage Status\n");
    println!("  Mode: {}", config.mode);

    let endpoint = match config.mode {
        BackendMode::External => config
            .url
            .clone()
            .context("External mode requires url to be set")?,
        BackendMode::SelfManaged => {
            let provisioner = DockerProvisioner::from_config(config);
            println!("  Container: {}", provisioner.container_name());
            match provisioner.find_running().await? {
                Some(port) => format!("http://127.0.0.1:{port}"),
                None => {
                    println!("  Running: no");
                    println!("\n  Run `anchorage up` to start it");
                    return Ok(());
                }
            }
        }
    };
    println!("  Endpoint: {}", endpoint);

    let probe = HttpHealthProbe::new(config.request_timeout(), config.api_key.clone())
        .context("Failed to create HTTP client")?;
    let result = probe.probe(&endpoint).await;
    if result.reachable {
        println!("  Healthy: yes ({} ms)", result.latency.as_millis());
    } else {
        println!("  Healthy: no");
        if let Some(error) = result.error {
            println!("  Error: {}", error);
        }
    }

    Ok(())
}

/// Stop the managed container, if there is one.
pub async fn run_down(config: &Config) -> Result<()> {
    if config.mode == BackendMode::External {
        anyhow::bail!("The backing store is external; anchorage does not manage it");
    }

    let provisioner = DockerProvisioner::from_config(config);
    if provisioner.find_running().await?.is_none() {
        println!("Container {} is not running", provisioner.container_name());
        return Ok(());
    }

    log::info!("Stopping container {}", provisioner.container_name());
    provisioner
        .terminate(config.shutdown_grace())
        .await
        .context("Failed to stop the backing store")?;
    println!("✓ Stopped {}", provisioner.container_name());
    Ok(())
}
