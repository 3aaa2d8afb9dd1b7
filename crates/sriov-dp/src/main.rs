use anyhow::Result;
use clap::Parser;
use sriov_dp::app::Daemon;
use sriov_dp::config::DaemonArgs;
use utils::logging;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let args = DaemonArgs::parse();
    let _guard = logging::init(args.log_dir.as_deref())?;

    tracing::info!("Starting SR-IOV network device plugin {}", &**version::VERSION);

    let mut daemon = Daemon::new(args);
    daemon
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("{e:?}"))?;

    let waited = daemon.wait_for_shutdown().await;
    daemon
        .shutdown()
        .await
        .map_err(|e| anyhow::anyhow!("{e:?}"))?;
    waited?;

    tracing::info!("SR-IOV network device plugin stopped");
    Ok(())
}
