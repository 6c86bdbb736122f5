use clap::Parser;

use avcapd::cli::Args;
use avcapd::core::DaemonState;

fn main() -> Result<(), ()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(args.tracing_level())
        .with_target(false)
        .init();

    if args.daemonize {
        avcapd::daemonize::daemonize(true).map_err(|e| {
            tracing::error!(error = %e, "failed to daemonize");
        })?;
    }

    // Taken after daemonize() returns: a fork() changes the pid, and the
    // socket path must name the pid that actually owns the listener.
    let pid = std::process::id();

    let mode_index = args.mode_index().map_err(|e| {
        tracing::error!(error = %e, mode = %args.mode, "unknown capture mode");
    })?;

    let uds_path = args.uds_path(pid);
    tracing::info!(path = %uds_path.display(), mode_index, "starting capture daemon");

    let mut daemon = DaemonState::new(&uds_path, &args.render_node, mode_index).map_err(|e| {
        tracing::error!(error = %e, "daemon initialization failed");
    })?;

    daemon.run().map_err(|e| {
        tracing::error!(error = %e, "daemon loop exited with error");
    })?;

    tracing::info!("shutdown complete");
    Ok(())
}
