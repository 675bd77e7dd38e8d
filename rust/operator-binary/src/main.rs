mod claim;
mod cluster;
mod config;
mod controller;
mod eligibility;
mod resolver;
mod retry;
mod scale;
#[cfg(test)]
mod testing;
mod workload;

use crate::{
    config::{ReattachConfig, ReattachRun},
    controller::ResizeController,
};
use anyhow::Context;
use clap::Parser;
use stackable_operator::{cli::ProductOperatorRun, kube};

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const APP_NAME: &str = "volume-reattach";
pub const OPERATOR_NAME: &str = "volume-reattach.stackable.tech";

#[derive(Parser)]
#[clap(about, author)]
struct Opts {
    #[clap(subcommand)]
    cmd: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Run the operator
    Run(ReattachRun),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    match opts.cmd {
        Command::Run(run) => {
            let config = ReattachConfig::try_from(&run);
            let ProductOperatorRun {
                watch_namespace,
                tracing_target,
                ..
            } = run.common;
            stackable_operator::logging::initialize_logging(
                "VOLUME_REATTACH_OPERATOR_LOG",
                APP_NAME,
                tracing_target,
            );
            stackable_operator::utils::print_startup_string(
                built_info::PKG_DESCRIPTION,
                built_info::PKG_VERSION,
                built_info::GIT_VERSION,
                built_info::TARGET,
                built_info::BUILT_TIME_UTC,
                built_info::RUSTC_VERSION,
            );

            let config = config.context("invalid configuration")?;
            tracing::info!(
                workers = config.workers,
                supported_provisioners = ?config.supported_provisioners,
                "loaded configuration"
            );
            let client = kube::Client::try_default()
                .await
                .context("failed to create Kubernetes client")?;

            ResizeController::new(client, config, watch_namespace)
                .start(shutdown_signal())
                .await
                .context("controller failed")?;
        }
    }

    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(error) => {
                tracing::warn!(
                    error = &error as &dyn std::error::Error,
                    "failed to listen for SIGTERM"
                );
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT, shutting down"),
        () = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
