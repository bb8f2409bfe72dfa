use crate::k8s::handlers::{EventKind, Handlers};
use anyhow::anyhow;
use clap::Parser;
use log::error;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use pingora::prelude::background_service;
use std::path::PathBuf;
use tokio::runtime::Runtime;

mod catalog;
mod k8s;
mod server;

#[derive(Parser, Debug)]
#[command(version, about = "Keeps a live catalog of Kubernetes Services", long_about = None)]
struct CliArgs {
    #[arg(short, long, default_value = "/etc/catalog/config.yaml")]
    config_file: String,

    /// Overrides the kubeconfig path (defaults to ~/.kube/config)
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    #[arg(long, default_value_t = log::LevelFilter::Info)]
    log_level: log::LevelFilter,
}

fn main() {
    let cli_args = CliArgs::parse();
    env_logger::builder()
        .filter_level(cli_args.log_level)
        .init();

    if let Err(e) = run(cli_args) {
        error!("{}", e);
    }
}

fn run(args: CliArgs) -> Result<(), anyhow::Error> {
    let mut config = server::config::load(&args.config_file)?;
    if args.kubeconfig.is_some() {
        config.catalog.kubeconfig = args.kubeconfig;
    }
    let mut server = server::new(config.server);

    let (watch_failure_tx, mut watch_failure_rx) = tokio::sync::mpsc::channel(1);

    let mut handlers = Handlers::new();
    handlers.subscribe("log", &EventKind::ALL, catalog::logging::log_changes());

    server.bootstrap();
    server.add_services(vec![Box::new(background_service(
        "Kubernetes Service catalog",
        catalog::Service::new(config.catalog, handlers, watch_failure_tx),
    ))]);

    let rt = Runtime::new().map_err(|e| anyhow!("Failed to create watch failure runtime {}", e))?;
    rt.spawn(async move {
        if let Some(failure) = watch_failure_rx.recv().await {
            error!("Catalog error: {}", failure);
            if let Err(e) = signal::kill(Pid::this(), Signal::SIGINT) {
                error!("Unable to signal shutdown: {}", e);
            }
        }
    });
    server.run_forever();
}
