//! Process entry point.

use tracing::{error, info};

use pgherd::backend::pool::pool;
use pgherd::cli::Cli;
use pgherd::cluster::{registry, status_file, StatusFile};
use pgherd::frontend::Listener;
use pgherd::{cluster, config, healthcheck, shutdown, watchdog};

fn main() {
    let cli = Cli::load();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        );
    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let cfg = match config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("configuration error: {}", err);
            std::process::exit(1);
        }
    };

    if cli.check {
        info!("configuration ok: {}", cli.config.display());
        return;
    }

    info!(
        "pgherd {} starting with {} backends",
        env!("CARGO_PKG_VERSION"),
        cfg.backends.len()
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("could not start runtime: {}", err);
            std::process::exit(1);
        }
    };

    runtime.block_on(async move {
        // Seed the registry with statuses from the previous run.
        let statuses = StatusFile::new(&cfg.general.status_file).load();
        registry().init(&cfg, statuses);

        if let Err(err) = status_file::write_pid_file(&cfg.general.pid_file) {
            error!("could not write PID file: {}", err);
        }

        shutdown::listen();
        pool().launch();
        healthcheck::launch();

        // With the watchdog up, node operations go through cluster
        // consensus; standalone they execute directly.
        let coordinator = watchdog::launch();
        tokio::spawn(cluster::failover::run(coordinator));

        let mut listener = Listener::new(cfg.general.listen_addr());
        if let Err(err) = listener.listen().await {
            error!("listener error: {}", err);
        }

        status_file::remove_pid_file(&cfg.general.pid_file);
        info!("pgherd shut down");
    });
}
