use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::process::ExitCode;
use taskload::config::OutputFormat;
use taskload::{BenchmarkRunner, Cli, Config};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Resolves once the user asks the run to stop
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Logs go to stderr so stdout carries only the report
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskload=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config::load(Cli::parse())?;
    info!(
        "Loaded configuration: api_url={}, mode={}, tasks={}, concurrency={}, workers={}",
        config.api_url,
        config.mode.name(),
        config.tasks,
        config.concurrency,
        config.workers
    );

    if let Some(addr) = config.metrics_addr {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!("Prometheus metrics exposed on http://{}/metrics", addr);
    }

    let output = config.output;
    let mut runner = BenchmarkRunner::new(config)?;

    match runner.run_until(shutdown_signal()).await {
        Ok(report) => {
            match output {
                OutputFormat::Text => println!("{}", report),
                OutputFormat::Json => println!("{}", report.to_json()?),
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!("Benchmark failed: {}", e);
            eprintln!("Error: {}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}
