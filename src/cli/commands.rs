use crate::cli::{Commands, OutputFormat};
use crate::metrics::PrometheusExporter;
use crate::{Discoverer, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

pub async fn handle_command(command: Commands, config_file: Option<PathBuf>) -> Result<()> {
    match command {
        Commands::Watch {
            discovery,
            report_secs,
            metrics,
        } => {
            let config = discovery.resolve(config_file.as_ref())?;
            handle_watch(Discoverer::new(config).await?, report_secs, metrics).await
        }
        Commands::List {
            discovery,
            format,
            settle_secs,
        } => {
            let config = discovery.resolve(config_file.as_ref())?;
            handle_list(Discoverer::new(config).await?, format, settle_secs).await
        }
    }
}

async fn handle_watch(discoverer: Discoverer, report_secs: u64, print_metrics: bool) -> Result<()> {
    discoverer.run().await;

    let mut report = tokio::time::interval(Duration::from_secs(report_secs.max(1)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C");
                break;
            }
            _ = report.tick() => {
                let apis = discoverer.api_list();
                info!("{} APIs discovered", apis.len());
                for api in apis {
                    info!("  {}", api);
                }
            }
        }
    }

    discoverer.shutdown().await;

    if print_metrics {
        let exporter = PrometheusExporter::new(discoverer.metrics().clone());
        print!("{}", exporter.format_current_metrics()?);
    }
    Ok(())
}

#[derive(Serialize)]
struct ListOutput {
    apis: Vec<String>,
    specs: Vec<String>,
}

async fn handle_list(discoverer: Discoverer, format: OutputFormat, settle_secs: u64) -> Result<()> {
    discoverer.run().await;

    info!("Letting discovery settle for {}s", settle_secs);
    tokio::time::sleep(Duration::from_secs(settle_secs)).await;

    let output = ListOutput {
        apis: discoverer.api_list(),
        specs: discoverer.specs().into_keys().collect(),
    };
    discoverer.shutdown().await;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&output)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(&output)?),
    }
    Ok(())
}
