use anyhow::Result;
use clap::Parser;
use relgraph::{RebuildReport, ServiceConfig, SweepFailure};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "relgraph-rebuild",
    about = "Re-embed a whole collection and rewrite every related-articles field"
)]
struct RebuildCli {
    /// Only reprocess these content ids (plus one-hop propagation) instead of a full rebuild
    #[arg(long = "id")]
    ids: Vec<String>,

    #[command(flatten)]
    config: ServiceConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("relgraph=info".parse()?))
        .init();

    let cli = RebuildCli::parse();
    let service = cli.config.build().await?;
    let endpoint = service.default_endpoint.clone();

    if cli.ids.is_empty() {
        let report = service.updater.batch_rebuild(&endpoint).await?;
        print_rebuild(&endpoint, &report);
        return Ok(());
    }

    let mut failures = Vec::new();
    for id in &cli.ids {
        match service.updater.handle_event(&endpoint, id).await {
            Ok(outcome) => {
                println!(
                    "{id}: {} neighbor{} [{}], {} relinked",
                    outcome.neighbors.len(),
                    if outcome.neighbors.len() == 1 { "" } else { "s" },
                    outcome.neighbors.join(", "),
                    outcome.propagation.relinked.len()
                );
                failures.extend(outcome.propagation.failed);
            }
            Err(err) => {
                warn!(content_id = %id, error = %format!("{err:#}"), "reprocess failed");
                failures.push(SweepFailure {
                    id: id.clone(),
                    error: format!("{err:#}"),
                });
            }
        }
    }
    print_failures(&failures);
    anyhow::ensure!(failures.is_empty(), "{} id(s) failed", failures.len());
    Ok(())
}

fn print_rebuild(endpoint: &str, report: &RebuildReport) {
    println!(
        "Rebuilt {endpoint}: {} article{} ingested over {} page{}, {} relinked.",
        report.ingested,
        if report.ingested == 1 { "" } else { "s" },
        report.pages,
        if report.pages == 1 { "" } else { "s" },
        report.relinked
    );
    print_failures(&report.failed);
}

fn print_failures(failures: &[SweepFailure]) {
    for failure in failures {
        eprintln!("failed {}: {}", failure.id, failure.error);
    }
}
