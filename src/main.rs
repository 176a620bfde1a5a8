use anyhow::{bail, Context};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use rangeforge::adapter::LdapDirectoryAdapter;
use rangeforge::{plan, ForgeConfig, ForgeEngine};

fn usage() -> ! {
    eprintln!("usage: rangeforge <config.json> [--plan]");
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut args = std::env::args().skip(1);
    let Some(config_path) = args.next() else { usage() };
    let plan_only = match args.next().as_deref() {
        None => false,
        Some("--plan") => true,
        Some(_) => usage(),
    };

    let text = std::fs::read_to_string(&config_path)
        .with_context(|| format!("reading config {}", config_path))?;
    let config = ForgeConfig::from_json(&text).context("parsing config")?;
    config.validate().context("validating config")?;

    if plan_only {
        let plan = plan(&config)?;
        println!("plan for {} (seed {})", plan.base_dn, config.seed);
        for (object_type, count) in plan.object_counts() {
            println!("  {:<20} {}", object_type, count);
        }
        println!("  {:<20} {}", "relationships", plan.relationships.len());
        println!(
            "  {:<20} {}",
            "misconfigurations",
            plan.planned_misconfigs.len()
        );
        return Ok(());
    }

    let Some(connection) = &config.connection else {
        bail!("config has no [connection] section; use --plan for an offline dry run");
    };
    let adapter = LdapDirectoryAdapter::connect(connection)
        .await
        .context("connecting to directory")?;
    let threshold = config.execution.critical_failure_threshold;
    let engine = ForgeEngine::new(config, Arc::new(adapter))?;

    let cancel = engine.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, finishing in-flight work");
            cancel.cancel();
        }
    });

    let summary = engine.run().await?;
    let totals = summary.objects_total();
    info!(
        run_id = %summary.run_id,
        cancelled = summary.cancelled,
        objects_created = totals.successes(),
        objects_failed = totals.failed,
        relationships = summary.relationships.successes(),
        misconfigurations = summary.misconfigurations.succeeded,
        ledger_entries = summary.ledger_entries,
        "run complete"
    );

    if summary.critical_failure(threshold) {
        error!("OU creation failure rate exceeded the critical threshold");
        std::process::exit(1);
    }
    Ok(())
}
