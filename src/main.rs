use anyhow::Result;
use clap::Parser;
use gymscan::browser::BrowserPool;
use gymscan::compliance::Compliance;
use gymscan::config::Config;
use gymscan::fetch::{light::LightClient, Fetcher};
use gymscan::orchestrator::Orchestrator;
use gymscan::planner::{LlmPlanner, PagePlanner, SelectorPlanner};
use gymscan::session::SessionManager;
use gymscan::sink::SupabaseSink;
use gymscan::trap::TrapDetector;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(
    name = "gymscan",
    about = "Scan a gym website's schedule and persist it",
    version
)]
struct Cli {
    /// Schedule page URL to scan
    url: String,

    /// IANA timezone for local times on the page (e.g. America/New_York)
    #[arg(default_value = "UTC")]
    timezone: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Usage problems and fatal scan failures share exit code 1.
            e.print().ok();
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("gymscan=info".parse().expect("directive parses")),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    info!(url = %cli.url, timezone = %cli.timezone, "starting scan");

    let planner: Option<Arc<dyn PagePlanner>> = match &config.openai_api_key {
        Some(key) => Some(Arc::new(LlmPlanner::new(
            key.clone(),
            config.llm_budget_cents,
        ))),
        None => Some(Arc::new(SelectorPlanner)),
    };

    let session = Arc::new(SessionManager::new(Arc::clone(&config), planner.clone()));
    let pool = Arc::new(BrowserPool::new(Arc::clone(&session)));
    let compliance = Arc::new(Compliance::new(&config.bot_user_agent, config.rate_limit_ms));
    let trap = Arc::new(TrapDetector::new(config.max_crawl_depth));
    let fetcher = Arc::new(Fetcher::new(
        LightClient::new(config.fetch_timeout_ms),
        Arc::clone(&pool),
        Arc::clone(&session),
        Arc::clone(&compliance),
    ));
    let sink = Arc::new(SupabaseSink::new(
        config.supabase_url.clone(),
        config.supabase_key.clone(),
    ));

    let orchestrator = Orchestrator::new(
        Arc::clone(&config),
        trap,
        session,
        Arc::clone(&compliance),
        Arc::clone(&pool),
        fetcher,
        planner,
        sink,
    );

    // Shut the browser down on ctrl-c; upserts never straddle the select
    // because the scan future is dropped between stages, not inside the sink.
    let scan = orchestrator.scan(&cli.url, &cli.timezone);
    let outcome = tokio::select! {
        outcome = scan => outcome,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down browser");
            pool.shutdown().await;
            std::process::exit(1);
        }
    };

    pool.shutdown().await;

    match outcome {
        Ok(outcome) => {
            info!(
                organization = %outcome.organization_ref,
                locations = outcome.location_refs.len(),
                classes = outcome.classes_upserted,
                "scan complete"
            );
            for warning in &outcome.warnings {
                info!(%warning, "scan warning");
            }
            println!(
                "{}",
                serde_json::to_string_pretty(&outcome).unwrap_or_default()
            );
            Ok(())
        }
        Err(e) => {
            error!("scan failed: {e}");
            std::process::exit(1);
        }
    }
}
