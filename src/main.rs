use std::sync::{Arc, Mutex};
use tokio::time;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use swarm_loadtest::client::ReqwestTransportFactory;
use swarm_loadtest::config::Config;
use swarm_loadtest::metrics::{gather_metrics_string, register_metrics, start_metrics_server};
use swarm_loadtest::plan::YamlPlan;
use swarm_loadtest::pool::{RunConfig, RunHandle, UserPool};
use swarm_loadtest::stats::{format_stats_table, StatsAggregator};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Prints helpful configuration documentation.
fn print_config_help() {
    eprintln!("Required environment variables:");
    eprintln!("  PLAN_FILE               - Path to the YAML test plan (see demos/ecommerce.yaml)");
    eprintln!();
    eprintln!("Run parameters (override the plan's run: section):");
    eprintln!("  SWARM_USERS             - Number of virtual users to spawn (default: 1)");
    eprintln!("  SPAWN_RATE              - Users spawned per second (default: 1)");
    eprintln!("  TEST_DURATION           - Run time: 30s, 10m, 2h (default: until Ctrl-C)");
    eprintln!("  WAIT_MIN / WAIT_MAX     - Think time between actions (default: 1s / 3s)");
    eprintln!("  REQUEST_TIMEOUT         - Per-request timeout (default: 30s)");
    eprintln!("  HOSTS                   - Host overrides: UserType=http://host:port,...");
    eprintln!("  TAGS                    - Only run tasks carrying one of these tags");
    eprintln!("  EXCLUDE_TAGS            - Never run tasks carrying one of these tags");
    eprintln!("  RANDOM_SEED             - Seed for reproducible task selection");
    eprintln!();
    eprintln!("Reporting:");
    eprintln!("  STATS_INTERVAL          - Interval between progress logs (default: 5s)");
    eprintln!("  STATS_JSON              - Write the final statistics as JSON to this path");
    eprintln!("  METRICS_PORT            - Prometheus exporter port (default: 9090)");
    eprintln!("  METRIC_NAMESPACE        - Prometheus metric namespace (default: swarm_loadtest)");
    eprintln!("  LOG_FORMAT              - 'json' for JSON logs; RUST_LOG sets the filter");
    eprintln!();
    eprintln!("HTTP client:");
    eprintln!("  SKIP_TLS_VERIFY         - Skip TLS certificate verification (default: false)");
    eprintln!("  CUSTOM_HEADERS          - Comma-separated headers (use \\, for literal commas)");
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };
    if let Err(err) = result {
        eprintln!("tracing init failed: {err}");
    }
}

/// Logs a progress line every `interval` until the run finishes.
async fn report_progress(handle: RunHandle, interval: time::Duration) {
    let mut ticker = time::interval(interval);
    ticker.tick().await;
    let finished = handle.wait();
    tokio::pin!(finished);

    loop {
        tokio::select! {
            _ = &mut finished => break,
            _ = ticker.tick() => {
                let total = handle.aggregator().snapshot().total;
                info!(
                    live_users = handle.live_users(),
                    requests = total.count,
                    failures = total.failure_count,
                    current_rps = total.current_rps,
                    p95_ms = total.p95_ms,
                    "Progress"
                );
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}\n", e);
            print_config_help();
            std::process::exit(1);
        }
    };

    init_tracing(config.json_logs);
    register_metrics()?;

    let plan = match YamlPlan::from_file(&config.plan_file) {
        Ok(plan) => plan,
        Err(e) => {
            eprintln!("Failed to load plan '{}': {}", config.plan_file, e);
            std::process::exit(1);
        }
    };

    let mut run_config = RunConfig::default();
    plan.apply_run_settings(&mut run_config)?;
    let run_config = config.to_run_config(run_config)?;
    let test_plan = plan.to_test_plan()?;

    let factory = ReqwestTransportFactory::new(config.to_client_config(&run_config))?;
    let user_types: Vec<(&str, &str)> = test_plan
        .user_types()
        .iter()
        .map(|(name, user_type)| (name.as_str(), user_type.host.as_str()))
        .collect();
    config.print_summary(&run_config, &user_types, factory.parsed_headers());

    let registry_arc = Arc::new(Mutex::new(prometheus::default_registry().clone()));
    {
        let registry = registry_arc.clone();
        let port = config.metrics_port;
        tokio::spawn(async move {
            start_metrics_server(port, registry).await;
        });
    }

    let handle = UserPool::start(
        &test_plan,
        run_config,
        Arc::new(factory),
        StatsAggregator::new(),
    )?;
    let reporter = tokio::spawn(report_progress(handle.clone(), config.stats_interval));

    tokio::select! {
        _ = handle.wait() => info!("Test duration completed"),
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => info!("Received Ctrl-C, stopping users"),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl-C, stopping users"),
        },
    }
    handle.stop().await;
    if let Err(e) = reporter.await {
        warn!(error = %e, "Progress reporter ended abnormally");
    }

    let summaries = handle.summaries();
    info!(
        users = summaries.len(),
        spawn_failures = handle.spawn_failures(),
        skipped_actions = summaries.iter().map(|s| s.skipped).sum::<u64>(),
        "All users stopped"
    );

    let snapshot = handle.aggregator().snapshot();
    println!("\n{}", format_stats_table(&snapshot));

    if let Some(path) = &config.stats_json {
        match serde_json::to_string_pretty(&snapshot) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    error!(path = %path, error = %e, "Failed to write statistics");
                }
            }
            Err(e) => error!(error = %e, "Failed to serialize statistics"),
        }
    }

    let final_metrics_output = gather_metrics_string(&registry_arc);
    println!("\n--- FINAL METRICS ---\n{}", final_metrics_output);
    println!("--- END OF FINAL METRICS ---\n");

    Ok(())
}
