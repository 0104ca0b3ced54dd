use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use painel_core::aggregate::service::PipelineService;
use painel_core::storage::cache::{CacheOptions, OpportunityCache};
use painel_core::time::range::DateFilter;
use painel_core::watch::hook::{PipelineWatcher, WatchOptions, WatchState};

#[derive(Debug, Parser)]
#[command(name = "painel_worker")]
struct Args {
    /// Print one aggregate as JSON and exit.
    #[arg(long)]
    once: bool,

    /// First day of the filter (YYYY-MM-DD, UTC).
    #[arg(long)]
    date_from: Option<String>,

    /// Last day of the filter (YYYY-MM-DD, UTC), inclusive.
    #[arg(long)]
    date_to: Option<String>,

    /// Watch refresh interval. Defaults to PIPELINES_REFRESH_SECS.
    #[arg(long)]
    refresh_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = painel_core::config::Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let args = Args::parse();
    let filter = DateFilter::parse(args.date_from.as_deref(), args.date_to.as_deref())?;

    let cache = Arc::new(OpportunityCache::new(CacheOptions::from_env()));
    let service = PipelineService::from_settings(&settings, cache)?;

    if args.once {
        let agg = service.get_pipelines_data(&filter).await;
        println!("{}", serde_json::to_string_pretty(&agg)?);
        if let Some(error) = agg.error {
            let err = anyhow::anyhow!(error);
            sentry_anyhow::capture_anyhow(&err);
            return Err(err);
        }
        return Ok(());
    }

    let mut opts = WatchOptions::from_env();
    if let Some(secs) = args.refresh_secs {
        opts.refresh = Duration::from_secs(secs.max(1));
    }
    tracing::info!(?filter, refresh = ?opts.refresh, "watching pipeline aggregate");

    let events = service.subscribe();
    let watcher = PipelineWatcher::spawn(Arc::new(service), Some(events), opts, filter);
    let mut states = watcher.subscribe();

    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                log_state(&state);
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("ctrl-c received; stopping watcher");
                break;
            }
        }
    }

    watcher.shutdown();
    Ok(())
}

fn log_state(state: &WatchState) {
    if state.loading {
        tracing::debug!(phase = ?state.phase, "loading");
        return;
    }
    let data = state.data.as_deref();
    tracing::info!(
        phase = ?state.phase,
        pipeline = data.and_then(|d| d.aggregate.pipeline_name.as_deref()),
        total = data.map(|d| d.aggregate.total),
        total_geral = data.map(|d| d.aggregate.total_geral),
        stages = data.map(|d| d.aggregate.stages.len()),
        is_partial = data.map(|d| d.aggregate.is_partial),
        tags = data.map(|d| d.aggregate.tags.len()),
        error = state.error.as_deref(),
        "pipeline state"
    );
    if let Some(data) = data {
        for stage in &data.aggregate.stages {
            tracing::info!(
                stage = %stage.name,
                count = stage.count,
                previous = ?stage.previous_count,
                change_percent = ?stage.change_percent,
                "stage"
            );
        }
    }
}

fn init_sentry(settings: &painel_core::config::Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}
