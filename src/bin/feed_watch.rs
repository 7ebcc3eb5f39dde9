use launchpad_feed::{handlers, EngineConfig, FeedEngine, FeedError, FeedPayload, FeedUpdate};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn summarize(update: &FeedUpdate) -> String {
    match &update.payload {
        FeedPayload::List(snapshot) => format!("list of {} items", snapshot.len()),
        FeedPayload::Candles(view) => format!(
            "{} {} candles, last close {}",
            view.candles.len(),
            view.interval.as_str(),
            view.candles
                .last()
                .map(|candle| candle.close.to_string())
                .unwrap_or_else(|| "-".to_string())
        ),
        FeedPayload::Value { kind, .. } => format!("{} value", kind.as_str()),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let Some(topic) = std::env::args().nth(1) else {
        eprintln!("usage: feed_watch <topic>");
        std::process::exit(2);
    };

    let engine = match EngineConfig::from_env().and_then(|config| FeedEngine::from_config(&config)) {
        Ok(engine) => engine,
        Err(error) => {
            error!(%error, "failed to build feed engine");
            std::process::exit(1);
        }
    };

    let subscription = match engine.subscribe(
        &topic,
        handlers(
            |update: &FeedUpdate| {
                info!(topic = %update.topic, source = ?update.source, "{}", summarize(update));
            },
            |error: &FeedError| warn!(%error, "feed error"),
        ),
    ) {
        Ok(subscription) => subscription,
        Err(error) => {
            error!(%error, "subscribe failed");
            std::process::exit(1);
        }
    };

    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(%error, "failed to listen for ctrl-c");
    }

    if let Some(status) = engine.status(&topic) {
        info!(
            state = ?status.state,
            ingest = status.ingest_count,
            emit = status.emit_count,
            "final status"
        );
    }
    engine.unsubscribe(&subscription);
    engine.shutdown();
}
