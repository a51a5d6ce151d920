use crate::config::LoggingConfig;
use crate::events::dispatcher::init_events;
use crate::events::model::LogLevel;
use crate::events::sink::{ConsoleSink, JsonFileSink, LogSink, Rotation};
use std::sync::Arc;

const DEFAULT_JSON_PATH: &str = "logs/localcomm.jsonl";
const DEFAULT_JSON_MAX_BYTES: usize = 5 * 1024 * 1024;
const DEFAULT_JSON_ROTATE: u32 = 3;
const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Console at info and above, JSON lines under `logs/`.
pub async fn init_default_events() {
    init_events_from_config(None).await
}

/// Build the console and JSON sinks described by `[logging]` and install the dispatcher.
pub async fn init_events_from_config(logging: Option<&LoggingConfig>) {
    let mut sinks: Vec<Arc<dyn LogSink>> = Vec::new();

    if !logging.and_then(|l| l.disable_console).unwrap_or(false) {
        let min = logging
            .and_then(|l| l.console_level.as_deref())
            .and_then(|s| s.parse::<LogLevel>().ok())
            .unwrap_or(LogLevel::Info);
        sinks.push(Arc::new(ConsoleSink::new(Some(min))));
    }

    let json_path = logging
        .and_then(|l| l.json_path.clone())
        .unwrap_or_else(|| DEFAULT_JSON_PATH.into());
    let rotation = Rotation {
        max_bytes: logging
            .and_then(|l| l.json_max_bytes)
            .unwrap_or(DEFAULT_JSON_MAX_BYTES) as u64,
        keep: logging
            .and_then(|l| l.json_rotate)
            .unwrap_or(DEFAULT_JSON_ROTATE),
    };
    match JsonFileSink::new(&json_path, Some(rotation)).await {
        Ok(json_sink) => sinks.push(Arc::new(json_sink)),
        Err(e) => eprintln!("⚠️ JSON event log disabled ({}): {}", json_path, e),
    }
    init_events(sinks, EVENT_QUEUE_CAPACITY).await;
}
