use crate::events::model::{EventMeta, LogEvent, LogLevel};
use crate::events::sink::LogSink;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc;
use uuid::Uuid;

static DISPATCHER: OnceCell<EventDispatcher> = OnceCell::new();

/// Process-wide event fan-out. Events are queued and handed to every sink in order.
pub struct EventDispatcher {
    tx: mpsc::Sender<LogEvent>,
    pub session_id: String,
    sinks: RwLock<Vec<Arc<dyn LogSink>>>,
    dropped: AtomicU64,
}

impl EventDispatcher {
    pub fn global() -> Option<&'static EventDispatcher> {
        DISPATCHER.get()
    }
    pub fn register_sink(&self, sink: Arc<dyn LogSink>) {
        self.sinks.write().push(sink);
    }
    /// Events lost because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
    pub async fn flush(&self) {
        let sinks = self.sinks.read().clone();
        for sink in sinks {
            sink.flush().await;
        }
    }
}

/// Install the global dispatcher. A second call keeps the first dispatcher and
/// only appends the given sinks to it.
pub async fn init_events(sinks: Vec<Arc<dyn LogSink>>, capacity: usize) {
    if let Some(existing) = EventDispatcher::global() {
        for sink in sinks {
            existing.register_sink(sink);
        }
        return;
    }
    let (tx, mut rx) = mpsc::channel::<LogEvent>(capacity);
    let dispatcher = EventDispatcher {
        tx,
        session_id: Uuid::new_v4().to_string(),
        sinks: RwLock::new(sinks),
        dropped: AtomicU64::new(0),
    };
    if DISPATCHER.set(dispatcher).is_err() {
        return;
    }
    tokio::spawn(async move {
        while let Some(evt) = rx.recv().await {
            if let Some(d) = EventDispatcher::global() {
                let sinks = d.sinks.read().clone();
                for sink in sinks {
                    sink.handle(&evt).await;
                }
            }
        }
    });
}

pub fn correlation_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}

pub fn meta(component: &'static str, level: LogLevel) -> EventMeta {
    let session_id = EventDispatcher::global()
        .map(|d| d.session_id.clone())
        .unwrap_or_else(|| "unknown".into());
    EventMeta {
        ts: SystemTime::now(),
        level,
        corr_id: None,
        session_id,
        component,
        suppress_console: false,
    }
}

/// Queue an event. Without a dispatcher the event is discarded; a full queue counts it as dropped.
pub fn emit(event: LogEvent) {
    let Some(d) = EventDispatcher::global() else {
        return;
    };
    if d.tx.try_send(event).is_err() {
        d.dropped.fetch_add(1, Ordering::Relaxed);
    }
}
