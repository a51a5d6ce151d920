use localcomm::events::{dispatcher, JsonFileSink, LogEvent, LogLevel, LogSink, Rotation, SystemEvent};

fn system(action: &str) -> LogEvent {
    LogEvent::System(SystemEvent {
        meta: dispatcher::meta("local_clients", LogLevel::Info),
        action: action.to_string(),
        detail: Some("x".repeat(64)),
    })
}

fn lines(path: &std::path::Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .map(|s| s.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

#[test]
fn log_levels_parse_and_order() {
    assert_eq!("WARNING".parse::<LogLevel>(), Ok(LogLevel::Warn));
    assert_eq!(" debug ".parse::<LogLevel>(), Ok(LogLevel::Debug));
    assert!("loud".parse::<LogLevel>().is_err());
    assert!(LogLevel::Trace < LogLevel::Info);
    assert!(LogLevel::Error > LogLevel::Warn);
}

#[tokio::test]
async fn json_sink_writes_one_object_per_line() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("events.jsonl");
    let sink = JsonFileSink::new(&path, None).await.unwrap();
    sink.handle(&system("local_started")).await;
    sink.handle(&system("local_stopped")).await;
    sink.flush().await;

    let written = lines(&path);
    assert_eq!(written.len(), 2);
    let first: serde_json::Value = serde_json::from_str(&written[0]).unwrap();
    assert_eq!(first["type"], "system");
    assert_eq!(first["action"], "local_started");
    assert_eq!(first["meta"]["level"], "info");
}

#[tokio::test]
async fn json_sink_rotates_and_keeps_limited_backups() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.jsonl");
    let sink = JsonFileSink::new(
        &path,
        Some(Rotation {
            max_bytes: 64,
            keep: 1,
        }),
    )
    .await
    .unwrap();
    for action in ["first", "second", "third"] {
        sink.handle(&system(action)).await;
    }
    sink.flush().await;

    let current = lines(&path);
    let backup = lines(&dir.path().join("events.jsonl.1"));
    assert_eq!(current.len(), 1);
    assert!(current[0].contains("\"third\""));
    assert_eq!(backup.len(), 1);
    assert!(backup[0].contains("\"second\""));
    assert!(!dir.path().join("events.jsonl.2").exists());
}
