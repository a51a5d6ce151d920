use crate::{
    constants::{client_tag, discovery_tag, ICON_PLACEHOLDER},
    events::model::{LogEvent, LogLevel},
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

#[async_trait]
pub trait LogSink: Send + Sync {
    async fn handle(&self, event: &LogEvent);
    async fn flush(&self) {}
}

/// Human readable one-liners on stdout.
pub struct ConsoleSink {
    min_level: Option<LogLevel>,
}

impl ConsoleSink {
    pub fn new(min_level: Option<LogLevel>) -> Self {
        Self { min_level }
    }
}

fn console_line(event: &LogEvent) -> String {
    let meta = event.meta();
    let head = format!("{}{:<5} {:<14}", ICON_PLACEHOLDER, format!("{:?}", meta.level).to_uppercase(), meta.component);
    match event {
        LogEvent::TrustDecision(td) => format!(
            "{} TRUST {:?} {} ({}, mode={}) subject={} fp={}",
            head,
            td.role,
            td.decision,
            td.reason,
            td.mode,
            td.subject.as_deref().unwrap_or("-"),
            td.fingerprint.as_deref().unwrap_or("-"),
        ),
        LogEvent::Network(n) => format!(
            "{} NET  {} {} {}",
            head,
            n.action,
            n.addr.as_deref().unwrap_or(""),
            n.detail.as_deref().unwrap_or("")
        ),
        LogEvent::Connection(c) => format!(
            "{} CONN {} {} {} -> {} [{} / {}] {}",
            head,
            c.luid.map(client_tag).unwrap_or_else(|| "[C#: ----]".into()),
            c.action,
            c.local_id,
            c.remote_id,
            c.state,
            c.reason,
            c.detail.as_deref().unwrap_or("")
        ),
        LogEvent::Discovery(d) => format!(
            "{} DISC {} {} {} {}",
            head,
            d.luid.map(discovery_tag).unwrap_or_else(|| "[D#: ----]".into()),
            d.action,
            d.service,
            d.detail.as_deref().unwrap_or("")
        ),
        LogEvent::System(s) => format!(
            "{} SYS  {} {}",
            head,
            s.action,
            s.detail.as_deref().unwrap_or("")
        ),
    }
}

#[async_trait]
impl LogSink for ConsoleSink {
    async fn handle(&self, event: &LogEvent) {
        let meta = event.meta();
        if meta.suppress_console || self.min_level.is_some_and(|min| meta.level < min) {
            return;
        }
        let line = console_line(event);
        if meta.level >= LogLevel::Warn {
            eprintln!("{}", line.trim_end());
        } else {
            println!("{}", line.trim_end());
        }
    }
}

/// Size-based rotation: `events.jsonl` -> `events.jsonl.1` -> ... -> `events.jsonl.<keep>`.
#[derive(Debug, Clone, Copy)]
pub struct Rotation {
    pub max_bytes: u64,
    pub keep: u32,
}

struct JsonFileState {
    file: Option<tokio::fs::File>,
    written: u64,
}

/// Appends every event as one JSON object per line.
pub struct JsonFileSink {
    path: PathBuf,
    rotation: Option<Rotation>,
    state: tokio::sync::Mutex<JsonFileState>,
}

async fn open_append(path: &Path) -> std::io::Result<(tokio::fs::File, u64)> {
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    let len = file.metadata().await.map(|m| m.len()).unwrap_or(0);
    Ok((file, len))
}

fn backup_path(path: &Path, idx: u32) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{}", idx));
    PathBuf::from(name)
}

impl JsonFileSink {
    pub async fn new<P: Into<PathBuf>>(path: P, rotation: Option<Rotation>) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let (file, written) = open_append(&path).await?;
        Ok(Self {
            path,
            rotation,
            state: tokio::sync::Mutex::new(JsonFileState {
                file: Some(file),
                written,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn rotate(&self, state: &mut JsonFileState, keep: u32) -> std::io::Result<()> {
        state.file = None;
        let oldest = backup_path(&self.path, keep);
        if tokio::fs::try_exists(&oldest).await.unwrap_or(false) {
            tokio::fs::remove_file(&oldest).await?;
        }
        for idx in (1..keep).rev() {
            let from = backup_path(&self.path, idx);
            if tokio::fs::try_exists(&from).await.unwrap_or(false) {
                tokio::fs::rename(&from, backup_path(&self.path, idx + 1)).await?;
            }
        }
        if keep > 0 {
            tokio::fs::rename(&self.path, backup_path(&self.path, 1)).await?;
        } else {
            tokio::fs::remove_file(&self.path).await?;
        }
        let (file, written) = open_append(&self.path).await?;
        state.file = Some(file);
        state.written = written;
        Ok(())
    }
}

#[async_trait]
impl LogSink for JsonFileSink {
    async fn handle(&self, event: &LogEvent) {
        let Ok(mut json) = serde_json::to_string(event) else {
            return;
        };
        json.push('\n');
        let mut state = self.state.lock().await;
        if let Some(rot) = self.rotation {
            if state.written > 0 && state.written + json.len() as u64 > rot.max_bytes {
                if let Err(e) = self.rotate(&mut state, rot.keep).await {
                    eprintln!("⚠️ event log rotation failed ({}): {}", self.path.display(), e);
                }
            }
        }
        if let Some(f) = state.file.as_mut() {
            if f.write_all(json.as_bytes()).await.is_ok() {
                state.written += json.len() as u64;
            }
        }
    }

    async fn flush(&self) {
        let mut state = self.state.lock().await;
        if let Some(f) = state.file.as_mut() {
            let _ = f.flush().await;
            let _ = f.sync_all().await;
        }
    }
}
