use crate::events::{
    dispatcher,
    model::{ConnectionEvent, DiscoveryEvent, LogEvent, LogLevel, NetworkEvent},
};

/// Emit a structured network event.
pub(crate) fn emit_network_event(
    component: &'static str,
    level: LogLevel,
    action: &str,
    addr: Option<String>,
    detail: Option<String>,
) {
    let mut meta = dispatcher::meta(component, level);
    meta.corr_id = Some(dispatcher::correlation_id());
    dispatcher::emit(LogEvent::Network(NetworkEvent {
        meta,
        action: action.to_string(),
        addr,
        detail,
    }));
}

/// Fields shared by every connection event of one client.
pub(crate) struct ConnectionTag<'a> {
    pub luid: Option<u32>,
    pub local_id: &'a str,
    pub remote_id: &'a str,
    pub state: String,
    pub reason: String,
}

pub(crate) fn emit_connection_event(
    component: &'static str,
    level: LogLevel,
    action: &str,
    tag: ConnectionTag<'_>,
    detail: Option<String>,
) {
    let meta = dispatcher::meta(component, level);
    dispatcher::emit(LogEvent::Connection(ConnectionEvent {
        meta,
        luid: tag.luid,
        action: action.to_string(),
        local_id: tag.local_id.to_string(),
        remote_id: tag.remote_id.to_string(),
        state: tag.state,
        reason: tag.reason,
        detail,
    }));
}

pub(crate) fn emit_discovery_event(
    level: LogLevel,
    action: &str,
    luid: Option<u32>,
    service: String,
    detail: Option<String>,
) {
    let meta = dispatcher::meta("discovery", level);
    dispatcher::emit(LogEvent::Discovery(DiscoveryEvent {
        meta,
        luid,
        action: action.to_string(),
        service,
        detail,
    }));
}
