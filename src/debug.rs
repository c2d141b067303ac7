use crate::protocol::{ComponentId, EntityRecord, Op, Payload, PayloadKind, PlayerId};
use crate::registry::{Encoding, Registry};
use serde::Serialize;
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};

static DEBUG_MODE: AtomicBool = AtomicBool::new(false);
static TRACE_MODE: AtomicBool = AtomicBool::new(false);

/// Initialize debug mode from environment variables
///
/// - `REPLECS_DEBUG=1`: log a JSON summary of every collected or applied payload
/// - `REPLECS_TRACE=1`: log one human-readable line per collection and apply
pub fn init_debug_mode() {
    let debug = env::var("REPLECS_DEBUG").is_ok();
    let trace = env::var("REPLECS_TRACE").is_ok();

    DEBUG_MODE.store(debug, Ordering::Relaxed);
    TRACE_MODE.store(trace, Ordering::Relaxed);

    if debug {
        log::info!("[REPLECS] Debug mode enabled - payload summaries will be logged as JSON");
    }

    if trace {
        log::info!("[REPLECS] Trace mode enabled - human-readable operation logs");
    }
}

pub fn is_debug_enabled() -> bool {
    DEBUG_MODE.load(Ordering::Relaxed)
}

pub fn is_trace_enabled() -> bool {
    TRACE_MODE.load(Ordering::Relaxed)
}

/// Op counts of one payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PayloadSummary {
    pub entities: usize,
    pub destroyed: usize,
    pub sets: usize,
    pub tags_added: usize,
    pub removals: usize,
    pub pairs_added: usize,
    pub pairs_removed: usize,
    pub bytes: usize,
    pub variants: usize,
}

pub fn summarize(records: &[EntityRecord]) -> PayloadSummary {
    let mut summary = PayloadSummary {
        entities: records.len(),
        ..PayloadSummary::default()
    };

    for op in records.iter().flat_map(|record| record.ops.iter()) {
        match op {
            Op::Set { .. } => summary.sets += 1,
            Op::Add { .. } => summary.tags_added += 1,
            Op::Remove { .. } => summary.removals += 1,
            Op::AddPair { .. } => summary.pairs_added += 1,
            Op::RemovePair { .. } => summary.pairs_removed += 1,
            Op::Destroy => summary.destroyed += 1,
        }
    }

    summary
}

/// Log a payload summary as JSON if debug mode is enabled
pub fn log_payload(direction: &str, player: Option<PlayerId>, records: &[EntityRecord], payload: &Payload) {
    if !is_debug_enabled() {
        return;
    }

    let mut summary = summarize(records);
    summary.bytes = payload.len();
    summary.variants = payload.variants.len();

    let target = player.map(|p| format!(" player {}", p)).unwrap_or_default();
    match serde_json::to_string_pretty(&summary) {
        Ok(json) => log::debug!("[REPLECS] {}{} payload:\n{}", direction, target, json),
        Err(e) => log::error!("[REPLECS] Failed to serialize payload summary to JSON: {}", e),
    }
}

/// Trace a collected payload
pub fn trace_collect(kind: PayloadKind, player: PlayerId, records: &[EntityRecord], payload: &Payload) {
    log_payload("→", Some(player), records, payload);

    if !is_trace_enabled() {
        return;
    }

    log::trace!(
        "[REPLECS] Collected {:?} for player {}: {} entities in {}",
        kind,
        player,
        records.len(),
        format_bytes(payload.len())
    );
}

/// Trace a decoded payload about to be applied
pub fn trace_apply(kind: PayloadKind, records: &[EntityRecord], size_bytes: usize) {
    if is_debug_enabled() {
        let mut summary = summarize(records);
        summary.bytes = size_bytes;
        if let Ok(json) = serde_json::to_string_pretty(&summary) {
            log::debug!("[REPLECS] ← {:?} payload:\n{}", kind, json);
        }
    }

    if !is_trace_enabled() {
        return;
    }

    let summary = summarize(records);
    log::trace!(
        "[REPLECS] Applying {:?}: {} entities, {} destroyed, {} sets, {} removals in {}",
        kind,
        summary.entities,
        summary.destroyed,
        summary.sets,
        summary.removals,
        format_bytes(size_bytes)
    );
}

/// Format bytes in human-readable format (KB, MB, etc.)
pub fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;
    const GB: usize = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// One-line description of a registered component.
pub fn describe_component(registry: &Registry, id: ComponentId) -> String {
    let Some(info) = registry.info(id) else {
        return format!("{} (unregistered)", id);
    };

    let encoding = match &info.encoding {
        Encoding::Tag => "tag".to_string(),
        Encoding::Primitive(p) => p.to_string(),
        Encoding::Serdes(_) => match info.bytespan {
            Some(span) => format!("serdes[{}]", span),
            None => "serdes".to_string(),
        },
        Encoding::Variant => "variant".to_string(),
    };

    let channel = if info.categories.is_pair() {
        "pair"
    } else if info.categories.is_unreliable() {
        "unreliable"
    } else {
        "reliable"
    };

    let filtered = if info.filter.is_some() { ", filtered" } else { "" };
    format!("{} {} nid={} {} {}{}", info.name, id, info.numeric, channel, encoding, filtered)
}
