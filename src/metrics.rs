//! Process-wide relay counters.
//!
//! Plain relaxed atomics shared by every deployment; `snapshot()` is logged on
//! shutdown and printed by the `replay` command.
use std::sync::atomic::{AtomicU64, Ordering};

static ENVELOPES_INGESTED: AtomicU64 = AtomicU64::new(0);
static DECRYPT_FAILURES: AtomicU64 = AtomicU64::new(0);
static NODE_INFO_UPDATES: AtomicU64 = AtomicU64::new(0);
static GROUPS_DRAINED: AtomicU64 = AtomicU64::new(0);
static MESSAGES_SENT: AtomicU64 = AtomicU64::new(0);
static REPLIES_SENT: AtomicU64 = AtomicU64::new(0);
static MESSAGES_EDITED: AtomicU64 = AtomicU64::new(0);
static SIZE_FALLBACKS: AtomicU64 = AtomicU64::new(0);
static DELIVERY_FAILURES: AtomicU64 = AtomicU64::new(0);

pub fn inc_envelopes_ingested() {
    ENVELOPES_INGESTED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_decrypt_failures() {
    DECRYPT_FAILURES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_node_info_updates() {
    NODE_INFO_UPDATES.fetch_add(1, Ordering::Relaxed);
}
pub fn add_groups_drained(count: usize) {
    GROUPS_DRAINED.fetch_add(count as u64, Ordering::Relaxed);
}
pub fn inc_messages_sent() {
    MESSAGES_SENT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_replies_sent() {
    REPLIES_SENT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_messages_edited() {
    MESSAGES_EDITED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_size_fallbacks() {
    SIZE_FALLBACKS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_delivery_failures() {
    DELIVERY_FAILURES.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Snapshot {
    pub envelopes_ingested: u64,
    pub decrypt_failures: u64,
    pub node_info_updates: u64,
    pub groups_drained: u64,
    pub messages_sent: u64,
    pub replies_sent: u64,
    pub messages_edited: u64,
    pub size_fallbacks: u64,
    pub delivery_failures: u64,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        envelopes_ingested: ENVELOPES_INGESTED.load(Ordering::Relaxed),
        decrypt_failures: DECRYPT_FAILURES.load(Ordering::Relaxed),
        node_info_updates: NODE_INFO_UPDATES.load(Ordering::Relaxed),
        groups_drained: GROUPS_DRAINED.load(Ordering::Relaxed),
        messages_sent: MESSAGES_SENT.load(Ordering::Relaxed),
        replies_sent: REPLIES_SENT.load(Ordering::Relaxed),
        messages_edited: MESSAGES_EDITED.load(Ordering::Relaxed),
        size_fallbacks: SIZE_FALLBACKS.load(Ordering::Relaxed),
        delivery_failures: DELIVERY_FAILURES.load(Ordering::Relaxed),
    }
}
