//! MUC metrics for observability.
//!
//! Uses the global OpenTelemetry meter provider, which must be initialized
//! by the host application. Without one every instrument is a no-op.

use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

static METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    METER.get_or_init(|| opentelemetry::global::meter("waddle-muc"))
}

// ============================================================================
// Counters (Cumulative)
// ============================================================================

/// Counter for room messages routed.
pub fn muc_messages() -> Counter<u64> {
    meter()
        .u64_counter("muc.messages")
        .with_description("Total messages routed through rooms")
        .with_unit("message")
        .build()
}

/// Counter for presence events (joins, leaves, nick changes).
pub fn muc_presence_events() -> Counter<u64> {
    meter()
        .u64_counter("muc.presence")
        .with_description("Total room presence events")
        .with_unit("event")
        .build()
}

/// Counter for presence probes sent to idle users.
pub fn idle_probes() -> Counter<u64> {
    meter()
        .u64_counter("muc.idle_probes")
        .with_description("Total presence probes sent to idle users")
        .with_unit("probe")
        .build()
}

/// Counter for conversation lifecycle events.
pub fn conversations() -> Counter<u64> {
    meter()
        .u64_counter("muc.conversations")
        .with_description("Total conversations started and ended")
        .with_unit("conversation")
        .build()
}

// ============================================================================
// Gauges (Current State)
// ============================================================================

/// Gauge for active rooms.
pub fn muc_rooms_active() -> Gauge<i64> {
    meter()
        .i64_gauge("muc.rooms.active")
        .with_description("Current number of active rooms")
        .with_unit("room")
        .build()
}

/// Gauge for room occupants.
pub fn muc_occupants() -> Gauge<i64> {
    meter()
        .i64_gauge("muc.occupants")
        .with_description("Current number of occupants per room")
        .with_unit("user")
        .build()
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Record a message routed by a room.
pub fn record_muc_message(kind: &str) {
    muc_messages().add(1, &[KeyValue::new("kind", kind.to_string())]);
}

/// Record a presence event (join, leave or nick).
pub fn record_muc_presence(event_type: &str, room: &str) {
    muc_presence_events().add(
        1,
        &[
            KeyValue::new("event", event_type.to_string()),
            KeyValue::new("room", room.to_string()),
        ],
    );
}

/// Update the occupants gauge for a room.
pub fn record_muc_occupant_count(count: i64, room: &str) {
    muc_occupants().record(count, &[KeyValue::new("room", room.to_string())]);
}

/// Update the active rooms gauge.
pub fn record_room_count(count: i64) {
    muc_rooms_active().record(count, &[]);
}

/// Record presence probes sent by one idle sweep.
pub fn record_idle_probes(count: u64) {
    idle_probes().add(count, &[]);
}

/// Record a conversation lifecycle event.
pub fn record_conversation(event: &str, kind: &str) {
    conversations().add(
        1,
        &[
            KeyValue::new("event", event.to_string()),
            KeyValue::new("kind", kind.to_string()),
        ],
    );
}
