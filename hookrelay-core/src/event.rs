//! Accessibility events produced inside the host process.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// Largest payload a single event may carry.
pub const MAX_EVENT_PAYLOAD: usize = 64 * 1024;

// ── PriorityClass ────────────────────────────────────────────────

/// Category used to allocate rate budget independently.
///
/// Declaration order is delivery order: when several admitted events are
/// ready at once, lower discriminants go first.
#[repr(u8)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PriorityClass {
    /// Must not be lost: focus loss of the foreground window, alerts.
    Critical = 0,
    /// Focus and caret movement.
    Focus = 1,
    /// Value, name and state changes.
    Normal = 2,
    /// Live-region churn, tooltips, progress updates.
    Background = 3,
}

impl PriorityClass {
    pub const COUNT: usize = 4;

    pub const ALL: [PriorityClass; Self::COUNT] = [
        PriorityClass::Critical,
        PriorityClass::Focus,
        PriorityClass::Normal,
        PriorityClass::Background,
    ];

    /// Dense index, usable for per-class arrays.
    pub fn index(self) -> usize {
        self as usize
    }
}

impl TryFrom<u8> for PriorityClass {
    type Error = RelayError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        PriorityClass::ALL
            .get(value as usize)
            .copied()
            .ok_or(RelayError::UnknownVariant {
                type_name: "PriorityClass",
                value: value as u64,
            })
    }
}

impl fmt::Display for PriorityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ── SourceId ─────────────────────────────────────────────────────

/// Identity of the producer of an event (normally a hook id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId(pub u64);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "src#{}", self.0)
    }
}

// ── Event ────────────────────────────────────────────────────────

/// One observation relayed to the controller. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    source: SourceId,
    timestamp_us: u64,
    priority: PriorityClass,
    payload: Vec<u8>,
}

impl Event {
    /// Build an event stamped with the current wall-clock time.
    pub fn new(
        source: SourceId,
        priority: PriorityClass,
        payload: Vec<u8>,
    ) -> Result<Self, RelayError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or_default();
        Self::with_timestamp(source, priority, now, payload)
    }

    /// Build an event with an explicit timestamp (microseconds since the
    /// Unix epoch).
    pub fn with_timestamp(
        source: SourceId,
        priority: PriorityClass,
        timestamp_us: u64,
        payload: Vec<u8>,
    ) -> Result<Self, RelayError> {
        if payload.len() > MAX_EVENT_PAYLOAD {
            return Err(RelayError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_EVENT_PAYLOAD,
            });
        }
        Ok(Self {
            source,
            timestamp_us,
            priority,
            payload,
        })
    }

    pub fn source(&self) -> SourceId {
        self.source
    }

    pub fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }

    pub fn priority(&self) -> PriorityClass {
        self.priority
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Key under which over-budget events replace each other.
    pub fn coalesce_key(&self) -> (SourceId, PriorityClass) {
        (self.source, self.priority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_order_is_delivery_order() {
        let mut classes = vec![
            PriorityClass::Background,
            PriorityClass::Critical,
            PriorityClass::Normal,
            PriorityClass::Focus,
        ];
        classes.sort();
        assert_eq!(classes, PriorityClass::ALL.to_vec());
    }

    #[test]
    fn priority_from_wire() {
        assert_eq!(PriorityClass::try_from(1).unwrap(), PriorityClass::Focus);
        assert!(PriorityClass::try_from(9).is_err());
    }

    #[test]
    fn oversized_payload_rejected() {
        let big = vec![0u8; MAX_EVENT_PAYLOAD + 1];
        let err = Event::new(SourceId(1), PriorityClass::Normal, big).unwrap_err();
        assert!(matches!(err, RelayError::PayloadTooLarge { .. }));
    }

    #[test]
    fn new_event_is_stamped() {
        let ev = Event::new(SourceId(3), PriorityClass::Focus, b"x".to_vec()).unwrap();
        assert!(ev.timestamp_us() > 0);
        assert_eq!(ev.coalesce_key(), (SourceId(3), PriorityClass::Focus));
    }
}
