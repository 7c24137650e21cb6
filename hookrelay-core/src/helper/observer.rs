//! Turns intercepted calls into limiter events.

use serde::{Deserialize, Serialize};

use crate::error::RelayError;
use crate::event::{Event, PriorityClass, SourceId};
use crate::hook::{CallObserver, HookCall, Symbol};
use crate::limiter::LimiterHandle;

/// Payload of an event produced by a hook: one completed call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    pub symbol: Symbol,
    pub args: Vec<u64>,
    pub result: u64,
}

impl CallRecord {
    pub fn encode(&self) -> Result<Vec<u8>, RelayError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, RelayError> {
        Ok(bincode::deserialize(payload)?)
    }
}

/// Observer installed on every hook of a helper. Never blocks the host
/// thread: a full limiter queue just drops the event.
#[derive(Debug, Clone)]
pub struct EventObserver {
    priority: PriorityClass,
    limiter: LimiterHandle,
}

impl EventObserver {
    pub fn new(priority: PriorityClass, limiter: LimiterHandle) -> Self {
        Self { priority, limiter }
    }

    pub fn priority(&self) -> PriorityClass {
        self.priority
    }

    fn event_for(&self, call: &HookCall<'_>, result: u64) -> Result<Event, RelayError> {
        let record = CallRecord {
            symbol: call.symbol.clone(),
            args: call.args.to_vec(),
            result,
        };
        Event::new(SourceId(call.hook_id), self.priority, record.encode()?)
    }
}

impl CallObserver for EventObserver {
    fn after(&self, call: &HookCall<'_>, result: u64) {
        // Failures on the host call path are swallowed.
        if let Ok(event) = self.event_for(call, result) {
            self.limiter.submit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_record_round_trips_through_payload() {
        let record = CallRecord {
            symbol: Symbol::new("user32!GetFocus"),
            args: vec![1, 2, 3],
            result: 0x4242,
        };
        let decoded = CallRecord::decode(&record.encode().unwrap()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn garbage_payload_is_an_error() {
        assert!(CallRecord::decode(&[0xff]).is_err());
    }
}
