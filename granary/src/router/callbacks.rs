//! Request/response correlation.
//!
//! Every outbound request leaves a [`CallbackRecord`] behind, indexed by
//! correlation id. The record owns a copy of the message (so rejections
//! can be retried and rerouted) and the completion sink. A record is
//! removed by exactly one of: response delivery, timeout sweep, or
//! target-silo failure.

use std::collections::HashMap;

use parking_lot::Mutex;

use granary_core::{CorrelationId, Message, SiloAddress};

use super::RouterError;

/// Consumes the final outcome of a request.
pub type ResponseSink = Box<dyn FnOnce(Result<Vec<u8>, RouterError>) + Send>;

/// One pending request.
pub(crate) struct CallbackRecord {
    /// A copy of the request, kept for retries and reroutes. Its
    /// `retries` field is the shared counter rejections and reroutes
    /// both increment.
    pub message: Message,
    /// Absolute deadline, ms since epoch.
    pub deadline_ms: u64,
    /// Completion sink; consumed exactly once.
    pub sink: ResponseSink,
}

/// The callback index for one silo.
#[derive(Default)]
pub(crate) struct CallbackTable {
    records: Mutex<HashMap<CorrelationId, CallbackRecord>>,
}

impl CallbackTable {
    pub(crate) fn insert(&self, record: CallbackRecord) {
        self.records.lock().insert(record.message.correlation, record);
    }

    /// Remove and return a record; `None` means it already completed.
    pub(crate) fn complete(&self, correlation: CorrelationId) -> Option<CallbackRecord> {
        self.records.lock().remove(&correlation)
    }

    /// Whether a pending record matches (sending grain, correlation id).
    ///
    /// Responses address their original sender; requiring the pair to
    /// match keeps a gateway client's correlation space (assigned by the
    /// client, not by us) from colliding with our own.
    pub(crate) fn matches(
        &self,
        correlation: CorrelationId,
        sender: &granary_core::GrainId,
    ) -> bool {
        self.records
            .lock()
            .get(&correlation)
            .is_some_and(|r| r.message.sending_grain == *sender)
    }

    /// Remove every record past its deadline.
    pub(crate) fn take_expired(&self, now_ms: u64) -> Vec<CallbackRecord> {
        let mut records = self.records.lock();
        let expired: Vec<CorrelationId> = records
            .iter()
            .filter(|(_, r)| now_ms > r.deadline_ms)
            .map(|(c, _)| *c)
            .collect();
        expired
            .into_iter()
            .filter_map(|c| records.remove(&c))
            .collect()
    }

    /// Remove every record whose request was last sent to `silo`.
    pub(crate) fn take_targeting(&self, silo: &SiloAddress) -> Vec<CallbackRecord> {
        let mut records = self.records.lock();
        let targeting: Vec<CorrelationId> = records
            .iter()
            .filter(|(_, r)| r.message.target_silo.as_ref() == Some(silo))
            .map(|(c, _)| *c)
            .collect();
        targeting
            .into_iter()
            .filter_map(|c| records.remove(&c))
            .collect()
    }

    /// Remove everything (silo shutdown).
    pub(crate) fn drain(&self) -> Vec<CallbackRecord> {
        self.records.lock().drain().map(|(_, r)| r).collect()
    }

    /// Pending request count.
    pub(crate) fn len(&self) -> usize {
        self.records.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use granary_core::{GrainId, GrainType, NetworkAddress};

    use super::*;

    fn record(correlation: u64, deadline_ms: u64, target: Option<SiloAddress>) -> CallbackRecord {
        let mut message = Message::request(GrainId::text(GrainType(1), "g")).build();
        message.correlation = CorrelationId(correlation);
        message.target_silo = target;
        CallbackRecord {
            message,
            deadline_ms,
            sink: Box::new(|_| {}),
        }
    }

    fn silo(port: u16) -> SiloAddress {
        SiloAddress::new(NetworkAddress::localhost(port), 1)
    }

    #[test]
    fn test_complete_removes_exactly_once() {
        let table = CallbackTable::default();
        table.insert(record(1, 100, None));
        assert_eq!(table.len(), 1);
        assert!(table.complete(CorrelationId(1)).is_some());
        assert!(table.complete(CorrelationId(1)).is_none());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_take_expired_only_past_deadline() {
        let table = CallbackTable::default();
        table.insert(record(1, 100, None));
        table.insert(record(2, 200, None));
        let expired = table.take_expired(150);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].message.correlation, CorrelationId(1));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_take_targeting_matches_silo() {
        let table = CallbackTable::default();
        table.insert(record(1, 100, Some(silo(1))));
        table.insert(record(2, 100, Some(silo(2))));
        table.insert(record(3, 100, None));
        let taken = table.take_targeting(&silo(1));
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].message.correlation, CorrelationId(1));
        assert_eq!(table.len(), 2);
    }
}
