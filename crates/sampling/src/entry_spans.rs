// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Registry of the currently-active entry spans per trace.
//!
//! An entry span is a span whose parent is absent or was imported from a
//! remote context. Each trace keeps a last-in/first-out stack of its entry
//! spans; the transaction name attaches to the top record. The span
//! processor must pair every `push` with a `delete` on span end, though
//! pops are not required to happen in push order.

use crate::error::Error;
use crate::ids::{SpanId, TraceId};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct EntrySpan {
    span_id: SpanId,
    txn_name: Option<String>,
}

/// Concurrent map of per-trace entry-span stacks.
#[derive(Debug, Default)]
pub struct EntrySpanRegistry {
    inner: Mutex<HashMap<TraceId, Vec<EntrySpan>>>,
}

impl EntrySpanRegistry {
    /// Creates an empty registry.
    pub fn new() -> EntrySpanRegistry {
        EntrySpanRegistry::default()
    }

    /// Pushes a new entry span onto its trace's stack.
    pub fn push(&self, trace_id: TraceId, span_id: SpanId) {
        let mut inner = self.inner.lock();
        inner.entry(trace_id).or_default().push(EntrySpan {
            span_id,
            txn_name: None,
        });
    }

    /// The id of the most recently pushed, not yet deleted entry span.
    pub fn current(&self, trace_id: TraceId) -> Option<SpanId> {
        let inner = self.inner.lock();
        inner
            .get(&trace_id)
            .and_then(|stack| stack.last())
            .map(|entry| entry.span_id)
    }

    /// Attaches a transaction name to the trace's top entry span.
    pub fn set_transaction_name(&self, trace_id: TraceId, name: &str) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        let top = inner
            .get_mut(&trace_id)
            .and_then(|stack| stack.last_mut())
            .ok_or(Error::UnknownTrace { trace_id })?;
        top.txn_name = Some(name.to_owned());
        Ok(())
    }

    /// The transaction name attached to the trace's top entry span.
    pub fn transaction_name(&self, trace_id: TraceId) -> Option<String> {
        let inner = self.inner.lock();
        inner
            .get(&trace_id)
            .and_then(|stack| stack.last())
            .and_then(|entry| entry.txn_name.clone())
    }

    /// Removes the record matching `(trace_id, span_id)`.
    pub fn delete(&self, trace_id: TraceId, span_id: SpanId) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        let stack = inner
            .get_mut(&trace_id)
            .ok_or(Error::UnknownTrace { trace_id })?;
        let position = stack
            .iter()
            .rposition(|entry| entry.span_id == span_id)
            .ok_or(Error::UnknownSpan { trace_id, span_id })?;
        let _ = stack.remove(position);
        if stack.is_empty() {
            let _ = inner.remove(&trace_id);
        }
        Ok(())
    }

    /// Number of traces with at least one live entry span.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// True when no entry spans are tracked.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid(b: u8) -> TraceId {
        TraceId([b; 16])
    }

    fn sid(b: u8) -> SpanId {
        SpanId([b; 8])
    }

    #[test]
    fn current_tracks_the_top_of_the_stack() {
        let registry = EntrySpanRegistry::new();
        assert_eq!(registry.current(tid(1)), None);

        registry.push(tid(1), sid(1));
        registry.push(tid(1), sid(2));
        assert_eq!(registry.current(tid(1)), Some(sid(2)));

        registry.delete(tid(1), sid(2)).expect("should delete");
        assert_eq!(registry.current(tid(1)), Some(sid(1)));

        registry.delete(tid(1), sid(1)).expect("should delete");
        assert_eq!(registry.current(tid(1)), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn out_of_order_delete_is_allowed() {
        let registry = EntrySpanRegistry::new();
        registry.push(tid(1), sid(1));
        registry.push(tid(1), sid(2));

        registry.delete(tid(1), sid(1)).expect("should delete");
        assert_eq!(registry.current(tid(1)), Some(sid(2)));
    }

    #[test]
    fn delete_unknown_trace_fails() {
        let registry = EntrySpanRegistry::new();
        assert!(matches!(
            registry.delete(tid(9), sid(1)),
            Err(Error::UnknownTrace { .. })
        ));
    }

    #[test]
    fn delete_unknown_span_fails() {
        let registry = EntrySpanRegistry::new();
        registry.push(tid(1), sid(1));
        assert!(matches!(
            registry.delete(tid(1), sid(9)),
            Err(Error::UnknownSpan { .. })
        ));
    }

    #[test]
    fn transaction_name_attaches_to_the_top_record() {
        let registry = EntrySpanRegistry::new();
        registry.push(tid(1), sid(1));
        registry.push(tid(1), sid(2));

        registry
            .set_transaction_name(tid(1), "checkout")
            .expect("should set name");
        assert_eq!(registry.transaction_name(tid(1)), Some("checkout".into()));

        // The name stays with the record it was attached to.
        registry.delete(tid(1), sid(2)).expect("should delete");
        assert_eq!(registry.transaction_name(tid(1)), None);
    }

    #[test]
    fn set_transaction_name_without_a_stack_fails() {
        let registry = EntrySpanRegistry::new();
        assert!(registry.set_transaction_name(tid(1), "x").is_err());
    }

    #[test]
    fn traces_are_isolated() {
        let registry = EntrySpanRegistry::new();
        registry.push(tid(1), sid(1));
        registry.push(tid(2), sid(2));
        assert_eq!(registry.current(tid(1)), Some(sid(1)));
        assert_eq!(registry.current(tid(2)), Some(sid(2)));
        assert_eq!(registry.len(), 2);
    }
}
