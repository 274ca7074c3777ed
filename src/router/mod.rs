//! Event demultiplexer.
//!
//! Handlers register a static set of event classes; the router folds those
//! into per-handler bitmasks plus a global filter, so per-event dispatch is
//! one mask test per handler and events nobody wants are discarded without
//! polling any handler.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

use crate::event::{Event, EventClass};

/// Outcome of a handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerResult {
    Processed,
    Ignored,
    Error,
}

impl HandlerResult {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::Ignored => "ignored",
            Self::Error => "error",
        }
    }
}

/// A typed consumer of routed events.
///
/// Handlers must not panic out of `handle`; failures are reported through
/// [`HandlerResult::Error`] and never abort the router.
pub trait SignalHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Static set of event classes this handler wants.
    fn relevant_events(&self) -> &'static [EventClass];

    fn handle(&self, event: &Event) -> HandlerResult;

    /// Called once when the router shuts down.
    fn stop(&self) {}
}

/// Callback invoked after each handler invocation, for metrics wiring.
pub type DispatchObserver = Box<dyn Fn(&'static str, HandlerResult) + Send + Sync>;

struct HandlerEntry {
    handler: Box<dyn SignalHandler>,
    filter: u8,
    processed: AtomicU64,
    ignored: AtomicU64,
    errors: AtomicU64,
}

impl HandlerEntry {
    fn new(handler: Box<dyn SignalHandler>) -> Self {
        let filter = handler
            .relevant_events()
            .iter()
            .fold(0u8, |mask, class| mask | class.bit());

        Self {
            handler,
            filter,
            processed: AtomicU64::new(0),
            ignored: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }
}

/// Per-handler dispatch counters, snapshot-and-reset for periodic logging.
#[derive(Debug, Clone)]
pub struct HandlerStats {
    pub name: &'static str,
    pub processed: u64,
    pub ignored: u64,
    pub errors: u64,
}

impl HandlerStats {
    pub fn total(&self) -> u64 {
        self.processed + self.ignored + self.errors
    }
}

/// Routes events to registered handlers in registration order.
pub struct EventRouter {
    entries: Vec<HandlerEntry>,
    global_filter: u8,
    discarded: AtomicU64,
    observer: Option<DispatchObserver>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(4),
            global_filter: 0,
            discarded: AtomicU64::new(0),
            observer: None,
        }
    }

    /// Registers a handler and folds its filter into the global filter.
    pub fn add_handler(&mut self, handler: Box<dyn SignalHandler>) {
        let entry = HandlerEntry::new(handler);
        self.global_filter |= entry.filter;
        self.entries.push(entry);
    }

    /// Installs a per-invocation observer (e.g. for Prometheus counters).
    pub fn set_observer(&mut self, observer: DispatchObserver) {
        self.observer = Some(observer);
    }

    /// Dispatches one event to every handler whose filter matches.
    ///
    /// Handlers run in registration order. An `Error` result is logged and
    /// counted; dispatch continues with the remaining handlers.
    pub fn dispatch(&self, event: &Event) {
        let bit = event.class.bit();
        if self.global_filter & bit == 0 {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }

        for entry in &self.entries {
            if entry.filter & bit == 0 {
                continue;
            }

            let result = entry.handler.handle(event);
            match result {
                HandlerResult::Processed => {
                    entry.processed.fetch_add(1, Ordering::Relaxed);
                }
                HandlerResult::Ignored => {
                    entry.ignored.fetch_add(1, Ordering::Relaxed);
                }
                HandlerResult::Error => {
                    entry.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        handler = entry.handler.name(),
                        event = %event.class,
                        "handler reported an error",
                    );
                }
            }

            if let Some(observer) = &self.observer {
                observer(entry.handler.name(), result);
            }
        }
    }

    /// Atomically reads and resets per-handler counters.
    pub fn snapshot_stats(&self) -> Vec<HandlerStats> {
        self.entries
            .iter()
            .map(|entry| HandlerStats {
                name: entry.handler.name(),
                processed: entry.processed.swap(0, Ordering::Relaxed),
                ignored: entry.ignored.swap(0, Ordering::Relaxed),
                errors: entry.errors.swap(0, Ordering::Relaxed),
            })
            .collect()
    }

    /// Atomically reads and resets the global-filter discard counter.
    pub fn snapshot_discarded(&self) -> u64 {
        self.discarded.swap(0, Ordering::Relaxed)
    }

    /// Stops all handlers, in registration order.
    pub fn stop(&self) {
        for entry in &self.entries {
            entry.handler.stop();
        }
    }
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::event::ThreadInfo;

    struct RecordingHandler {
        name: &'static str,
        relevant: &'static [EventClass],
        result: HandlerResult,
        seen: Arc<Mutex<Vec<&'static str>>>,
        calls: Arc<AtomicUsize>,
    }

    impl SignalHandler for RecordingHandler {
        fn name(&self) -> &'static str {
            self.name
        }

        fn relevant_events(&self) -> &'static [EventClass] {
            self.relevant
        }

        fn handle(&self, _event: &Event) -> HandlerResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().expect("lock").push(self.name);
            self.result
        }
    }

    fn event(class: EventClass) -> Event {
        Event {
            class,
            timestamp_ns: 0,
            rawres: Some(0),
            fd: None,
            thread: ThreadInfo::default(),
        }
    }

    fn recording(
        name: &'static str,
        relevant: &'static [EventClass],
        result: HandlerResult,
        seen: &Arc<Mutex<Vec<&'static str>>>,
    ) -> (Box<RecordingHandler>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = Box::new(RecordingHandler {
            name,
            relevant,
            result,
            seen: Arc::clone(seen),
            calls: Arc::clone(&calls),
        });
        (handler, calls)
    }

    #[test]
    fn test_events_outside_global_filter_are_discarded() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (handler, calls) = recording(
            "net",
            &[EventClass::Connect],
            HandlerResult::Processed,
            &seen,
        );

        let mut router = EventRouter::new();
        router.add_handler(handler);

        router.dispatch(&event(EventClass::Execve));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(router.snapshot_discarded(), 1);

        router.dispatch(&event(EventClass::Connect));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(router.snapshot_discarded(), 0);
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (first, _) = recording(
            "first",
            &[EventClass::Close],
            HandlerResult::Processed,
            &seen,
        );
        let (second, _) = recording(
            "second",
            &[EventClass::Close],
            HandlerResult::Ignored,
            &seen,
        );

        let mut router = EventRouter::new();
        router.add_handler(first);
        router.add_handler(second);

        router.dispatch(&event(EventClass::Close));
        assert_eq!(*seen.lock().expect("lock"), vec!["first", "second"]);
    }

    #[test]
    fn test_error_result_does_not_abort_dispatch() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (failing, _) = recording(
            "failing",
            &[EventClass::Connect],
            HandlerResult::Error,
            &seen,
        );
        let (after, after_calls) = recording(
            "after",
            &[EventClass::Connect],
            HandlerResult::Processed,
            &seen,
        );

        let mut router = EventRouter::new();
        router.add_handler(failing);
        router.add_handler(after);

        router.dispatch(&event(EventClass::Connect));
        assert_eq!(after_calls.load(Ordering::SeqCst), 1);

        let stats = router.snapshot_stats();
        assert_eq!(stats[0].errors, 1);
        assert_eq!(stats[1].processed, 1);
    }

    #[test]
    fn test_only_matching_handlers_are_invoked() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (net, net_calls) = recording(
            "net",
            &[EventClass::Connect, EventClass::Close],
            HandlerResult::Processed,
            &seen,
        );
        let (proc_handler, proc_calls) = recording(
            "proc",
            &[EventClass::Execve],
            HandlerResult::Processed,
            &seen,
        );

        let mut router = EventRouter::new();
        router.add_handler(net);
        router.add_handler(proc_handler);

        router.dispatch(&event(EventClass::Connect));
        router.dispatch(&event(EventClass::Execve));
        router.dispatch(&event(EventClass::Close));

        assert_eq!(net_calls.load(Ordering::SeqCst), 2);
        assert_eq!(proc_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stats_snapshot_resets_counters() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (handler, _) = recording(
            "net",
            &[EventClass::Connect],
            HandlerResult::Ignored,
            &seen,
        );

        let mut router = EventRouter::new();
        router.add_handler(handler);
        router.dispatch(&event(EventClass::Connect));

        let stats = router.snapshot_stats();
        assert_eq!(stats[0].ignored, 1);

        let stats = router.snapshot_stats();
        assert_eq!(stats[0].ignored, 0);
    }

    #[test]
    fn test_observer_sees_every_invocation() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (handler, _) = recording(
            "net",
            &[EventClass::Connect],
            HandlerResult::Processed,
            &seen,
        );

        let observed = Arc::new(Mutex::new(Vec::new()));
        let observed_by_cb = Arc::clone(&observed);

        let mut router = EventRouter::new();
        router.add_handler(handler);
        router.set_observer(Box::new(move |name, result| {
            observed_by_cb
                .lock()
                .expect("lock")
                .push((name, result.as_str()));
        }));

        router.dispatch(&event(EventClass::Connect));
        assert_eq!(*observed.lock().expect("lock"), vec![("net", "processed")]);
    }
}
