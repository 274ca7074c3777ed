//! Runtime-pushed filtering configuration.
//!
//! The sensor owns the configuration; the collector holds at most one
//! committed snapshot behind an atomic cell so the event path reads it
//! without blocking, plus a one-shot latch for the startup wait.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tokio::sync::watch;
use tracing::{info, warn};

use super::proto::{FilterAction, RuntimeFilteringConfiguration};
use crate::conn::{Cidr, Connection, Endpoint};

/// Process-wide configuration snapshot with an initialization latch.
///
/// Exactly one writer (the control session) calls [`update`]; readers on
/// the hot event path call [`current`], which is wait-free. Before the
/// first update, [`current`] is `None` and callers fall back to the
/// accept-all predicate.
///
/// [`update`]: RuntimeConfig::update
/// [`current`]: RuntimeConfig::current
pub struct RuntimeConfig {
    snapshot: ArcSwapOption<FilterSet>,
    init_tx: watch::Sender<bool>,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        let (init_tx, _) = watch::channel(false);
        Self {
            snapshot: ArcSwapOption::empty(),
            init_tx,
        }
    }

    /// The process-wide instance, created lazily on first access.
    pub fn global() -> Arc<RuntimeConfig> {
        static INSTANCE: OnceLock<Arc<RuntimeConfig>> = OnceLock::new();
        Arc::clone(INSTANCE.get_or_init(|| Arc::new(RuntimeConfig::new())))
    }

    /// Atomically replaces the snapshot, sets the latch, and wakes waiters.
    /// The new filter set applies to all events processed after this
    /// returns; in-flight events may observe either snapshot.
    pub fn update(&self, cfg: &RuntimeFilteringConfiguration) {
        let compiled = FilterSet::compile(cfg);
        info!(
            cluster_id = %cfg.cluster_id,
            rules = compiled.len(),
            "runtime filtering configuration updated",
        );

        self.snapshot.store(Some(Arc::new(compiled)));
        self.init_tx.send_replace(true);
    }

    /// Non-blocking read of the latest committed snapshot.
    pub fn current(&self) -> Option<Arc<FilterSet>> {
        self.snapshot.load_full()
    }

    /// Whether [`update`](RuntimeConfig::update) has ever been called.
    pub fn is_initialized(&self) -> bool {
        *self.init_tx.borrow()
    }

    /// Blocks until the first snapshot is committed, up to `timeout`.
    /// Returns false on timeout; the caller then proceeds with the
    /// accept-all predicate.
    pub async fn wait_until_initialized(&self, timeout: Duration) -> bool {
        let mut rx = self.init_tx.subscribe();
        let result = tokio::time::timeout(timeout, rx.wait_for(|initialized| *initialized)).await;
        result.is_ok()
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// One compiled CIDR/port rule. Absent constraints match everything.
struct CompiledRule {
    cidr: Option<Cidr>,
    ports: Option<(u16, u16)>,
    action: FilterAction,
}

impl CompiledRule {
    fn matches_endpoint(&self, ep: &Endpoint) -> bool {
        if let Some(cidr) = &self.cidr {
            if !cidr.contains(&ep.address) {
                return false;
            }
        }
        if let Some((begin, end)) = self.ports {
            if ep.port < begin || ep.port > end {
                return false;
            }
        }
        true
    }

    /// A rule matches a connection when either endpoint satisfies it.
    fn matches(&self, conn: &Connection) -> bool {
        self.matches_endpoint(&conn.local) || self.matches_endpoint(&conn.remote)
    }
}

/// Relevance predicate compiled from a pushed configuration.
pub struct FilterSet {
    rules: Vec<CompiledRule>,
}

impl FilterSet {
    /// Compiles the pushed rules, skipping unparseable ones with a warning.
    fn compile(cfg: &RuntimeFilteringConfiguration) -> Self {
        let mut rules = Vec::with_capacity(cfg.filters.len());

        for filter in &cfg.filters {
            let cidr = if filter.cidr.is_empty() {
                None
            } else {
                match filter.cidr.parse::<Cidr>() {
                    Ok(cidr) => Some(cidr),
                    Err(e) => {
                        warn!(cidr = %filter.cidr, error = %e, "skipping filter rule");
                        continue;
                    }
                }
            };

            let ports = filter.port_range.as_ref().map(|range| {
                let begin = u16::try_from(range.begin).unwrap_or(u16::MAX);
                let end = u16::try_from(range.end).unwrap_or(u16::MAX);
                (begin, end)
            });

            let action =
                FilterAction::try_from(filter.action).unwrap_or(FilterAction::Ignore);

            rules.push(CompiledRule {
                cidr,
                ports,
                action,
            });
        }

        Self { rules }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// The first matching rule decides; no match means relevant.
    pub fn is_relevant(&self, conn: &Connection) -> bool {
        for rule in &self.rules {
            if rule.matches(conn) {
                return rule.action == FilterAction::Include;
            }
        }
        true
    }
}
