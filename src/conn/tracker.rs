//! Authoritative view of currently-open connections.
//!
//! The tracker coalesces per-socket add/remove deltas into one entry per
//! `(5-tuple, role, container)` and exposes periodic snapshots whose
//! set differences drive the upstream reporter.

use std::collections::{HashMap, HashSet};
use std::time::SystemTime;

use parking_lot::Mutex;

use super::{Connection, ConnectionDelta, DeltaKind};

/// Per-connection open-socket accounting.
#[derive(Debug, Clone, Copy)]
struct ConnActivity {
    first_seen_us: u64,
    last_seen_us: u64,
    open_count: u32,
    /// Set once the entry has been included in a snapshot.
    reported: bool,
}

#[derive(Default)]
struct TrackerState {
    active: HashMap<Connection, ConnActivity>,
    /// Connections that closed before ever appearing in a snapshot. Each is
    /// included in exactly one snapshot (afterglow) so a consumer polling
    /// with period P still sees connections that lived for less than P.
    pending_closed: HashSet<Connection>,
}

/// Tracks the set of open connections and their recently-closed afterglow.
///
/// Sockets are intentionally coalesced by connection identity rather than
/// FD: concurrent identical flows contribute to `open_count` only, which
/// matches the observation granularity the sensor expects.
pub struct ConnectionTracker {
    state: Mutex<TrackerState>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Applies a single delta.
    ///
    /// Adds increment the open count and keep `last_seen_us` monotonic.
    /// Removes decrement it; the entry leaves the active set when the count
    /// reaches zero. Removes for unknown connections are a no-op: the
    /// tracker may have started mid-session, or the add was filtered.
    pub fn update_connection(&self, delta: ConnectionDelta) {
        let ConnectionDelta {
            conn,
            timestamp_us,
            kind,
        } = delta;

        let mut state = self.state.lock();
        match kind {
            DeltaKind::Add => {
                let entry = state.active.entry(conn).or_insert(ConnActivity {
                    first_seen_us: timestamp_us,
                    last_seen_us: timestamp_us,
                    open_count: 0,
                    reported: false,
                });
                entry.open_count += 1;
                entry.last_seen_us = entry.last_seen_us.max(timestamp_us);
            }
            DeltaKind::Remove => {
                let Some(entry) = state.active.get_mut(&conn) else {
                    return;
                };
                debug_assert!(entry.open_count > 0, "active entry with zero open count");
                entry.open_count = entry.open_count.saturating_sub(1);
                if entry.open_count == 0 {
                    let reported = entry.reported;
                    state.active.remove(&conn);
                    if !reported {
                        state.pending_closed.insert(conn);
                    }
                }
            }
        }
    }

    /// Returns the reportable set: all active connections plus any that
    /// closed unseen since the previous snapshot. Atomic with respect to
    /// concurrent `update_connection` calls.
    pub fn snapshot(&self) -> ConnectionSnapshot {
        let mut state = self.state.lock();

        let mut conns =
            HashSet::with_capacity(state.active.len() + state.pending_closed.len());
        for (conn, activity) in state.active.iter_mut() {
            activity.reported = true;
            conns.insert(conn.clone());
        }
        conns.extend(state.pending_closed.drain());

        ConnectionSnapshot {
            taken_at: SystemTime::now(),
            conns,
        }
    }

    /// Number of connections with at least one open socket.
    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    /// Open-socket count for a connection, 0 if inactive.
    pub fn open_count(&self, conn: &Connection) -> u32 {
        self.state
            .lock()
            .active
            .get(conn)
            .map_or(0, |a| a.open_count)
    }

    /// `(first_seen_us, last_seen_us)` for an active connection.
    pub fn seen_range(&self, conn: &Connection) -> Option<(u64, u64)> {
        self.state
            .lock()
            .active
            .get(conn)
            .map(|a| (a.first_seen_us, a.last_seen_us))
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// The tracker's reportable set at an instant.
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub taken_at: SystemTime,
    conns: HashSet<Connection>,
}

impl ConnectionSnapshot {
    /// An empty snapshot, used as the reporter's initial previous state.
    pub fn empty() -> Self {
        Self {
            taken_at: SystemTime::UNIX_EPOCH,
            conns: HashSet::new(),
        }
    }

    pub fn contains(&self, conn: &Connection) -> bool {
        self.conns.contains(conn)
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Standard set difference against an earlier snapshot.
    pub fn diff_since(&self, prev: &ConnectionSnapshot) -> ConnectionDiff {
        ConnectionDiff {
            added: self.conns.difference(&prev.conns).cloned().collect(),
            removed: prev.conns.difference(&self.conns).cloned().collect(),
        }
    }
}

/// Connections that appeared or disappeared between two snapshots.
#[derive(Debug, Clone, Default)]
pub struct ConnectionDiff {
    pub added: Vec<Connection>,
    pub removed: Vec<Connection>,
}

impl ConnectionDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}
