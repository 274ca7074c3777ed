//! Socket-lifecycle event handler.
//!
//! Reconstructs a [`Connection`] from each event's FD context and forwards
//! the resulting delta to the tracker. Every extraction failure is an
//! ignore, not an error: failed syscalls, roleless FDs, non-IP sockets,
//! and host processes all fall out here.

use std::sync::Arc;

use crate::conn::tracker::ConnectionTracker;
use crate::conn::{
    Address, ConnRole, Connection, ConnectionDelta, DeltaKind, Endpoint, L4Proto,
};
use crate::control::config::RuntimeConfig;
use crate::event::{Event, EventClass, FdProto, FdRole, SockTuple};
use crate::router::{HandlerResult, SignalHandler};

pub struct NetworkSignalHandler {
    tracker: Arc<ConnectionTracker>,
    runtime_config: Arc<RuntimeConfig>,
}

impl NetworkSignalHandler {
    pub fn new(tracker: Arc<ConnectionTracker>, runtime_config: Arc<RuntimeConfig>) -> Self {
        Self {
            tracker,
            runtime_config,
        }
    }

    /// Delta kind implied by the event class, `None` for classes this
    /// handler does not act on.
    fn delta_kind(class: EventClass) -> Option<DeltaKind> {
        match class {
            EventClass::Connect | EventClass::Accept => Some(DeltaKind::Add),
            EventClass::Close | EventClass::Shutdown => Some(DeltaKind::Remove),
            _ => None,
        }
    }

    /// Extracts a connection from the event's FD context.
    fn connection_from(event: &Event) -> Option<Connection> {
        // Unsuccessful syscalls never established or closed a connection.
        let res = event.rawres?;
        if res < 0 {
            return None;
        }

        let fd = event.fd.as_ref()?;

        let role = match fd.role {
            FdRole::Server => ConnRole::Server,
            FdRole::Client => ConnRole::Client,
            FdRole::None => return None,
        };

        let proto = match fd.proto {
            FdProto::Tcp => L4Proto::Tcp,
            FdProto::Udp => L4Proto::Udp,
            FdProto::Other => return None,
        };

        // Source fields are the client side, destination fields the server
        // side, for both families.
        let (client, server) = match fd.tuple {
            SockTuple::V4 {
                sip,
                sport,
                dip,
                dport,
            } => (
                Endpoint::new(Address::V4(sip), sport),
                Endpoint::new(Address::V4(dip), dport),
            ),
            SockTuple::V6 {
                sip,
                sport,
                dip,
                dport,
            } => (
                Endpoint::new(Address::V6(sip), sport),
                Endpoint::new(Address::V6(dip), dport),
            ),
            SockTuple::Other => return None,
        };

        let container_id = event.thread.container_id.as_deref()?;
        if container_id.is_empty() {
            return None;
        }

        let (local, remote) = match role {
            ConnRole::Server => (server, client),
            ConnRole::Client => (client, server),
        };

        Some(Connection {
            container_id: container_id.to_string(),
            local,
            remote,
            proto,
            role,
        })
    }

    /// Consults the latest runtime filter snapshot; accept-all until the
    /// sensor pushes a configuration.
    fn is_relevant(&self, conn: &Connection) -> bool {
        match self.runtime_config.current() {
            Some(filters) => filters.is_relevant(conn),
            None => true,
        }
    }
}

impl SignalHandler for NetworkSignalHandler {
    fn name(&self) -> &'static str {
        "network"
    }

    fn relevant_events(&self) -> &'static [EventClass] {
        &[
            EventClass::Close,
            EventClass::Shutdown,
            EventClass::Connect,
            EventClass::Accept,
        ]
    }

    fn handle(&self, event: &Event) -> HandlerResult {
        let Some(kind) = Self::delta_kind(event.class) else {
            return HandlerResult::Ignored;
        };

        let Some(conn) = Self::connection_from(event) else {
            return HandlerResult::Ignored;
        };

        if !self.is_relevant(&conn) {
            return HandlerResult::Ignored;
        }

        self.tracker.update_connection(ConnectionDelta {
            conn,
            timestamp_us: event.timestamp_us(),
            kind,
        });

        HandlerResult::Processed
    }
}
