//! Upstream reporting.
//!
//! The reporter consumes connection diffs and self-check results. The
//! sensor-backed implementation serializes diffs into `ConnectionUpdate`
//! messages on the control stream's outbound queue; it never blocks, so a
//! missing session only costs the dropped update.

use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, error, info};

use crate::conn::{ConnRole, Connection, L4Proto};
use crate::control::client::ControlSender;
use crate::control::proto::{
    msg_from_collector, ConnectionRecord, ConnectionRole, ConnectionUpdate, L4Protocol,
    MsgFromCollector,
};
use crate::export::health::HealthMetrics;

/// Pipeline stage validated by a self-check handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfCheckComponent {
    Process,
    Network,
}

impl SelfCheckComponent {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Process => "process",
            Self::Network => "network",
        }
    }
}

/// Consumer of connection diffs and self-check results.
pub trait Reporter: Send + Sync {
    fn push_diff(&self, added: &[Connection], removed: &[Connection], wall_ts: SystemTime);

    fn push_self_check_result(&self, component: SelfCheckComponent, observed: bool);
}

/// Reporter that pushes diffs to the sensor over the control stream.
pub struct SensorReporter {
    sender: ControlSender,
    health: Option<Arc<HealthMetrics>>,
}

impl SensorReporter {
    pub fn new(sender: ControlSender, health: Option<Arc<HealthMetrics>>) -> Self {
        Self { sender, health }
    }
}

fn record(conn: &Connection) -> ConnectionRecord {
    ConnectionRecord {
        container_id: conn.container_id.clone(),
        local_address: conn.local.address.to_string(),
        local_port: u32::from(conn.local.port),
        remote_address: conn.remote.address.to_string(),
        remote_port: u32::from(conn.remote.port),
        protocol: match conn.proto {
            L4Proto::Tcp => L4Protocol::Tcp as i32,
            L4Proto::Udp => L4Protocol::Udp as i32,
        },
        role: match conn.role {
            ConnRole::Server => ConnectionRole::Server as i32,
            ConnRole::Client => ConnectionRole::Client as i32,
        },
    }
}

fn wall_ts_us(wall_ts: SystemTime) -> u64 {
    wall_ts
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

impl Reporter for SensorReporter {
    fn push_diff(&self, added: &[Connection], removed: &[Connection], wall_ts: SystemTime) {
        let update = ConnectionUpdate {
            added: added.iter().map(record).collect(),
            removed: removed.iter().map(record).collect(),
            timestamp_us: wall_ts_us(wall_ts),
        };

        let msg = MsgFromCollector {
            msg: Some(msg_from_collector::Msg::ConnectionUpdate(update)),
        };

        if self.sender.send(msg) {
            if let Some(health) = &self.health {
                health.connection_updates_sent.inc();
            }
            debug!(
                added = added.len(),
                removed = removed.len(),
                "connection update sent",
            );
        } else {
            debug!(
                added = added.len(),
                removed = removed.len(),
                "no control session, dropping connection update",
            );
        }
    }

    fn push_self_check_result(&self, component: SelfCheckComponent, observed: bool) {
        if let Some(health) = &self.health {
            health
                .selfcheck_observed
                .with_label_values(&[component.as_str()])
                .set(f64::from(u8::from(observed)));
        }

        if observed {
            info!(component = component.as_str(), "self-check passed");
        } else {
            error!(component = component.as_str(), "self-check failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::{Address, Endpoint};

    fn conn() -> Connection {
        Connection {
            container_id: "c1".to_string(),
            local: Endpoint::new(Address::V4(u32::from_be_bytes([10, 0, 0, 1])), 40000),
            remote: Endpoint::new(Address::V4(u32::from_be_bytes([10, 0, 0, 2])), 443),
            proto: L4Proto::Tcp,
            role: ConnRole::Client,
        }
    }

    #[test]
    fn test_record_serialization() {
        let rec = record(&conn());
        assert_eq!(rec.container_id, "c1");
        assert_eq!(rec.local_address, "10.0.0.1");
        assert_eq!(rec.local_port, 40000);
        assert_eq!(rec.remote_address, "10.0.0.2");
        assert_eq!(rec.remote_port, 443);
        assert_eq!(rec.protocol, L4Protocol::Tcp as i32);
        assert_eq!(rec.role, ConnectionRole::Client as i32);
    }

    #[test]
    fn test_wall_ts_microseconds() {
        let ts = SystemTime::UNIX_EPOCH + std::time::Duration::from_millis(1_500);
        assert_eq!(wall_ts_us(ts), 1_500_000);
    }

    #[test]
    fn test_component_labels() {
        assert_eq!(SelfCheckComponent::Process.as_str(), "process");
        assert_eq!(SelfCheckComponent::Network.as_str(), "network");
    }
}
