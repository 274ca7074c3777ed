//! Duplex control session with the upstream sensor.
//!
//! The client cycles Dialing -> Session until stopped. Session errors and
//! remote closes tear the stream down and return to Dialing after a short
//! delay; only `stop` ends the loop.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::RuntimeConfig;
use super::proto::{
    msg_from_collector, msg_to_collector, MsgFromCollector, MsgToCollector, RuntimeFiltersAck,
    SensorServiceClient,
};
use crate::config::SensorConfig;
use crate::export::health::HealthMetrics;

/// Per-session outbound queue depth. Writes beyond this are dropped rather
/// than blocking the producer.
const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Handle for queueing outbound messages onto the current session stream.
///
/// Sends never block: without an attached session, or with a full queue,
/// the message is dropped and `false` returned.
#[derive(Clone)]
pub struct ControlSender {
    slot: Arc<ArcSwapOption<mpsc::Sender<MsgFromCollector>>>,
}

impl ControlSender {
    fn detached() -> Self {
        Self {
            slot: Arc::new(ArcSwapOption::empty()),
        }
    }

    pub fn send(&self, msg: MsgFromCollector) -> bool {
        match self.slot.load_full() {
            Some(tx) => tx.try_send(msg).is_ok(),
            None => false,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.slot.load().is_some()
    }
}

/// Maintains the persistent duplex session with the sensor and applies
/// pushed configuration to [`RuntimeConfig`].
pub struct RuntimeControlClient {
    cfg: SensorConfig,
    runtime_config: Arc<RuntimeConfig>,
    health: Option<Arc<HealthMetrics>>,
    sender: ControlSender,
    cancel: CancellationToken,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RuntimeControlClient {
    pub fn new(
        cfg: SensorConfig,
        runtime_config: Arc<RuntimeConfig>,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            cfg,
            runtime_config,
            health,
            sender: ControlSender::detached(),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Handle for queueing outbound messages (acks, connection updates).
    pub fn sender(&self) -> ControlSender {
        self.sender.clone()
    }

    /// Spawns the session task. Safe to call from any thread; a second
    /// call while running is a no-op.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let cfg = self.cfg.clone();
        let runtime_config = Arc::clone(&self.runtime_config);
        let health = self.health.clone();
        let slot = Arc::clone(&self.sender.slot);
        let cancel = self.cancel.clone();

        *task = Some(tokio::spawn(run_loop(
            cfg,
            runtime_config,
            health,
            slot,
            cancel,
        )));
    }

    /// Signals the session task to stop. With `wait` the task is joined;
    /// otherwise it is left to wind down detached.
    pub async fn stop(&self, wait: bool) {
        self.cancel.cancel();

        let task = self.task.lock().take();
        if let Some(task) = task {
            if wait {
                if let Err(e) = task.await {
                    warn!(error = %e, "control client task join failed");
                }
            }
        }
    }
}

async fn run_loop(
    cfg: SensorConfig,
    runtime_config: Arc<RuntimeConfig>,
    health: Option<Arc<HealthMetrics>>,
    slot: Arc<ArcSwapOption<mpsc::Sender<MsgFromCollector>>>,
    cancel: CancellationToken,
) {
    debug!("runtime control client started");

    let mut first_attempt = true;
    while !cancel.is_cancelled() {
        if !first_attempt {
            if let Some(health) = &health {
                health.control_reconnects.inc();
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(cfg.redial_interval) => {}
            }
        }
        first_attempt = false;

        // Dialing: block until the channel is ready or stop is signalled.
        let channel = tokio::select! {
            _ = cancel.cancelled() => break,
            res = dial(&cfg) => match res {
                Ok(channel) => channel,
                Err(e) => {
                    warn!(error = %e, "sensor channel not ready");
                    continue;
                }
            }
        };
        debug!("control channel ready");

        if let Err(e) = run_session(channel, &runtime_config, health.as_deref(), &slot, &cancel).await
        {
            warn!(error = %e, "control session interrupted");
        }
    }

    debug!("runtime control client stopped");
}

async fn dial(cfg: &SensorConfig) -> Result<tonic::transport::Channel> {
    tonic::transport::Endpoint::from_shared(cfg.endpoint.clone())
        .context("invalid sensor endpoint")?
        .connect_timeout(cfg.connect_timeout)
        .connect()
        .await
        .context("connecting to sensor")
}

/// One session: open the duplex stream, publish the outbound queue, and
/// pump inbound messages until error, remote close, or stop.
async fn run_session(
    channel: tonic::transport::Channel,
    runtime_config: &RuntimeConfig,
    health: Option<&HealthMetrics>,
    slot: &ArcSwapOption<mpsc::Sender<MsgFromCollector>>,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut client = SensorServiceClient::new(channel);
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);

    let response = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        res = client.communicate(tonic::Request::new(ReceiverStream::new(rx))) => {
            res.context("opening control stream")?
        }
    };
    let mut inbound = response.into_inner();

    slot.store(Some(Arc::new(tx.clone())));
    info!("control session established");

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            msg = inbound.message() => match msg {
                Ok(Some(msg)) => handle_message(msg, runtime_config, &tx, health),
                Ok(None) => break Err(anyhow!("sensor closed the control stream")),
                Err(status) => break Err(anyhow!("control stream read failed: {status}")),
            }
        }
    };

    // Dropping the queue sender after detaching finishes the outbound half.
    slot.store(None);

    result
}

/// Applies one inbound message. Unknown kinds are dropped.
fn handle_message(
    msg: MsgToCollector,
    runtime_config: &RuntimeConfig,
    outbound: &mpsc::Sender<MsgFromCollector>,
    health: Option<&HealthMetrics>,
) {
    match msg.msg {
        Some(msg_to_collector::Msg::RuntimeFilteringConfiguration(cfg)) => {
            runtime_config.update(&cfg);
            if let Some(health) = health {
                health.runtime_config_updates.inc();
            }

            let ack = MsgFromCollector {
                msg: Some(msg_from_collector::Msg::RuntimeFiltersAck(
                    RuntimeFiltersAck {},
                )),
            };
            if outbound.try_send(ack).is_err() {
                warn!("outbound queue full, dropping runtime filters ack");
            }
        }
        None => {
            debug!("dropping unhandled sensor message");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::control::proto::{FilterAction, RuntimeFilter, RuntimeFilteringConfiguration};

    fn sensor_cfg(endpoint: &str) -> SensorConfig {
        SensorConfig {
            endpoint: endpoint.to_string(),
            redial_interval: Duration::from_millis(10),
            connect_timeout: Duration::from_millis(100),
            config_wait_timeout: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn test_filtering_configuration_is_committed_and_acked() {
        let runtime_config = RuntimeConfig::new();
        let (tx, mut rx) = mpsc::channel(4);

        let msg = MsgToCollector {
            msg: Some(msg_to_collector::Msg::RuntimeFilteringConfiguration(
                RuntimeFilteringConfiguration {
                    cluster_id: "cluster-a".to_string(),
                    filters: vec![RuntimeFilter {
                        cidr: "10.0.0.0/8".to_string(),
                        port_range: None,
                        action: FilterAction::Ignore as i32,
                    }],
                },
            )),
        };

        handle_message(msg, &runtime_config, &tx, None);

        assert!(runtime_config.is_initialized());
        assert_eq!(runtime_config.current().expect("snapshot").len(), 1);

        let ack = rx.try_recv().expect("ack queued");
        assert!(matches!(
            ack.msg,
            Some(msg_from_collector::Msg::RuntimeFiltersAck(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_message_is_dropped_without_ack() {
        let runtime_config = RuntimeConfig::new();
        let (tx, mut rx) = mpsc::channel(4);

        handle_message(MsgToCollector { msg: None }, &runtime_config, &tx, None);

        assert!(!runtime_config.is_initialized());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_interrupts_dialing() {
        // Nothing listens on this endpoint; the client stays in Dialing.
        let client = RuntimeControlClient::new(
            sensor_cfg("http://127.0.0.1:1"),
            Arc::new(RuntimeConfig::new()),
            None,
        );
        client.start();

        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_secs(2), client.stop(true))
            .await
            .expect("stop should return promptly");
    }

    #[tokio::test]
    async fn test_detached_sender_drops_messages() {
        let sender = ControlSender::detached();
        assert!(!sender.is_attached());
        assert!(!sender.send(MsgFromCollector { msg: None }));
    }
}
