//! Agent orchestration: wires the event source, router, handlers, tracker,
//! reporter, self-check, and control client together.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, SelfCheckConfig};
use crate::conn::tracker::{ConnectionSnapshot, ConnectionTracker};
use crate::control::client::RuntimeControlClient;
use crate::control::config::RuntimeConfig;
use crate::event::source::{ChannelSource, EventSource};
use crate::event::Event;
use crate::export::health::HealthMetrics;
use crate::handlers::network::NetworkSignalHandler;
use crate::handlers::selfcheck::{
    SelfCheckNetworkHandler, SelfCheckProbe, SelfCheckProcessHandler,
};
use crate::report::{Reporter, SelfCheckComponent, SensorReporter};
use crate::router::{EventRouter, HandlerStats};

/// Agent orchestrates all components of the collector.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    runtime_config: Arc<RuntimeConfig>,
    tracker: Arc<ConnectionTracker>,
    control: Arc<RuntimeControlClient>,
    event_tx: mpsc::Sender<Event>,
    /// Taken by `start` when the drain task spawns.
    source: Option<ChannelSource>,
    cancel: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics and the event queue.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        let runtime_config = RuntimeConfig::global();

        let control = Arc::new(RuntimeControlClient::new(
            cfg.sensor.clone(),
            Arc::clone(&runtime_config),
            Some(Arc::clone(&health)),
        ));

        let (event_tx, source) = ChannelSource::new(cfg.event_channel_capacity);

        Ok(Self {
            cfg,
            health,
            runtime_config,
            tracker: Arc::new(ConnectionTracker::new()),
            control,
            event_tx,
            source: Some(source),
            cancel: CancellationToken::new(),
            tasks: Vec::with_capacity(4),
        })
    }

    /// Producer handle for the kernel probe feeding events into the agent.
    pub fn event_sender(&self) -> mpsc::Sender<Event> {
        self.event_tx.clone()
    }

    /// The tracker holding the authoritative connection set.
    pub fn tracker(&self) -> Arc<ConnectionTracker> {
        Arc::clone(&self.tracker)
    }

    /// Start all components and begin processing events.
    pub async fn start(&mut self) -> Result<()> {
        // 1. Health server first so probes respond during startup.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        // 2. Control session, so a pushed configuration can arrive early.
        self.control.start();

        if !self
            .runtime_config
            .wait_until_initialized(self.cfg.sensor.config_wait_timeout)
            .await
        {
            warn!(
                timeout = ?self.cfg.sensor.config_wait_timeout,
                "no runtime configuration from sensor, filtering disabled until one arrives",
            );
        }

        // 3. Build the router: network handler plus self-check handlers.
        let mut router = EventRouter::new();
        router.add_handler(Box::new(NetworkSignalHandler::new(
            Arc::clone(&self.tracker),
            Arc::clone(&self.runtime_config),
        )));

        let probes = if self.cfg.selfcheck.enabled {
            let process_probe = SelfCheckProbe::new(self.cfg.selfcheck.timeout);
            let network_probe = SelfCheckProbe::new(self.cfg.selfcheck.timeout);

            router.add_handler(Box::new(SelfCheckProcessHandler::new(
                self.cfg.selfcheck.name.clone(),
                self.cfg.selfcheck.exe_path.clone(),
                process_probe.clone(),
            )));
            router.add_handler(Box::new(SelfCheckNetworkHandler::new(
                self.cfg.selfcheck.name.clone(),
                self.cfg.selfcheck.exe_path.clone(),
                network_probe.clone(),
            )));

            Some((process_probe, network_probe))
        } else {
            None
        };

        {
            let health = Arc::clone(&self.health);
            router.set_observer(Box::new(move |handler, result| {
                health
                    .handler_results
                    .with_label_values(&[handler, result.as_str()])
                    .inc();
            }));
        }

        let router = Arc::new(router);

        // 4. Drain events; this must run before the self-check can observe.
        let source = self.source.take().context("agent started twice")?;
        self.tasks.push(spawn_drain(
            source,
            Arc::clone(&router),
            Arc::clone(&self.health),
            self.cancel.child_token(),
        ));

        let reporter = Arc::new(SensorReporter::new(
            self.control.sender(),
            Some(Arc::clone(&self.health)),
        ));

        // 5. Self-check: launch the synthetic process and wait for its
        // events to round-trip through the pipeline.
        if let Some((process_probe, network_probe)) = probes {
            if self.cfg.selfcheck.spawn {
                spawn_self_check_process(&self.cfg.selfcheck);
            }

            run_self_check_supervisor(process_probe, network_probe, reporter.as_ref())
                .await
                .context("startup self-check")?;
        }

        // 6. Periodic reporting and stats.
        self.tasks.push(spawn_reporter(
            Arc::clone(&self.tracker),
            reporter,
            Arc::clone(&self.health),
            self.cfg.reporting.interval,
            self.cancel.child_token(),
        ));
        self.tasks.push(spawn_stats_reporter(
            router,
            Arc::clone(&self.health),
            self.cancel.child_token(),
        ));

        info!("agent fully started");

        Ok(())
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        self.control.stop(true).await;

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "agent task join failed");
            }
        }

        self.health.stop().await?;

        Ok(())
    }
}

/// Drains the event source into the router. The wait for the next event is
/// the only blocking point; all handler work is non-blocking.
fn spawn_drain<S>(
    mut source: S,
    router: Arc<EventRouter>,
    health: Arc<HealthMetrics>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()>
where
    S: EventSource + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = source.next() => match event {
                    Some(event) => {
                        health.events_received.inc();
                        router.dispatch(&event);
                    }
                    None => {
                        info!("event source closed");
                        break;
                    }
                }
            }
        }

        router.stop();
    })
}

/// Launches the synthetic self-check binary. Failure to launch is not
/// fatal by itself; the supervisor timeout decides the outcome.
fn spawn_self_check_process(cfg: &SelfCheckConfig) {
    match tokio::process::Command::new(&cfg.exe_path).spawn() {
        Ok(mut child) => {
            debug!(exe = %cfg.exe_path, "self-check process launched");
            tokio::spawn(async move {
                match child.wait().await {
                    Ok(status) => debug!(%status, "self-check process exited"),
                    Err(e) => warn!(error = %e, "waiting for self-check process"),
                }
            });
        }
        Err(e) => {
            warn!(exe = %cfg.exe_path, error = %e, "failed to launch self-check process");
        }
    }
}

/// Polls both self-check probes until each observes an event or times out.
/// A timeout is a fatal startup error.
async fn run_self_check_supervisor(
    process: SelfCheckProbe,
    network: SelfCheckProbe,
    reporter: &dyn Reporter,
) -> Result<()> {
    let mut poll = tokio::time::interval(Duration::from_millis(100));

    loop {
        poll.tick().await;

        let process_ok = process.observed();
        let network_ok = network.observed();

        if process_ok && network_ok {
            reporter.push_self_check_result(SelfCheckComponent::Process, true);
            reporter.push_self_check_result(SelfCheckComponent::Network, true);
            return Ok(());
        }

        if (!process_ok && process.has_timed_out()) || (!network_ok && network.has_timed_out()) {
            reporter.push_self_check_result(SelfCheckComponent::Process, process_ok);
            reporter.push_self_check_result(SelfCheckComponent::Network, network_ok);
            bail!(
                "pipeline events not observed within {:?}",
                process.timeout(),
            );
        }
    }
}

/// Periodically snapshots the tracker and pushes non-empty diffs upstream.
fn spawn_reporter(
    tracker: Arc<ConnectionTracker>,
    reporter: Arc<SensorReporter>,
    health: Arc<HealthMetrics>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut prev = ConnectionSnapshot::empty();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let snapshot = tracker.snapshot();
                    health.active_connections.set(tracker.active_count() as f64);

                    let diff = snapshot.diff_since(&prev);
                    if !diff.is_empty() {
                        reporter.push_diff(&diff.added, &diff.removed, SystemTime::now());
                    }

                    prev = snapshot;
                }
            }
        }
    })
}

/// Periodically logs per-handler dispatch stats and rolls the discard
/// counter into health metrics.
fn spawn_stats_reporter(
    router: Arc<EventRouter>,
    health: Arc<HealthMetrics>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let discarded = router.snapshot_discarded();
                    if discarded > 0 {
                        health.events_discarded.inc_by(discarded as f64);
                    }

                    let stats = router.snapshot_stats();
                    let total: u64 = stats.iter().map(HandlerStats::total).sum();

                    if total == 0 && discarded == 0 {
                        continue;
                    }

                    info!(dispatched = total, discarded, "event stats (60s)");

                    for s in &stats {
                        debug!(
                            handler = s.name,
                            processed = s.processed,
                            ignored = s.ignored,
                            errors = s.errors,
                            "  by handler (60s)",
                        );
                    }
                }
            }
        }
    })
}
