//! Startup self-check handlers.
//!
//! The collector launches a known synthetic process that performs a socket
//! operation; these handlers watch for its events to confirm the pipeline
//! delivers both process and network signals end to end.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::event::{Event, EventClass};
use crate::router::{HandlerResult, SignalHandler};

/// Default time allowed for self-check events to arrive.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default process name of the synthetic self-check binary.
pub const DEFAULT_NAME: &str = "self_checks";

/// Default executable path of the synthetic self-check binary.
pub const DEFAULT_EXE_PATH: &str = "/usr/local/bin/self_checks";

/// Observation state shared between one handler and the startup
/// supervisor that polls it.
#[derive(Clone)]
pub struct SelfCheckProbe {
    observed: Arc<AtomicBool>,
    start: Instant,
    timeout: Duration,
}

impl SelfCheckProbe {
    pub fn new(timeout: Duration) -> Self {
        Self {
            observed: Arc::new(AtomicBool::new(false)),
            start: Instant::now(),
            timeout,
        }
    }

    pub fn mark_observed(&self) {
        self.observed.store(true, Ordering::SeqCst);
    }

    pub fn observed(&self) -> bool {
        self.observed.load(Ordering::SeqCst)
    }

    pub fn has_timed_out(&self) -> bool {
        Instant::now() > self.start + self.timeout
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Verifies that an event came from the self-check process.
///
/// Either signal alone is sufficient: the driver reports the host pid
/// while the forked child sees its namespace pid, so pid matching is not
/// possible, and comm may be altered across fork+exec.
fn is_self_check_event(comm: &str, exe: &str, name: &str, exe_path: &str) -> bool {
    comm == name || exe == exe_path
}

/// Watches for the self-check process executing.
pub struct SelfCheckProcessHandler {
    name: String,
    exe_path: String,
    probe: SelfCheckProbe,
}

impl SelfCheckProcessHandler {
    pub fn new(name: String, exe_path: String, probe: SelfCheckProbe) -> Self {
        Self {
            name,
            exe_path,
            probe,
        }
    }
}

impl SignalHandler for SelfCheckProcessHandler {
    fn name(&self) -> &'static str {
        "self_check_process"
    }

    fn relevant_events(&self) -> &'static [EventClass] {
        &[EventClass::Execve]
    }

    fn handle(&self, event: &Event) -> HandlerResult {
        if is_self_check_event(
            &event.thread.comm,
            &event.thread.exe,
            &self.name,
            &self.exe_path,
        ) {
            self.probe.mark_observed();
            HandlerResult::Processed
        } else {
            HandlerResult::Ignored
        }
    }
}

/// Watches for the self-check process's socket activity.
pub struct SelfCheckNetworkHandler {
    name: String,
    exe_path: String,
    probe: SelfCheckProbe,
}

impl SelfCheckNetworkHandler {
    pub fn new(name: String, exe_path: String, probe: SelfCheckProbe) -> Self {
        Self {
            name,
            exe_path,
            probe,
        }
    }
}

impl SignalHandler for SelfCheckNetworkHandler {
    fn name(&self) -> &'static str {
        "self_check_network"
    }

    fn relevant_events(&self) -> &'static [EventClass] {
        &[
            EventClass::Close,
            EventClass::Shutdown,
            EventClass::Connect,
            EventClass::Accept,
            EventClass::Getsockopt,
        ]
    }

    fn handle(&self, event: &Event) -> HandlerResult {
        if is_self_check_event(
            &event.thread.comm,
            &event.thread.exe,
            &self.name,
            &self.exe_path,
        ) {
            self.probe.mark_observed();
            HandlerResult::Processed
        } else {
            HandlerResult::Ignored
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ThreadInfo;

    fn event(class: EventClass, comm: &str, exe: &str) -> Event {
        Event {
            class,
            timestamp_ns: 0,
            rawres: Some(0),
            fd: None,
            thread: ThreadInfo {
                comm: comm.to_string(),
                exe: exe.to_string(),
                container_id: None,
            },
        }
    }

    fn probe() -> SelfCheckProbe {
        SelfCheckProbe::new(DEFAULT_TIMEOUT)
    }

    #[test]
    fn test_identity_matches_on_comm_alone() {
        assert!(is_self_check_event(
            "self_checks",
            "/some/other/path",
            DEFAULT_NAME,
            DEFAULT_EXE_PATH,
        ));
    }

    #[test]
    fn test_identity_matches_on_exe_alone() {
        assert!(is_self_check_event(
            "renamed",
            DEFAULT_EXE_PATH,
            DEFAULT_NAME,
            DEFAULT_EXE_PATH,
        ));
    }

    #[test]
    fn test_identity_rejects_unrelated_process() {
        assert!(!is_self_check_event(
            "nginx",
            "/usr/sbin/nginx",
            DEFAULT_NAME,
            DEFAULT_EXE_PATH,
        ));
    }

    #[test]
    fn test_process_handler_observes_execve() {
        let probe = probe();
        let handler = SelfCheckProcessHandler::new(
            DEFAULT_NAME.to_string(),
            DEFAULT_EXE_PATH.to_string(),
            probe.clone(),
        );

        let unrelated = event(EventClass::Execve, "bash", "/bin/bash");
        assert_eq!(handler.handle(&unrelated), HandlerResult::Ignored);
        assert!(!probe.observed());

        let matched = event(EventClass::Execve, DEFAULT_NAME, DEFAULT_EXE_PATH);
        assert_eq!(handler.handle(&matched), HandlerResult::Processed);
        assert!(probe.observed());
    }

    #[test]
    fn test_network_handler_observes_socket_events() {
        let probe = probe();
        let handler = SelfCheckNetworkHandler::new(
            DEFAULT_NAME.to_string(),
            DEFAULT_EXE_PATH.to_string(),
            probe.clone(),
        );

        let matched = event(EventClass::Getsockopt, "other", DEFAULT_EXE_PATH);
        assert_eq!(handler.handle(&matched), HandlerResult::Processed);
        assert!(probe.observed());
    }

    #[test]
    fn test_probe_timeout() {
        let probe = SelfCheckProbe::new(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(5));
        assert!(probe.has_timed_out());

        let probe = SelfCheckProbe::new(Duration::from_secs(60));
        assert!(!probe.has_timed_out());
    }
}
