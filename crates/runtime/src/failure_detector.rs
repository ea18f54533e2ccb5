//! Failure detector resource
//!
//! A mapped resource indexed by peer identifier; each sub-resource is a
//! read-only Bool saying "peer suspected dead". A poller coroutine per
//! queried peer round-trips a query to that peer's monitor every
//! `pull_interval`: a peer whose monitor answered Alive within the last
//! `timeout` window is alive; anything else (silence, an unreachable
//! monitor, an explicit Suspected) leaves it suspected once the window
//! runs out. Suspicion flips both ways as evidence accumulates.
//!
//! `read` returns the latest cached verdict, pinned for the duration of the
//! reading critical section; it never waits on the network.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use may::coroutine;
use mpcal_core::Value;
use tracing::debug;

use crate::error::{Result, RuntimeError};
use crate::monitor::{MonitorClient, MonitorReply};
use crate::resource::{Resource, ResourceMaker, ResourceMap};

#[derive(Debug, Clone)]
pub struct FailureDetectorConfig {
    /// Cadence of monitor polling.
    pub pull_interval: Duration,
    /// Silence tolerated before a peer is suspected.
    pub timeout: Duration,
    /// Per-query answer deadline.
    pub reply_timeout: Duration,
}

impl Default for FailureDetectorConfig {
    fn default() -> Self {
        FailureDetectorConfig {
            pull_interval: Duration::from_millis(500),
            timeout: Duration::from_secs(2),
            reply_timeout: Duration::from_secs(1),
        }
    }
}

/// Build a failure-detector map. `route` yields, per peer identifier, the
/// address of the monitor answering for that peer.
pub fn failure_detector(
    route: impl Fn(&Value) -> Option<String> + Send + 'static,
    config: FailureDetectorConfig,
) -> ResourceMaker {
    Box::new(move |_env| {
        let shutdown = Arc::new(AtomicBool::new(false));
        let poller_shutdown = shutdown.clone();
        let map = ResourceMap::new(move |peer| {
            let addr = route(peer).ok_or_else(|| {
                RuntimeError::misuse(format!("no monitor route for peer {peer}"))
            })?;
            Ok(Box::new(PeerView::start(
                peer.clone(),
                addr,
                config.clone(),
                poller_shutdown.clone(),
            )) as Box<dyn Resource>)
        });
        Ok(Box::new(FailureDetector { map, shutdown }))
    })
}

/// The mapped root: delegates to the child table, and stops every poller on
/// close.
struct FailureDetector {
    map: ResourceMap,
    shutdown: Arc<AtomicBool>,
}

impl Resource for FailureDetector {
    fn index(&mut self, index: &Value) -> Result<&mut dyn Resource> {
        self.map.index(index)
    }

    fn pre_commit(&mut self) -> Result<()> {
        self.map.pre_commit()
    }

    fn commit(&mut self) -> Result<()> {
        self.map.commit()
    }

    fn abort(&mut self) {
        self.map.abort();
    }

    fn close(&mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::Relaxed);
        self.map.close()
    }
}

/// Read-only Bool view of one peer's suspicion, backed by its poller.
struct PeerView {
    state: Arc<AtomicBool>,
    pinned: Option<bool>,
}

impl PeerView {
    fn start(
        peer: Value,
        addr: String,
        config: FailureDetectorConfig,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        // presumed alive until the first window of evidence is in
        let state = Arc::new(AtomicBool::new(false));
        let poller_state = state.clone();
        unsafe {
            coroutine::spawn(move || {
                poll_loop(peer, addr, config, shutdown, poller_state);
            });
        }
        PeerView {
            state,
            pinned: None,
        }
    }
}

fn poll_loop(
    peer: Value,
    addr: String,
    config: FailureDetectorConfig,
    shutdown: Arc<AtomicBool>,
    state: Arc<AtomicBool>,
) {
    let client = MonitorClient::new(addr, config.reply_timeout);
    let mut last_alive = Instant::now();
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        if let Ok(MonitorReply::Alive) = client.query(&peer) {
            last_alive = Instant::now();
        }
        let suspected = last_alive.elapsed() > config.timeout;
        if state.swap(suspected, Ordering::Relaxed) != suspected {
            debug!(%peer, suspected, "peer suspicion changed");
        }
        coroutine::sleep(config.pull_interval);
    }
}

impl Resource for PeerView {
    fn read(&mut self) -> Result<Value> {
        // pinned per critical section for snapshot stability
        let suspected = match self.pinned {
            Some(suspected) => suspected,
            None => {
                let suspected = self.state.load(Ordering::Relaxed);
                self.pinned = Some(suspected);
                suspected
            }
        };
        Ok(Value::Bool(suspected))
    }

    fn commit(&mut self) -> Result<()> {
        self.pinned = None;
        Ok(())
    }

    fn abort(&mut self) {
        self.pinned = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{Monitor, MonitorConfig};

    fn n(v: i64) -> Value {
        Value::number(v)
    }

    fn fast_fd() -> FailureDetectorConfig {
        FailureDetectorConfig {
            pull_interval: Duration::from_millis(25),
            timeout: Duration::from_millis(150),
            reply_timeout: Duration::from_millis(300),
        }
    }

    #[test]
    fn test_peer_view_is_section_stable() {
        let mut view = PeerView {
            state: Arc::new(AtomicBool::new(false)),
            pinned: None,
        };
        assert_eq!(view.read().unwrap(), Value::FALSE);
        // the world changes mid-section; the section must not see it
        view.state.store(true, Ordering::Relaxed);
        assert_eq!(view.read().unwrap(), Value::FALSE);
        view.commit().unwrap();
        assert_eq!(view.read().unwrap(), Value::TRUE);
    }

    #[test]
    fn test_suspicion_follows_heartbeats_both_ways() {
        crate::context::init_coroutine_runtime();
        let monitor = Monitor::spawn(
            "127.0.0.1:20501",
            MonitorConfig {
                inactivity_window: Duration::from_millis(100),
                ..MonitorConfig::default()
            },
        )
        .unwrap();

        let handle = unsafe {
            coroutine::spawn(move || {
                let client = MonitorClient::new("127.0.0.1:20501", Duration::from_secs(1));
                let shutdown = Arc::new(AtomicBool::new(false));
                let mut view =
                    PeerView::start(n(3), "127.0.0.1:20501".into(), fast_fd(), shutdown.clone());

                // nobody heartbeats peer 3: suspicion settles in
                coroutine::sleep(Duration::from_millis(300));
                assert_eq!(view.read().unwrap(), Value::TRUE);
                view.commit().unwrap();

                // peer 3 comes alive
                client.register(&n(3)).unwrap();
                let revived = unsafe {
                    coroutine::spawn({
                        let shutdown = shutdown.clone();
                        move || {
                            while !shutdown.load(Ordering::Relaxed) {
                                let _ = client.heartbeat(&n(3));
                                coroutine::sleep(Duration::from_millis(25));
                            }
                        }
                    })
                };
                coroutine::sleep(Duration::from_millis(200));
                assert_eq!(view.read().unwrap(), Value::FALSE);
                view.commit().unwrap();

                shutdown.store(true, Ordering::Relaxed);
                let _ = revived.join();
            })
        };
        handle.join().unwrap();
        monitor.close();
    }

    #[test]
    fn test_missing_route_is_misuse() {
        let config = fast_fd();
        let maker = failure_detector(|_| None, config);
        let self_id = n(1);
        let constants = Default::default();
        let close = crate::context::CloseHandle::default();
        let env = crate::resource::ResourceEnv::new(&self_id, &constants, &close);
        let mut fd = maker(&env).unwrap();
        assert!(fd.index(&n(7)).is_err());
        fd.close().unwrap();
    }
}
