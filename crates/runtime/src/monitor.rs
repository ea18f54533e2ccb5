//! Monitor service: node-liveness heartbeats and queries
//!
//! A standalone TCP server to which each archetype registers its identifier
//! and periodically heartbeats while running; failure-detector clients ask
//! it "is peer X alive?". The monitor may be restarted: every heartbeat
//! upserts, so archetypes re-register lazily. Per peer id the recorded
//! last-heartbeat instant never moves backwards, so concurrent heartbeats
//! through different connections cannot cause the answer to oscillate.
//!
//! Archetype contexts can "run under" a colocated monitor: the monitor owns
//! the heartbeat coroutine and ties its lifetime to the run, and withdraws
//! liveness the moment the run ends. Contexts elsewhere only ever know a
//! monitor by its network address, through `MonitorClient`.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use may::coroutine;
use may::net::{TcpListener, TcpStream};
use mpcal_core::Value;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::context::{ArchetypeContext, init_coroutine_runtime};
use crate::error::{Result, RuntimeError};
use crate::wire::{self, FrameReader};

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Silence tolerated before a registered peer is reported suspected.
    pub inactivity_window: Duration,
    /// Heartbeat cadence for archetypes running under this monitor.
    pub heartbeat_interval: Duration,
    /// How long clients wait for an answer before treating the monitor as
    /// unreachable.
    pub reply_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            inactivity_window: Duration::from_secs(2),
            heartbeat_interval: Duration::from_millis(500),
            reply_timeout: Duration::from_secs(1),
        }
    }
}

/// Requests of the monitor protocol; framing mirrors the mailbox protocol.
#[derive(Debug, Serialize, Deserialize)]
pub enum MonitorRequest {
    Register(Value),
    Heartbeat(Value),
    Query(Value),
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum MonitorReply {
    Ack,
    Alive,
    Suspected,
}

struct MonitorShared {
    beats: Mutex<HashMap<Value, Instant>>,
    shutdown: AtomicBool,
    window: Duration,
}

impl MonitorShared {
    /// Upsert a heartbeat; the instant never moves backwards.
    fn record(&self, peer: &Value) {
        let now = Instant::now();
        let mut beats = self.beats.lock().expect("monitor heartbeat table lock poisoned");
        let entry = beats.entry(peer.clone()).or_insert(now);
        if *entry < now {
            *entry = now;
        }
    }

    fn withdraw(&self, peer: &Value) {
        self.beats
            .lock()
            .expect("monitor heartbeat table lock poisoned")
            .remove(peer);
    }

    fn is_alive(&self, peer: &Value) -> bool {
        self.beats
            .lock()
            .expect("monitor heartbeat table lock poisoned")
            .get(peer)
            .is_some_and(|at| at.elapsed() <= self.window)
    }
}

/// A running monitor server.
pub struct Monitor {
    shared: Arc<MonitorShared>,
    addr: String,
    config: MonitorConfig,
}

impl Monitor {
    /// Bind `addr` and start serving.
    pub fn spawn(addr: impl Into<String>, config: MonitorConfig) -> Result<Monitor> {
        init_coroutine_runtime();
        let addr = addr.into();
        let listener = TcpListener::bind(&addr)?;
        let shared = Arc::new(MonitorShared {
            beats: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
            window: config.inactivity_window,
        });
        debug!(%addr, "monitor listening");
        let accept_shared = shared.clone();
        let accept_addr = addr.clone();
        unsafe {
            coroutine::spawn(move || accept_loop(listener, accept_shared, accept_addr));
        }
        Ok(Monitor {
            shared,
            addr,
            config,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Stop serving. Peers tracked so far are forgotten.
    pub fn close(&self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        let _ = TcpStream::connect(&self.addr);
    }

    /// Run an archetype context under this monitor: register its identifier,
    /// heartbeat for the duration of the run, and withdraw liveness when the
    /// run ends (normally or not).
    pub fn run_archetype(&self, ctx: &mut ArchetypeContext) -> Result<()> {
        let id = ctx.self_id().clone();
        self.shared.record(&id);
        debug!(archetype = %id, monitor = %self.addr, "archetype registered");

        let stop = Arc::new(AtomicBool::new(false));
        let beat_stop = stop.clone();
        let beat_shared = self.shared.clone();
        let beat_id = id.clone();
        let interval = self.config.heartbeat_interval;
        let beater = unsafe {
            coroutine::spawn(move || {
                while !beat_stop.load(Ordering::Relaxed)
                    && !beat_shared.shutdown.load(Ordering::Relaxed)
                {
                    beat_shared.record(&beat_id);
                    coroutine::sleep(interval);
                }
            })
        };

        let result = ctx.run();

        stop.store(true, Ordering::Relaxed);
        let _ = beater.join();
        self.shared.withdraw(&id);
        debug!(archetype = %id, "archetype withdrawn from monitor");
        result
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<MonitorShared>, addr: String) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if shared.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                trace!(%addr, %peer, "monitor connection accepted");
                let conn_shared = shared.clone();
                unsafe {
                    coroutine::spawn(move || serve_connection(stream, conn_shared));
                }
            }
            Err(e) => {
                if shared.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                warn!(%addr, error = %e, "monitor accept failed");
                coroutine::sleep(Duration::from_millis(50));
            }
        }
    }
    debug!(%addr, "monitor stopped");
}

fn serve_connection(mut stream: TcpStream, shared: Arc<MonitorShared>) {
    if stream.set_read_timeout(Some(wire::READ_SLICE)).is_err() {
        return;
    }
    let mut reader = FrameReader::new();
    loop {
        if shared.shutdown.load(Ordering::Relaxed) {
            return;
        }
        let frame = match reader.poll_frame(&mut stream) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(_) => return,
        };
        let request: MonitorRequest = match bincode::deserialize(&frame) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "dropping monitor connection with undecodable frame");
                return;
            }
        };
        let reply = match request {
            MonitorRequest::Register(peer) => {
                debug!(%peer, "peer registered");
                shared.record(&peer);
                MonitorReply::Ack
            }
            MonitorRequest::Heartbeat(peer) => {
                shared.record(&peer);
                MonitorReply::Ack
            }
            MonitorRequest::Query(peer) => {
                if shared.is_alive(&peer) {
                    MonitorReply::Alive
                } else {
                    MonitorReply::Suspected
                }
            }
        };
        if wire::send_message(&mut stream, &reply).is_err() {
            return;
        }
    }
}

/// Client for archetypes not colocated with their monitor. One short-lived
/// connection per call, so a crashed monitor is indistinguishable from a
/// crashed node, which is the conservative answer a failure detector wants.
pub struct MonitorClient {
    addr: String,
    reply_timeout: Duration,
}

impl MonitorClient {
    pub fn new(addr: impl Into<String>, reply_timeout: Duration) -> Self {
        MonitorClient {
            addr: addr.into(),
            reply_timeout,
        }
    }

    fn exchange(&self, request: &MonitorRequest) -> io::Result<MonitorReply> {
        let mut stream = TcpStream::connect(&self.addr)?;
        stream.set_read_timeout(Some(wire::READ_SLICE))?;
        wire::send_message(&mut stream, request)?;
        FrameReader::new()
            .read_message_timeout(&mut stream, self.reply_timeout)?
            .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "monitor did not answer"))
    }

    pub fn register(&self, peer: &Value) -> Result<()> {
        self.exchange(&MonitorRequest::Register(peer.clone()))
            .map(|_| ())
            .map_err(RuntimeError::Io)
    }

    pub fn heartbeat(&self, peer: &Value) -> Result<()> {
        self.exchange(&MonitorRequest::Heartbeat(peer.clone()))
            .map(|_| ())
            .map_err(RuntimeError::Io)
    }

    /// Ask for the peer's liveness; `Err` means the monitor itself was
    /// unreachable.
    pub fn query(&self, peer: &Value) -> Result<MonitorReply> {
        self.exchange(&MonitorRequest::Query(peer.clone()))
            .map_err(RuntimeError::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(v: i64) -> Value {
        Value::number(v)
    }

    fn fast_config() -> MonitorConfig {
        MonitorConfig {
            inactivity_window: Duration::from_millis(150),
            heartbeat_interval: Duration::from_millis(30),
            reply_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_register_heartbeat_query_lifecycle() {
        let monitor = Monitor::spawn("127.0.0.1:20401", fast_config()).unwrap();
        let handle = unsafe {
            coroutine::spawn(move || {
                let client = MonitorClient::new("127.0.0.1:20401", Duration::from_secs(1));
                // unknown peer: suspected
                assert_eq!(client.query(&n(9)).unwrap(), MonitorReply::Suspected);

                client.register(&n(9)).unwrap();
                assert_eq!(client.query(&n(9)).unwrap(), MonitorReply::Alive);

                // silence past the window flips the verdict
                coroutine::sleep(Duration::from_millis(250));
                assert_eq!(client.query(&n(9)).unwrap(), MonitorReply::Suspected);

                // a late heartbeat lazily re-registers
                client.heartbeat(&n(9)).unwrap();
                assert_eq!(client.query(&n(9)).unwrap(), MonitorReply::Alive);
            })
        };
        handle.join().unwrap();
        monitor.close();
    }

    #[test]
    fn test_run_archetype_ties_liveness_to_the_run() {
        use crate::context::{Label, Step};
        use crate::register::LocalRegister;

        let monitor = Monitor::spawn("127.0.0.1:20402", fast_config()).unwrap();
        let mut ctx = ArchetypeContext::builder(n(5))
            .resource("i", LocalRegister::maker(n(0)))
            .body(Label("spin"), |ctx, _| {
                let i = ctx.resource_handle("i")?;
                let v = ctx.read(i, &[])?.as_number()?;
                ctx.write(i, &[], n(v + 1))?;
                coroutine::sleep(Duration::from_millis(5));
                Ok(Step::Goto(Label("spin")))
            })
            .build()
            .unwrap();
        let close = ctx.close_handle();

        let runner = unsafe {
            coroutine::spawn(move || {
                monitor.run_archetype(&mut ctx).unwrap();
                monitor
            })
        };
        let prober = unsafe {
            coroutine::spawn(move || {
                let client = MonitorClient::new("127.0.0.1:20402", Duration::from_secs(1));
                coroutine::sleep(Duration::from_millis(60));
                assert_eq!(client.query(&n(5)).unwrap(), MonitorReply::Alive);
                close.close();
                // withdrawal is immediate once the run ends
                coroutine::sleep(Duration::from_millis(60));
                assert_eq!(client.query(&n(5)).unwrap(), MonitorReply::Suspected);
            })
        };
        prober.join().unwrap();
        let monitor = runner.join().unwrap();
        monitor.close();
    }
}
