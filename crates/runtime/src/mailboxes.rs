//! TCP mailboxes: reliable, in-order, buffered inter-archetype queues
//!
//! A mapped resource indexed by peer identifier. Each sub-resource is either
//! the archetype's own inbox (`Local`) or an outbound queue to another
//! address (`Remote`), decided by a route callback from index value to
//! address.
//!
//! ## Delivery protocol
//!
//! A remote sub-resource buffers writes in the critical section. At
//! pre-commit it (re)connects, replays the buffered batch tagged with
//! monotonic per-destination sequence numbers, and asks the receiver to
//! reserve inbox room; refusal or a broken connection turns into
//! `CriticalSectionAborted` so the section retries, escalating to a fatal
//! I/O error after too many consecutive connection failures. At commit it
//! sends a commit mark and retries (reconnect, replay, re-commit) until the
//! receiver acknowledges.
//!
//! The receiving side stages delivered messages per connection and moves
//! them into the shared inbox only when the commit mark arrives, admitting
//! each sequence number at most once. A batch that was partially flushed
//! before a pre-commit rejection may therefore already sit at the receiver;
//! the replay after retry commits it exactly once.
//!
//! Messages read from a local inbox are held back until the reading
//! section commits; abort returns them to the front of the inbox in order.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use may::coroutine;
use may::net::{TcpListener, TcpStream};
use may::sync::mpmc;
use mpcal_core::Value;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::context::CloseHandle;
use crate::error::{Result, RuntimeError};
use crate::resource::{Resource, ResourceMaker, ResourceMap};
use crate::wire::{self, FrameReader};

// Cadence at which a blocked inbox read re-checks the close signal.
const RECV_POLL: Duration = Duration::from_millis(2);

/// Whether an index names this archetype's own inbox or a peer's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxKind {
    Local,
    Remote,
}

#[derive(Debug, Clone)]
pub struct MailboxConfig {
    /// Messages the inbox will hold (queued plus staged) before refusing
    /// reservations.
    pub inbox_capacity: usize,
    /// How long a local `read` waits for a message before aborting the
    /// section; the scheduler's retry makes this equivalent to blocking
    /// while letting the section observe other state between attempts.
    pub read_wait: Duration,
    /// How long the sending side waits for a reservation or commit
    /// acknowledgment before treating the connection as broken.
    pub reply_timeout: Duration,
    /// Consecutive connection failures per destination tolerated before a
    /// transient abort escalates to a fatal I/O error.
    pub connection_failure_limit: u32,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        MailboxConfig {
            inbox_capacity: 128,
            read_wait: Duration::from_millis(20),
            reply_timeout: Duration::from_secs(1),
            connection_failure_limit: 64,
        }
    }
}

/// Wire frames of the mailbox protocol (§ wire format: u32 big-endian
/// length, bincode payload).
#[derive(Debug, Serialize, Deserialize)]
pub enum MailFrame {
    /// First frame on a connection: who is sending, and the instance nonce
    /// that keys receiver-side deduplication.
    Hello { sender: Value, nonce: u64 },
    /// One buffered message, tagged with its per-destination sequence
    /// number.
    Deliver { seq: u64, value: Value },
    /// Pre-commit: ask the receiver whether the staged batch fits its
    /// inbox.
    Reserve,
    /// Commit the staged batch into the inbox.
    Commit,
    /// Drop the staged batch.
    Abort,
}

/// Receiver's answer to `Reserve` and `Commit`.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum MailReply {
    Ok,
    Full,
}

/// Build a TCP mailbox map. `route` derives, for each index value, whether
/// the sub-resource is this archetype's inbox or a peer's, and at which
/// `host:port`; consistent addressing across peers is the deployer's
/// responsibility.
pub fn tcp_mailboxes(
    route: impl Fn(&Value) -> Option<(MailboxKind, String)> + Send + 'static,
    config: MailboxConfig,
) -> ResourceMaker {
    Box::new(move |env| {
        let close = env.close_handle();
        let self_id = env.self_id().clone();
        let map = ResourceMap::new(move |index| {
            let (kind, addr) = route(index).ok_or_else(|| {
                RuntimeError::misuse(format!("no mailbox route for index {index}"))
            })?;
            match kind {
                MailboxKind::Local => {
                    let mailbox = LocalMailbox::open(addr, config.clone(), close.clone())?;
                    Ok(Box::new(mailbox) as Box<dyn Resource>)
                }
                MailboxKind::Remote => Ok(Box::new(RemoteMailbox::new(
                    addr,
                    self_id.clone(),
                    config.clone(),
                    close.clone(),
                ))),
            }
        });
        Ok(Box::new(map))
    })
}

// ---------------------------------------------------------------------------
// Receiving side
// ---------------------------------------------------------------------------

struct InboxShared {
    tx: mpmc::Sender<Value>,
    /// Queued plus read-but-uncommitted messages; the reservation bound.
    occupied: AtomicUsize,
    capacity: usize,
    shutdown: AtomicBool,
    /// Highest committed sequence number per sender nonce.
    last_seq: Mutex<HashMap<u64, u64>>,
}

/// This archetype's inbox: a listener plus per-connection readers staging
/// messages until the sender commits.
struct LocalMailbox {
    rx: mpmc::Receiver<Value>,
    /// Messages put back by an aborted section, served before the channel.
    refront: VecDeque<Value>,
    /// Messages read in the current section, acknowledged at commit.
    held: Vec<Value>,
    shared: Arc<InboxShared>,
    addr: String,
    config: MailboxConfig,
    close: CloseHandle,
}

impl LocalMailbox {
    fn open(addr: String, config: MailboxConfig, close: CloseHandle) -> Result<Self> {
        let listener = TcpListener::bind(&addr)?;
        let (tx, rx) = mpmc::channel();
        let shared = Arc::new(InboxShared {
            tx,
            occupied: AtomicUsize::new(0),
            capacity: config.inbox_capacity,
            shutdown: AtomicBool::new(false),
            last_seq: Mutex::new(HashMap::new()),
        });
        debug!(%addr, "mailbox listener started");
        let accept_shared = shared.clone();
        let accept_addr = addr.clone();
        unsafe {
            coroutine::spawn(move || accept_loop(listener, accept_shared, accept_addr));
        }
        Ok(LocalMailbox {
            rx,
            refront: VecDeque::new(),
            held: Vec::new(),
            shared,
            addr,
            config,
            close,
        })
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<InboxShared>, addr: String) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if shared.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                trace!(%addr, %peer, "mailbox connection accepted");
                let conn_shared = shared.clone();
                unsafe {
                    coroutine::spawn(move || connection_loop(stream, conn_shared));
                }
            }
            Err(e) => {
                if shared.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                warn!(%addr, error = %e, "mailbox accept failed");
                coroutine::sleep(Duration::from_millis(50));
            }
        }
    }
    debug!(%addr, "mailbox listener stopped");
}

/// Reads frames from one sender connection. Staged deliveries live here,
/// on the connection: a broken connection simply drops its staging, and the
/// sender's replay after reconnect rebuilds it.
fn connection_loop(mut stream: TcpStream, shared: Arc<InboxShared>) {
    if stream.set_read_timeout(Some(wire::READ_SLICE)).is_err() {
        return;
    }
    let mut reader = FrameReader::new();
    let mut staged: Vec<(u64, Value)> = Vec::new();
    let mut sender_nonce: u64 = 0;
    loop {
        if shared.shutdown.load(Ordering::Relaxed) {
            return;
        }
        let frame = match reader.poll_frame(&mut stream) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(_) => return,
        };
        let message: MailFrame = match bincode::deserialize(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "dropping mailbox connection with undecodable frame");
                return;
            }
        };
        match message {
            MailFrame::Hello { sender, nonce } => {
                trace!(%sender, nonce, "mailbox sender identified");
                sender_nonce = nonce;
            }
            MailFrame::Deliver { seq, value } => staged.push((seq, value)),
            MailFrame::Reserve => {
                let room =
                    shared.occupied.load(Ordering::Relaxed) + staged.len() <= shared.capacity;
                let reply = if room { MailReply::Ok } else { MailReply::Full };
                if wire::send_message(&mut stream, &reply).is_err() {
                    return;
                }
            }
            MailFrame::Commit => {
                let mut fresh = 0usize;
                {
                    let mut last = shared
                        .last_seq
                        .lock()
                        .expect("mailbox sequence table lock poisoned");
                    let highest = last.entry(sender_nonce).or_insert(0);
                    for (seq, value) in staged.drain(..) {
                        if seq > *highest {
                            *highest = seq;
                            if shared.tx.send(value).is_err() {
                                return;
                            }
                            fresh += 1;
                        }
                    }
                }
                shared.occupied.fetch_add(fresh, Ordering::Relaxed);
                if wire::send_message(&mut stream, &MailReply::Ok).is_err() {
                    return;
                }
            }
            MailFrame::Abort => staged.clear(),
        }
    }
}

impl Resource for LocalMailbox {
    fn read(&mut self) -> Result<Value> {
        let deadline = Instant::now() + self.config.read_wait;
        loop {
            if self.close.is_closed() {
                return Err(RuntimeError::ContextClosed);
            }
            if let Some(value) = self.refront.pop_front() {
                self.held.push(value.clone());
                return Ok(value);
            }
            if let Ok(value) = self.rx.try_recv() {
                self.held.push(value.clone());
                return Ok(value);
            }
            if Instant::now() >= deadline {
                return Err(RuntimeError::CriticalSectionAborted);
            }
            coroutine::sleep(RECV_POLL);
        }
    }

    fn commit(&mut self) -> Result<()> {
        // the held messages are acknowledged: they release inbox room
        self.shared
            .occupied
            .fetch_sub(self.held.len(), Ordering::Relaxed);
        self.held.clear();
        Ok(())
    }

    fn abort(&mut self) {
        for value in self.held.drain(..).rev() {
            self.refront.push_front(value);
        }
    }

    fn close(&mut self) -> Result<()> {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        // poke the listener so its blocked accept wakes up and exits
        let _ = TcpStream::connect(&self.addr);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sending side
// ---------------------------------------------------------------------------

struct Conn {
    stream: TcpStream,
    reader: FrameReader,
}

/// Outbound queue to one peer inbox.
struct RemoteMailbox {
    addr: String,
    self_id: Value,
    /// Instance nonce keying receiver-side deduplication.
    nonce: u64,
    next_seq: u64,
    batch: Vec<(u64, Value)>,
    /// The current connection holds a successfully reserved staging of
    /// `batch`.
    reserved: bool,
    conn: Option<Conn>,
    failures: u32,
    config: MailboxConfig,
    close: CloseHandle,
}

impl RemoteMailbox {
    fn new(addr: String, self_id: Value, config: MailboxConfig, close: CloseHandle) -> Self {
        RemoteMailbox {
            addr,
            self_id,
            nonce: rand::random(),
            next_seq: 1,
            batch: Vec::new(),
            reserved: false,
            conn: None,
            failures: 0,
            config,
            close,
        }
    }

    fn dial(&self) -> io::Result<Conn> {
        let mut stream = TcpStream::connect(&self.addr)?;
        stream.set_read_timeout(Some(wire::READ_SLICE))?;
        wire::send_message(
            &mut stream,
            &MailFrame::Hello {
                sender: self.self_id.clone(),
                nonce: self.nonce,
            },
        )?;
        trace!(addr = %self.addr, "mailbox connection established");
        Ok(Conn {
            stream,
            reader: FrameReader::new(),
        })
    }

    /// Take the live connection, or dial a fresh one. The bool is true for
    /// a fresh connection (whose staging is necessarily empty).
    fn grab_conn(&mut self) -> io::Result<(Conn, bool)> {
        match self.conn.take() {
            Some(conn) => Ok((conn, false)),
            None => self.dial().map(|conn| (conn, true)),
        }
    }

    /// Replay the batch and ask the receiver to reserve room for it.
    fn reserve(&mut self) -> io::Result<MailReply> {
        let (mut conn, _) = self.grab_conn()?;
        let result = replay_and_ask(
            &mut conn,
            &self.batch,
            true,
            &MailFrame::Reserve,
            self.config.reply_timeout,
        );
        match result {
            Ok(reply) => {
                self.conn = Some(conn);
                Ok(reply)
            }
            Err(e) => Err(e),
        }
    }

    fn try_commit(&mut self) -> io::Result<()> {
        let (mut conn, fresh) = self.grab_conn()?;
        let replay = fresh || !self.reserved;
        let result = replay_and_ask(
            &mut conn,
            &self.batch,
            replay,
            &MailFrame::Commit,
            self.config.reply_timeout,
        );
        match result {
            Ok(MailReply::Ok) => {
                self.conn = Some(conn);
                Ok(())
            }
            Ok(MailReply::Full) => Err(io::Error::other("unexpected Full reply to commit")),
            Err(e) => Err(e),
        }
    }
}

fn replay_and_ask(
    conn: &mut Conn,
    batch: &[(u64, Value)],
    replay: bool,
    request: &MailFrame,
    reply_timeout: Duration,
) -> io::Result<MailReply> {
    if replay {
        for (seq, value) in batch {
            wire::send_message(
                &mut conn.stream,
                &MailFrame::Deliver {
                    seq: *seq,
                    value: value.clone(),
                },
            )?;
        }
    }
    wire::send_message(&mut conn.stream, request)?;
    conn.reader
        .read_message_timeout::<MailReply>(&mut conn.stream, reply_timeout)?
        .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "mailbox peer did not answer"))
}

impl Resource for RemoteMailbox {
    fn write(&mut self, value: Value) -> Result<()> {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.batch.push((seq, value));
        Ok(())
    }

    fn pre_commit(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        match self.reserve() {
            Ok(MailReply::Ok) => {
                self.failures = 0;
                self.reserved = true;
                Ok(())
            }
            Ok(MailReply::Full) => {
                self.failures = 0;
                debug!(addr = %self.addr, "peer inbox full, aborting section");
                Err(RuntimeError::CriticalSectionAborted)
            }
            Err(e) => {
                self.failures += 1;
                debug!(addr = %self.addr, failures = self.failures, error = %e, "mailbox send failed");
                if self.failures > self.config.connection_failure_limit {
                    Err(RuntimeError::Io(e))
                } else {
                    Err(RuntimeError::CriticalSectionAborted)
                }
            }
        }
    }

    fn commit(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        loop {
            if self.close.is_closed() {
                return Err(RuntimeError::ContextClosed);
            }
            match self.try_commit() {
                Ok(()) => {
                    self.batch.clear();
                    self.reserved = false;
                    self.failures = 0;
                    return Ok(());
                }
                Err(e) => {
                    // the receiver deduplicates by sequence number, so
                    // replaying after a lost acknowledgment cannot double-
                    // deliver
                    self.reserved = false;
                    debug!(addr = %self.addr, error = %e, "mailbox commit retrying");
                    coroutine::sleep(Duration::from_millis(50));
                }
            }
        }
    }

    fn abort(&mut self) {
        if self.reserved {
            // tell the receiver to drop its staged copy; a broken
            // connection drops it anyway
            if let Some(mut conn) = self.conn.take()
                && wire::send_message(&mut conn.stream, &MailFrame::Abort).is_ok()
            {
                self.conn = Some(conn);
            }
        }
        self.batch.clear();
        self.reserved = false;
    }

    fn close(&mut self) -> Result<()> {
        self.conn = None;
        Ok(())
    }
}
