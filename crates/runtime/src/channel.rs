//! Input / output channel resources
//!
//! The bridge between an archetype and its embedding host, built on May's
//! MPMC channels so both sides block cooperatively. An input read is pinned
//! for the duration of its critical section: re-reads see the same value,
//! commit consumes it, abort re-delivers it to the next section. Output
//! writes buffer in the section and are published, in order, exactly at
//! commit.

use std::time::Duration;

use may::coroutine;
use may::sync::mpmc;
use mpcal_core::Value;

use crate::context::CloseHandle;
use crate::error::{Result, RuntimeError};
use crate::resource::{Resource, ResourceEnv, ResourceMaker};

// Cadence at which blocked channel operations re-check the close signal.
const POLL: Duration = Duration::from_millis(5);

/// Host-side sender feeding an archetype's input channel.
#[derive(Clone)]
pub struct ChannelWriter {
    tx: mpmc::Sender<Value>,
}

impl ChannelWriter {
    pub fn send(&self, value: Value) -> Result<()> {
        self.tx
            .send(value)
            .map_err(|_| RuntimeError::misuse("input channel resource is gone"))
    }
}

/// Host-side receiver draining an archetype's output channel.
pub struct ChannelReader {
    rx: mpmc::Receiver<Value>,
}

impl ChannelReader {
    /// Non-blocking poll.
    pub fn try_recv(&self) -> Option<Value> {
        self.rx.try_recv().ok()
    }

    /// Wait up to `timeout` for the next published value. Safe to call from
    /// plain threads (tests) as well as coroutines.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Value> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Ok(value) = self.rx.try_recv() {
                return Some(value);
            }
            if std::time::Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(POLL);
        }
    }

    /// Drain everything currently published.
    pub fn drain(&self) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(value) = self.rx.try_recv() {
            out.push(value);
        }
        out
    }
}

/// An input channel: the host writes, the archetype reads.
pub fn input_channel() -> (ChannelWriter, ResourceMaker) {
    let (tx, rx) = mpmc::channel();
    let maker: ResourceMaker = Box::new(move |env: &ResourceEnv<'_>| {
        Ok(Box::new(InputChannel {
            rx,
            pinned: None,
            close: env.close_handle(),
        }))
    });
    (ChannelWriter { tx }, maker)
}

/// An output channel: the archetype writes, the host reads.
pub fn output_channel() -> (ChannelReader, ResourceMaker) {
    let (tx, rx) = mpmc::channel();
    let maker: ResourceMaker = Box::new(move |_env: &ResourceEnv<'_>| {
        Ok(Box::new(OutputChannel {
            tx,
            pending: Vec::new(),
        }))
    });
    (ChannelReader { rx }, maker)
}

struct InputChannel {
    rx: mpmc::Receiver<Value>,
    pinned: Option<Value>,
    close: CloseHandle,
}

impl Resource for InputChannel {
    fn read(&mut self) -> Result<Value> {
        if let Some(value) = &self.pinned {
            return Ok(value.clone());
        }
        loop {
            if self.close.is_closed() {
                return Err(RuntimeError::ContextClosed);
            }
            match self.rx.try_recv() {
                Ok(value) => {
                    self.pinned = Some(value.clone());
                    return Ok(value);
                }
                // Empty, or the host dropped its writer; either way the
                // next value can only arrive later (or never), so park
                // until then or until close.
                Err(_) => coroutine::sleep(POLL),
            }
        }
    }

    fn commit(&mut self) -> Result<()> {
        self.pinned = None;
        Ok(())
    }

    fn abort(&mut self) {
        // keep the pinned value: it is re-delivered to the retried section
    }
}

struct OutputChannel {
    tx: mpmc::Sender<Value>,
    pending: Vec<Value>,
}

impl Resource for OutputChannel {
    fn write(&mut self, value: Value) -> Result<()> {
        self.pending.push(value);
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        for value in self.pending.drain(..) {
            self.tx
                .send(value)
                .map_err(|_| RuntimeError::misuse("output channel reader is gone"))?;
        }
        Ok(())
    }

    fn abort(&mut self) {
        self.pending.clear();
    }
}
