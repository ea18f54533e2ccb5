//! Archetype context and critical-section scheduler
//!
//! One context runs one archetype. The compiled body is a state machine
//! keyed by label: each call executes the code of one label against the
//! context and returns either the next label or termination. The driver
//! loop here, not the generated code, owns commit and abort:
//!
//! - at a label boundary, every touched resource is asked to `pre_commit`;
//!   on unanimity they all `commit` and the program counter advances
//! - if any pre-commit refuses, or a resource reported
//!   `CriticalSectionAborted` mid-section, every touched resource is
//!   aborted and the same label is retried after a jittered backoff
//! - `ContextClosed` ends the run without error
//!
//! The body is single-threaded from its own viewpoint; resources may spawn
//! internal coroutines but the body never observes them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mpcal_core::Value;
use rand::Rng;
use tracing::{debug, warn};

use crate::error::{Result, RuntimeError};
use crate::resource::{Resource, ResourceEnv, ResourceMaker};

/// Default coroutine stack size: 1MB (0x100000 bytes)
/// Can be overridden via the MPCAL_STACK_SIZE environment variable
const DEFAULT_STACK_SIZE: usize = 0x100000;

static COROUTINE_INIT: Once = Once::new();

/// Configure the coroutine scheduler exactly once per process. Called by
/// `ArchetypeContextBuilder::build`, so embedders normally never need it.
pub fn init_coroutine_runtime() {
    COROUTINE_INIT.call_once(|| {
        let size = std::env::var("MPCAL_STACK_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|&s| s > 0)
            .unwrap_or(DEFAULT_STACK_SIZE);
        may::config().set_stack_size(size);
    });
}

/// A named point in an archetype body; the boundary between critical
/// sections. Owned by generated code, opaque to the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(pub &'static str);

impl Label {
    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

/// What a body step decided: continue at another label, or terminate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Goto(Label),
    Done,
}

/// Token addressing one resource of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceHandle(usize);

/// Cloneable close signal. `close()` may be called from any thread or
/// coroutine; the driver and all blocked resource operations observe it.
#[derive(Debug, Clone, Default)]
pub struct CloseHandle {
    flag: Arc<AtomicBool>,
}

impl CloseHandle {
    pub fn close(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// One step of a compiled archetype body.
pub type ArchetypeBody = Box<dyn FnMut(&mut ArchetypeContext, Label) -> Result<Step> + Send>;

pub struct ArchetypeContextBuilder {
    self_id: Value,
    constants: BTreeMap<String, Value>,
    makers: Vec<(String, ResourceMaker)>,
    entry: Option<Label>,
    body: Option<ArchetypeBody>,
    retry_base: Duration,
    retry_cap: Duration,
}

impl ArchetypeContextBuilder {
    /// Bind a constant (e.g. `NUM_SERVERS`), readable by the body and by
    /// resource factories.
    pub fn constant(mut self, name: impl Into<String>, value: Value) -> Self {
        self.constants.insert(name.into(), value);
        self
    }

    /// Declare a resource parameter by name.
    pub fn resource(mut self, name: impl Into<String>, maker: ResourceMaker) -> Self {
        self.makers.push((name.into(), maker));
        self
    }

    /// Bind the archetype body and its entry label.
    pub fn body(
        mut self,
        entry: Label,
        body: impl FnMut(&mut ArchetypeContext, Label) -> Result<Step> + Send + 'static,
    ) -> Self {
        self.entry = Some(entry);
        self.body = Some(Box::new(body));
        self
    }

    /// Backoff window between retries of an aborted section.
    pub fn retry_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.retry_base = base;
        self.retry_cap = cap;
        self
    }

    /// Materialize every resource and produce a runnable context.
    pub fn build(self) -> Result<ArchetypeContext> {
        init_coroutine_runtime();
        let ArchetypeContextBuilder {
            self_id,
            constants,
            makers,
            entry,
            body,
            retry_base,
            retry_cap,
        } = self;

        let close = CloseHandle::default();
        let mut names = BTreeMap::new();
        let mut resources: Vec<Box<dyn Resource>> = Vec::with_capacity(makers.len());
        {
            let env = ResourceEnv::new(&self_id, &constants, &close);
            for (name, maker) in makers {
                if names.contains_key(&name) {
                    return Err(RuntimeError::misuse(format!(
                        "resource {name} declared twice"
                    )));
                }
                let resource = maker(&env)?;
                names.insert(name, resources.len());
                resources.push(resource);
            }
        }

        Ok(ArchetypeContext {
            self_id,
            constants,
            names,
            resources,
            touched: Vec::new(),
            close,
            entry,
            body,
            retry_base,
            retry_cap,
            resources_closed: false,
        })
    }
}

/// Executes one archetype as a sequence of labeled critical sections.
pub struct ArchetypeContext {
    self_id: Value,
    constants: BTreeMap<String, Value>,
    names: BTreeMap<String, usize>,
    resources: Vec<Box<dyn Resource>>,
    touched: Vec<usize>,
    close: CloseHandle,
    entry: Option<Label>,
    body: Option<ArchetypeBody>,
    retry_base: Duration,
    retry_cap: Duration,
    resources_closed: bool,
}

impl ArchetypeContext {
    pub fn builder(self_id: Value) -> ArchetypeContextBuilder {
        ArchetypeContextBuilder {
            self_id,
            constants: BTreeMap::new(),
            makers: Vec::new(),
            entry: None,
            body: None,
            retry_base: Duration::from_millis(10),
            retry_cap: Duration::from_secs(1),
        }
    }

    pub fn self_id(&self) -> &Value {
        &self.self_id
    }

    pub fn constant(&self, name: &str) -> Result<&Value> {
        self.constants
            .get(name)
            .ok_or_else(|| RuntimeError::misuse(format!("unknown constant {name}")))
    }

    pub fn resource_handle(&self, name: &str) -> Result<ResourceHandle> {
        self.names
            .get(name)
            .map(|&i| ResourceHandle(i))
            .ok_or_else(|| RuntimeError::misuse(format!("unknown resource {name}")))
    }

    /// Close signal for this context, usable from other coroutines.
    pub fn close_handle(&self) -> CloseHandle {
        self.close.clone()
    }

    /// Read the resource at `handle`, descending through `indices` for
    /// mapped resources (`net[dst]` is `read(net, &[dst])`).
    pub fn read(&mut self, handle: ResourceHandle, indices: &[Value]) -> Result<Value> {
        self.check_open()?;
        self.touch(handle);
        self.target(handle, indices)?.read()
    }

    /// Write through the resource at `handle`; takes effect at commit.
    pub fn write(&mut self, handle: ResourceHandle, indices: &[Value], value: Value) -> Result<()> {
        self.check_open()?;
        self.touch(handle);
        self.target(handle, indices)?.write(value)
    }

    /// Run the archetype body to completion. Returns `Ok(())` on normal
    /// termination or external close; fatal resource and type errors
    /// propagate.
    pub fn run(&mut self) -> Result<()> {
        let mut body = self.body.take().ok_or_else(|| {
            RuntimeError::misuse("archetype context has no body or has already run")
        })?;
        let mut pc = match self.entry {
            Some(label) => label,
            None => return Err(RuntimeError::misuse("archetype context has no entry label")),
        };
        let mut backoff = Backoff::new(self.retry_base, self.retry_cap);
        debug!(archetype = %self.self_id, entry = %pc, "archetype starting");

        let result = loop {
            if self.close.is_closed() {
                break Ok(());
            }
            match body(self, pc) {
                Ok(step) => {
                    if self.close.is_closed() {
                        break Ok(());
                    }
                    match self.commit_section() {
                        Ok(true) => {
                            backoff.reset();
                            debug!(archetype = %self.self_id, label = %pc, "section committed");
                            match step {
                                Step::Goto(next) => pc = next,
                                Step::Done => break Ok(()),
                            }
                        }
                        Ok(false) => {
                            debug!(archetype = %self.self_id, label = %pc, "pre-commit refused, retrying");
                            backoff.pause();
                        }
                        Err(RuntimeError::ContextClosed) => break Ok(()),
                        Err(e) => break Err(e),
                    }
                }
                Err(RuntimeError::CriticalSectionAborted) => {
                    self.abort_section();
                    debug!(archetype = %self.self_id, label = %pc, "section aborted, retrying");
                    backoff.pause();
                }
                Err(RuntimeError::ContextClosed) => {
                    self.abort_section();
                    break Ok(());
                }
                Err(e) => {
                    self.abort_section();
                    break Err(e);
                }
            }
        };

        self.abort_section();
        let closed = self.close_resources();
        debug!(archetype = %self.self_id, ok = result.is_ok(), "archetype stopped");
        match (result, closed) {
            (Ok(()), closed) => closed,
            (Err(e), Err(close_err)) => {
                warn!(archetype = %self.self_id, error = %close_err, "resource close failed after run error");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
        }
    }

    /// Close the context explicitly. Idempotent; `run` already closes
    /// resources on exit, this covers contexts that never ran.
    pub fn close(&mut self) -> Result<()> {
        self.abort_section();
        self.close_resources()
    }

    fn check_open(&self) -> Result<()> {
        if self.close.is_closed() {
            Err(RuntimeError::ContextClosed)
        } else {
            Ok(())
        }
    }

    fn touch(&mut self, handle: ResourceHandle) {
        if !self.touched.contains(&handle.0) {
            self.touched.push(handle.0);
        }
    }

    fn target(&mut self, handle: ResourceHandle, indices: &[Value]) -> Result<&mut dyn Resource> {
        let root = self
            .resources
            .get_mut(handle.0)
            .ok_or_else(|| RuntimeError::misuse("stale resource handle"))?;
        let mut resource: &mut dyn Resource = root.as_mut();
        for index in indices {
            resource = resource.index(index)?;
        }
        Ok(resource)
    }

    /// Run the two-phase commit over the touched set. `Ok(true)` means the
    /// section is durable; `Ok(false)` means some resource refused at
    /// pre-commit and everything was aborted for a retry.
    fn commit_section(&mut self) -> Result<bool> {
        for k in 0..self.touched.len() {
            let i = self.touched[k];
            match self.resources[i].pre_commit() {
                Ok(()) => {}
                Err(RuntimeError::CriticalSectionAborted) => {
                    self.abort_section();
                    return Ok(false);
                }
                Err(e) => {
                    self.abort_section();
                    return Err(e);
                }
            }
        }
        for k in 0..self.touched.len() {
            let i = self.touched[k];
            self.resources[i].commit()?;
        }
        self.touched.clear();
        Ok(true)
    }

    fn abort_section(&mut self) {
        for k in 0..self.touched.len() {
            let i = self.touched[k];
            self.resources[i].abort();
        }
        self.touched.clear();
    }

    fn close_resources(&mut self) -> Result<()> {
        if self.resources_closed {
            return Ok(());
        }
        self.resources_closed = true;
        self.close.close();
        let mut first_err = None;
        for resource in &mut self.resources {
            if let Err(e) = resource.close() {
                warn!(archetype = %self.self_id, error = %e, "resource close failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Bounded randomized exponential backoff between retries of the same
/// section; avoids two archetypes spinning on reciprocally full buffers.
struct Backoff {
    base: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    fn new(base: Duration, cap: Duration) -> Self {
        Backoff {
            base,
            cap,
            current: base,
        }
    }

    fn reset(&mut self) {
        self.current = self.base;
    }

    fn pause(&mut self) {
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        may::coroutine::sleep(self.current.mul_f64(jitter));
        self.current = (self.current * 2).min(self.cap);
    }
}
