//! The resource protocol
//!
//! Every piece of external state an archetype touches (network mailboxes,
//! local registers, host channels, the failure detector) implements the
//! `Resource` trait: read/write/index plus the two-phase commit operations.
//! The archetype context drives the protocol; resources only have to keep
//! enough shadow state to make `abort` restore the last committed state.
//!
//! ## Contract
//!
//! - `pre_commit` is called only after some `read`/`write`/`index` since the
//!   last terminal call, and must not commit anything irreversibly
//! - `commit` is called only if every resource touched in the critical
//!   section pre-committed ok, and must not report `CriticalSectionAborted`
//! - `abort` must be infallible and idempotent within a section
//! - `read` is stable within a section (snapshot semantics) and observes
//!   writes made earlier in the same section
//! - blocked `read`/`write`/`pre_commit` calls must return
//!   `CriticalSectionAborted` or `ContextClosed` once the owning context
//!   closes
//!
//! Leaf resources inherit an `index` that fails with `ProtocolMisuse`;
//! mapped resources implement `index` and inherit failing `read`/`write`.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use mpcal_core::Value;

use crate::context::CloseHandle;
use crate::error::{Result, RuntimeError};

/// One unit of external state, driven through the two-phase protocol.
pub trait Resource: Send {
    /// Current value; may block until one is available.
    fn read(&mut self) -> Result<Value> {
        Err(RuntimeError::misuse("read on a resource that is not readable"))
    }

    /// Stage a value to take effect at commit; may block on backpressure.
    fn write(&mut self, value: Value) -> Result<()> {
        let _ = value;
        Err(RuntimeError::misuse(
            "write on a resource that is not writable",
        ))
    }

    /// Yield the sub-resource at `index`; must not block.
    fn index(&mut self, index: &Value) -> Result<&mut dyn Resource> {
        Err(RuntimeError::misuse(format!(
            "index [{index}] on a resource that is not a map"
        )))
    }

    /// First commit phase; ok means this resource can commit the section.
    fn pre_commit(&mut self) -> Result<()> {
        Ok(())
    }

    /// Second commit phase; must be unconditionally durable to peers.
    fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    /// Discard tentative state, restoring the last committed state.
    fn abort(&mut self) {}

    /// Called exactly once at context shutdown.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Read-only view handed to resource factories at context construction.
pub struct ResourceEnv<'a> {
    self_id: &'a Value,
    constants: &'a BTreeMap<String, Value>,
    close: &'a CloseHandle,
}

impl<'a> ResourceEnv<'a> {
    pub(crate) fn new(
        self_id: &'a Value,
        constants: &'a BTreeMap<String, Value>,
        close: &'a CloseHandle,
    ) -> Self {
        ResourceEnv {
            self_id,
            constants,
            close,
        }
    }

    pub fn self_id(&self) -> &Value {
        self.self_id
    }

    pub fn constant(&self, name: &str) -> Result<&Value> {
        self.constants
            .get(name)
            .ok_or_else(|| RuntimeError::misuse(format!("unknown constant {name}")))
    }

    /// The owning context's close signal. Blocking resource operations poll
    /// it so that close can interrupt them.
    pub fn close_handle(&self) -> CloseHandle {
        self.close.clone()
    }
}

/// Descriptor from which a context materializes one resource.
pub type ResourceMaker = Box<dyn FnOnce(&ResourceEnv<'_>) -> Result<Box<dyn Resource>> + Send>;

/// Mapped-resource engine: a lazy table of sub-resources keyed by index
/// value. Sub-resources are owned here, materialized on first access, and
/// closed transitively. The two-phase operations forward to the children
/// touched since the last terminal call, in touch order.
pub struct ResourceMap {
    children: BTreeMap<Value, Box<dyn Resource>>,
    dirty: Vec<Value>,
    make: Box<dyn FnMut(&Value) -> Result<Box<dyn Resource>> + Send>,
}

impl ResourceMap {
    pub fn new(make: impl FnMut(&Value) -> Result<Box<dyn Resource>> + Send + 'static) -> Self {
        ResourceMap {
            children: BTreeMap::new(),
            dirty: Vec::new(),
            make: Box::new(make),
        }
    }
}

impl Resource for ResourceMap {
    fn index(&mut self, index: &Value) -> Result<&mut dyn Resource> {
        let child = match self.children.entry(index.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(slot) => slot.insert((self.make)(index)?),
        };
        if !self.dirty.contains(index) {
            self.dirty.push(index.clone());
        }
        Ok(child.as_mut())
    }

    fn pre_commit(&mut self) -> Result<()> {
        for key in &self.dirty {
            if let Some(child) = self.children.get_mut(key) {
                child.pre_commit()?;
            }
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        for key in &self.dirty {
            if let Some(child) = self.children.get_mut(key) {
                child.commit()?;
            }
        }
        self.dirty.clear();
        Ok(())
    }

    fn abort(&mut self) {
        for key in &self.dirty {
            if let Some(child) = self.children.get_mut(key) {
                child.abort();
            }
        }
        self.dirty.clear();
    }

    fn close(&mut self) -> Result<()> {
        let mut first_err = None;
        for (_, child) in self.children.iter_mut() {
            if let Err(e) = child.close() {
                first_err.get_or_insert(e);
            }
        }
        self.children.clear();
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
