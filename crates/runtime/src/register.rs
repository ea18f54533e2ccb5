//! Local register resource
//!
//! Holds one value of archetype-private state. Speculation is plain shadow
//! state: the tentative value sits alongside the last committed one and is
//! promoted on commit or dropped on abort.

use mpcal_core::Value;

use crate::error::Result;
use crate::resource::{Resource, ResourceMaker};

pub struct LocalRegister {
    committed: Value,
    tentative: Option<Value>,
}

impl LocalRegister {
    pub fn new(initial: Value) -> Self {
        LocalRegister {
            committed: initial,
            tentative: None,
        }
    }

    pub fn maker(initial: Value) -> ResourceMaker {
        Box::new(move |_| Ok(Box::new(LocalRegister::new(initial))))
    }
}

impl Resource for LocalRegister {
    fn read(&mut self) -> Result<Value> {
        match &self.tentative {
            Some(value) => Ok(value.clone()),
            None => Ok(self.committed.clone()),
        }
    }

    fn write(&mut self, value: Value) -> Result<()> {
        self.tentative = Some(value);
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if let Some(value) = self.tentative.take() {
            self.committed = value;
        }
        Ok(())
    }

    fn abort(&mut self) {
        self.tentative = None;
    }
}
