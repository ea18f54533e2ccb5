//! Placeholder resource
//!
//! Bound to archetype parameters that a particular deployment leaves
//! unused. Touching it in any way is a programmer bug, diagnosed instead of
//! silently doing nothing.

use mpcal_core::Value;

use crate::error::{Result, RuntimeError};
use crate::resource::{Resource, ResourceMaker};

pub struct Placeholder;

impl Placeholder {
    pub fn maker() -> ResourceMaker {
        Box::new(|_| Ok(Box::new(Placeholder)))
    }

    fn refuse<T>(op: &str) -> Result<T> {
        Err(RuntimeError::misuse(format!(
            "{op} on a placeholder resource; this archetype parameter is unbound in this deployment"
        )))
    }
}

impl Resource for Placeholder {
    fn read(&mut self) -> Result<Value> {
        Self::refuse("read")
    }

    fn write(&mut self, _value: Value) -> Result<()> {
        Self::refuse("write")
    }

    fn index(&mut self, _index: &Value) -> Result<&mut dyn Resource> {
        Self::refuse("index")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_operation_is_refused() {
        let mut p = Placeholder;
        assert!(p.read().is_err());
        assert!(p.write(Value::number(1)).is_err());
        assert!(p.index(&Value::number(1)).is_err());
        // lifecycle is still harmless so contexts can close it
        p.pre_commit().unwrap();
        p.commit().unwrap();
        p.abort();
        p.close().unwrap();
    }
}
