//! Function operators
//!
//! A `Function` is a finite map totally defined over its keys. In TLA+ a
//! tuple is also a function with domain `1..Len`, so `domain`, `apply`, and
//! `update` accept both variants; generated code indexes `f[x]` uniformly
//! without knowing which it holds.

use crate::error::TypeError;
use crate::value::Value;

/// `DOMAIN f`
pub fn domain(f: &Value) -> Result<Value, TypeError> {
    match f {
        Value::Function(m) => Ok(Value::set(m.keys().cloned())),
        Value::Tuple(t) => Ok(Value::set((1..=t.len() as i64).map(Value::Number))),
        other => Err(TypeError::mismatch("DOMAIN", "a function or tuple", other)),
    }
}

/// Pointwise application `f[k]`; a key outside the domain is an error.
pub fn apply(f: &Value, key: &Value) -> Result<Value, TypeError> {
    match f {
        Value::Function(m) => m
            .get(key)
            .cloned()
            .ok_or_else(|| TypeError::new(format!("[]: {key} is not in the domain of {f}"))),
        Value::Tuple(_) => crate::tuples::nth(f, key),
        other => Err(TypeError::mismatch("[]", "a function or tuple", other)),
    }
}

/// `[f EXCEPT ![k] = v]`. On a function an absent key is inserted; on a
/// tuple the index must already be in range.
pub fn update(f: &Value, key: &Value, value: &Value) -> Result<Value, TypeError> {
    match f {
        Value::Function(m) => {
            let mut updated = (**m).clone();
            updated.insert(key.clone(), value.clone());
            Ok(Value::Function(std::sync::Arc::new(updated)))
        }
        Value::Tuple(t) => {
            let i = key.as_number()?;
            if i < 1 || i > t.len() as i64 {
                return Err(TypeError::new(format!(
                    "EXCEPT: index {i} out of range for tuple of length {}",
                    t.len()
                )));
            }
            let mut updated = (**t).clone();
            updated[(i - 1) as usize] = value.clone();
            Ok(Value::Tuple(std::sync::Arc::new(updated)))
        }
        other => Err(TypeError::mismatch("EXCEPT", "a function or tuple", other)),
    }
}

/// `a @@ b`: merge; on overlapping keys the left operand wins.
pub fn merge(a: &Value, b: &Value) -> Result<Value, TypeError> {
    let left = a.as_function()?;
    let right = b.as_function()?;
    let mut merged = right.clone();
    for (k, v) in left.iter() {
        merged.insert(k.clone(), v.clone());
    }
    Ok(Value::Function(std::sync::Arc::new(merged)))
}

/// `k :> v`: the single-pair function.
pub fn pair(key: &Value, value: &Value) -> Value {
    Value::function([(key.clone(), value.clone())])
}

/// Record dot access: function application with the field name as string.
pub fn field(record: &Value, name: &str) -> Result<Value, TypeError> {
    let m = record.as_function()?;
    m.get(&Value::string(name))
        .cloned()
        .ok_or_else(|| TypeError::new(format!(".{name}: no such field in {record}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(v: i64) -> Value {
        Value::number(v)
    }

    #[test]
    fn test_domain() {
        let f = Value::function([(n(1), n(10)), (n(2), n(20))]);
        assert_eq!(domain(&f).unwrap(), Value::set([n(1), n(2)]));
        let t = Value::tuple([n(5), n(6)]);
        assert_eq!(domain(&t).unwrap(), Value::set([n(1), n(2)]));
    }

    #[test]
    fn test_apply() {
        let f = Value::function([(n(1), n(10))]);
        assert_eq!(apply(&f, &n(1)).unwrap(), n(10));
        assert!(apply(&f, &n(2)).is_err());
        let t = Value::tuple([n(5), n(6)]);
        assert_eq!(apply(&t, &n(2)).unwrap(), n(6));
    }

    #[test]
    fn test_update() {
        let f = Value::function([(n(1), n(10))]);
        let g = update(&f, &n(2), &n(20)).unwrap();
        assert_eq!(apply(&g, &n(2)).unwrap(), n(20));
        // original untouched
        assert!(apply(&f, &n(2)).is_err());

        let t = Value::tuple([n(5), n(6)]);
        assert_eq!(update(&t, &n(1), &n(7)).unwrap(), Value::tuple([n(7), n(6)]));
        assert!(update(&t, &n(3), &n(7)).is_err());
    }

    #[test]
    fn test_merge_left_wins() {
        let a = Value::function([(n(1), n(10)), (n(2), n(20))]);
        let b = Value::function([(n(2), n(99)), (n(3), n(30))]);
        let m = merge(&a, &b).unwrap();
        assert_eq!(apply(&m, &n(1)).unwrap(), n(10));
        assert_eq!(apply(&m, &n(2)).unwrap(), n(20));
        assert_eq!(apply(&m, &n(3)).unwrap(), n(30));
    }

    #[test]
    fn test_pair_and_merge_build_functions() {
        let f = merge(&pair(&n(1), &n(10)), &pair(&n(2), &n(20))).unwrap();
        assert_eq!(domain(&f).unwrap(), Value::set([n(1), n(2)]));
    }

    #[test]
    fn test_record_field() {
        let r = Value::record([("name", Value::string("a")), ("id", n(7))]);
        assert_eq!(field(&r, "id").unwrap(), n(7));
        assert!(field(&r, "missing").is_err());
        assert!(field(&n(1), "x").is_err());
    }
}
