//! Tuple (sequence) operators
//!
//! Tuples double as TLA+ sequences. Indexing is 1-based everywhere; index 0
//! or past the end is a `TypeError`, matching the sequence operators of the
//! source algebra.

use crate::error::TypeError;
use crate::value::Value;

fn seq_of<'a>(op: &str, v: &'a Value) -> Result<&'a [Value], TypeError> {
    match v {
        Value::Tuple(t) => Ok(t),
        other => Err(TypeError::mismatch(op, "a tuple", other)),
    }
}

pub fn len(t: &Value) -> Result<Value, TypeError> {
    Ok(Value::Number(seq_of("Len", t)?.len() as i64))
}

pub fn head(t: &Value) -> Result<Value, TypeError> {
    seq_of("Head", t)?
        .first()
        .cloned()
        .ok_or_else(|| TypeError::new("Head: empty tuple"))
}

pub fn tail(t: &Value) -> Result<Value, TypeError> {
    let elems = seq_of("Tail", t)?;
    if elems.is_empty() {
        return Err(TypeError::new("Tail: empty tuple"));
    }
    Ok(Value::tuple(elems[1..].iter().cloned()))
}

pub fn append(t: &Value, elem: &Value) -> Result<Value, TypeError> {
    let elems = seq_of("Append", t)?;
    Ok(Value::tuple(
        elems.iter().cloned().chain(std::iter::once(elem.clone())),
    ))
}

/// `a \o b`
pub fn concat(a: &Value, b: &Value) -> Result<Value, TypeError> {
    let x = seq_of("\\o", a)?;
    let y = seq_of("\\o", b)?;
    Ok(Value::tuple(x.iter().chain(y.iter()).cloned()))
}

/// `SubSeq(t, from, to)`, both bounds 1-based and inclusive. An empty range
/// (`from > to`) yields the empty tuple without bounds checks, as in TLA+.
pub fn sub_seq(t: &Value, from: &Value, to: &Value) -> Result<Value, TypeError> {
    let elems = seq_of("SubSeq", t)?;
    let m = from.as_number()?;
    let n = to.as_number()?;
    if m > n {
        return Ok(Value::tuple([]));
    }
    if m < 1 || n > elems.len() as i64 {
        return Err(TypeError::new(format!(
            "SubSeq: range {m}..{n} out of bounds for tuple of length {}",
            elems.len()
        )));
    }
    Ok(Value::tuple(
        elems[(m - 1) as usize..n as usize].iter().cloned(),
    ))
}

/// 1-based indexing.
pub fn nth(t: &Value, index: &Value) -> Result<Value, TypeError> {
    let elems = seq_of("[]", t)?;
    let i = index.as_number()?;
    if i < 1 || i > elems.len() as i64 {
        return Err(TypeError::new(format!(
            "[]: index {i} out of range for tuple of length {}",
            elems.len()
        )));
    }
    Ok(elems[(i - 1) as usize].clone())
}
