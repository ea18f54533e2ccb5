//! Arithmetic and comparison operators on `Number`
//!
//! Division and modulo are mathematical (floored): the result of `%` carries
//! the sign of the divisor and `div` rounds toward negative infinity, so
//! `-7 div 2 = -4` and `-7 % 2 = 1`. Overflow is a failure, never a wrap.

use crate::error::TypeError;
use crate::value::Value;

fn numbers(op: &str, a: &Value, b: &Value) -> Result<(i64, i64), TypeError> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => Ok((*x, *y)),
        _ => Err(TypeError::new(format!(
            "{op}: expected numbers, got {a} and {b}"
        ))),
    }
}

fn overflow(op: &str, a: i64, b: i64) -> TypeError {
    TypeError::new(format!("{op}: overflow on {a} and {b}"))
}

pub fn add(a: &Value, b: &Value) -> Result<Value, TypeError> {
    let (x, y) = numbers("+", a, b)?;
    x.checked_add(y)
        .map(Value::Number)
        .ok_or_else(|| overflow("+", x, y))
}

pub fn sub(a: &Value, b: &Value) -> Result<Value, TypeError> {
    let (x, y) = numbers("-", a, b)?;
    x.checked_sub(y)
        .map(Value::Number)
        .ok_or_else(|| overflow("-", x, y))
}

pub fn mul(a: &Value, b: &Value) -> Result<Value, TypeError> {
    let (x, y) = numbers("*", a, b)?;
    x.checked_mul(y)
        .map(Value::Number)
        .ok_or_else(|| overflow("*", x, y))
}

/// Floored integer division.
pub fn floor_div(a: &Value, b: &Value) -> Result<Value, TypeError> {
    let (x, y) = numbers("div", a, b)?;
    if y == 0 {
        return Err(TypeError::new(format!("div: division of {x} by zero")));
    }
    let q = x.checked_div(y).ok_or_else(|| overflow("div", x, y))?;
    let r = x % y;
    // Truncated quotient rounds toward zero; adjust when the remainder and
    // divisor disagree in sign.
    if r != 0 && (r < 0) != (y < 0) {
        q.checked_sub(1)
            .map(Value::Number)
            .ok_or_else(|| overflow("div", x, y))
    } else {
        Ok(Value::Number(q))
    }
}

/// Floored modulo: the result has the sign of the divisor.
pub fn floor_mod(a: &Value, b: &Value) -> Result<Value, TypeError> {
    let (x, y) = numbers("%", a, b)?;
    if y == 0 {
        return Err(TypeError::new(format!("%: division of {x} by zero")));
    }
    if x == i64::MIN && y == -1 {
        return Err(overflow("%", x, y));
    }
    let r = x % y;
    if r != 0 && (r < 0) != (y < 0) {
        Ok(Value::Number(r + y))
    } else {
        Ok(Value::Number(r))
    }
}

/// Exponentiation; the exponent must be non-negative.
pub fn pow(a: &Value, b: &Value) -> Result<Value, TypeError> {
    let (x, y) = numbers("^", a, b)?;
    if y < 0 {
        return Err(TypeError::new(format!("^: negative exponent {y}")));
    }
    let exp = u32::try_from(y).map_err(|_| overflow("^", x, y))?;
    x.checked_pow(exp)
        .map(Value::Number)
        .ok_or_else(|| overflow("^", x, y))
}

pub fn neg(a: &Value) -> Result<Value, TypeError> {
    match a {
        Value::Number(x) => x
            .checked_neg()
            .map(Value::Number)
            .ok_or_else(|| TypeError::new(format!("-: overflow negating {x}"))),
        other => Err(TypeError::mismatch("-", "a number", other)),
    }
}

pub fn lt(a: &Value, b: &Value) -> Result<Value, TypeError> {
    let (x, y) = numbers("<", a, b)?;
    Ok(Value::Bool(x < y))
}

pub fn le(a: &Value, b: &Value) -> Result<Value, TypeError> {
    let (x, y) = numbers("<=", a, b)?;
    Ok(Value::Bool(x <= y))
}

pub fn gt(a: &Value, b: &Value) -> Result<Value, TypeError> {
    let (x, y) = numbers(">", a, b)?;
    Ok(Value::Bool(x > y))
}

pub fn ge(a: &Value, b: &Value) -> Result<Value, TypeError> {
    let (x, y) = numbers(">=", a, b)?;
    Ok(Value::Bool(x >= y))
}
