//! Set operators
//!
//! Sets are finite and heterogeneous: operating on two sets whose elements
//! have different shapes is legal, the result simply holds elements of mixed
//! variants. Enumeration order is the value total order, so quantifier
//! expansion in generated code is deterministic.

use std::collections::BTreeSet;

use crate::error::TypeError;
use crate::value::Value;

// Power sets double per element; past this bound the result would not fit in
// memory anyway, so fail early with a diagnosable error.
const POWER_SET_LIMIT: usize = 24;

fn set_of<'a>(op: &str, v: &'a Value) -> Result<&'a BTreeSet<Value>, TypeError> {
    match v {
        Value::Set(s) => Ok(s),
        other => Err(TypeError::mismatch(op, "a set", other)),
    }
}

/// `e \in s`
pub fn member(elem: &Value, set: &Value) -> Result<Value, TypeError> {
    Ok(Value::Bool(set_of("\\in", set)?.contains(elem)))
}

pub fn union(a: &Value, b: &Value) -> Result<Value, TypeError> {
    let x = set_of("\\union", a)?;
    let y = set_of("\\union", b)?;
    Ok(Value::set(x.iter().chain(y.iter()).cloned()))
}

pub fn intersection(a: &Value, b: &Value) -> Result<Value, TypeError> {
    let x = set_of("\\intersect", a)?;
    let y = set_of("\\intersect", b)?;
    Ok(Value::set(x.intersection(y).cloned()))
}

/// `a \ b`
pub fn difference(a: &Value, b: &Value) -> Result<Value, TypeError> {
    let x = set_of("\\", a)?;
    let y = set_of("\\", b)?;
    Ok(Value::set(x.difference(y).cloned()))
}

pub fn is_subset(a: &Value, b: &Value) -> Result<Value, TypeError> {
    let x = set_of("\\subseteq", a)?;
    let y = set_of("\\subseteq", b)?;
    Ok(Value::Bool(x.is_subset(y)))
}

/// `SUBSET s`: the set of all subsets of `s`.
pub fn power_set(s: &Value) -> Result<Value, TypeError> {
    let elems: Vec<&Value> = set_of("SUBSET", s)?.iter().collect();
    if elems.len() > POWER_SET_LIMIT {
        return Err(TypeError::new(format!(
            "SUBSET: set of cardinality {} is too large to enumerate",
            elems.len()
        )));
    }
    let mut subsets = BTreeSet::new();
    for mask in 0u64..(1u64 << elems.len()) {
        let subset = elems
            .iter()
            .enumerate()
            .filter(|(i, _)| mask & (1 << i) != 0)
            .map(|(_, e)| (*e).clone());
        subsets.insert(Value::set(subset));
    }
    Ok(Value::Set(std::sync::Arc::new(subsets)))
}

/// `UNION s`: flatten a set of sets into one set.
pub fn union_all(s: &Value) -> Result<Value, TypeError> {
    let outer = set_of("UNION", s)?;
    let mut result = BTreeSet::new();
    for inner in outer.iter() {
        result.extend(set_of("UNION", inner)?.iter().cloned());
    }
    Ok(Value::Set(std::sync::Arc::new(result)))
}

pub fn cardinality(s: &Value) -> Result<Value, TypeError> {
    let set = set_of("Cardinality", s)?;
    Ok(Value::Number(set.len() as i64))
}

/// Elements in enumeration order (the value total order). Generated
/// quantifiers and `CHOOSE`-style helpers iterate this.
pub fn elements(s: &Value) -> Result<Vec<Value>, TypeError> {
    Ok(set_of("elements", s)?.iter().cloned().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(v: i64) -> Value {
        Value::number(v)
    }

    fn ns(vals: &[i64]) -> Value {
        Value::set(vals.iter().map(|v| n(*v)))
    }

    #[test]
    fn test_member() {
        assert_eq!(member(&n(2), &ns(&[1, 2, 3])).unwrap(), Value::TRUE);
        assert_eq!(member(&n(9), &ns(&[1, 2, 3])).unwrap(), Value::FALSE);
        assert!(member(&n(1), &n(1)).is_err());
    }

    #[test]
    fn test_union_intersection_difference() {
        assert_eq!(union(&ns(&[1, 2]), &ns(&[2, 3])).unwrap(), ns(&[1, 2, 3]));
        assert_eq!(intersection(&ns(&[1, 2]), &ns(&[2, 3])).unwrap(), ns(&[2]));
        assert_eq!(difference(&ns(&[1, 2]), &ns(&[2, 3])).unwrap(), ns(&[1]));
    }

    #[test]
    fn test_heterogeneous_sets_are_legal() {
        let mixed = union(&ns(&[1]), &Value::set([Value::string("a")])).unwrap();
        assert_eq!(cardinality(&mixed).unwrap(), n(2));
    }

    #[test]
    fn test_subset() {
        assert_eq!(is_subset(&ns(&[1, 2]), &ns(&[1, 2, 3])).unwrap(), Value::TRUE);
        assert_eq!(is_subset(&ns(&[1, 4]), &ns(&[1, 2, 3])).unwrap(), Value::FALSE);
        assert_eq!(is_subset(&ns(&[]), &ns(&[])).unwrap(), Value::TRUE);
    }

    #[test]
    fn test_power_set() {
        let p = power_set(&ns(&[1, 2])).unwrap();
        let expected = Value::set([ns(&[]), ns(&[1]), ns(&[2]), ns(&[1, 2])]);
        assert_eq!(p, expected);
    }

    #[test]
    fn test_union_all() {
        let s = Value::set([ns(&[1, 2]), ns(&[2, 3]), ns(&[])]);
        assert_eq!(union_all(&s).unwrap(), ns(&[1, 2, 3]));
        assert!(union_all(&ns(&[1])).is_err());
    }

    #[test]
    fn test_elements_are_ordered() {
        let elems = elements(&ns(&[3, 1, 2])).unwrap();
        assert_eq!(elems, vec![n(1), n(2), n(3)]);
    }
}
