//! TLA+ value algebra for compiled Modular PlusCal systems
//!
//! This crate is the purely functional foundation the runtime and generated
//! archetype code share: the `Value` type (the only data archetypes read or
//! write through resources), the operators of the value algebra, and the
//! canonical binary codec.
//!
//! Key design principles:
//! - Values are immutable; every operator returns a fresh `Value`
//! - Equality is structural, and a total order exists across all variants
//!   (used for set canonicalization and deterministic serialization)
//! - Failing operators return `TypeError` instead of panicking

pub mod arith;
pub mod codec;
pub mod error;
pub mod funcs;
pub mod sets;
pub mod tuples;
pub mod value;

// Re-export key types and functions
pub use codec::{CodecError, decode, encode};
pub use error::TypeError;
pub use value::Value;
