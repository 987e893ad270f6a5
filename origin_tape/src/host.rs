// Copyright 2026 the Origin Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Opaque-call boundary.
//!
//! Calls whose callee is not under instrumentation are delegated to an
//! embedder-provided [`Host`]. The callee is identified by its fully-qualified
//! name plus a hash over the argument types; the pair labels the provenance
//! root that the call's result becomes.

use thiserror::Error;

use crate::value::Value;

/// A stable 64-bit signature hash over callee name and argument types.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
#[serde(transparent)]
pub struct SigHash(pub u64);

/// Computes the signature hash for a call to `symbol` with `args`.
///
/// Uses FNV-1a 64 over a canonical byte encoding; the hash is part of the
/// trace format and must stay stable.
#[must_use]
pub fn sig_hash(symbol: &str, args: &[Value]) -> SigHash {
    let mut h = fnv1a(FNV_OFFSET, b"origin_tape:v1\0");
    h = fnv1a(h, symbol.as_bytes());
    h = fnv1a(h, &[0]);
    h = fnv1a(h, &(args.len() as u32).to_le_bytes());
    for a in args {
        h = fnv1a(h, &[a.value_type().tag()]);
    }
    SigHash(h)
}

/// Errors a host call can return.
///
/// Host failures surface in the guest as ordinary guest faults; they never
/// abort the recorder.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum HostError {
    /// The symbol is unknown to the host.
    #[error("unknown host symbol")]
    UnknownSymbol,
    /// The host rejected the argument types for the symbol.
    #[error("host signature mismatch")]
    SignatureMismatch,
    /// The host failed during execution.
    #[error("host call failed: {0}")]
    Failed(String),
}

/// Host call interface.
///
/// The evaluator provides the resolved symbol string, the signature hash and
/// the argument values; the host returns the call result. The result becomes
/// a provenance root tagged with `(symbol, sig_hash)`.
pub trait Host {
    /// Performs an opaque call.
    fn call(&mut self, symbol: &str, sig: SigHash, args: &[Value]) -> Result<Value, HostError>;
}

/// A host that knows no symbols. Useful for guests that never leave
/// instrumented code.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoHost;

impl Host for NoHost {
    fn call(&mut self, _symbol: &str, _sig: SigHash, _args: &[Value]) -> Result<Value, HostError> {
        Err(HostError::UnknownSymbol)
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Folds `bytes` into an FNV-1a state.
fn fnv1a(state: u64, bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(state, |h, &b| (h ^ u64::from(b)).wrapping_mul(FNV_PRIME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sig_hash_is_stable_for_same_call() {
        let a = sig_hash("random.randint", &[Value::Int(1), Value::Int(100)]);
        let b = sig_hash("random.randint", &[Value::Int(5), Value::Int(7)]);
        assert_eq!(a, b, "hash depends on types, not values");
    }

    #[test]
    fn sig_hash_changes_with_name_or_types() {
        let base = sig_hash("random.randint", &[Value::Int(1), Value::Int(100)]);
        assert_ne!(base, sig_hash("random.random", &[Value::Int(1), Value::Int(100)]));
        assert_ne!(base, sig_hash("random.randint", &[Value::Float(1.0), Value::Int(100)]));
        assert_ne!(base, sig_hash("random.randint", &[Value::Int(1)]));
    }
}
