//! Load-time structural validation.
//!
//! Routing-aware validation (binding targets, chain resolvability) lives
//! in `cheval-routing`, which owns alias resolution. This module covers
//! the checks that need nothing but the config itself.

use std::collections::{BTreeMap, HashSet};

use cheval_core::{ChevalError, ChevalResult, NATIVE_ALIAS};

/// Reject alias graphs with cycles reachable by repeated lookup.
///
/// # Errors
///
/// `INVALID_CONFIG` naming the alias that starts a circular chain.
pub fn detect_alias_cycles(aliases: &BTreeMap<String, String>) -> ChevalResult<()> {
    for alias in aliases.keys() {
        if alias == NATIVE_ALIAS {
            continue;
        }
        let mut visited: HashSet<&str> = HashSet::new();
        let mut current = alias.as_str();
        while let Some(target) = aliases.get(current) {
            if target.contains(':') {
                break;
            }
            if !visited.insert(current) {
                return Err(ChevalError::invalid_config(format!(
                    "circular alias chain detected starting from '{alias}'"
                )));
            }
            current = target.as_str();
        }
    }
    Ok(())
}
