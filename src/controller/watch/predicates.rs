//! # Spec Change Predicate
//!
//! Lets a distribution event through only when its spec differs from the
//! last one seen. Status writes and metadata-only updates are dropped, which
//! keeps the operator's own status updates from re-triggering it. The
//! changed fields are logged for audit.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

use crate::crd::LlamaStackDistribution;
use kube::ResourceExt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecChange {
    /// First time this distribution is seen by this process
    Initial,
    /// Dotted paths of the fields that changed
    Changed(Vec<String>),
    Unchanged,
}

impl SpecChange {
    #[must_use]
    pub fn should_reconcile(&self) -> bool {
        !matches!(self, SpecChange::Unchanged)
    }
}

#[derive(Debug, Default)]
pub struct SpecChangePredicate {
    seen: Mutex<HashMap<String, Value>>,
}

impl SpecChangePredicate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn evaluate(&self, dist: &LlamaStackDistribution) -> SpecChange {
        let key = format!("{}/{}", dist.namespace().unwrap_or_default(), dist.name_any());
        let spec = match serde_json::to_value(&dist.spec) {
            Ok(spec) => spec,
            // Cannot compare, so let it through
            Err(_) => return SpecChange::Initial,
        };

        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        let change = match seen.get(&key) {
            None => SpecChange::Initial,
            Some(previous) if *previous == spec => SpecChange::Unchanged,
            Some(previous) => SpecChange::Changed(spec_diff(previous, &spec)),
        };
        match &change {
            SpecChange::Changed(paths) => {
                info!(resource = %key, changed = ?paths, "Spec changed");
            }
            SpecChange::Initial => debug!(resource = %key, "First sight of distribution"),
            SpecChange::Unchanged => debug!(resource = %key, "Spec unchanged, skipping event"),
        }
        seen.insert(key, spec);
        change
    }

    pub fn forget(&self, namespace: &str, name: &str) {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&format!("{namespace}/{name}"));
    }
}

/// Dotted paths where `old` and `new` differ
#[must_use]
pub fn spec_diff(old: &Value, new: &Value) -> Vec<String> {
    let mut paths = Vec::new();
    diff_into(old, new, String::new(), &mut paths);
    paths
}

fn diff_into(old: &Value, new: &Value, path: String, out: &mut Vec<String>) {
    match (old, new) {
        (Value::Object(a), Value::Object(b)) => {
            let mut keys: Vec<&String> = a.keys().chain(b.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                let child = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                match (a.get(key), b.get(key)) {
                    (Some(x), Some(y)) => diff_into(x, y, child, out),
                    (None, Some(Value::Null)) | (Some(Value::Null), None) => {}
                    _ => out.push(child),
                }
            }
        }
        (Value::Array(a), Value::Array(b)) if a.len() == b.len() => {
            for (i, (x, y)) in a.iter().zip(b).enumerate() {
                diff_into(x, y, format!("{path}[{i}]"), out);
            }
        }
        _ if old != new => out.push(path),
        _ => {}
    }
}
