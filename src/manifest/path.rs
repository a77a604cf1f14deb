//! # Field Paths
//!
//! JSON-pointer style paths into rendered manifests (`/spec/ports/0/port`).
//! `~1` encodes `/` and `~0` encodes `~`, so label keys such as
//! `app.kubernetes.io/instance` are written `app.kubernetes.io~1instance`.

use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path must start with '/': {0}")]
    NotAbsolute(String),
    #[error("path '{path}' cannot descend into a {found} at segment '{segment}'")]
    TypeMismatch {
        path: String,
        segment: String,
        found: &'static str,
    },
    #[error("path '{path}' has invalid sequence index '{segment}'")]
    InvalidIndex { path: String, segment: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    raw: String,
    segments: Vec<String>,
}

impl FieldPath {
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        let Some(rest) = raw.strip_prefix('/') else {
            return Err(PathError::NotAbsolute(raw.to_string()));
        };
        let segments = rest
            .split('/')
            .map(|s| s.replace("~1", "/").replace("~0", "~"))
            .collect();
        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    /// Escape a single key for use inside a path
    #[must_use]
    pub fn escape(segment: &str) -> String {
        segment.replace('~', "~0").replace('/', "~1")
    }

    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    #[must_use]
    pub fn get<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        let mut current = root;
        for segment in &self.segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Write `value` at this path.
    ///
    /// Returns `Ok(false)` when part of the path is absent and
    /// `create_if_missing` is off. Missing intermediate containers are
    /// created as sequences when the next segment is numeric, maps otherwise.
    /// A sequence index may equal the current length to append.
    pub fn set(
        &self,
        root: &mut Value,
        value: Value,
        create_if_missing: bool,
    ) -> Result<bool, PathError> {
        let Some((last, parents)) = self.segments.split_last() else {
            return Ok(false);
        };

        let mut current = root;
        for (i, segment) in parents.iter().enumerate() {
            let next_is_index = self.segments[i + 1].parse::<usize>().is_ok();
            current = match self.child_mut(current, segment, create_if_missing, next_is_index)? {
                Some(child) => child,
                None => return Ok(false),
            };
        }

        match current {
            Value::Object(map) => {
                if !map.contains_key(last) && !create_if_missing {
                    return Ok(false);
                }
                map.insert(last.clone(), value);
                Ok(true)
            }
            Value::Array(items) => {
                let index = self.index(last)?;
                if index < items.len() {
                    items[index] = value;
                    Ok(true)
                } else if index == items.len() && create_if_missing {
                    items.push(value);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            other => Err(self.mismatch(last, other)),
        }
    }

    /// Remove the value at this path, returning it
    pub fn remove(&self, root: &mut Value) -> Option<Value> {
        let (last, parents) = self.segments.split_last()?;
        let mut current = root;
        for segment in parents {
            current = match current {
                Value::Object(map) => map.get_mut(segment)?,
                Value::Array(items) => items.get_mut(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        match current {
            Value::Object(map) => map.remove(last),
            Value::Array(items) => {
                let index = last.parse::<usize>().ok()?;
                (index < items.len()).then(|| items.remove(index))
            }
            _ => None,
        }
    }

    fn child_mut<'a>(
        &self,
        current: &'a mut Value,
        segment: &str,
        create: bool,
        next_is_index: bool,
    ) -> Result<Option<&'a mut Value>, PathError> {
        let empty = || {
            if next_is_index {
                Value::Array(Vec::new())
            } else {
                Value::Object(Map::new())
            }
        };
        match current {
            Value::Object(map) => {
                if !map.contains_key(segment) {
                    if !create {
                        return Ok(None);
                    }
                    map.insert(segment.to_string(), empty());
                }
                Ok(map.get_mut(segment))
            }
            Value::Array(items) => {
                let index = self.index(segment)?;
                if index == items.len() && create {
                    items.push(empty());
                }
                Ok(items.get_mut(index))
            }
            other => Err(self.mismatch(segment, other)),
        }
    }

    fn index(&self, segment: &str) -> Result<usize, PathError> {
        segment.parse().map_err(|_| PathError::InvalidIndex {
            path: self.raw.clone(),
            segment: segment.to_string(),
        })
    }

    fn mismatch(&self, segment: &str, found: &Value) -> PathError {
        PathError::TypeMismatch {
            path: self.raw.clone(),
            segment: segment.to_string(),
            found: value_type(found),
        }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn value_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "map",
    }
}

/// Deep-merge `overlay` into `base`. Maps merge key by key; any other
/// overlay value (including sequences) replaces the base value.
pub fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
