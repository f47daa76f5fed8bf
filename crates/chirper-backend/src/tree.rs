use serde_json::{Map, Value};

use chirper_types::Path;
use chirper_types::snapshot::is_timestamp_sentinel;

/// The in-memory node tree.
///
/// The tree is kept normalized: no `null` leaves and no empty objects, so
/// "absent" has exactly one representation.
#[derive(Debug, Clone, Default)]
pub struct Tree {
    root: Map<String, Value>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root(&self) -> Value {
        Value::Object(self.root.clone())
    }

    pub fn get(&self, path: &Path) -> Option<Value> {
        let Some((head, rest)) = path.segments().split_first() else {
            return (!self.root.is_empty()).then(|| self.root());
        };
        rest.iter()
            .try_fold(self.root.get(head)?, |node, segment| node.as_object()?.get(segment))
            .cloned()
    }

    /// Subtree stored under one top-level key.
    pub fn top_level(&self, key: &str) -> Option<&Value> {
        self.root.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.root.keys()
    }

    /// Overwrite the subtree at `path`. `null` removes it.
    ///
    /// Returns true if the value observable at `path` changed.
    pub fn set(&mut self, path: &Path, value: Value, now_millis: i64) -> bool {
        let value = normalize(resolve_timestamps(value, now_millis));

        let Some((head, rest)) = path.segments().split_first() else {
            let replacement = match value {
                Some(Value::Object(map)) => map,
                // Backend::commit refuses scalars here.
                _ => Map::new(),
            };
            let changed = replacement != self.root;
            self.root = replacement;
            return changed;
        };

        let before = self.root.get(head).cloned();
        let old = self.root.remove(head);
        if let Some(updated) = write(old, rest, value) {
            self.root.insert(head.clone(), updated);
        }
        let after = self.root.get(head);

        before.as_ref() != after
    }
}

fn write(node: Option<Value>, segments: &[String], value: Option<Value>) -> Option<Value> {
    let Some((head, rest)) = segments.split_first() else {
        return value;
    };

    let mut map = match node {
        Some(Value::Object(map)) => map,
        // Writing below a leaf replaces the leaf with an object.
        _ => Map::new(),
    };

    let child = map.remove(head);
    if let Some(updated) = write(child, rest, value) {
        map.insert(head.clone(), updated);
    }

    if map.is_empty() {
        None
    } else {
        Some(Value::Object(map))
    }
}

/// Drop nulls and empty objects.
fn normalize(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(map) => {
            let map: Map<String, Value> = map
                .into_iter()
                .filter_map(|(k, v)| normalize(v).map(|v| (k, v)))
                .collect();
            if map.is_empty() {
                None
            } else {
                Some(Value::Object(map))
            }
        }
        other => Some(other),
    }
}

/// Replace every timestamp placeholder with the commit time.
fn resolve_timestamps(value: Value, now_millis: i64) -> Value {
    if is_timestamp_sentinel(&value) {
        return Value::from(now_millis);
    }
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, resolve_timestamps(v, now_millis)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| resolve_timestamps(v, now_millis))
                .collect(),
        ),
        other => other,
    }
}
