use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::path::Path;

/// Key of the placeholder object the backend swaps for its own clock.
pub const SENTINEL_KEY: &str = ".sv";
pub const SENTINEL_TIMESTAMP: &str = "timestamp";

/// The placeholder value `{".sv": "timestamp"}`.
pub fn timestamp_sentinel() -> Value {
    let mut map = Map::new();
    map.insert(SENTINEL_KEY.into(), Value::String(SENTINEL_TIMESTAMP.into()));
    Value::Object(map)
}

pub fn is_timestamp_sentinel(value: &Value) -> bool {
    match value {
        Value::Object(map) => {
            map.len() == 1
                && map.get(SENTINEL_KEY).and_then(Value::as_str) == Some(SENTINEL_TIMESTAMP)
        }
        _ => false,
    }
}

/// A timestamp assigned by the backend at commit time.
///
/// Until the write commits the client only holds `Pending`; the stored form
/// is milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerTimestamp {
    Pending,
    Resolved(DateTime<Utc>),
}

impl ServerTimestamp {
    pub fn resolved(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Pending => None,
            Self::Resolved(at) => Some(*at),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

impl Serialize for ServerTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Pending => timestamp_sentinel().serialize(serializer),
            Self::Resolved(at) => serializer.serialize_i64(at.timestamp_millis()),
        }
    }
}

impl<'de> Deserialize<'de> for ServerTimestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        if is_timestamp_sentinel(&value) {
            return Ok(Self::Pending);
        }
        let millis = value
            .as_i64()
            .ok_or_else(|| serde::de::Error::custom(format!("not a timestamp: {value}")))?;
        Utc.timestamp_millis_opt(millis)
            .single()
            .map(Self::Resolved)
            .ok_or_else(|| serde::de::Error::custom(format!("timestamp out of range: {millis}")))
    }
}

/// The full value at a path at one point in the backend's commit history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub path: Path,
    pub value: Option<Value>,
    /// Backend revision the value was observed at.
    pub revision: u64,
}

impl Snapshot {
    pub fn new(path: Path, value: Option<Value>, revision: u64) -> Self {
        Self {
            path,
            value,
            revision,
        }
    }

    /// Decode the value, `Ok(None)` when the node does not exist.
    pub fn deserialize<T: DeserializeOwned>(&self) -> serde_json::Result<Option<T>> {
        self.value
            .as_ref()
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
    }

    /// Child key/value pairs in key order. Empty for leaves and missing nodes.
    pub fn children(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.value
            .as_ref()
            .and_then(Value::as_object)
            .into_iter()
            .flat_map(|map| map.iter())
    }
}

/// Look up the value stored at `path` inside `root`. Nulls and empty objects
/// count as absent.
pub fn value_at<'a>(root: &'a Value, path: &Path) -> Option<&'a Value> {
    path.segments()
        .iter()
        .try_fold(root, |node, segment| node.as_object()?.get(segment))
        .filter(|v| match v {
            Value::Null => false,
            Value::Object(map) => !map.is_empty(),
            _ => true,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn server_timestamp_two_phase() {
        let pending: ServerTimestamp = serde_json::from_value(timestamp_sentinel()).unwrap();
        assert!(pending.is_pending());
        assert_eq!(serde_json::to_value(pending).unwrap(), json!({".sv": "timestamp"}));

        let resolved: ServerTimestamp = serde_json::from_value(json!(1_700_000_000_000i64)).unwrap();
        assert_eq!(
            resolved.resolved().unwrap().timestamp_millis(),
            1_700_000_000_000
        );
        assert!(serde_json::from_value::<ServerTimestamp>(json!("soon")).is_err());
    }

    #[test]
    fn value_lookup_and_children() {
        let tree = json!({"chirps": {"b": {"likes": 1}, "a": {"likes": 2}}, "gone": null});

        let chirps = Path::parse("chirps").unwrap();
        let snap = Snapshot::new(chirps.clone(), value_at(&tree, &chirps).cloned(), 3);
        let keys: Vec<_> = snap.children().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);

        assert_eq!(
            value_at(&tree, &Path::parse("chirps/a/likes").unwrap()),
            Some(&json!(2))
        );
        assert_eq!(value_at(&tree, &Path::parse("gone").unwrap()), None);
        assert_eq!(value_at(&tree, &Path::parse("chirps/a/likes/x").unwrap()), None);
        assert_eq!(value_at(&tree, &Path::root()), Some(&tree));
        assert_eq!(value_at(&json!({}), &Path::root()), None);
    }
}
