use serde::{Deserialize, Serialize};

use crate::snapshot::ServerTimestamp;

/// Profile stored at `users/{id}`. The id is the key, not part of the value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub handle: String,
    #[serde(rename = "avatar", default)]
    pub avatar_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(flatten)]
    pub profile: UserProfile,
}

/// A posted message, stored under `chirps/{pushId}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chirp {
    pub text: String,
    #[serde(rename = "userId")]
    pub author_id: String,
    #[serde(default)]
    pub likes: u64,
    #[serde(rename = "time")]
    pub created_at: ServerTimestamp,
}

impl Chirp {
    pub fn new(text: impl Into<String>, author_id: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            author_id: author_id.into(),
            likes: 0,
            created_at: ServerTimestamp::Pending,
        }
    }
}

/// The singleton collaborative text node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SharedDocument {
    #[serde(default)]
    pub text: String,
}

/// One keyed child of a collection, e.g. a chirp together with its push id.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry<T> {
    pub id: String,
    pub value: T,
}

impl<T> Entry<T> {
    pub fn new(id: impl Into<String>, value: T) -> Self {
        Self {
            id: id.into(),
            value,
        }
    }
}

impl<T> std::ops::Deref for Entry<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> std::ops::DerefMut for Entry<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chirp_uses_stored_field_names() {
        let chirp = Chirp::new("hello", "u1");
        assert_eq!(
            serde_json::to_value(&chirp).unwrap(),
            json!({"text": "hello", "userId": "u1", "likes": 0, "time": {".sv": "timestamp"}})
        );

        let stored: Chirp = serde_json::from_value(
            json!({"text": "hi", "userId": "u2", "likes": 5, "time": 1_700_000_000_000i64}),
        )
        .unwrap();
        assert_eq!(stored.likes, 5);
        assert!(!stored.created_at.is_pending());
    }

    #[test]
    fn profile_avatar_field() {
        let profile: UserProfile =
            serde_json::from_value(json!({"handle": "ada", "avatar": "http://a/x.png"})).unwrap();
        assert_eq!(profile.avatar_url, "http://a/x.png");
    }
}
