/// Database row types — these map directly to SQLite rows.
/// Distinct from chirper-types models to keep the DB layer independent.

pub struct AccountRow {
    pub id: String,
    pub email: String,
    pub password: String,
    pub created_at: String,
}

pub struct NodeRow {
    pub key: String,
    /// JSON text of the whole subtree under `key`.
    pub value: String,
    pub revision: u64,
}
