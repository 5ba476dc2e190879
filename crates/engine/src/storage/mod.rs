//! Transactional document and policy storage.
//!
//! A store holds one JSON document tree (the base `data` document) plus the
//! raw source of every policy module. All access happens inside a
//! transaction; writes become visible atomically on commit.

mod inmem;

use std::any::Any;
use std::fmt;

use async_trait::async_trait;
use serde_json::Value;

pub use inmem::InMemStore;

// ── Error type ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
    #[error("storage path not found: {0}")]
    NotFound(String),

    #[error("invalid patch: {0}")]
    InvalidPatch(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("transaction {0} is read-only")]
    ReadOnly(u64),

    #[error("transaction does not belong to this store")]
    ForeignTransaction,

    #[error("policy not found: {0}")]
    PolicyNotFound(String),
}

// ── Paths ───────────────────────────────────────────────────────────

/// Slash-separated location inside the document tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoragePath(Vec<String>);

impl StoragePath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn new(segments: Vec<String>) -> Self {
        Self(segments)
    }

    /// Parse `/a/b/c`. The empty string and `/` are the root.
    pub fn parse(s: &str) -> Result<Self, StorageError> {
        if s.is_empty() || s == "/" {
            return Ok(Self::root());
        }
        let Some(rest) = s.strip_prefix('/') else {
            return Err(StorageError::InvalidPath(s.to_string()));
        };
        Ok(Self(rest.split('/').map(str::to_string).collect()))
    }

    /// Path from a bundle root such as `a/b`; the empty root is the document root.
    pub fn from_root(root: &str) -> Self {
        let trimmed = root.trim_matches('/');
        if trimmed.is_empty() {
            return Self::root();
        }
        Self(trimmed.split('/').map(str::to_string).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segs = self.0.clone();
        segs.push(segment.into());
        Self(segs)
    }

    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            return None;
        }
        Some(Self(self.0[..self.0.len() - 1].to_vec()))
    }

    pub fn has_prefix(&self, other: &StoragePath) -> bool {
        self.0.starts_with(&other.0)
    }
}

impl fmt::Display for StoragePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for seg in &self.0 {
            write!(f, "/{seg}")?;
        }
        Ok(())
    }
}

// ── Transactions ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOp {
    Add,
    Replace,
    Remove,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionParams {
    pub write: bool,
}

impl TransactionParams {
    pub const READ: Self = Self { write: false };
    pub const WRITE: Self = Self { write: true };
}

/// Handle to an open transaction. The store keeps its private state in
/// `inner`; other stores reject handles they did not create.
pub struct Transaction {
    id: u64,
    write: bool,
    inner: Box<dyn Any + Send + Sync>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("write", &self.write)
            .finish()
    }
}

impl Transaction {
    pub fn new(id: u64, write: bool, inner: Box<dyn Any + Send + Sync>) -> Self {
        Self { id, write, inner }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_write(&self) -> bool {
        self.write
    }

    pub fn inner<T: 'static>(&self) -> Option<&T> {
        self.inner.downcast_ref()
    }

    pub fn inner_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.inner.downcast_mut()
    }

    pub fn into_inner(self) -> Box<dyn Any + Send + Sync> {
        self.inner
    }
}

// ── Store trait ─────────────────────────────────────────────────────

#[async_trait]
pub trait Store: Send + Sync {
    /// Open a transaction. Write transactions are exclusive; opening one
    /// waits until any other writer has committed or aborted.
    async fn new_transaction(&self, params: TransactionParams) -> Result<Transaction, StorageError>;

    fn read(&self, txn: &Transaction, path: &StoragePath) -> Result<Value, StorageError>;

    fn write(
        &self,
        txn: &mut Transaction,
        op: PatchOp,
        path: &StoragePath,
        value: Value,
    ) -> Result<(), StorageError>;

    fn commit(&self, txn: Transaction) -> Result<(), StorageError>;

    fn abort(&self, txn: Transaction);

    fn list_policies(&self, txn: &Transaction) -> Result<Vec<String>, StorageError>;

    fn get_policy(&self, txn: &Transaction, id: &str) -> Result<Vec<u8>, StorageError>;

    fn upsert_policy(&self, txn: &mut Transaction, id: &str, raw: &[u8]) -> Result<(), StorageError>;

    fn delete_policy(&self, txn: &mut Transaction, id: &str) -> Result<(), StorageError>;
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Create every missing object along `path`.
pub fn make_dir(store: &dyn Store, txn: &mut Transaction, path: &StoragePath) -> Result<(), StorageError> {
    let mut current = StoragePath::root();
    for seg in path.segments() {
        current = current.child(seg.clone());
        match store.read(txn, &current) {
            Ok(Value::Object(_)) => {}
            Ok(_) => {
                return Err(StorageError::InvalidPatch(format!(
                    "{current} exists and is not an object"
                )))
            }
            Err(StorageError::NotFound(_)) => {
                store.write(txn, PatchOp::Add, &current, Value::Object(Default::default()))?
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// True when the store holds any policy or any document outside `system`.
pub fn non_empty(store: &dyn Store, txn: &Transaction) -> Result<bool, StorageError> {
    if !store.list_policies(txn)?.is_empty() {
        return Ok(true);
    }
    match store.read(txn, &StoragePath::root())? {
        Value::Object(map) => Ok(map.keys().any(|k| k != "system")),
        _ => Ok(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_parse_and_render() {
        let p = StoragePath::parse("/system/version").unwrap();
        assert_eq!(p.segments(), ["system", "version"]);
        assert_eq!(p.to_string(), "/system/version");
        assert!(StoragePath::parse("").unwrap().is_root());
        assert!(StoragePath::parse("system").is_err());
        assert_eq!(StoragePath::from_root("a/b/"), StoragePath::parse("/a/b").unwrap());
        assert!(StoragePath::from_root("").is_root());
    }

    #[test]
    fn prefix_and_parent() {
        let p = StoragePath::parse("/a/b").unwrap();
        assert!(p.has_prefix(&StoragePath::parse("/a").unwrap()));
        assert!(p.has_prefix(&StoragePath::root()));
        assert_eq!(p.parent(), Some(StoragePath::parse("/a").unwrap()));
    }
}
