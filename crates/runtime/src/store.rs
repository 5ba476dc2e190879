//! Store selection and the tracing store decorator.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::trace;
use warden_engine::storage::{InMemStore, PatchOp, StorageError};
use warden_engine::{Store, StoragePath, Transaction, TransactionParams};

use crate::config::StoreKind;

pub fn new_store(kind: StoreKind) -> Arc<dyn Store> {
    match kind {
        StoreKind::Inmem => Arc::new(InMemStore::new()),
        StoreKind::Traced => Arc::new(TracedStore::new(Arc::new(InMemStore::new()))),
    }
}

/// Forwards every call to an inner store, logging it at trace level.
pub struct TracedStore {
    inner: Arc<dyn Store>,
}

impl TracedStore {
    pub fn new(inner: Arc<dyn Store>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Store for TracedStore {
    async fn new_transaction(&self, params: TransactionParams) -> Result<Transaction, StorageError> {
        let txn = self.inner.new_transaction(params).await?;
        trace!(source = "store", txn = txn.id(), write = params.write, "new transaction");
        Ok(txn)
    }

    fn read(&self, txn: &Transaction, path: &StoragePath) -> Result<Value, StorageError> {
        trace!(source = "store", txn = txn.id(), path = %path, "read");
        self.inner.read(txn, path)
    }

    fn write(
        &self,
        txn: &mut Transaction,
        op: PatchOp,
        path: &StoragePath,
        value: Value,
    ) -> Result<(), StorageError> {
        trace!(source = "store", txn = txn.id(), path = %path, op = ?op, "write");
        self.inner.write(txn, op, path, value)
    }

    fn commit(&self, txn: Transaction) -> Result<(), StorageError> {
        trace!(source = "store", txn = txn.id(), "commit");
        self.inner.commit(txn)
    }

    fn abort(&self, txn: Transaction) {
        trace!(source = "store", txn = txn.id(), "abort");
        self.inner.abort(txn)
    }

    fn list_policies(&self, txn: &Transaction) -> Result<Vec<String>, StorageError> {
        trace!(source = "store", txn = txn.id(), "list policies");
        self.inner.list_policies(txn)
    }

    fn get_policy(&self, txn: &Transaction, id: &str) -> Result<Vec<u8>, StorageError> {
        trace!(source = "store", txn = txn.id(), id, "get policy");
        self.inner.get_policy(txn, id)
    }

    fn upsert_policy(&self, txn: &mut Transaction, id: &str, raw: &[u8]) -> Result<(), StorageError> {
        trace!(source = "store", txn = txn.id(), id, size = raw.len(), "upsert policy");
        self.inner.upsert_policy(txn, id, raw)
    }

    fn delete_policy(&self, txn: &mut Transaction, id: &str) -> Result<(), StorageError> {
        trace!(source = "store", txn = txn.id(), id, "delete policy");
        self.inner.delete_policy(txn, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn traced_store_behaves_like_its_inner_store() {
        let store = new_store(StoreKind::Traced);
        let mut txn = store.new_transaction(TransactionParams::WRITE).await.unwrap();
        let path = StoragePath::parse("/a").unwrap();
        store.write(&mut txn, PatchOp::Add, &path, json!({"b": 1})).unwrap();
        store.upsert_policy(&mut txn, "p.rego", b"package p").unwrap();
        store.commit(txn).unwrap();

        let txn = store.new_transaction(TransactionParams::READ).await.unwrap();
        assert_eq!(store.read(&txn, &path).unwrap(), json!({"b": 1}));
        assert_eq!(store.list_policies(&txn).unwrap(), vec!["p.rego".to_string()]);
        store.abort(txn);
    }
}
