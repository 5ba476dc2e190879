use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use super::{PatchOp, StorageError, Store, StoragePath, Transaction, TransactionParams};

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Default)]
struct State {
    data: Value,
    policies: BTreeMap<String, Vec<u8>>,
}

enum TxnState {
    /// Snapshot of the committed state at open time.
    Read(Arc<State>),
    /// Private working copy; the guard keeps other writers out.
    Write {
        working: State,
        _guard: OwnedMutexGuard<()>,
    },
}

struct InMemTxn {
    store_id: u64,
    state: TxnState,
}

/// In-memory store. Readers see the last committed snapshot; one writer at
/// a time works on a private copy that replaces the snapshot on commit.
pub struct InMemStore {
    id: u64,
    committed: RwLock<Arc<State>>,
    writer: Arc<Mutex<()>>,
    next_txn: AtomicU64,
}

impl InMemStore {
    pub fn new() -> Self {
        Self::with_data(Value::Object(Map::new()))
    }

    /// Store seeded with a base document. Non-object values are replaced by
    /// an empty object.
    pub fn with_data(data: Value) -> Self {
        let data = if data.is_object() {
            data
        } else {
            Value::Object(Map::new())
        };
        Self {
            id: NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed),
            committed: RwLock::new(Arc::new(State {
                data,
                policies: BTreeMap::new(),
            })),
            writer: Arc::new(Mutex::new(())),
            next_txn: AtomicU64::new(1),
        }
    }

    fn state<'t>(&self, txn: &'t Transaction) -> Result<&'t State, StorageError> {
        let inner = txn
            .inner::<InMemTxn>()
            .filter(|t| t.store_id == self.id)
            .ok_or(StorageError::ForeignTransaction)?;
        Ok(match &inner.state {
            TxnState::Read(snapshot) => snapshot.as_ref(),
            TxnState::Write { working, .. } => working,
        })
    }

    fn working<'t>(&self, txn: &'t mut Transaction) -> Result<&'t mut State, StorageError> {
        let id = txn.id();
        let inner = txn
            .inner_mut::<InMemTxn>()
            .filter(|t| t.store_id == self.id)
            .ok_or(StorageError::ForeignTransaction)?;
        match &mut inner.state {
            TxnState::Write { working, .. } => Ok(working),
            TxnState::Read(_) => Err(StorageError::ReadOnly(id)),
        }
    }
}

impl Default for InMemStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemStore {
    async fn new_transaction(&self, params: TransactionParams) -> Result<Transaction, StorageError> {
        let id = self.next_txn.fetch_add(1, Ordering::Relaxed);
        let state = if params.write {
            let guard = self.writer.clone().lock_owned().await;
            let snapshot = self.committed.read().expect("store lock poisoned").clone();
            TxnState::Write {
                working: (*snapshot).clone(),
                _guard: guard,
            }
        } else {
            TxnState::Read(self.committed.read().expect("store lock poisoned").clone())
        };
        Ok(Transaction::new(
            id,
            params.write,
            Box::new(InMemTxn {
                store_id: self.id,
                state,
            }),
        ))
    }

    fn read(&self, txn: &Transaction, path: &StoragePath) -> Result<Value, StorageError> {
        let state = self.state(txn)?;
        let mut node = &state.data;
        for seg in path.segments() {
            node = child(node, seg).ok_or_else(|| StorageError::NotFound(path.to_string()))?;
        }
        Ok(node.clone())
    }

    fn write(
        &self,
        txn: &mut Transaction,
        op: PatchOp,
        path: &StoragePath,
        value: Value,
    ) -> Result<(), StorageError> {
        let state = self.working(txn)?;
        apply_patch(&mut state.data, op, path, value)
    }

    fn commit(&self, txn: Transaction) -> Result<(), StorageError> {
        let id = txn.id();
        let inner = txn
            .into_inner()
            .downcast::<InMemTxn>()
            .map_err(|_| StorageError::ForeignTransaction)?;
        if inner.store_id != self.id {
            return Err(StorageError::ForeignTransaction);
        }
        if let TxnState::Write { working, _guard } = inner.state {
            *self.committed.write().expect("store lock poisoned") = Arc::new(working);
            debug!(txn = id, "committed write transaction");
        }
        Ok(())
    }

    fn abort(&self, txn: Transaction) {
        drop(txn);
    }

    fn list_policies(&self, txn: &Transaction) -> Result<Vec<String>, StorageError> {
        Ok(self.state(txn)?.policies.keys().cloned().collect())
    }

    fn get_policy(&self, txn: &Transaction, id: &str) -> Result<Vec<u8>, StorageError> {
        self.state(txn)?
            .policies
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::PolicyNotFound(id.to_string()))
    }

    fn upsert_policy(&self, txn: &mut Transaction, id: &str, raw: &[u8]) -> Result<(), StorageError> {
        self.working(txn)?
            .policies
            .insert(id.to_string(), raw.to_vec());
        Ok(())
    }

    fn delete_policy(&self, txn: &mut Transaction, id: &str) -> Result<(), StorageError> {
        self.working(txn)?
            .policies
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StorageError::PolicyNotFound(id.to_string()))
    }
}

fn child<'v>(node: &'v Value, seg: &str) -> Option<&'v Value> {
    match node {
        Value::Object(map) => map.get(seg),
        Value::Array(items) => items.get(seg.parse::<usize>().ok()?),
        _ => None,
    }
}

fn child_mut<'v>(node: &'v mut Value, seg: &str) -> Option<&'v mut Value> {
    match node {
        Value::Object(map) => map.get_mut(seg),
        Value::Array(items) => items.get_mut(seg.parse::<usize>().ok()?),
        _ => None,
    }
}

fn apply_patch(doc: &mut Value, op: PatchOp, path: &StoragePath, value: Value) -> Result<(), StorageError> {
    let Some((last, parents)) = path.segments().split_last() else {
        return match op {
            PatchOp::Add | PatchOp::Replace if value.is_object() => {
                *doc = value;
                Ok(())
            }
            PatchOp::Add | PatchOp::Replace => Err(StorageError::InvalidPatch(
                "root must be an object".to_string(),
            )),
            PatchOp::Remove => Err(StorageError::InvalidPatch("cannot remove root".to_string())),
        };
    };

    let mut node = doc;
    for seg in parents {
        node = child_mut(node, seg).ok_or_else(|| StorageError::NotFound(path.to_string()))?;
    }

    let not_found = || StorageError::NotFound(path.to_string());
    match node {
        Value::Object(map) => match op {
            PatchOp::Add => {
                map.insert(last.clone(), value);
            }
            PatchOp::Replace => {
                let slot = map.get_mut(last).ok_or_else(not_found)?;
                *slot = value;
            }
            PatchOp::Remove => {
                map.remove(last).ok_or_else(not_found)?;
            }
        },
        Value::Array(items) => {
            if op == PatchOp::Add && last == "-" {
                items.push(value);
                return Ok(());
            }
            let idx: usize = last
                .parse()
                .map_err(|_| StorageError::InvalidPatch(format!("{path}: invalid array index")))?;
            match op {
                PatchOp::Add if idx <= items.len() => items.insert(idx, value),
                PatchOp::Replace if idx < items.len() => items[idx] = value,
                PatchOp::Remove if idx < items.len() => {
                    items.remove(idx);
                }
                _ => return Err(not_found()),
            }
        }
        _ => return Err(not_found()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{make_dir, non_empty};
    use serde_json::json;
    use std::time::Duration;

    fn path(s: &str) -> StoragePath {
        StoragePath::parse(s).unwrap()
    }

    #[tokio::test]
    async fn writes_are_invisible_until_commit() {
        let store = InMemStore::new();
        let mut w = store.new_transaction(TransactionParams::WRITE).await.unwrap();
        store.write(&mut w, PatchOp::Add, &path("/a"), json!(1)).unwrap();
        assert_eq!(store.read(&w, &path("/a")).unwrap(), json!(1));

        let r = store.new_transaction(TransactionParams::READ).await.unwrap();
        assert!(matches!(store.read(&r, &path("/a")), Err(StorageError::NotFound(_))));

        store.commit(w).unwrap();
        // An already open read transaction keeps its snapshot.
        assert!(store.read(&r, &path("/a")).is_err());
        store.abort(r);

        let r = store.new_transaction(TransactionParams::READ).await.unwrap();
        assert_eq!(store.read(&r, &path("/a")).unwrap(), json!(1));
    }

    #[tokio::test]
    async fn abort_discards_writes() {
        let store = InMemStore::new();
        let mut w = store.new_transaction(TransactionParams::WRITE).await.unwrap();
        store.upsert_policy(&mut w, "x.rego", b"package x").unwrap();
        store.abort(w);

        let r = store.new_transaction(TransactionParams::READ).await.unwrap();
        assert!(store.list_policies(&r).unwrap().is_empty());
    }

    #[tokio::test]
    async fn writers_are_exclusive() {
        let store = Arc::new(InMemStore::new());
        let w1 = store.new_transaction(TransactionParams::WRITE).await.unwrap();

        let s2 = store.clone();
        let second = tokio::spawn(async move {
            s2.new_transaction(TransactionParams::WRITE).await.map(|t| t.id())
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        store.abort(w1);
        let id = second.await.unwrap().unwrap();
        assert!(id > 1);
    }

    #[tokio::test]
    async fn read_transactions_reject_writes() {
        let store = InMemStore::new();
        let mut r = store.new_transaction(TransactionParams::READ).await.unwrap();
        assert!(matches!(
            store.write(&mut r, PatchOp::Add, &path("/a"), json!(1)),
            Err(StorageError::ReadOnly(_))
        ));
    }

    #[tokio::test]
    async fn foreign_transactions_are_rejected() {
        let a = InMemStore::new();
        let b = InMemStore::new();
        let txn = a.new_transaction(TransactionParams::READ).await.unwrap();
        assert_eq!(
            b.read(&txn, &StoragePath::root()).unwrap_err(),
            StorageError::ForeignTransaction
        );
    }

    #[tokio::test]
    async fn patch_semantics() {
        let store = InMemStore::with_data(json!({"list": [1, 2]}));
        let mut w = store.new_transaction(TransactionParams::WRITE).await.unwrap();
        store.write(&mut w, PatchOp::Add, &path("/list/-"), json!(3)).unwrap();
        store.write(&mut w, PatchOp::Replace, &path("/list/0"), json!(0)).unwrap();
        assert!(store
            .write(&mut w, PatchOp::Replace, &path("/missing"), json!(1))
            .is_err());
        assert!(store.write(&mut w, PatchOp::Add, &path("/x/y"), json!(1)).is_err());
        store.write(&mut w, PatchOp::Remove, &path("/list/1"), Value::Null).unwrap();
        assert_eq!(store.read(&w, &path("/list")).unwrap(), json!([0, 3]));
    }

    #[tokio::test]
    async fn make_dir_and_non_empty() {
        let store = InMemStore::new();
        let mut w = store.new_transaction(TransactionParams::WRITE).await.unwrap();
        assert!(!non_empty(&store, &w).unwrap());

        make_dir(&store, &mut w, &path("/system/bundles")).unwrap();
        assert_eq!(store.read(&w, &path("/system")).unwrap(), json!({"bundles": {}}));
        assert!(!non_empty(&store, &w).unwrap());

        store.write(&mut w, PatchOp::Add, &path("/app"), json!({})).unwrap();
        assert!(non_empty(&store, &w).unwrap());
    }
}
