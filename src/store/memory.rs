//! In-process store
//!
//! A single JSON tree behind a lock, with subscriptions fanned out over
//! unbounded channels. Notifications are computed after every mutation while
//! the lock is still held, so every subscriber observes changes in write
//! order.
//!
//! Semantics follow the hosted realtime stores the protocol was built on:
//! `null` deletes, objects left empty by a delete are pruned, and push keys
//! are fixed width so they sort in append order.

use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, Mutex};

use super::error::StoreError;
use super::path::segments;
use super::{ChildAdded, ChildWatch, Store, ValueWatch};

struct ValueWatcher {
    path: Vec<String>,
    last: Option<Value>,
    tx: mpsc::UnboundedSender<Option<Value>>,
}

struct ChildWatcher {
    path: Vec<String>,
    known: HashSet<String>,
    tx: mpsc::UnboundedSender<ChildAdded>,
}

struct Tree {
    root: Value,
    value_watchers: Vec<ValueWatcher>,
    child_watchers: Vec<ChildWatcher>,
    denied: Vec<Vec<String>>,
    next_push: u64,
}

/// Store held entirely in memory
pub struct MemoryStore {
    tree: Mutex<Tree>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            tree: Mutex::new(Tree {
                root: Value::Object(Map::new()),
                value_watchers: Vec::new(),
                child_watchers: Vec::new(),
                denied: Vec::new(),
                next_push: 0,
            }),
        }
    }

    /// Reject writes at, above or below a path, as store rules would
    pub async fn deny_writes(&self, path: &str) -> Result<(), StoreError> {
        let segs = segments(path)?;
        self.tree.lock().await.denied.push(segs);
        Ok(())
    }

    /// Lift every write restriction
    pub async fn allow_all(&self) {
        self.tree.lock().await.denied.clear();
    }

    /// Copy of the whole tree
    pub async fn snapshot(&self) -> Value {
        self.tree.lock().await.root.clone()
    }

    /// Number of live subscriptions (value and child) still attached
    pub async fn subscriber_count(&self) -> usize {
        let mut tree = self.tree.lock().await;
        tree.value_watchers.retain(|w| !w.tx.is_closed());
        tree.child_watchers.retain(|w| !w.tx.is_closed());
        tree.value_watchers.len() + tree.child_watchers.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    fn check_write(&self, segs: &[String]) -> Result<(), StoreError> {
        let blocked = self.denied.iter().any(|denied| {
            let n = denied.len().min(segs.len());
            denied[..n] == segs[..n]
        });
        if blocked {
            Err(StoreError::PermissionDenied(segs.join("/")))
        } else {
            Ok(())
        }
    }

    fn write(&mut self, segs: &[String], value: Value) {
        write_at(&mut self.root, segs, normalize(value));
        if !self.root.is_object() {
            self.root = Value::Object(Map::new());
        }
    }

    fn notify(&mut self) {
        let Tree {
            root,
            value_watchers,
            child_watchers,
            ..
        } = self;

        value_watchers.retain_mut(|w| {
            let current = lookup(root, &w.path).cloned();
            if current != w.last {
                w.last = current.clone();
                w.tx.send(current).is_ok()
            } else {
                !w.tx.is_closed()
            }
        });

        child_watchers.retain_mut(|w| {
            let mut seen = HashSet::new();
            if let Some(children) = lookup(root, &w.path).and_then(Value::as_object) {
                for (key, value) in children {
                    seen.insert(key.clone());
                    if !w.known.contains(key) {
                        let added = ChildAdded {
                            key: key.clone(),
                            value: value.clone(),
                        };
                        if w.tx.send(added).is_err() {
                            return false;
                        }
                    }
                }
            }
            w.known = seen;
            !w.tx.is_closed()
        });
    }
}

fn lookup<'a>(node: &'a Value, segs: &[String]) -> Option<&'a Value> {
    segs.iter()
        .try_fold(node, |node, seg| node.as_object()?.get(seg))
}

/// Strip nulls and empty objects so that absence has one representation
fn normalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let map: Map<String, Value> = map
                .into_iter()
                .map(|(k, v)| (k, normalize(v)))
                .filter(|(_, v)| !is_absent(v))
                .collect();
            if map.is_empty() {
                Value::Null
            } else {
                Value::Object(map)
            }
        }
        other => other,
    }
}

fn is_absent(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn write_at(node: &mut Value, segs: &[String], value: Value) {
    let Some((head, rest)) = segs.split_first() else {
        *node = value;
        return;
    };

    if !node.is_object() {
        if value.is_null() {
            return;
        }
        *node = Value::Object(Map::new());
    }

    if let Value::Object(map) = node {
        let child = map.entry(head.clone()).or_insert(Value::Null);
        write_at(child, rest, value);
        if is_absent(child) {
            map.remove(head);
        }
    }
}

fn join(base: &[String], relative: &str) -> Result<Vec<String>, StoreError> {
    let mut full = base.to_vec();
    full.extend(segments(relative)?);
    Ok(full)
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let segs = segments(path)?;
        let tree = self.tree.lock().await;
        Ok(lookup(&tree.root, &segs).cloned())
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let segs = segments(path)?;
        let mut tree = self.tree.lock().await;
        tree.check_write(&segs)?;
        tree.write(&segs, value);
        tree.notify();
        Ok(())
    }

    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<(), StoreError> {
        let base = segments(path)?;
        let writes = fields
            .into_iter()
            .map(|(key, value)| Ok((join(&base, &key)?, value)))
            .collect::<Result<Vec<_>, StoreError>>()?;

        let mut tree = self.tree.lock().await;
        for (segs, _) in &writes {
            tree.check_write(segs)?;
        }
        for (segs, value) in writes {
            tree.write(&segs, value);
        }
        tree.notify();
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        self.set(path, Value::Null).await
    }

    async fn push(&self, path: &str, value: Value) -> Result<String, StoreError> {
        let base = segments(path)?;
        let mut tree = self.tree.lock().await;
        tree.check_write(&base)?;

        let key = format!("-{:016x}", tree.next_push);
        tree.next_push += 1;

        let mut segs = base;
        segs.push(key.clone());
        tree.write(&segs, value);
        tree.notify();
        Ok(key)
    }

    async fn watch_value(&self, path: &str) -> Result<ValueWatch, StoreError> {
        let segs = segments(path)?;
        let mut tree = self.tree.lock().await;

        let current = lookup(&tree.root, &segs).cloned();
        let (tx, watch) = ValueWatch::channel();
        let _ = tx.send(current.clone());

        tree.value_watchers.push(ValueWatcher {
            path: segs,
            last: current,
            tx,
        });
        Ok(watch)
    }

    async fn watch_children(&self, path: &str) -> Result<ChildWatch, StoreError> {
        let segs = segments(path)?;
        let mut tree = self.tree.lock().await;

        let (tx, watch) = ChildWatch::channel();
        let mut known = HashSet::new();
        if let Some(children) = lookup(&tree.root, &segs).and_then(Value::as_object) {
            for (key, value) in children {
                known.insert(key.clone());
                let _ = tx.send(ChildAdded {
                    key: key.clone(),
                    value: value.clone(),
                });
            }
        }

        tree.child_watchers.push(ChildWatcher {
            path: segs,
            known,
            tx,
        });
        Ok(watch)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::store::fields;

    #[tokio::test]
    async fn test_set_get() {
        let store = MemoryStore::new();

        store.set("a/b", json!({"x": 1})).await.unwrap();

        assert_eq!(store.get("a/b/x").await.unwrap(), Some(json!(1)));
        assert_eq!(store.get("a").await.unwrap(), Some(json!({"b": {"x": 1}})));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_update_merges_fields() {
        let store = MemoryStore::new();
        store
            .set("listeners/l1", json!({"state": "waiting", "audioEnabled": false}))
            .await
            .unwrap();

        store
            .update("listeners/l1", fields(json!({"audioEnabled": true, "answer": null})))
            .await
            .unwrap();

        assert_eq!(
            store.get("listeners/l1").await.unwrap(),
            Some(json!({"state": "waiting", "audioEnabled": true}))
        );
    }

    #[tokio::test]
    async fn test_update_nested_keys_at_root() {
        let store = MemoryStore::new();
        store.set("listeners/a/state", json!("connected")).await.unwrap();
        store.set("listeners/b/state", json!("connecting")).await.unwrap();

        store
            .update(
                "",
                fields(json!({"listeners/a/state": "waiting", "listeners/b/state": "waiting"})),
            )
            .await
            .unwrap();

        assert_eq!(store.get("listeners/a/state").await.unwrap(), Some(json!("waiting")));
        assert_eq!(store.get("listeners/b/state").await.unwrap(), Some(json!("waiting")));
    }

    #[tokio::test]
    async fn test_remove_prunes_empty_parents() {
        let store = MemoryStore::new();
        store.set("candidates/admin/l1/k", json!({"candidate": "c"})).await.unwrap();

        store.remove("candidates/admin/l1").await.unwrap();

        assert_eq!(store.get("candidates").await.unwrap(), None);
        assert_eq!(store.snapshot().await, json!({}));
    }

    #[tokio::test]
    async fn test_remove_root_wipes_everything() {
        let store = MemoryStore::new();
        store.set("broadcast/status", json!("live")).await.unwrap();
        store.set("listeners/a/state", json!("waiting")).await.unwrap();

        store.remove("/").await.unwrap();

        assert_eq!(store.snapshot().await, json!({}));
    }

    #[tokio::test]
    async fn test_push_keys_sort_in_append_order() {
        let store = MemoryStore::new();
        let mut keys = Vec::new();
        for i in 0..20 {
            keys.push(store.push("seq", json!(i)).await.unwrap());
        }

        let stored = store.get("seq").await.unwrap().unwrap();
        let values: Vec<_> = stored.as_object().unwrap().values().cloned().collect();
        assert_eq!(values, (0..20).map(|i| json!(i)).collect::<Vec<_>>());

        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[tokio::test]
    async fn test_value_watch_initial_and_changes() {
        let store = MemoryStore::new();
        store.set("broadcast/status", json!("idle")).await.unwrap();

        let mut watch = store.watch_value("broadcast").await.unwrap();
        assert_eq!(watch.next().await, Some(Some(json!({"status": "idle"}))));

        // Unrelated writes do not fire
        store.set("listeners/a/state", json!("waiting")).await.unwrap();
        // Descendant writes do
        store.set("broadcast/status", json!("live")).await.unwrap();
        assert_eq!(watch.next().await, Some(Some(json!({"status": "live"}))));

        store.remove("broadcast").await.unwrap();
        assert_eq!(watch.next().await, Some(None));
    }

    #[tokio::test]
    async fn test_child_watch_replays_existing_then_new() {
        let store = MemoryStore::new();
        store.set("listeners/a", json!({"audioEnabled": true})).await.unwrap();

        let mut watch = store.watch_children("listeners").await.unwrap();
        let first = watch.next().await.unwrap();
        assert_eq!(first.key, "a");

        // Changing an existing child does not fire again
        store.set("listeners/a/state", json!("connecting")).await.unwrap();
        store.set("listeners/b", json!({"audioEnabled": false})).await.unwrap();

        let second = watch.next().await.unwrap();
        assert_eq!(second.key, "b");
        assert_eq!(second.value, json!({"audioEnabled": false}));
    }

    #[tokio::test]
    async fn test_dropped_watch_unsubscribes() {
        let store = MemoryStore::new();
        let watch = store.watch_value("broadcast").await.unwrap();
        let _children = store.watch_children("listeners").await.unwrap();
        assert_eq!(store.subscriber_count().await, 2);

        drop(watch);
        store.set("broadcast/status", json!("live")).await.unwrap();

        assert_eq!(store.subscriber_count().await, 1);
    }

    #[tokio::test]
    async fn test_denied_writes() {
        let store = MemoryStore::new();
        store.deny_writes("broadcast").await.unwrap();

        let result = store.set("broadcast/status", json!("live")).await;
        assert!(matches!(result, Err(StoreError::PermissionDenied(_))));

        // Ancestors of a denied path are denied too
        assert!(store.remove("/").await.is_err());

        // Siblings are unaffected
        store.set("listeners/a/state", json!("waiting")).await.unwrap();

        store.allow_all().await;
        store.set("broadcast/status", json!("live")).await.unwrap();
    }

    #[tokio::test]
    async fn test_value_watch_waits_for_a_change() {
        let store = MemoryStore::new();
        store.set("a", json!(1)).await.unwrap();
        let mut watch = store.watch_value("a").await.unwrap();
        assert_eq!(watch.next().await, Some(Some(json!(1))));

        let mut next = tokio_test::task::spawn(watch.next());
        tokio_test::assert_pending!(next.poll());

        // Rewriting the same value is not a change
        store.set("a", json!(1)).await.unwrap();
        tokio_test::assert_pending!(next.poll());

        store.set("a", json!(2)).await.unwrap();
        assert!(next.is_woken());
        tokio_test::assert_ready_eq!(next.poll(), Some(Some(json!(2))));
    }
}
