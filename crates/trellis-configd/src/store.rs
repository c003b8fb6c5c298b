use std::sync::Mutex;

use tracing::{debug, warn};
use trellis_object::{Fault, Map, Object};
use trellis_pool::Handle;

/// One configuration key: either a leaf value or a map of children,
/// never both. Children keep insertion order.
#[derive(Default)]
struct Node {
    value: Option<(Object<'static>, i64)>,
    children: Vec<(Vec<u8>, Node)>,
}

impl Node {
    fn child(&self, key: &[u8]) -> Option<&Node> {
        self.children.iter().find(|(k, _)| k == key).map(|(_, node)| node)
    }

    fn child_mut(&mut self, key: &[u8]) -> &mut Node {
        if let Some(index) = self.children.iter().position(|(k, _)| k == key) {
            return &mut self.children[index].1;
        }
        self.children.push((key.to_vec(), Node::default()));
        &mut self.children.last_mut().unwrap().1
    }

    fn lookup(&self, key_path: &[Vec<u8>]) -> Option<&Node> {
        key_path.iter().try_fold(self, |node, key| node.child(key))
    }

    fn materialize(&self) -> Object<'static> {
        if let Some((value, _)) = &self.value {
            return value.clone();
        }
        Object::Map(
            self.children
                .iter()
                .map(|(key, node)| (key.clone().into(), node.materialize()))
                .collect::<Map<'static>>(),
        )
    }
}

struct Subscriber {
    key_path: Vec<Vec<u8>>,
    handle: Handle,
}

#[derive(Default)]
struct StoreInner {
    root: Node,
    subscribers: Vec<Subscriber>,
}

/// A write's fallout: which subscription handles must be told about
/// which written key paths.
pub type Notifications = Vec<(Handle, Vec<Vec<u8>>)>;

/// In-memory configuration tree with timestamped merge writes and
/// key-path change subscribers.
///
/// The store keeps the relational model's observable semantics
/// (arbitrary depth, keys are opaque bytes, no separator ambiguity);
/// persistence is a separate concern and not handled here.
#[derive(Default)]
pub struct ConfigStore {
    inner: Mutex<StoreInner>,
}

impl ConfigStore {
    /// Merges `value` at `key_path` with the given timestamp.
    ///
    /// Map values merge recursively; non-map values land as leaves. A
    /// leaf older than what the store already holds is skipped, not an
    /// error. Returns the subscriber notifications the write produced.
    pub fn write(
        &self,
        key_path: &[Vec<u8>],
        value: &Object<'_>,
        timestamp: i64,
    ) -> Result<Notifications, Fault> {
        let mut inner = self.inner.lock().unwrap();

        let mut written = Vec::new();
        {
            let mut node = &mut inner.root;
            for key in key_path {
                node = node.child_mut(key);
            }
            let mut path = key_path.to_vec();
            merge(node, value, timestamp, &mut path, &mut written);
        }

        let notifications = written
            .iter()
            .flat_map(|path| {
                inner
                    .subscribers
                    .iter()
                    .filter(|sub| path.starts_with(&sub.key_path))
                    .map(|sub| (sub.handle, path.clone()))
            })
            .collect();
        Ok(notifications)
    }

    /// Materializes the value at `key_path`: the leaf value, or the
    /// subtree as nested maps.
    pub fn read(&self, key_path: &[Vec<u8>]) -> Result<Object<'static>, Fault> {
        let inner = self.inner.lock().unwrap();
        let node = inner.root.lookup(key_path).ok_or(Fault::NoEntry)?;
        Ok(node.materialize())
    }

    /// Names of the direct children of `key_path`.
    pub fn list(&self, key_path: &[Vec<u8>]) -> Result<Vec<Vec<u8>>, Fault> {
        let inner = self.inner.lock().unwrap();
        let node = inner.root.lookup(key_path).ok_or(Fault::NoEntry)?;
        Ok(node.children.iter().map(|(key, _)| key.clone()).collect())
    }

    /// Removes the subtree rooted at `key_path`.
    pub fn delete(&self, key_path: &[Vec<u8>]) -> Result<(), Fault> {
        let mut inner = self.inner.lock().unwrap();
        let Some((last, parent_path)) = key_path.split_last() else {
            inner.root = Node::default();
            return Ok(());
        };

        let mut node = &mut inner.root;
        for key in parent_path {
            let index = node
                .children
                .iter()
                .position(|(k, _)| k == key)
                .ok_or(Fault::NoEntry)?;
            node = &mut node.children[index].1;
        }
        let index = node
            .children
            .iter()
            .position(|(k, _)| k == last)
            .ok_or(Fault::NoEntry)?;
        node.children.remove(index);
        debug!("deleted config subtree");
        Ok(())
    }

    /// Registers `handle` for writes at or below `key_path`. The key
    /// must exist.
    pub fn subscribe(&self, key_path: &[Vec<u8>], handle: Handle) -> Result<(), Fault> {
        let mut inner = self.inner.lock().unwrap();
        if inner.root.lookup(key_path).is_none() {
            warn!("subscription to nonexistent config key");
            return Err(Fault::NoEntry);
        }
        inner
            .subscribers
            .push(Subscriber { key_path: key_path.to_vec(), handle });
        Ok(())
    }

    /// Drops every subscription owned by `handle`.
    pub fn drop_subscriber(&self, handle: Handle) {
        let mut inner = self.inner.lock().unwrap();
        inner.subscribers.retain(|sub| sub.handle != handle);
    }
}

fn merge(
    node: &mut Node,
    value: &Object<'_>,
    timestamp: i64,
    path: &mut Vec<Vec<u8>>,
    written: &mut Vec<Vec<Vec<u8>>>,
) {
    if let Object::Map(map) = value {
        // Becoming a map supersedes any previous leaf value.
        node.value = None;
        for (key, child_value) in map.iter() {
            path.push(key.to_vec());
            merge(node.child_mut(key), child_value, timestamp, path, written);
            path.pop();
        }
        return;
    }

    if let Some((_, existing)) = &node.value {
        if *existing > timestamp {
            debug!("skipping write older than stored value");
            return;
        }
    }
    node.value = Some((value.clone().into_owned(), timestamp));
    node.children.clear();
    written.push(path.clone());
}
