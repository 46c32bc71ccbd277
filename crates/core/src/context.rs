//! Context: a path-keyed, directional value store with pipe connections.
//!
//! A [`Context`] is a handle. Cloning it shares the underlying storage, so
//! several Tasks may reference the same Context and observe each other's
//! writes immediately. Callers that need a private copy use
//! [`Context::snapshot`] and [`Context::from_data`].

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::ContextFault;
use crate::id::ContextId;

/// Path where a result lands when nothing else says where it goes.
pub const DEFAULT_RESULT_PATH: &str = "result";

/// Data direction of a context entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Direction {
    /// Supplied by the caller, read-only to the operation
    In,
    /// Produced by the operation
    #[default]
    Out,
    /// Both
    InOut,
}

impl Direction {
    /// Whether the operation reads this entry.
    pub fn is_input(self) -> bool {
        matches!(self, Direction::In | Direction::InOut)
    }

    /// Whether the operation produces this entry.
    pub fn is_output(self) -> bool {
        matches!(self, Direction::Out | Direction::InOut)
    }
}

/// One slot of a context. `value == None` is the no-value marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Bound value, if any
    pub value: Option<Value>,

    /// Data direction
    pub direction: Direction,
}

/// Serializable description of a pipe, addressing its target by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeSpec {
    /// Path read from the source context
    pub from_path: String,

    /// Path written in the target context
    pub to_path: String,

    /// Target context
    pub target: ContextId,
}

/// Plain, serializable contents of a context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextData {
    /// Unique identifier
    pub id: ContextId,

    /// Context name
    pub name: String,

    /// Owner tag
    #[serde(default)]
    pub owner: Option<String>,

    /// Entries in insertion order
    #[serde(default)]
    pub entries: IndexMap<String, Entry>,

    /// alias -> canonical path
    #[serde(default)]
    pub aliases: IndexMap<String, String>,

    /// Where the canonical result is stored
    #[serde(default)]
    pub return_path: Option<String>,

    /// Outgoing pipes
    #[serde(default)]
    pub pipes: Vec<PipeSpec>,
}

impl ContextData {
    fn new(name: impl Into<String>) -> Self {
        Self {
            id: ContextId::new(),
            name: name.into(),
            owner: None,
            entries: IndexMap::new(),
            aliases: IndexMap::new(),
            return_path: None,
            pipes: Vec::new(),
        }
    }

    /// Follow aliases to the canonical path.
    fn resolve(&self, path: &str) -> String {
        let mut current = normalize(path);
        // bounded walk, an alias chain cannot be longer than the alias table
        for _ in 0..=self.aliases.len() {
            match self.aliases.get(&current) {
                Some(target) => current = target.clone(),
                None => break,
            }
        }
        current
    }
}

fn normalize(path: &str) -> String {
    path.trim_matches('/').to_string()
}

struct Pipe {
    spec: PipeSpec,
    target: Weak<RwLock<ContextInner>>,
}

struct ContextInner {
    data: ContextData,
    pipes: Vec<Pipe>,
    /// canonical path -> clock value of its last write
    versions: HashMap<String, u64>,
    clock: u64,
}

impl ContextInner {
    fn touch(&mut self, path: &str) {
        self.clock += 1;
        self.versions.insert(path.to_string(), self.clock);
    }
}

/// Shared handle to a hierarchical, path-keyed value store.
#[derive(Clone)]
pub struct Context {
    inner: Arc<RwLock<ContextInner>>,
}

impl Context {
    /// Create an empty context.
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_data(ContextData::new(name))
    }

    /// Rebuild a context from a snapshot.
    ///
    /// Pipes in the snapshot are kept as specs and stay inert until
    /// [`Context::relink`] resolves their targets.
    pub fn from_data(mut data: ContextData) -> Self {
        let pipes = std::mem::take(&mut data.pipes)
            .into_iter()
            .map(|spec| Pipe {
                spec,
                target: Weak::new(),
            })
            .collect();

        Self {
            inner: Arc::new(RwLock::new(ContextInner {
                data,
                pipes,
                versions: HashMap::new(),
                clock: 0,
            })),
        }
    }

    /// Set the owner tag.
    pub fn with_owner(self, owner: impl Into<String>) -> Self {
        self.inner.write().data.owner = Some(owner.into());
        self
    }

    /// Add a bound IN entry.
    pub fn with_in(self, path: &str, value: impl Into<Value>) -> Self {
        self.put(path, value, Direction::In);
        self
    }

    /// Add an unbound OUT entry.
    pub fn with_out(self, path: &str) -> Self {
        self.declare(path, Direction::Out);
        self
    }

    /// Add an unbound IN entry, typically the target of a pipe.
    pub fn with_unbound_in(self, path: &str) -> Self {
        self.declare(path, Direction::In);
        self
    }

    /// Add a bound INOUT entry.
    pub fn with_inout(self, path: &str, value: impl Into<Value>) -> Self {
        self.put(path, value, Direction::InOut);
        self
    }

    /// Set the return path.
    pub fn with_return_path(self, path: &str) -> Self {
        self.set_return_path(path);
        self
    }

    /// Unique identifier.
    pub fn id(&self) -> ContextId {
        self.inner.read().data.id
    }

    /// Context name.
    pub fn name(&self) -> String {
        self.inner.read().data.name.clone()
    }

    /// Owner tag.
    pub fn owner(&self) -> Option<String> {
        self.inner.read().data.owner.clone()
    }

    /// Another handle to the same storage.
    pub fn share(&self) -> Context {
        self.clone()
    }

    /// Whether both handles refer to the same storage.
    pub fn ptr_eq(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Read a bound value.
    pub fn get(&self, path: &str) -> Result<Value, ContextFault> {
        let inner = self.inner.read();
        let path = inner.data.resolve(path);
        match inner.data.entries.get(&path) {
            Some(Entry { value: Some(v), .. }) => Ok(v.clone()),
            Some(Entry { value: None, .. }) => Err(ContextFault::Unbound(path)),
            None => Err(ContextFault::MissingPath(path)),
        }
    }

    /// Read a bound value as `T`.
    pub fn get_as<T: DeserializeOwned>(&self, path: &str) -> Result<T, ContextFault> {
        let value = self.get(path)?;
        serde_json::from_value(value).map_err(|_| ContextFault::Mistyped {
            path: normalize(path),
            expected: std::any::type_name::<T>().to_string(),
        })
    }

    /// Read a value if the path is bound.
    pub fn try_get(&self, path: &str) -> Option<Value> {
        self.get(path).ok()
    }

    /// Write a value with an explicit direction.
    pub fn put(&self, path: &str, value: impl Into<Value>, direction: Direction) {
        let mut inner = self.inner.write();
        let path = inner.data.resolve(path);
        inner.touch(&path);
        inner.data.entries.insert(
            path,
            Entry {
                value: Some(value.into()),
                direction,
            },
        );
    }

    /// Write a value, keeping the declared direction or defaulting to OUT.
    pub fn put_value(&self, path: &str, value: impl Into<Value>) {
        let mut inner = self.inner.write();
        let path = inner.data.resolve(path);
        inner.touch(&path);
        let value = Some(value.into());
        match inner.data.entries.get_mut(&path) {
            Some(entry) => entry.value = value,
            None => {
                inner.data.entries.insert(
                    path,
                    Entry {
                        value,
                        direction: Direction::Out,
                    },
                );
            }
        }
    }

    /// Declare an unbound slot.
    pub fn declare(&self, path: &str, direction: Direction) {
        let mut inner = self.inner.write();
        let path = inner.data.resolve(path);
        inner
            .data
            .entries
            .entry(path)
            .and_modify(|e| e.direction = direction)
            .or_insert(Entry {
                value: None,
                direction,
            });
    }

    /// Clear a value, keeping the slot and its direction.
    pub fn unbind(&self, path: &str) -> Result<(), ContextFault> {
        let mut inner = self.inner.write();
        let path = inner.data.resolve(path);
        inner.touch(&path);
        match inner.data.entries.get_mut(&path) {
            Some(entry) => {
                entry.value = None;
                Ok(())
            }
            None => Err(ContextFault::MissingPath(path)),
        }
    }

    /// Canonical form of a path, with aliases followed.
    pub fn canonical(&self, path: &str) -> String {
        self.inner.read().data.resolve(path)
    }

    /// Write counter of a path, increasing on every write through any
    /// handle. Paths never written report 0.
    pub fn version(&self, path: &str) -> u64 {
        let inner = self.inner.read();
        let path = inner.data.resolve(path);
        inner.versions.get(&path).copied().unwrap_or(0)
    }

    /// Direction of an entry.
    pub fn direction(&self, path: &str) -> Option<Direction> {
        let inner = self.inner.read();
        let path = inner.data.resolve(path);
        inner.data.entries.get(&path).map(|e| e.direction)
    }

    fn mark(&self, path: &str, direction: Direction) -> Result<(), ContextFault> {
        let mut inner = self.inner.write();
        let path = inner.data.resolve(path);
        match inner.data.entries.get_mut(&path) {
            Some(entry) => {
                entry.direction = direction;
                Ok(())
            }
            None => Err(ContextFault::MissingPath(path)),
        }
    }

    /// Mark an existing entry as IN.
    pub fn mark_in(&self, path: &str) -> Result<(), ContextFault> {
        self.mark(path, Direction::In)
    }

    /// Mark an existing entry as OUT.
    pub fn mark_out(&self, path: &str) -> Result<(), ContextFault> {
        self.mark(path, Direction::Out)
    }

    /// Mark an existing entry as INOUT.
    pub fn mark_inout(&self, path: &str) -> Result<(), ContextFault> {
        self.mark(path, Direction::InOut)
    }

    /// Make `alias` a synonym for `path`.
    pub fn alias(&self, alias: &str, path: &str) {
        let mut inner = self.inner.write();
        let target = inner.data.resolve(path);
        let alias = normalize(alias);
        if alias != target {
            inner.data.aliases.insert(alias, target);
        }
    }

    /// Whether the path (or alias) names an entry.
    pub fn contains(&self, path: &str) -> bool {
        let inner = self.inner.read();
        let path = inner.data.resolve(path);
        inner.data.entries.contains_key(&path)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.inner.read().data.entries.len()
    }

    /// Whether the context has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All paths in insertion order.
    pub fn paths(&self) -> Vec<String> {
        self.inner.read().data.entries.keys().cloned().collect()
    }

    /// Paths read by the operation.
    pub fn input_paths(&self) -> Vec<String> {
        self.paths_where(|e| e.direction.is_input())
    }

    /// Paths produced by the operation.
    pub fn output_paths(&self) -> Vec<String> {
        self.paths_where(|e| e.direction.is_output())
    }

    fn paths_where(&self, pred: impl Fn(&Entry) -> bool) -> Vec<String> {
        self.inner
            .read()
            .data
            .entries
            .iter()
            .filter(|(_, e)| pred(e))
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// First OUT or INOUT entry still waiting for a value.
    pub fn first_unbound_output(&self) -> Option<String> {
        self.inner
            .read()
            .data
            .entries
            .iter()
            .find(|(_, e)| e.direction.is_output() && e.value.is_none())
            .map(|(p, _)| p.clone())
    }

    /// Context-level return path.
    pub fn return_path(&self) -> Option<String> {
        self.inner.read().data.return_path.clone()
    }

    /// Set the context-level return path.
    pub fn set_return_path(&self, path: &str) {
        self.inner.write().data.return_path = Some(normalize(path));
    }

    /// Register a pipe from `from_path` here to `to_path` in `target`.
    ///
    /// Nothing is copied now; the value moves when the dispatcher calls
    /// [`Context::propagate_pipes`] after this context's exertion is done.
    pub fn connect(&self, from_path: &str, to_path: &str, target: &Context) {
        let spec = PipeSpec {
            from_path: normalize(from_path),
            to_path: normalize(to_path),
            target: target.id(),
        };
        debug!(
            "Pipe {}:{} -> {}:{}",
            self.name(),
            spec.from_path,
            target.name(),
            spec.to_path
        );
        self.inner.write().pipes.push(Pipe {
            spec,
            target: Arc::downgrade(&target.inner),
        });
    }

    /// Outgoing pipe descriptions.
    pub fn pipes(&self) -> Vec<PipeSpec> {
        self.inner
            .read()
            .pipes
            .iter()
            .map(|p| p.spec.clone())
            .collect()
    }

    /// Copy every bound pipe source into its target. Returns the number of
    /// values moved.
    ///
    /// Piped values overwrite the target slot regardless of what the
    /// target's own exertion declared there.
    pub fn propagate_pipes(&self) -> usize {
        let pending: Vec<(Value, String, Weak<RwLock<ContextInner>>)> = {
            let inner = self.inner.read();
            inner
                .pipes
                .iter()
                .filter_map(|pipe| {
                    let from = inner.data.resolve(&pipe.spec.from_path);
                    match inner.data.entries.get(&from).and_then(|e| e.value.clone()) {
                        Some(value) => Some((value, pipe.spec.to_path.clone(), pipe.target.clone())),
                        None => {
                            debug!("Pipe source '{}' unbound, nothing to propagate", from);
                            None
                        }
                    }
                })
                .collect()
        };

        let mut moved = 0;
        for (value, to_path, target) in pending {
            match target.upgrade() {
                Some(inner) => {
                    Context { inner }.receive(&to_path, value);
                    moved += 1;
                }
                None => warn!("Pipe target for '{}' is gone", to_path),
            }
        }
        moved
    }

    fn receive(&self, path: &str, value: Value) {
        let mut inner = self.inner.write();
        let path = inner.data.resolve(path);
        let direction = inner
            .data
            .entries
            .get(&path)
            .map(|e| e.direction)
            .unwrap_or(Direction::In);
        inner.touch(&path);
        inner.data.entries.insert(
            path,
            Entry {
                value: Some(value),
                direction,
            },
        );
    }

    /// Resolve pipe targets that are not attached, looking them up by id.
    pub fn relink(&self, registry: &HashMap<ContextId, Context>) {
        let mut inner = self.inner.write();
        for pipe in inner.pipes.iter_mut() {
            if pipe.target.upgrade().is_some() {
                continue;
            }
            match registry.get(&pipe.spec.target) {
                Some(target) => pipe.target = Arc::downgrade(&target.inner),
                None => debug!("Pipe target {} not in this tree, left detached", pipe.spec.target),
            }
        }
    }

    /// Copy every bound OUT/INOUT entry of `other` into this context.
    ///
    /// A return path pinned in `other` is adopted when this context has none.
    pub fn merge_outputs(&self, other: &ContextData) -> usize {
        let mut inner = self.inner.write();
        if inner.data.return_path.is_none() {
            inner.data.return_path = other.return_path.clone();
        }
        let mut merged = 0;
        for (path, entry) in &other.entries {
            if entry.direction.is_output() && entry.value.is_some() {
                inner.touch(path);
                inner.data.entries.insert(path.clone(), entry.clone());
                merged += 1;
            }
        }
        merged
    }

    /// Copy of the contents, pipes included as specs.
    pub fn snapshot(&self) -> ContextData {
        let inner = self.inner.read();
        let mut data = inner.data.clone();
        data.pipes = inner.pipes.iter().map(|p| p.spec.clone()).collect();
        data
    }

    /// Copy of the entries in insertion order.
    pub fn entries(&self) -> Vec<(String, Entry)> {
        self.inner
            .read()
            .data
            .entries
            .iter()
            .map(|(p, e)| (p.clone(), e.clone()))
            .collect()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("Context")
            .field("id", &inner.data.id)
            .field("name", &inner.data.name)
            .field("entries", &inner.data.entries)
            .field("pipes", &inner.pipes.len())
            .finish()
    }
}

impl std::fmt::Display for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        write!(f, "{}", inner.data.name)?;
        for (path, entry) in &inner.data.entries {
            match &entry.value {
                Some(v) => write!(f, "\n  {} = {} ({:?})", path, v, entry.direction)?,
                None => write!(f, "\n  {} = <none> ({:?})", path, entry.direction)?,
            }
        }
        Ok(())
    }
}

impl Serialize for Context {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.snapshot().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Context {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        ContextData::deserialize(deserializer).map(Context::from_data)
    }
}
