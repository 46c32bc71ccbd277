//! Invoker graph.
//!
//! Invokers live in an arena and refer to each other by [`InvokerId`].
//! A parameter that names another invoker is a dependency edge; any other
//! parameter is a path read from the scope context. Invalidation is a
//! breadth-first walk over dependents and never recomputes anything;
//! values are recomputed on the next [`Model::get_value`].
//!
//! The scope is a shared handle and may be written from outside the model.
//! Each cached value remembers the write version of every scope path and
//! the evaluation count of every invoker it read, and is recomputed when
//! any of them moved.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use exert_core::Context;
use serde_json::Value;
use tracing::debug;

use crate::error::InvokerError;

/// Index of an invoker in its model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InvokerId(usize);

/// Parameter values handed to a computation, in declaration order.
#[derive(Debug, Clone)]
pub struct Args {
    invoker: String,
    names: Vec<String>,
    values: Vec<Value>,
}

impl Args {
    /// Value of a parameter by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| &self.values[i])
    }

    /// Numeric value of a parameter.
    pub fn f64(&self, name: &str) -> Result<f64, InvokerError> {
        self.get(name)
            .and_then(Value::as_f64)
            .ok_or_else(|| self.fail(format!("parameter '{}' is not a number", name)))
    }

    /// All values in declaration order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Build an evaluation error for the invoker being computed.
    pub fn fail(&self, message: impl Into<String>) -> InvokerError {
        InvokerError::Evaluation {
            name: self.invoker.clone(),
            message: message.into(),
        }
    }
}

type Compute = Box<dyn Fn(&Args) -> Result<Value, InvokerError> + Send + Sync>;

struct InvokerNode {
    name: String,
    params: Vec<String>,
    compute: Compute,
    cached: Option<Value>,
    /// per parameter: scope write version or dependency evaluation count
    stamps: Vec<u64>,
    valid: bool,
    dependents: BTreeSet<InvokerId>,
    evaluations: u64,
}

/// A scope context plus the invokers computed over it.
pub struct Model {
    scope: Context,
    nodes: Vec<InvokerNode>,
    by_name: HashMap<String, InvokerId>,
}

impl Model {
    /// Create a model over a scope context.
    pub fn new(scope: Context) -> Self {
        Self {
            scope,
            nodes: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    /// The scope context.
    pub fn scope(&self) -> &Context {
        &self.scope
    }

    /// Define an invoker.
    ///
    /// Parameters may name invokers defined later; earlier invokers that
    /// read a scope path with this invoker's name are rewired to it and
    /// invalidated.
    pub fn add_invoker<F>(
        &mut self,
        name: impl Into<String>,
        params: &[&str],
        compute: F,
    ) -> Result<InvokerId, InvokerError>
    where
        F: Fn(&Args) -> Result<Value, InvokerError> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.by_name.contains_key(&name) {
            return Err(InvokerError::Duplicate(name));
        }

        let id = InvokerId(self.nodes.len());
        let params: Vec<String> = params.iter().map(|p| p.to_string()).collect();

        for p in &params {
            if let Some(&dep) = self.by_name.get(p) {
                self.nodes[dep.0].dependents.insert(id);
            }
        }

        let mut dependents = BTreeSet::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if node.params.iter().any(|p| p == &name) {
                dependents.insert(InvokerId(i));
            }
        }

        debug!("Invoker '{}' params {:?}", name, params);
        self.nodes.push(InvokerNode {
            name: name.clone(),
            params,
            compute: Box::new(compute),
            cached: None,
            stamps: Vec::new(),
            valid: false,
            dependents: dependents.clone(),
            evaluations: 0,
        });
        self.by_name.insert(name, id);

        self.cascade(dependents.into_iter().collect());
        Ok(id)
    }

    /// Id of an invoker.
    pub fn id(&self, name: &str) -> Option<InvokerId> {
        self.by_name.get(name).copied()
    }

    /// Current value, recomputing only if invalid.
    pub fn get_value(&mut self, name: &str) -> Result<Value, InvokerError> {
        let id = self.require(name)?;
        let mut evaluating = Vec::new();
        self.evaluate(id, &mut evaluating)
    }

    /// Write a scope value and invalidate every invoker that reads it,
    /// directly or through other invokers.
    pub fn set_value(&mut self, path: &str, value: impl Into<Value>) -> usize {
        let canonical = self.scope.canonical(path);
        self.scope.put_value(path, value);
        let readers: Vec<InvokerId> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| {
                n.params
                    .iter()
                    .any(|p| !self.by_name.contains_key(p) && self.scope.canonical(p) == canonical)
            })
            .map(|(i, _)| InvokerId(i))
            .collect();
        self.cascade(readers)
    }

    /// Invalidate an invoker and everything depending on it.
    pub fn invalidate(&mut self, name: &str) -> Result<usize, InvokerError> {
        let id = self.require(name)?;
        Ok(self.cascade(vec![id]))
    }

    /// Whether the cached value is current.
    pub fn is_valid(&self, name: &str) -> bool {
        self.id(name)
            .map(|id| self.is_fresh(id, &mut HashSet::new()))
            .unwrap_or(false)
    }

    fn is_fresh(&self, id: InvokerId, visiting: &mut HashSet<InvokerId>) -> bool {
        if !visiting.insert(id) {
            return false;
        }
        let node = &self.nodes[id.0];
        if !node.valid || node.stamps.len() != node.params.len() {
            return false;
        }
        node.params
            .iter()
            .zip(&node.stamps)
            .all(|(p, stamp)| match self.by_name.get(p).copied() {
                Some(dep) => self.is_fresh(dep, visiting) && self.nodes[dep.0].evaluations == *stamp,
                None => self.scope.version(p) == *stamp,
            })
    }

    /// How many times the invoker has been computed.
    pub fn evaluations(&self, name: &str) -> Option<u64> {
        self.id(name).map(|id| self.nodes[id.0].evaluations)
    }

    /// Invoker names in definition order.
    pub fn names(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.name.clone()).collect()
    }

    fn require(&self, name: &str) -> Result<InvokerId, InvokerError> {
        self.id(name)
            .ok_or_else(|| InvokerError::Unknown(name.to_string()))
    }

    fn evaluate(
        &mut self,
        id: InvokerId,
        evaluating: &mut Vec<InvokerId>,
    ) -> Result<Value, InvokerError> {
        if let Some(pos) = evaluating.iter().position(|e| *e == id) {
            let mut path: Vec<String> = evaluating[pos..]
                .iter()
                .map(|e| self.nodes[e.0].name.clone())
                .collect();
            path.push(self.nodes[id.0].name.clone());
            return Err(InvokerError::Cycle(path));
        }

        evaluating.push(id);
        let params = self.nodes[id.0].params.clone();
        let mut values = Vec::with_capacity(params.len());
        let mut stamps = Vec::with_capacity(params.len());
        for p in &params {
            match self.by_name.get(p).copied() {
                Some(dep) => {
                    values.push(self.evaluate(dep, evaluating)?);
                    stamps.push(self.nodes[dep.0].evaluations);
                }
                None => {
                    stamps.push(self.scope.version(p));
                    values.push(self.scope.get(p)?);
                }
            }
        }
        evaluating.pop();

        let node = &mut self.nodes[id.0];
        if node.valid && node.stamps == stamps {
            if let Some(v) = &node.cached {
                return Ok(v.clone());
            }
        }

        let args = Args {
            invoker: node.name.clone(),
            names: params,
            values,
        };
        let value = (node.compute)(&args)?;

        node.evaluations += 1;
        node.cached = Some(value.clone());
        node.stamps = stamps;
        node.valid = true;
        debug!("Invoker '{}' recomputed (#{})", node.name, node.evaluations);
        Ok(value)
    }

    fn cascade(&mut self, start: Vec<InvokerId>) -> usize {
        let mut queue: VecDeque<InvokerId> = start.into();
        let mut seen = HashSet::new();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            let node = &mut self.nodes[id.0];
            node.valid = false;
            queue.extend(node.dependents.iter().copied());
        }
        if !seen.is_empty() {
            debug!("Invalidated {} invoker(s)", seen.len());
        }
        seen.len()
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("scope", &self.scope.name())
            .field("invokers", &self.names())
            .finish()
    }
}
