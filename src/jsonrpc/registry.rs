//! Method registry: wire method name -> parameter/result shapes.
//!
//! The registry is built once per connection from named [`ServiceGroup`]s:
//! the group(s) the local side implements and the group(s) expected of the
//! remote side. Groups may carry a segment (a method-name prefix) and may
//! delegate to other groups, whose methods are merged in under the delegate's
//! own segment. Everything is flattened into a single map at build time.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use super::payload::{AnyPayload, Payload};

type DecodeFn = dyn Fn(Value) -> serde_json::Result<Payload> + Send + Sync;

/// Type-erased decoder for one payload type
#[derive(Clone)]
pub struct Shape {
    type_name: &'static str,
    decode: Arc<DecodeFn>,
}

impl Shape {
    /// Shape resolving JSON into `T`
    pub fn of<T>() -> Self
    where
        T: DeserializeOwned + AnyPayload,
    {
        Self {
            type_name: std::any::type_name::<T>(),
            decode: Arc::new(|value: Value| T::deserialize(value).map(Payload::typed)),
        }
    }

    /// Shape keeping the raw JSON tree
    pub fn json() -> Self {
        Self {
            type_name: "json",
            decode: Arc::new(|value: Value| Ok::<_, serde_json::Error>(Payload::Json(value))),
        }
    }

    pub fn decode(&self, value: Value) -> serde_json::Result<Payload> {
        (self.decode)(value)
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Shape").field(&self.type_name).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Request,
    Notification,
}

/// Shape information for one wire method
#[derive(Debug, Clone)]
pub struct MethodDescriptor {
    name: String,
    kind: MethodKind,
    params: Shape,
    result: Option<Shape>,
}

impl MethodDescriptor {
    pub fn request<P, R>(name: impl Into<String>) -> Self
    where
        P: DeserializeOwned + AnyPayload,
        R: DeserializeOwned + AnyPayload,
    {
        Self {
            name: name.into(),
            kind: MethodKind::Request,
            params: Shape::of::<P>(),
            result: Some(Shape::of::<R>()),
        }
    }

    pub fn notification<P>(name: impl Into<String>) -> Self
    where
        P: DeserializeOwned + AnyPayload,
    {
        Self {
            name: name.into(),
            kind: MethodKind::Notification,
            params: Shape::of::<P>(),
            result: None,
        }
    }

    /// Request whose params and result stay raw JSON
    pub fn untyped_request(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: MethodKind::Request,
            params: Shape::json(),
            result: Some(Shape::json()),
        }
    }

    pub fn untyped_notification(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: MethodKind::Notification,
            params: Shape::json(),
            result: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> MethodKind {
        self.kind
    }

    pub fn is_notification(&self) -> bool {
        self.kind == MethodKind::Notification
    }

    pub fn params(&self) -> &Shape {
        &self.params
    }

    pub fn result(&self) -> Option<&Shape> {
        self.result.as_ref()
    }

    fn prefixed(&self, segment: &str) -> Self {
        Self {
            name: format!("{}{}", segment, self.name),
            ..self.clone()
        }
    }
}

/// A named group of methods, optionally prefixed and delegating to other groups
#[derive(Debug, Clone)]
pub struct ServiceGroup {
    name: String,
    segment: String,
    methods: Vec<MethodDescriptor>,
    delegates: Vec<String>,
}

impl ServiceGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            segment: String::new(),
            methods: Vec::new(),
            delegates: Vec::new(),
        }
    }

    /// Prefix applied to every method of this group (e.g. `"textDocument/"`)
    pub fn segment(mut self, segment: impl Into<String>) -> Self {
        self.segment = segment.into();
        self
    }

    pub fn request<P, R>(self, method: impl Into<String>) -> Self
    where
        P: DeserializeOwned + AnyPayload,
        R: DeserializeOwned + AnyPayload,
    {
        self.method(MethodDescriptor::request::<P, R>(method))
    }

    pub fn notification<P>(self, method: impl Into<String>) -> Self
    where
        P: DeserializeOwned + AnyPayload,
    {
        self.method(MethodDescriptor::notification::<P>(method))
    }

    pub fn method(mut self, descriptor: MethodDescriptor) -> Self {
        self.methods.push(descriptor);
        self
    }

    /// Merge the methods of another group (by name) into this one
    pub fn delegate(mut self, group: impl Into<String>) -> Self {
        self.delegates.push(group.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn segment_prefix(&self) -> &str {
        &self.segment
    }

    pub fn methods(&self) -> &[MethodDescriptor] {
        &self.methods
    }

    pub fn delegates(&self) -> &[String] {
        &self.delegates
    }

    pub(crate) fn push_method(&mut self, descriptor: MethodDescriptor) {
        self.methods.push(descriptor);
    }

    pub(crate) fn push_delegate(&mut self, group: String) {
        self.delegates.push(group);
    }
}

/// Registry construction failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("duplicate RPC method '{method}' (registered by '{first}' and '{second}')")]
    DuplicateMethod {
        method: String,
        first: String,
        second: String,
    },

    #[error("service group '{0}' is defined twice")]
    DuplicateGroup(String),

    #[error("service group '{0}' is not defined")]
    UnknownGroup(String),

    #[error("delegation cycle: {}", .0.join(" -> "))]
    DelegationCycle(Vec<String>),
}

/// Read-only name -> descriptor map
#[derive(Debug, Clone, Default)]
pub struct MethodRegistry {
    methods: HashMap<String, MethodDescriptor>,
}

impl MethodRegistry {
    pub fn builder() -> MethodRegistryBuilder {
        MethodRegistryBuilder::default()
    }

    pub fn get(&self, method: &str) -> Option<&MethodDescriptor> {
        self.methods.get(method)
    }

    pub fn contains(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Registered method names in sorted order
    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[derive(Debug, Default)]
pub struct MethodRegistryBuilder {
    groups: BTreeMap<String, ServiceGroup>,
    duplicate_groups: Vec<String>,
    local: Vec<String>,
    remote: Vec<String>,
}

impl MethodRegistryBuilder {
    /// Add a group to the catalog without exposing it
    pub fn group(mut self, group: ServiceGroup) -> Self {
        let name = group.name.clone();
        if self.groups.insert(name.clone(), group).is_some() {
            self.duplicate_groups.push(name);
        }
        self
    }

    pub fn groups(self, groups: impl IntoIterator<Item = ServiceGroup>) -> Self {
        groups.into_iter().fold(self, |builder, group| builder.group(group))
    }

    /// Root group implemented by the local side
    pub fn local(mut self, group: impl Into<String>) -> Self {
        self.local.push(group.into());
        self
    }

    /// Root group expected of the remote side
    pub fn remote(mut self, group: impl Into<String>) -> Self {
        self.remote.push(group.into());
        self
    }

    pub fn build(self) -> Result<MethodRegistry, RegistryError> {
        if let Some(name) = self.duplicate_groups.first() {
            return Err(RegistryError::DuplicateGroup(name.clone()));
        }

        let mut flattener = Flattener {
            groups: &self.groups,
            stack: Vec::new(),
            visited: HashSet::new(),
            owners: HashMap::new(),
            methods: HashMap::new(),
        };
        for root in self.local.iter().chain(self.remote.iter()) {
            flattener.visit(root)?;
        }

        log::debug!(
            "Built method registry with {} methods from {} groups",
            flattener.methods.len(),
            flattener.visited.len()
        );
        Ok(MethodRegistry {
            methods: flattener.methods,
        })
    }
}

struct Flattener<'a> {
    groups: &'a BTreeMap<String, ServiceGroup>,
    stack: Vec<String>,
    visited: HashSet<String>,
    owners: HashMap<String, String>,
    methods: HashMap<String, MethodDescriptor>,
}

impl Flattener<'_> {
    fn visit(&mut self, name: &str) -> Result<(), RegistryError> {
        if let Some(pos) = self.stack.iter().position(|n| n == name) {
            let mut cycle = self.stack[pos..].to_vec();
            cycle.push(name.to_string());
            return Err(RegistryError::DelegationCycle(cycle));
        }
        if self.visited.contains(name) {
            return Ok(());
        }
        let groups = self.groups;
        let group = groups
            .get(name)
            .ok_or_else(|| RegistryError::UnknownGroup(name.to_string()))?;

        self.stack.push(name.to_string());
        for method in &group.methods {
            let descriptor = method.prefixed(&group.segment);
            let full_name = descriptor.name.clone();
            if let Some(first) = self.owners.get(&full_name) {
                return Err(RegistryError::DuplicateMethod {
                    method: full_name,
                    first: first.clone(),
                    second: name.to_string(),
                });
            }
            self.owners.insert(full_name.clone(), name.to_string());
            self.methods.insert(full_name, descriptor);
        }
        for delegate in &group.delegates {
            self.visit(delegate)?;
        }
        self.stack.pop();
        self.visited.insert(name.to_string());
        Ok(())
    }
}
