//! Mutation graph built during one reconcile
//!
//! Vertices are target objects keyed by kind, namespace and name, each tagged
//! with the action to apply. Edges order application: for an edge
//! `before -> after`, `before` is applied first. The root vertex (the cluster
//! itself) implicitly depends on every other vertex so its status is written
//! last.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use kube::api::DynamicObject;
use kube::core::{ApiResource, GroupVersionKind};
use kube::{Resource, ResourceExt};
use serde::Serialize;

use crate::controller::error::{Error, Result};

/// What to do with a vertex's object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphAction {
    Create,
    Update,
    Patch,
    Delete,
    NoOp,
    /// Status-only write, used for the root and for component status updates
    Status,
}

impl fmt::Display for GraphAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphAction::Create => write!(f, "Create"),
            GraphAction::Update => write!(f, "Update"),
            GraphAction::Patch => write!(f, "Patch"),
            GraphAction::Delete => write!(f, "Delete"),
            GraphAction::NoOp => write!(f, "NoOp"),
            GraphAction::Status => write!(f, "Status"),
        }
    }
}

/// Identity of a vertex
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: impl Into<String>, namespace: Option<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            namespace,
            name: name.into(),
        }
    }

    /// Key of a typed resource
    pub fn of<K>(obj: &K) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        Self::new(K::kind(&()), obj.namespace(), obj.name_any())
    }

    /// Key of the object's status subresource, distinct from the object's own key
    pub fn status(&self) -> Self {
        Self::new(format!("{}/status", self.kind), self.namespace.clone(), self.name.clone())
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// An object and the action to apply to it
#[derive(Debug, Clone)]
pub struct Vertex {
    pub key: ObjectKey,
    pub action: GraphAction,
    pub resource: ApiResource,
    pub object: DynamicObject,
}

impl Vertex {
    /// Build a vertex from a typed resource
    pub fn new<K>(obj: &K, action: GraphAction) -> Result<Self>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let gvk = GroupVersionKind::gvk(&K::group(&()), &K::version(&()), &K::kind(&()));
        let resource = ApiResource::from_gvk_with_plural(&gvk, &K::plural(&()));
        let mut object: DynamicObject = serde_json::from_value(serde_json::to_value(obj)?)?;
        object.types = Some(kube::core::TypeMeta {
            api_version: K::api_version(&()).to_string(),
            kind: K::kind(&()).to_string(),
        });
        let key = match action {
            GraphAction::Status => ObjectKey::of(obj).status(),
            _ => ObjectKey::of(obj),
        };
        Ok(Self {
            key,
            action,
            resource,
            object,
        })
    }

    pub fn create<K>(obj: &K) -> Result<Self>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        Self::new(obj, GraphAction::Create)
    }

    pub fn patch<K>(obj: &K) -> Result<Self>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        Self::new(obj, GraphAction::Patch)
    }

    pub fn delete<K>(obj: &K) -> Result<Self>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        Self::new(obj, GraphAction::Delete)
    }

    pub fn status<K>(obj: &K) -> Result<Self>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        Self::new(obj, GraphAction::Status)
    }

    /// Deserialize the object back into its typed form
    pub fn typed<K>(&self) -> Result<K>
    where
        K: serde::de::DeserializeOwned,
    {
        Ok(serde_json::from_value(serde_json::to_value(&self.object)?)?)
    }
}

/// Dependency-ordered set of object mutations
#[derive(Debug, Default, Clone)]
pub struct MutationGraph {
    root: Option<ObjectKey>,
    vertices: BTreeMap<ObjectKey, Vertex>,
    edges: BTreeSet<(ObjectKey, ObjectKey)>,
}

impl MutationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the root vertex; it is walked after every other vertex
    pub fn set_root(&mut self, vertex: Vertex) {
        self.root = Some(vertex.key.clone());
        self.vertices.insert(vertex.key.clone(), vertex);
    }

    pub fn root(&self) -> Option<&Vertex> {
        self.root.as_ref().and_then(|k| self.vertices.get(k))
    }

    pub fn root_mut(&mut self) -> Option<&mut Vertex> {
        let key = self.root.clone()?;
        self.vertices.get_mut(&key)
    }

    /// Add or replace a vertex; an existing vertex keeps its edges
    pub fn add_vertex(&mut self, vertex: Vertex) {
        self.vertices.insert(vertex.key.clone(), vertex);
    }

    pub fn vertex(&self, key: &ObjectKey) -> Option<&Vertex> {
        self.vertices.get(key)
    }

    pub fn vertex_mut(&mut self, key: &ObjectKey) -> Option<&mut Vertex> {
        self.vertices.get_mut(key)
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.vertices.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// Require `before` to be applied before `after`
    pub fn connect(&mut self, before: &ObjectKey, after: &ObjectKey) {
        if before != after {
            self.edges.insert((before.clone(), after.clone()));
        }
    }

    /// Whether `before` is required to be applied before `after`
    pub fn has_edge(&self, before: &ObjectKey, after: &ObjectKey) -> bool {
        self.edges.contains(&(before.clone(), after.clone()))
    }

    /// Vertices carrying the given action
    pub fn vertices_with(&self, action: GraphAction) -> impl Iterator<Item = &Vertex> {
        self.vertices.values().filter(move |v| v.action == action)
    }

    /// Vertices in apply order, root last
    ///
    /// Ties are broken by key order so the walk is deterministic. Edges whose
    /// endpoints are not in the graph are ignored.
    pub fn walk_order(&self) -> Result<Vec<&Vertex>> {
        let mut in_degree: BTreeMap<&ObjectKey, usize> =
            self.vertices.keys().map(|k| (k, 0)).collect();
        let mut successors: BTreeMap<&ObjectKey, Vec<&ObjectKey>> = BTreeMap::new();

        let mut add_edge = |from: &'_ ObjectKey, to: &'_ ObjectKey| -> Option<()> {
            let (from, _) = self.vertices.get_key_value(from)?;
            let (to, _) = self.vertices.get_key_value(to)?;
            successors.entry(from).or_default().push(to);
            *in_degree.entry(to).or_insert(0) += 1;
            Some(())
        };

        for (before, after) in &self.edges {
            add_edge(before, after);
        }
        if let Some(root) = &self.root {
            for key in self.vertices.keys().filter(|k| *k != root) {
                add_edge(key, root);
            }
        }

        let mut ready: VecDeque<&ObjectKey> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(k, _)| *k)
            .collect();
        let mut order = Vec::with_capacity(self.vertices.len());

        while let Some(key) = ready.pop_front() {
            if let Some(vertex) = self.vertices.get(key) {
                order.push(vertex);
            }
            for next in successors.get(key).into_iter().flatten() {
                if let Some(d) = in_degree.get_mut(next) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push_back(next);
                    }
                }
            }
        }

        if order.len() != self.vertices.len() {
            let stuck = in_degree
                .iter()
                .find(|(_, d)| **d > 0)
                .map(|(k, _)| k.to_string())
                .unwrap_or_default();
            return Err(Error::GraphCycle(stuck));
        }
        Ok(order)
    }
}
