//! Resource versions, sources and pipeline-declared resource types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A concrete version of a resource, e.g. `{"ref": "abc123"}`.
///
/// Keys are kept sorted so the serialized form is canonical.
pub type Version = BTreeMap<String, String>;

/// Source configuration of a resource or resource type.
pub type Source = BTreeMap<String, serde_json::Value>;

/// Parameters passed to a fetch.
pub type Params = BTreeMap<String, serde_json::Value>;

/// A resource type declared by a pipeline.
///
/// `kind` names the type that implements this one. It is either a built-in
/// (base) resource type or another resource type declared by the same
/// pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceType {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub source: Source,
}

impl ResourceType {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, source: Source) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            source,
        }
    }
}

/// The set of resource types visible to a pipeline.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceTypes(Vec<ResourceType>);

impl ResourceTypes {
    pub fn new(types: Vec<ResourceType>) -> Self {
        Self(types)
    }

    /// Find a resource type by name.
    pub fn lookup(&self, name: &str) -> Option<&ResourceType> {
        self.0.iter().find(|t| t.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceType> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<ResourceType>> for ResourceTypes {
    fn from(types: Vec<ResourceType>) -> Self {
        Self(types)
    }
}

impl FromIterator<ResourceType> for ResourceTypes {
    fn from_iter<I: IntoIterator<Item = ResourceType>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
