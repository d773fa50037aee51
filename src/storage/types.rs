//! Resource keys, write events and list request/response types.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies one logical object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub namespace: String,
    pub group: String,
    pub resource: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(
        namespace: impl Into<String>,
        group: impl Into<String>,
        resource: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            group: group.into(),
            resource: resource.into(),
            name: name.into(),
        }
    }

    /// The (group, resource) partition this key's versions are ordered in.
    pub fn bucket(&self) -> BucketKey {
        BucketKey::new(&self.group, &self.resource)
    }

    /// Keys used for writes must name a single object.
    pub fn validate(&self) -> Result<(), String> {
        if self.group.is_empty() {
            return Err("missing group".to_string());
        }
        if self.resource.is_empty() {
            return Err("missing resource".to_string());
        }
        if self.name.is_empty() {
            return Err("missing name".to_string());
        }
        Ok(())
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.namespace, self.group, self.resource, self.name
        )
    }
}

/// The (group, resource) partition within which resource versions are ordered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketKey {
    pub group: String,
    pub resource: String,
}

impl BucketKey {
    pub fn new(group: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            resource: resource.into(),
        }
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.resource)
    }
}

/// Kind of change carried by a write event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

/// Action column stored with every row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    Created = 1,
    Updated = 2,
    Deleted = 3,
}

impl Action {
    pub(crate) fn as_i64(self) -> i64 {
        self as i64
    }

    pub(crate) fn from_i64(v: i64) -> Option<Self> {
        match v {
            1 => Some(Action::Created),
            2 => Some(Action::Updated),
            3 => Some(Action::Deleted),
            _ => None,
        }
    }
}

impl From<WatchEventType> for Action {
    fn from(t: WatchEventType) -> Self {
        match t {
            WatchEventType::Added => Action::Created,
            WatchEventType::Modified => Action::Updated,
            WatchEventType::Deleted => Action::Deleted,
        }
    }
}

impl From<Action> for WatchEventType {
    fn from(a: Action) -> Self {
        match a {
            Action::Created => WatchEventType::Added,
            Action::Updated => WatchEventType::Modified,
            Action::Deleted => WatchEventType::Deleted,
        }
    }
}

/// A write submitted to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteEvent {
    pub event_type: WatchEventType,
    pub key: ResourceKey,
    /// Opaque payload, typically a JSON object.
    pub value: Vec<u8>,
    /// Expected current version. 0 disables the conflict check.
    pub previous_rv: i64,
    pub folder: String,
    pub generation: i64,
}

impl WriteEvent {
    pub fn added(key: ResourceKey, value: impl Into<Vec<u8>>) -> Self {
        Self {
            event_type: WatchEventType::Added,
            key,
            value: value.into(),
            previous_rv: 0,
            folder: String::new(),
            generation: 1,
        }
    }

    pub fn modified(key: ResourceKey, value: impl Into<Vec<u8>>, previous_rv: i64) -> Self {
        Self {
            event_type: WatchEventType::Modified,
            key,
            value: value.into(),
            previous_rv,
            folder: String::new(),
            generation: 1,
        }
    }

    pub fn deleted(key: ResourceKey, previous_rv: i64) -> Self {
        Self {
            event_type: WatchEventType::Deleted,
            key,
            value: Vec::new(),
            previous_rv,
            folder: String::new(),
            generation: 0,
        }
    }

    pub fn with_folder(mut self, folder: impl Into<String>) -> Self {
        self.folder = folder.into();
        self
    }

    pub fn with_generation(mut self, generation: i64) -> Self {
        self.generation = generation;
        self
    }
}

/// A committed write, as delivered to watchers.
#[derive(Debug, Clone, PartialEq)]
pub struct WrittenEvent {
    pub event_type: WatchEventType,
    pub key: ResourceKey,
    pub value: Vec<u8>,
    pub previous_rv: i64,
    pub folder: String,
    pub generation: i64,
    pub resource_version: i64,
}

/// Result of a point read.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadResponse {
    pub key: ResourceKey,
    pub uid: String,
    pub value: Vec<u8>,
    pub folder: String,
    pub generation: i64,
    pub resource_version: i64,
}

/// Table a list request reads from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListSource {
    #[default]
    Store,
    History,
    Trash,
}

/// How `resource_version` in a list request is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionMatch {
    #[default]
    Unset,
    Exact,
    NotOlderThan,
}

/// Label selector operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// One label selector term, matched against `metadata.labels` of the value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub key: String,
    pub operator: Operator,
    pub values: Vec<String>,
}

impl Requirement {
    pub fn new(key: impl Into<String>, operator: Operator, values: Vec<String>) -> Self {
        Self {
            key: key.into(),
            operator,
            values,
        }
    }

    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let current = labels.get(&self.key);
        match self.operator {
            Operator::Equals | Operator::In => {
                current.is_some_and(|v| self.values.iter().any(|want| want == v))
            }
            Operator::NotEquals | Operator::NotIn => {
                current.map_or(true, |v| self.values.iter().all(|want| want != v))
            }
            Operator::Exists => current.is_some(),
            Operator::DoesNotExist => current.is_none(),
        }
    }
}

/// Key pattern and filters for a list request.
///
/// Empty key fields match everything; `group` and `resource` are required.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListOptions {
    pub key: ResourceKey,
    pub labels: Vec<Requirement>,
    pub folder: Option<String>,
}

impl ListOptions {
    pub fn for_bucket(group: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            key: ResourceKey::new("", group, resource, ""),
            ..Default::default()
        }
    }

    pub(crate) fn has_filters(&self) -> bool {
        !self.labels.is_empty() || self.folder.is_some()
    }

    /// Apply label and folder filters to one item.
    pub(crate) fn matches(&self, item: &ResourceWrapper) -> bool {
        if let Some(folder) = &self.folder {
            if &item.folder != folder {
                return false;
            }
        }
        if self.labels.is_empty() {
            return true;
        }
        let labels = extract_labels(&item.value);
        self.labels.iter().all(|r| r.matches(&labels))
    }
}

fn extract_labels(value: &[u8]) -> BTreeMap<String, String> {
    let Ok(json) = serde_json::from_slice::<serde_json::Value>(value) else {
        return BTreeMap::new();
    };
    json.get("metadata")
        .and_then(|m| m.get("labels"))
        .and_then(|l| l.as_object())
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// A paginated list request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListRequest {
    pub options: ListOptions,
    /// Page size. Values <= 0 use the default.
    pub limit: i64,
    pub resource_version: i64,
    pub next_page_token: String,
    pub source: ListSource,
    pub version_match: VersionMatch,
}

/// One item yielded by a list iterator.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceWrapper {
    pub key: ResourceKey,
    pub value: Vec<u8>,
    pub folder: String,
    pub resource_version: i64,
}

/// One page of list results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListResponse {
    pub items: Vec<ResourceWrapper>,
    pub next_page_token: String,
    pub resource_version: i64,
}

/// Latest history entry of a name changed after a baseline version.
#[derive(Debug, Clone, PartialEq)]
pub struct ModifiedResource {
    pub key: ResourceKey,
    pub event_type: WatchEventType,
    pub value: Vec<u8>,
    pub resource_version: i64,
}

/// Row counts per (namespace, group, resource).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceStats {
    pub namespace: String,
    pub group: String,
    pub resource: String,
    pub count: i64,
    pub resource_version: i64,
}
