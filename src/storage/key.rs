use crate::error::CounterError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One element of a key path. Serializes untagged so a JSON path reads
/// `["Counter", "dummy-id"]` or `["Counter", 42]`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathElement {
    Id(i64),
    Name(String),
}

impl fmt::Display for PathElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathElement::Id(id) => write!(f, "{id}"),
            PathElement::Name(name) => f.write_str(name),
        }
    }
}

impl From<&str> for PathElement {
    fn from(value: &str) -> Self {
        PathElement::Name(value.to_string())
    }
}

impl From<String> for PathElement {
    fn from(value: String) -> Self {
        PathElement::Name(value)
    }
}

impl From<i64> for PathElement {
    fn from(value: i64) -> Self {
        PathElement::Id(value)
    }
}

impl From<i32> for PathElement {
    fn from(value: i32) -> Self {
        PathElement::Id(i64::from(value))
    }
}

/// Key of a stored entity: an optional namespace plus alternating
/// kind / identifier path elements, ancestors first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    namespace: Option<String>,
    path: Vec<PathElement>,
}

impl EntityKey {
    pub fn new(kind: impl Into<String>, id: impl Into<PathElement>) -> Self {
        Self {
            namespace: None,
            path: vec![PathElement::Name(kind.into()), id.into()],
        }
    }

    pub fn from_path(
        namespace: Option<String>,
        path: Vec<PathElement>,
    ) -> Result<Self, CounterError> {
        let key = Self { namespace, path };
        key.validate()?;
        Ok(key)
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn child(mut self, kind: impl Into<String>, id: impl Into<PathElement>) -> Self {
        self.path.push(PathElement::Name(kind.into()));
        self.path.push(id.into());
        self
    }

    pub fn validate(&self) -> Result<(), CounterError> {
        if self.path.is_empty() || self.path.len() % 2 != 0 {
            return Err(CounterError::InvalidKey(format!(
                "key path must hold kind/id pairs, got {} elements",
                self.path.len()
            )));
        }
        for pair in self.path.chunks(2) {
            match &pair[0] {
                PathElement::Name(kind) if !kind.is_empty() => {}
                other => {
                    return Err(CounterError::InvalidKey(format!(
                        "key kind must be a non-empty name, got '{other}'"
                    )));
                }
            }
        }
        if matches!(&self.namespace, Some(ns) if ns.is_empty()) {
            return Err(CounterError::InvalidKey("namespace must not be empty".into()));
        }
        Ok(())
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn path(&self) -> &[PathElement] {
        &self.path
    }

    /// Kind of the innermost path pair.
    pub fn kind(&self) -> &str {
        match self.path.len().checked_sub(2).and_then(|i| self.path.get(i)) {
            Some(PathElement::Name(kind)) => kind,
            _ => "",
        }
    }

    pub fn id(&self) -> Option<&PathElement> {
        self.path.last()
    }

    /// Flattens the key into the string that names its counter shards:
    /// namespace (when set) and every path element joined by '.'.
    pub fn target_key(&self) -> TargetKey {
        let parts = self
            .namespace
            .iter()
            .cloned()
            .chain(self.path.iter().map(PathElement::to_string))
            .collect::<Vec<_>>();
        TargetKey(parts.join("."))
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ns) = &self.namespace {
            write!(f, "{ns}:")?;
        }
        let path = self
            .path
            .iter()
            .map(PathElement::to_string)
            .collect::<Vec<_>>();
        write!(f, "{}", path.join("/"))
    }
}

/// Flattened, stable identity of a counted entity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetKey(String);

impl TargetKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
