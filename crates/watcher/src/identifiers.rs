//! Newtype domain identifiers.
//!
//! Every domain concept that has an identity is represented as a distinct newtype
//! wrapping a primitive. This prevents accidentally interchanging, for example,
//! the upstream [`ProjectId`] being watched with the [`RepositoryId`] whose
//! pipeline is dispatched, even though both are `"owner/repo"` strings.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Macro for String-wrapped newtypes.
// Generates: struct, new() returning Option<Self>, as_str(), Display.
// ---------------------------------------------------------------------------
macro_rules! string_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier, returning `None` if the value is empty
            /// or whitespace only.
            pub fn new(value: impl Into<String>) -> Option<Self> {
                let v = value.into();
                if v.trim().is_empty() { None } else { Some(Self(v)) }
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Macro for `owner/repo` newtypes.
// Generates: struct, parse() validating the shape, owner(), name(), as_str(),
// Display, FromStr.
// ---------------------------------------------------------------------------
macro_rules! owner_repo_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Parses an `"owner/repo"` identifier.
            ///
            /// Returns `None` unless the value has exactly two non-empty,
            /// whitespace-free segments separated by a single `/`.
            pub fn parse(value: &str) -> Option<Self> {
                let (owner, repo) = value.split_once('/')?;
                let valid = |s: &str| !s.is_empty() && !s.contains('/') && !s.contains(char::is_whitespace);
                if valid(owner) && valid(repo) {
                    Some(Self(value.to_string()))
                } else {
                    None
                }
            }

            /// Returns the owner (user or organisation) segment.
            pub fn owner(&self) -> &str {
                self.0.split_once('/').map(|(o, _)| o).unwrap_or_default()
            }

            /// Returns the repository name segment.
            pub fn name(&self) -> &str {
                self.0.split_once('/').map(|(_, r)| r).unwrap_or_default()
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s).ok_or_else(|| format!("'{s}' is not in owner/repo form"))
            }
        }

        impl TryFrom<String> for $name {
            type Error = String;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Identifiers: repository-backed
// ---------------------------------------------------------------------------

owner_repo_id! {
    /// Identifies the upstream project whose releases are watched.
    ///
    /// Also the key under which the watermark is persisted.
    ProjectId
}

owner_repo_id! {
    /// Identifies the repository hosting the downstream build pipeline.
    RepositoryId
}

// ---------------------------------------------------------------------------
// Identifiers: UUID-backed (internally generated)
// ---------------------------------------------------------------------------

/// Identifies a single watcher run (one invocation of the engine).
///
/// Generated fresh for every CLI invocation; propagated through spans and
/// recorded next to the watermark so that all activity from a single run can
/// be correlated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    /// Generates a new random run identifier.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Identifiers: String-backed (registry / Git names)
// ---------------------------------------------------------------------------

string_id! {
    /// A release tag as reported by the registry (e.g. `"v2.2.0"`).
    ///
    /// Opaque: tags are never parsed or ordered, because tag formats are not
    /// guaranteed to sort in release order.
    ReleaseTag
}

string_id! {
    /// Identifies a workflow within the target repository, either by file
    /// name (`"build.yml"`) or by numeric id.
    WorkflowId
}

string_id! {
    /// A Git ref (branch or tag) the dispatched workflow runs on.
    GitRef
}

string_id! {
    /// Name of the workflow input that receives the release tag.
    InputName
}
