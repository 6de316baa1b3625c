//! Change-set model: the structured proposal a child agent sends back.

use serde::{Deserialize, Serialize};

/// One search/replace hunk within a patch operation. The `search` body may be
/// rewritten in place by the validation gate's fuzzy anchor recovery so that
/// apply always works on an exact substring of the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchReplace {
    pub search: String,
    pub replace: String,
}

/// The operation kind and its body. The `operation` field on the wire selects
/// the variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum FileOp {
    /// Create a new file; the target must not exist.
    Create { content: String },
    /// Replace a file's full content; subject to the destructive-update rule.
    Update { content: String },
    /// Apply ordered search/replace hunks; the target must exist.
    Patch { patches: Vec<SearchReplace> },
    /// Remove the file.
    Delete,
}

impl FileOp {
    /// Wire name of the operation kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Update { .. } => "update",
            Self::Patch { .. } => "patch",
            Self::Delete => "delete",
        }
    }
}

/// A single file operation within a change-set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileOperation {
    /// Repo-relative target path.
    pub path: String,
    #[serde(flatten)]
    pub op: FileOp,
}

/// An ordered list of file operations. An empty list is a no-op success, not
/// a failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    #[serde(default)]
    pub operations: Vec<FileOperation>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Paths touched by this change-set, in order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.operations.iter().map(|op| op.path.as_str())
    }
}
