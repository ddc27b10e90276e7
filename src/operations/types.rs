use std::fmt;

use serde::{Deserialize, Serialize};

use crate::bookmarks::describe_path;

/// Change to the live store. Paths are title sequences from a root folder and
/// are resolved to ids only when the operation runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "OperationWire", into = "OperationWire")]
pub enum Operation {
    /// Create `title` under `path`; existing segments are reused.
    CreateFolder { path: Vec<String>, title: String },
    Move {
        bookmark_id: String,
        target_path: Vec<String>,
    },
    RenameFolder {
        path: Vec<String>,
        new_title: String,
    },
    RemoveEmptyFolder { path: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    CreateFolder,
    Move,
    RenameFolder,
    RemoveEmptyFolder,
}

impl OperationKind {
    pub const ALL: [OperationKind; 4] = [
        OperationKind::CreateFolder,
        OperationKind::Move,
        OperationKind::RenameFolder,
        OperationKind::RemoveEmptyFolder,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::CreateFolder => "create_folder",
            OperationKind::Move => "move",
            OperationKind::RenameFolder => "rename_folder",
            OperationKind::RemoveEmptyFolder => "remove_empty_folder",
        }
    }

    pub fn from_wire(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }

    pub fn phase(self) -> Phase {
        match self {
            OperationKind::CreateFolder => Phase::Folders,
            OperationKind::Move => Phase::Moves,
            OperationKind::RenameFolder => Phase::Renames,
            OperationKind::RemoveEmptyFolder => Phase::Removals,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Executor phases, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Folders,
    Moves,
    Renames,
    Removals,
}

impl Phase {
    pub const ORDER: [Phase; 4] = [Phase::Folders, Phase::Moves, Phase::Renames, Phase::Removals];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Folders => "folders",
            Phase::Moves => "moves",
            Phase::Renames => "renames",
            Phase::Removals => "removals",
        }
    }

    /// Share of the apply progress band this phase occupies.
    pub fn weight(self) -> f64 {
        match self {
            Phase::Folders => 0.25,
            Phase::Moves => 0.60,
            Phase::Renames => 0.10,
            Phase::Removals => 0.05,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::CreateFolder { .. } => OperationKind::CreateFolder,
            Operation::Move { .. } => OperationKind::Move,
            Operation::RenameFolder { .. } => OperationKind::RenameFolder,
            Operation::RemoveEmptyFolder { .. } => OperationKind::RemoveEmptyFolder,
        }
    }

    pub fn phase(&self) -> Phase {
        self.kind().phase()
    }

    pub fn create_folder(path: Vec<String>, title: impl Into<String>) -> Self {
        Operation::CreateFolder {
            path,
            title: title.into(),
        }
    }

    pub fn move_to(bookmark_id: impl Into<String>, target_path: Vec<String>) -> Self {
        Operation::Move {
            bookmark_id: bookmark_id.into(),
            target_path,
        }
    }

    /// Full path of the folder a `create_folder` produces.
    pub fn created_path(&self) -> Option<Vec<String>> {
        match self {
            Operation::CreateFolder { path, title } => {
                let mut full = path.clone();
                full.push(title.clone());
                Some(full)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::CreateFolder { path, title } => {
                write!(f, "create_folder {} > {title}", describe_path(path))
            }
            Operation::Move {
                bookmark_id,
                target_path,
            } => write!(f, "move {bookmark_id} -> {}", describe_path(target_path)),
            Operation::RenameFolder { path, new_title } => {
                write!(f, "rename_folder {} -> {new_title}", describe_path(path))
            }
            Operation::RemoveEmptyFolder { path } => {
                write!(f, "remove_empty_folder {}", describe_path(path))
            }
        }
    }
}

/// Flat JSON shape shared with the model: `{type, path, title?, bookmarkId?,
/// targetPath?, newTitle?}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationWire {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bookmark_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_path: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_title: Option<String>,
}

fn non_empty_path(path: Option<Vec<String>>) -> Option<Vec<String>> {
    path.filter(|segments| !segments.is_empty())
}

impl TryFrom<OperationWire> for Operation {
    type Error = String;

    fn try_from(wire: OperationWire) -> Result<Self, Self::Error> {
        let kind = OperationKind::from_wire(&wire.kind)
            .ok_or_else(|| format!("Unsupported operation type: {}", wire.kind))?;

        match kind {
            OperationKind::CreateFolder => Ok(Operation::CreateFolder {
                path: non_empty_path(wire.path)
                    .ok_or_else(|| "Operation create_folder has invalid path".to_string())?,
                title: wire
                    .title
                    .filter(|title| !title.is_empty())
                    .ok_or_else(|| "create_folder missing title".to_string())?,
            }),
            OperationKind::Move => {
                let bookmark_id = wire
                    .bookmark_id
                    .filter(|id| !id.is_empty())
                    .ok_or_else(|| "move operation missing bookmarkId".to_string())?;
                let target_path = non_empty_path(wire.target_path)
                    .or_else(|| non_empty_path(wire.path))
                    .ok_or_else(|| "Operation move has invalid targetPath".to_string())?;
                Ok(Operation::Move {
                    bookmark_id,
                    target_path,
                })
            }
            OperationKind::RenameFolder => Ok(Operation::RenameFolder {
                path: non_empty_path(wire.path)
                    .ok_or_else(|| "Operation rename_folder has invalid path".to_string())?,
                new_title: wire
                    .new_title
                    .filter(|title| !title.is_empty())
                    .ok_or_else(|| "rename_folder missing newTitle".to_string())?,
            }),
            OperationKind::RemoveEmptyFolder => Ok(Operation::RemoveEmptyFolder {
                path: non_empty_path(wire.path).ok_or_else(|| {
                    "Operation remove_empty_folder has invalid path".to_string()
                })?,
            }),
        }
    }
}

impl From<Operation> for OperationWire {
    fn from(operation: Operation) -> Self {
        let kind = operation.kind().as_str().to_string();
        match operation {
            Operation::CreateFolder { path, title } => OperationWire {
                kind,
                path: Some(path),
                title: Some(title),
                ..OperationWire::default()
            },
            Operation::Move {
                bookmark_id,
                target_path,
            } => OperationWire {
                kind,
                path: Some(target_path.clone()),
                bookmark_id: Some(bookmark_id),
                target_path: Some(target_path),
                ..OperationWire::default()
            },
            Operation::RenameFolder { path, new_title } => OperationWire {
                kind,
                path: Some(path),
                new_title: Some(new_title),
                ..OperationWire::default()
            },
            Operation::RemoveEmptyFolder { path } => OperationWire {
                kind,
                path: Some(path),
                ..OperationWire::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn move_without_target_path_uses_path() {
        let op: Operation = serde_json::from_value(json!({
            "type": "move",
            "path": ["Development", "Rust"],
            "bookmarkId": "42"
        }))
        .expect("parse move");

        assert_eq!(
            op,
            Operation::move_to("42", vec!["Development".into(), "Rust".into()])
        );
    }

    #[test]
    fn move_serializes_both_path_fields() {
        let value = serde_json::to_value(Operation::move_to("7", vec!["News".into()]))
            .expect("serialize");
        assert_eq!(
            value,
            json!({"type": "move", "path": ["News"], "bookmarkId": "7", "targetPath": ["News"]})
        );
    }

    #[test]
    fn malformed_operations_are_rejected_with_reason() {
        let err = serde_json::from_value::<Operation>(json!({"type": "delete_all", "path": ["x"]}))
            .unwrap_err();
        assert!(err.to_string().contains("Unsupported operation type: delete_all"));

        let err = serde_json::from_value::<Operation>(json!({"type": "rename_folder", "path": ["x"]}))
            .unwrap_err();
        assert!(err.to_string().contains("rename_folder missing newTitle"));
    }

    #[test]
    fn phases_follow_kind() {
        let remove = Operation::RemoveEmptyFolder {
            path: vec!["Old".into()],
        };
        assert_eq!(remove.phase(), Phase::Removals);
        assert_eq!(
            Operation::create_folder(vec!["Bar".into()], "Docs").created_path(),
            Some(vec!["Bar".to_string(), "Docs".to_string()])
        );
        let total: f64 = Phase::ORDER.iter().map(|phase| phase.weight()).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }
}
