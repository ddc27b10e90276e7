use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::bookmarks::BookmarkRecord;
use crate::error::PipelineError;
use crate::operations::validator::check_operation;
use crate::operations::Operation;

/// Folder a batch asked for, addressed by a handle until finalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingFolder {
    pub handle: String,
    #[serde(default)]
    pub path: Vec<String>,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub bookmark_id: String,
    pub folder_handle: String,
}

/// One batch reply after parsing: handle-based assignments plus proposed folders.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchProposal {
    pub assignments: Vec<Assignment>,
    pub pending_folders: Vec<PendingFolder>,
    pub passthrough: Vec<Operation>,
    pub warnings: Vec<String>,
}

impl BatchProposal {
    /// Read `{operations: [{type: "assign", ...}], pendingFolders: [...]}`.
    /// Path-based operations the model emitted directly are kept as they are.
    /// A reply without an `operations` array is rejected; assignments for
    /// bookmarks outside `batch` are dropped with a warning.
    pub fn from_response(response: &Value, batch: &[BookmarkRecord]) -> Result<Self, PipelineError> {
        let Some(operations) = response.get("operations").and_then(Value::as_array) else {
            return Err(PipelineError::InvalidResponse {
                errors: vec!["Missing or invalid operations array".to_string()],
            });
        };

        let batch_ids: HashSet<&str> = batch.iter().map(|record| record.id.as_str()).collect();
        let mut proposal = Self::default();

        for entry in operations {
            if entry.get("type").and_then(Value::as_str) == Some("assign") {
                match serde_json::from_value::<Assignment>(entry.clone()) {
                    Ok(assignment) if batch_ids.contains(assignment.bookmark_id.as_str()) => {
                        proposal.assignments.push(assignment)
                    }
                    Ok(assignment) => proposal.warnings.push(format!(
                        "Skipped assign for bookmark {} outside this chunk",
                        assignment.bookmark_id
                    )),
                    Err(err) => proposal.warnings.push(format!("Skipped assign: {err}")),
                }
                continue;
            }
            match serde_json::from_value::<Operation>(entry.clone()) {
                Ok(operation) => match check_operation(&operation) {
                    Ok(()) => proposal.passthrough.push(operation),
                    Err(reason) => proposal
                        .warnings
                        .push(format!("Skipped operation {operation}: {reason}")),
                },
                Err(err) => proposal.warnings.push(format!("Skipped operation: {err}")),
            }
        }

        let folders = response
            .get("pendingFolders")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for entry in folders {
            match serde_json::from_value::<PendingFolder>(entry.clone()) {
                Ok(folder) if !folder.handle.is_empty() && !normalize_title(&folder.title).is_empty() => {
                    proposal.pending_folders.push(folder)
                }
                Ok(folder) => proposal
                    .warnings
                    .push(format!("Skipped unnamed folder proposal {}", folder.handle)),
                Err(err) => proposal
                    .warnings
                    .push(format!("Skipped folder proposal: {err}")),
            }
        }

        Ok(proposal)
    }
}

/// Everything the batches proposed, in arrival order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Proposal {
    pub assignments: Vec<Assignment>,
    pub pending_folders: Vec<PendingFolder>,
    pub passthrough: Vec<Operation>,
    pub warnings: Vec<String>,
}

impl Proposal {
    pub fn absorb(&mut self, batch: BatchProposal) {
        self.assignments.extend(batch.assignments);
        self.pending_folders.extend(batch.pending_folders);
        self.passthrough.extend(batch.passthrough);
        self.warnings.extend(batch.warnings);
    }
}

/// Lower-case and drop everything except ASCII letters and digits.
pub fn normalize_title(title: &str) -> String {
    title
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|ch| ch.to_ascii_lowercase())
        .collect()
}

fn definition_order(folder: &PendingFolder) -> (String, &[String], &str) {
    (normalize_title(&folder.title), &folder.path, &folder.title)
}

/// Proposal after duplicate folders were merged. Still handle-based.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciledProposal {
    /// Surviving folders, sorted by normalized title.
    pub folders: Vec<PendingFolder>,
    /// Every proposed handle mapped to the surviving handle it merged into.
    pub handle_map: BTreeMap<String, String>,
    pub assignments: Vec<Assignment>,
    pub passthrough: Vec<Operation>,
    pub warnings: Vec<String>,
    pub merged: usize,
}

/// Merge folders whose titles normalize to the same key. The result does not
/// depend on the order in which batches or proposals arrived:
/// a handle proposed more than once keeps its smallest definition, and each
/// title group is represented by its smallest handle.
pub fn reconcile(proposal: Proposal) -> ReconciledProposal {
    let mut definitions: BTreeMap<String, PendingFolder> = BTreeMap::new();
    for folder in proposal.pending_folders {
        let replace = definitions
            .get(&folder.handle)
            .map_or(true, |current| definition_order(&folder) < definition_order(current));
        if replace {
            definitions.insert(folder.handle.clone(), folder);
        }
    }

    // Handles iterate in sorted order, so the first handle seen per key is the smallest.
    let mut groups: BTreeMap<String, String> = BTreeMap::new();
    let mut handle_map = BTreeMap::new();
    for (handle, folder) in &definitions {
        let canonical = groups
            .entry(normalize_title(&folder.title))
            .or_insert_with(|| handle.clone());
        handle_map.insert(handle.clone(), canonical.clone());
    }

    let folders: Vec<PendingFolder> = groups
        .values()
        .filter_map(|handle| definitions.get(handle).cloned())
        .collect();
    let merged = definitions.len() - folders.len();

    ReconciledProposal {
        folders,
        handle_map,
        assignments: proposal.assignments,
        passthrough: proposal.passthrough,
        warnings: proposal.warnings,
        merged,
    }
}

/// Path-based plan ready for validation and execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPlan {
    pub operations: Vec<Operation>,
    pub warnings: Vec<String>,
    pub folders_created: usize,
}

impl ReconciledProposal {
    /// Emit one `create_folder` per surviving folder, then one `move` per
    /// assignment whose handle resolves. `existing` maps handles of folders
    /// already in the store to their paths; folders proposed without a parent
    /// path are placed under `root_path`.
    pub fn finalize(
        self,
        existing: &HashMap<String, Vec<String>>,
        root_path: &[String],
    ) -> ResolvedPlan {
        let mut warnings = self.warnings;
        let mut operations = Vec::with_capacity(self.folders.len() + self.assignments.len());
        let mut targets: HashMap<&str, Vec<String>> = HashMap::new();

        for folder in &self.folders {
            let parent = if folder.path.is_empty() {
                root_path.to_vec()
            } else {
                folder.path.clone()
            };
            let mut target = parent.clone();
            target.push(folder.title.trim().to_string());
            targets.insert(folder.handle.as_str(), target);
            operations.push(Operation::create_folder(parent, folder.title.trim()));
        }
        let folders_created = operations.len();

        let mut moved: HashSet<&str> = HashSet::new();
        let mut unresolved = 0usize;
        for assignment in &self.assignments {
            let target = self
                .handle_map
                .get(&assignment.folder_handle)
                .and_then(|canonical| targets.get(canonical.as_str()))
                .or_else(|| existing.get(&assignment.folder_handle));

            let Some(target) = target else {
                unresolved += 1;
                continue;
            };
            if !moved.insert(assignment.bookmark_id.as_str()) {
                warnings.push(format!(
                    "Bookmark {} assigned more than once; keeping the first",
                    assignment.bookmark_id
                ));
                continue;
            }
            operations.push(Operation::move_to(
                assignment.bookmark_id.clone(),
                target.clone(),
            ));
        }

        if unresolved > 0 {
            warn!(unresolved, "Dropped assignments with unknown folder handles");
            warnings.push(format!(
                "{unresolved} assignments referenced unknown folder handles and were dropped"
            ));
        }

        operations.extend(self.passthrough);

        ResolvedPlan {
            operations,
            warnings,
            folders_created,
        }
    }
}
