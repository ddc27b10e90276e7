use std::collections::BTreeSet;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use super::types::{Operation, Phase};
use super::validator::check_operation;
use crate::bookmarks::{
    create_folder_path, describe_path, find_folder_by_path, is_folder_empty, SharedBookmarkStore,
    StoreError,
};
use crate::pipeline::progress::CancellationFlag;

const DEFAULT_PAUSE_EVERY: usize = 50;
const DEFAULT_PAUSE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseProgress {
    pub phase: Phase,
    pub current: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PhaseTally {
    pub successful: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PhaseTallies {
    pub folders: PhaseTally,
    pub moves: PhaseTally,
    pub renames: PhaseTally,
    pub removals: PhaseTally,
}

impl PhaseTallies {
    pub fn get(&self, phase: Phase) -> PhaseTally {
        match phase {
            Phase::Folders => self.folders,
            Phase::Moves => self.moves,
            Phase::Renames => self.renames,
            Phase::Removals => self.removals,
        }
    }

    fn get_mut(&mut self, phase: Phase) -> &mut PhaseTally {
        match phase {
            Phase::Folders => &mut self.folders,
            Phase::Moves => &mut self.moves,
            Phase::Renames => &mut self.renames,
            Phase::Removals => &mut self.removals,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationFailure {
    pub operation: Operation,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub successful: usize,
    pub failed: usize,
    pub errors: Vec<OperationFailure>,
    pub phases: PhaseTallies,
    /// Set when cancellation stopped the run before a phase started.
    pub cancelled: bool,
}

impl ExecutionResult {
    fn record(&mut self, phase: Phase, operation: &Operation, outcome: Result<(), StoreError>) {
        let tally = self.phases.get_mut(phase);
        match outcome {
            Ok(()) => {
                tally.successful += 1;
                self.successful += 1;
            }
            Err(err) => {
                tally.failed += 1;
                self.failed += 1;
                warn!(operation = %operation, error = %err, "Operation failed");
                self.errors.push(OperationFailure {
                    operation: operation.clone(),
                    error: err.to_string(),
                });
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DryRunFinding {
    pub index: usize,
    pub operation: Operation,
    pub message: String,
}

/// Outcome of checking a plan against the live store without touching it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DryRunReport {
    pub valid: usize,
    pub invalid: usize,
    pub warnings: Vec<DryRunFinding>,
    pub errors: Vec<DryRunFinding>,
}

impl DryRunReport {
    /// Drop the operations that failed, keeping the original order.
    pub fn retain_valid(&self, operations: Vec<Operation>) -> Vec<Operation> {
        let rejected: BTreeSet<usize> = self.errors.iter().map(|finding| finding.index).collect();
        operations
            .into_iter()
            .enumerate()
            .filter(|(index, _)| !rejected.contains(index))
            .map(|(_, operation)| operation)
            .collect()
    }
}

enum Check {
    Ok,
    Warning(String),
    Error(String),
}

/// Applies operations phase by phase: folders, moves, renames, removals.
/// A failed operation is recorded and the phase continues.
pub struct OperationExecutor {
    store: SharedBookmarkStore,
    pause_every: usize,
    pause: Duration,
    cancel: CancellationFlag,
}

impl OperationExecutor {
    pub fn new(store: SharedBookmarkStore) -> Self {
        Self {
            store,
            pause_every: DEFAULT_PAUSE_EVERY,
            pause: DEFAULT_PAUSE,
            cancel: CancellationFlag::default(),
        }
    }

    pub fn with_pause(mut self, every: usize, pause: Duration) -> Self {
        self.pause_every = every;
        self.pause = pause;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    #[instrument(skip_all, fields(operations = operations.len()))]
    pub async fn execute(
        &self,
        operations: &[Operation],
        on_progress: &(dyn Fn(PhaseProgress) + Send + Sync),
    ) -> ExecutionResult {
        let mut result = ExecutionResult::default();

        for phase in Phase::ORDER {
            if self.cancel.is_cancelled() {
                warn!(%phase, "Cancelled before phase; remaining operations skipped");
                result.cancelled = true;
                break;
            }

            let batch: Vec<&Operation> = operations
                .iter()
                .filter(|operation| operation.phase() == phase)
                .collect();
            if batch.is_empty() {
                continue;
            }

            let total = batch.len();
            debug!(%phase, total, "Starting phase");
            on_progress(PhaseProgress {
                phase,
                current: 0,
                total,
            });

            for (index, operation) in batch.into_iter().enumerate() {
                let outcome = self.apply(operation).await;
                result.record(phase, operation, outcome);
                on_progress(PhaseProgress {
                    phase,
                    current: index + 1,
                    total,
                });

                if phase == Phase::Moves
                    && self.pause_every > 0
                    && index > 0
                    && index % self.pause_every == 0
                    && !self.pause.is_zero()
                {
                    tokio::time::sleep(self.pause).await;
                }
            }
        }

        info!(
            successful = result.successful,
            failed = result.failed,
            cancelled = result.cancelled,
            "Operations applied"
        );
        result
    }

    async fn apply(&self, operation: &Operation) -> Result<(), StoreError> {
        let store = self.store.as_ref();
        match operation {
            Operation::CreateFolder { .. } => {
                let full = operation.created_path().unwrap_or_default();
                create_folder_path(store, &full).await.map(|_| ())
            }
            Operation::Move {
                bookmark_id,
                target_path,
            } => {
                let folder_id = match find_folder_by_path(store, target_path).await? {
                    Some(folder) => folder.id,
                    None => create_folder_path(store, target_path).await?,
                };
                store.move_node(bookmark_id, &folder_id).await
            }
            Operation::RenameFolder { path, new_title } => {
                let folder = find_folder_by_path(store, path)
                    .await?
                    .ok_or_else(|| StoreError::FolderNotFound(describe_path(path)))?;
                store.rename(&folder.id, new_title).await
            }
            Operation::RemoveEmptyFolder { path } => {
                let Some(folder) = find_folder_by_path(store, path).await? else {
                    return Ok(());
                };
                if is_folder_empty(store, &folder.id).await? {
                    store.remove(&folder.id).await
                } else {
                    Err(StoreError::NotEmpty(describe_path(path)))
                }
            }
        }
    }

    /// Structural and live-store checks; never mutates the store.
    #[instrument(skip_all, fields(operations = operations.len()))]
    pub async fn dry_run(&self, operations: &[Operation]) -> DryRunReport {
        let mut report = DryRunReport::default();

        for (index, operation) in operations.iter().enumerate() {
            let finding = |message: String| DryRunFinding {
                index,
                operation: operation.clone(),
                message,
            };

            match self.check(operation).await {
                Check::Ok => report.valid += 1,
                Check::Warning(message) => {
                    report.valid += 1;
                    report.warnings.push(finding(message));
                }
                Check::Error(message) => {
                    report.invalid += 1;
                    report.errors.push(finding(message));
                }
            }
        }

        debug!(
            valid = report.valid,
            invalid = report.invalid,
            warnings = report.warnings.len(),
            "Dry run finished"
        );
        report
    }

    async fn check(&self, operation: &Operation) -> Check {
        if let Err(message) = check_operation(operation) {
            return Check::Error(message);
        }

        let store = self.store.as_ref();
        match operation {
            Operation::Move { bookmark_id, .. } => match store.get(bookmark_id).await {
                Ok(_) => Check::Ok,
                Err(StoreError::NotFound(_)) => {
                    Check::Warning(format!("Bookmark not found: {bookmark_id}"))
                }
                Err(err) => Check::Error(err.to_string()),
            },
            Operation::RenameFolder { path, .. } => match find_folder_by_path(store, path).await {
                Ok(Some(_)) => Check::Ok,
                Ok(None) => Check::Error(format!("Folder not found: {}", describe_path(path))),
                Err(err) => Check::Error(err.to_string()),
            },
            Operation::CreateFolder { .. } | Operation::RemoveEmptyFolder { .. } => Check::Ok,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::bookmarks::{BookmarkNode, BookmarkStore, InMemoryBookmarkStore};

    fn path(segments: &[&str]) -> Vec<String> {
        segments.iter().map(|s| s.to_string()).collect()
    }

    fn fixture() -> Arc<InMemoryBookmarkStore> {
        Arc::new(InMemoryBookmarkStore::from_tree(vec![BookmarkNode::folder(
            "0",
            "",
            vec![
                BookmarkNode::folder(
                    "1",
                    "Bookmarks bar",
                    vec![
                        BookmarkNode::bookmark("10", "Rust", "https://www.rust-lang.org"),
                        BookmarkNode::bookmark("11", "Tokio", "https://tokio.rs"),
                    ],
                ),
                BookmarkNode::folder(
                    "2",
                    "Other bookmarks",
                    vec![
                        BookmarkNode::folder("3", "Old", vec![]),
                        BookmarkNode::folder(
                            "4",
                            "Keep",
                            vec![BookmarkNode::bookmark("12", "Serde", "https://serde.rs")],
                        ),
                    ],
                ),
            ],
        )]))
    }

    fn executor(store: &Arc<InMemoryBookmarkStore>) -> OperationExecutor {
        let shared: SharedBookmarkStore = store.clone();
        OperationExecutor::new(shared).with_pause(50, Duration::ZERO)
    }

    fn no_progress(_: PhaseProgress) {}

    #[tokio::test]
    async fn phases_run_in_order_regardless_of_input_order() {
        let store = fixture();
        let operations = vec![
            Operation::RemoveEmptyFolder {
                path: path(&["Keep"]),
            },
            Operation::RenameFolder {
                path: path(&["Bookmarks bar", "Dev"]),
                new_title: "Development".to_string(),
            },
            Operation::move_to("12", path(&["Bookmarks bar", "Dev"])),
            Operation::create_folder(path(&["Bookmarks bar"]), "Dev"),
        ];

        let seen = Mutex::new(Vec::new());
        let record = |progress: PhaseProgress| {
            seen.lock().expect("progress lock").push(progress);
        };
        let result = executor(&store).execute(&operations, &record).await;

        assert_eq!(result.failed, 0, "{:?}", result.errors);
        assert_eq!(result.successful, 4);

        let seen = seen.into_inner().expect("progress lock");
        let phases: Vec<Phase> = seen.iter().map(|p| p.phase).collect();
        let mut sorted = phases.clone();
        sorted.sort();
        assert_eq!(phases, sorted);
        assert_eq!(seen.first().map(|p| p.current), Some(0));
        assert_eq!(seen.len(), 8);

        let renamed = find_folder_by_path(store.as_ref(), &path(&["Bookmarks bar", "Development"]))
            .await
            .expect("lookup")
            .expect("renamed folder");
        assert_eq!(store.parent_of("12"), Some(renamed.id));
        assert!(store.get("4").await.is_err(), "emptied folder removed");
    }

    #[tokio::test]
    async fn dry_run_then_apply_round_trip() {
        let store = fixture();
        let operations = vec![
            Operation::create_folder(path(&["Bookmarks bar"]), "Languages"),
            Operation::move_to("10", path(&["Bookmarks bar", "Languages"])),
            Operation::move_to("11", path(&["Bookmarks bar", "Async"])),
            Operation::RemoveEmptyFolder {
                path: path(&["Old"]),
            },
        ];
        let executor = executor(&store);
        let before = store.node_count();

        let report = executor.dry_run(&operations).await;
        assert_eq!(report.valid, 4);
        assert_eq!(report.invalid, 0);
        assert!(report.warnings.is_empty());
        assert_eq!(store.node_count(), before, "dry run must not mutate");

        let result = executor.execute(&operations, &no_progress).await;
        assert_eq!(result.successful, 4);
        assert_eq!(result.phases.moves.successful, 2);

        let languages = find_folder_by_path(store.as_ref(), &path(&["Bookmarks bar", "Languages"]))
            .await
            .expect("lookup")
            .expect("created");
        assert_eq!(store.parent_of("10"), Some(languages.id));
        assert!(find_folder_by_path(store.as_ref(), &path(&["Bookmarks bar", "Async"]))
            .await
            .expect("lookup")
            .is_some());
        assert!(store.get("3").await.is_err());
    }

    #[tokio::test]
    async fn missing_bookmark_warns_in_dry_run_and_fails_once_on_apply() {
        let store = fixture();
        let operations = vec![
            Operation::move_to("10", path(&["Bookmarks bar", "Docs"])),
            Operation::move_to("404", path(&["Bookmarks bar", "Docs"])),
        ];
        let executor = executor(&store);

        let report = executor.dry_run(&operations).await;
        assert_eq!(report.valid, 2);
        assert_eq!(report.invalid, 0);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].message, "Bookmark not found: 404");

        let result = executor.execute(&operations, &no_progress).await;
        assert_eq!(result.successful, 1);
        assert_eq!(result.failed, 1);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].operation, operations[1]);
    }

    #[tokio::test]
    async fn folder_creation_is_idempotent() {
        let store = fixture();
        let operations = vec![
            Operation::create_folder(path(&["Bookmarks bar", "Dev"]), "Rust"),
            Operation::create_folder(path(&["Bookmarks bar", "Dev"]), "Rust"),
        ];
        let executor = executor(&store);

        let first = executor.execute(&operations, &no_progress).await;
        let count = store.node_count();
        let second = executor.execute(&operations, &no_progress).await;

        assert_eq!(first.successful, 2);
        assert_eq!(second.successful, 2);
        assert_eq!(store.node_count(), count);
        let dev = find_folder_by_path(store.as_ref(), &path(&["Bookmarks bar", "Dev"]))
            .await
            .expect("lookup")
            .expect("dev");
        assert_eq!(store.get_children(&dev.id).await.expect("children").len(), 1);
    }

    #[tokio::test]
    async fn rename_and_remove_edge_cases() {
        let store = fixture();
        let operations = vec![
            Operation::RenameFolder {
                path: path(&["Nowhere"]),
                new_title: "Somewhere".to_string(),
            },
            Operation::RemoveEmptyFolder {
                path: path(&["Gone"]),
            },
            Operation::RemoveEmptyFolder {
                path: path(&["Keep"]),
            },
        ];
        let executor = executor(&store);

        let report = executor.dry_run(&operations).await;
        assert_eq!(report.invalid, 1);
        assert_eq!(report.errors[0].message, "Folder not found: Nowhere");
        assert_eq!(report.retain_valid(operations.clone()).len(), 2);

        let result = executor.execute(&operations, &no_progress).await;
        assert_eq!(result.phases.renames.failed, 1);
        assert_eq!(result.phases.removals, PhaseTally { successful: 1, failed: 1 });
        assert_eq!(result.errors[1].error, "Folder not empty: Keep");
    }

    #[tokio::test]
    async fn cancellation_stops_before_the_next_phase() {
        let store = fixture();
        let cancel = CancellationFlag::new();
        let shared: SharedBookmarkStore = store.clone();
        let executor = OperationExecutor::new(shared).with_cancellation(cancel.clone());
        let operations = vec![
            Operation::create_folder(path(&["Bookmarks bar"]), "Dev"),
            Operation::move_to("10", path(&["Bookmarks bar", "Dev"])),
        ];

        let on_progress = |progress: PhaseProgress| {
            if progress.phase == Phase::Folders && progress.current == progress.total {
                cancel.cancel();
            }
        };
        let result = executor.execute(&operations, &on_progress).await;

        assert!(result.cancelled);
        assert_eq!(result.phases.folders.successful, 1);
        assert_eq!(result.phases.moves, PhaseTally::default());
        assert_eq!(store.parent_of("10").as_deref(), Some("1"));
    }
}
