use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{Operation, OperationKind};
use crate::bookmarks::BookmarkRecord;
use crate::error::PipelineError;

const LOW_COVERAGE_PERCENT: f64 = 80.0;
const MAX_CATEGORY_NAME: usize = 60;
const UNCATEGORIZED: &str = "Miscellaneous";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationStats {
    pub total_folders: usize,
    pub total_operations: usize,
    pub risky_operations: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyStats {
    pub total_categories: usize,
    pub total_urls: usize,
    pub duplicate_urls: usize,
    pub coverage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ValidationStats {
    Operations(OperationStats),
    Legacy(LegacyStats),
}

/// Findings for one model response. Validation never fails; callers decide
/// what an invalid report means.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub stats: ValidationStats,
}

impl ValidationReport {
    fn new(stats: ValidationStats) -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            stats,
        }
    }

    fn error(&mut self, message: impl Into<String>) {
        self.is_valid = false;
        self.errors.push(message.into());
    }

    pub fn into_result(self) -> Result<Self, PipelineError> {
        if self.is_valid {
            Ok(self)
        } else {
            Err(PipelineError::InvalidResponse {
                errors: self.errors,
            })
        }
    }
}

/// Parse model text as JSON, tolerating a surrounding Markdown code fence.
pub fn parse_response_json(raw: &str) -> Result<Value, PipelineError> {
    serde_json::from_str(strip_code_fence(raw)).map_err(PipelineError::MalformedJson)
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}

/// Dispatch on shape: a `version` key selects the operation-list checks.
pub fn validate_response(response: &Value, input: &[BookmarkRecord]) -> ValidationReport {
    let Some(object) = response.as_object() else {
        let mut report = ValidationReport::new(ValidationStats::Legacy(LegacyStats::default()));
        report.error("Response is not a valid object");
        return report;
    };

    if object.contains_key("version") {
        validate_operation_list(response, input)
    } else {
        validate_legacy(response, input)
    }
}

pub fn validate_operation_list(response: &Value, input: &[BookmarkRecord]) -> ValidationReport {
    let mut stats = OperationStats::default();
    let mut report = ValidationReport::new(ValidationStats::Operations(OperationStats::default()));

    if !response.get("version").is_some_and(Value::is_string) {
        report.error("Missing or invalid version");
    }

    let Some(operations) = response.get("operations").and_then(Value::as_array) else {
        report.error("Missing or invalid operations array");
        return report;
    };

    let known_ids: HashSet<&str> = input.iter().map(|record| record.id.as_str()).collect();

    for entry in operations {
        let Some(operation) = entry.as_object() else {
            report.error("Invalid operation object");
            continue;
        };

        let type_name = operation.get("type").and_then(Value::as_str);
        let Some(kind) = type_name.and_then(OperationKind::from_wire) else {
            report.error(format!(
                "Unsupported operation type: {}",
                type_name.unwrap_or("undefined")
            ));
            continue;
        };

        let path_field = match kind {
            OperationKind::Move => operation
                .get("path")
                .filter(|value| is_path(value))
                .or_else(|| operation.get("targetPath")),
            _ => operation.get("path"),
        };
        if !path_field.is_some_and(is_path) {
            report.error(format!("Operation {kind} has invalid path"));
            continue;
        }

        match kind {
            OperationKind::CreateFolder => {
                if !is_non_empty_string(operation.get("title")) {
                    report.error("create_folder missing title");
                }
            }
            OperationKind::Move => match operation.get("bookmarkId").and_then(Value::as_str) {
                Some(id) if !id.is_empty() => {
                    if !known_ids.contains(id) {
                        report.warnings.push(format!("Bookmark ID not found: {id}"));
                    }
                }
                _ => report.error("move operation missing bookmarkId"),
            },
            OperationKind::RenameFolder => {
                if !is_non_empty_string(operation.get("newTitle")) {
                    report.error("rename_folder missing newTitle");
                }
            }
            OperationKind::RemoveEmptyFolder => stats.risky_operations += 1,
        }

        stats.total_operations += 1;
    }

    if let Some(folders) = response.get("folders").and_then(Value::as_array) {
        for folder in folders {
            if !folder.get("path").is_some_and(is_path) {
                report.warnings.push("Folder entry has invalid path".to_string());
                continue;
            }
            if folder.get("description").is_some_and(|d| !d.is_string() && !d.is_null()) {
                report
                    .warnings
                    .push("Folder description must be a string".to_string());
            }
            stats.total_folders += 1;
        }
    }

    report.stats = ValidationStats::Operations(stats);
    report
}

pub fn validate_legacy(response: &Value, input: &[BookmarkRecord]) -> ValidationReport {
    let mut stats = LegacyStats::default();
    let mut report = ValidationReport::new(ValidationStats::Legacy(LegacyStats::default()));

    let Some(categories) = response.get("categories").and_then(Value::as_array) else {
        report.error("Missing or invalid categories array");
        return report;
    };

    let input_urls = input_url_set(input);
    let mut seen: HashSet<&str> = HashSet::new();

    for category in categories {
        if !category.is_object() {
            report.error("Invalid category object");
            continue;
        }
        let Some(name) = category
            .get("category")
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
        else {
            report.error("Category is missing name");
            continue;
        };
        let Some(urls) = category.get("urls").and_then(Value::as_array) else {
            report.error(format!("Category \"{name}\" has invalid URLs array"));
            continue;
        };

        let mut accepted = 0;
        for url in urls {
            let Some(url) = url.as_str().filter(|url| !url.trim().is_empty()) else {
                report
                    .warnings
                    .push(format!("Category \"{name}\" contains invalid URL"));
                continue;
            };
            if !input_urls.contains(url) {
                report
                    .warnings
                    .push(format!("URL \"{url}\" not found in input bookmarks"));
                continue;
            }
            if !seen.insert(url) {
                report.warnings.push(format!("Duplicate URL detected: {url}"));
                stats.duplicate_urls += 1;
                continue;
            }
            accepted += 1;
        }

        if accepted == 0 {
            report
                .warnings
                .push(format!("Category \"{name}\" has no valid URLs"));
        }
        stats.total_categories += 1;
        stats.total_urls += accepted;
    }

    if !input.is_empty() {
        stats.coverage = stats.total_urls as f64 / input.len() as f64 * 100.0;
        if stats.coverage < LOW_COVERAGE_PERCENT {
            report.warnings.push(format!(
                "Low coverage: {:.1}% of bookmarks categorized",
                stats.coverage
            ));
        }
    }

    report.stats = ValidationStats::Legacy(stats);
    report
}

/// Validate a typed plan, such as the one assembled from chunk replies.
pub fn validate_operations(operations: &[Operation], input: &[BookmarkRecord]) -> ValidationReport {
    let mut stats = OperationStats::default();
    let mut report = ValidationReport::new(ValidationStats::Operations(OperationStats::default()));
    let known_ids: HashSet<&str> = input.iter().map(|record| record.id.as_str()).collect();

    for operation in operations {
        if let Err(reason) = check_operation(operation) {
            report.error(format!("{reason}: {operation}"));
            continue;
        }
        match operation {
            Operation::CreateFolder { .. } => stats.total_folders += 1,
            Operation::Move { bookmark_id, .. } if !known_ids.contains(bookmark_id.as_str()) => {
                report
                    .warnings
                    .push(format!("Bookmark ID not found: {bookmark_id}"));
            }
            Operation::RemoveEmptyFolder { .. } => stats.risky_operations += 1,
            _ => {}
        }
        stats.total_operations += 1;
    }

    report.stats = ValidationStats::Operations(stats);
    report
}

/// Structural checks for an already typed operation.
pub fn check_operation(operation: &Operation) -> Result<(), String> {
    let path_ok = |path: &[String]| !path.is_empty() && path.iter().all(|s| !s.trim().is_empty());
    match operation {
        Operation::CreateFolder { path, title } => {
            if !path_ok(path) {
                return Err("Invalid path".to_string());
            }
            if title.trim().is_empty() {
                return Err("Invalid title".to_string());
            }
        }
        Operation::Move {
            bookmark_id,
            target_path,
        } => {
            if bookmark_id.trim().is_empty() {
                return Err("Missing bookmarkId".to_string());
            }
            if !path_ok(target_path) {
                return Err("Invalid targetPath".to_string());
            }
        }
        Operation::RenameFolder { path, new_title } => {
            if !path_ok(path) {
                return Err("Invalid path".to_string());
            }
            if new_title.trim().is_empty() {
                return Err("Invalid newTitle".to_string());
            }
        }
        Operation::RemoveEmptyFolder { path } => {
            if !path_ok(path) {
                return Err("Invalid path".to_string());
            }
        }
    }
    Ok(())
}

/// Entries of `response.operations` that could not be typed, by index.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedOperations {
    pub operations: Vec<Operation>,
    pub rejected: Vec<String>,
}

pub fn parse_operations(response: &Value) -> ParsedOperations {
    let mut parsed = ParsedOperations {
        operations: Vec::new(),
        rejected: Vec::new(),
    };

    let entries = response
        .get("operations")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    for (index, entry) in entries.iter().enumerate() {
        match serde_json::from_value::<Operation>(entry.clone()) {
            Ok(operation) => parsed.operations.push(operation),
            Err(err) => parsed.rejected.push(format!("operation {index}: {err}")),
        }
    }

    parsed
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyCategory {
    pub category: String,
    pub urls: Vec<String>,
}

/// `{categories: [{category, urls}]}` response shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyPlan {
    pub categories: Vec<LegacyCategory>,
}

impl LegacyPlan {
    /// One folder per category under `root_path`, then one move per bookmark
    /// whose URL the category lists.
    pub fn into_operations(self, bookmarks: &[BookmarkRecord], root_path: &[String]) -> Vec<Operation> {
        let mut operations = Vec::new();
        let mut created = BTreeSet::new();
        let mut moves = Vec::new();

        for category in self.categories {
            if created.insert(category.category.clone()) {
                operations.push(Operation::create_folder(
                    root_path.to_vec(),
                    category.category.clone(),
                ));
            }

            let mut target = root_path.to_vec();
            target.push(category.category);
            let urls: HashSet<&str> = category.urls.iter().map(String::as_str).collect();

            moves.extend(
                bookmarks
                    .iter()
                    .filter(|record| urls.contains(record.url.as_str()))
                    .map(|record| Operation::move_to(record.id.clone(), target.clone())),
            );
        }

        operations.extend(moves);
        operations
    }
}

/// Rebuild a legacy response keeping only known, first-seen URLs; the rest of
/// the input lands in "Miscellaneous". Operation lists are not repairable.
pub fn repair_legacy(response: &Value, input: &[BookmarkRecord]) -> Option<LegacyPlan> {
    let object = response.as_object()?;
    if object.contains_key("version") {
        return None;
    }
    let categories = object.get("categories")?.as_array()?;

    let input_urls = input_url_set(input);
    let mut seen: HashSet<String> = HashSet::new();
    let mut repaired = Vec::new();

    for category in categories {
        let Some(urls) = category.get("urls").and_then(Value::as_array) else {
            continue;
        };
        let name = sanitize_category_name(
            category
                .get("category")
                .and_then(Value::as_str)
                .unwrap_or_default(),
        );

        let kept: Vec<String> = urls
            .iter()
            .filter_map(Value::as_str)
            .filter(|url| input_urls.contains(url))
            .filter(|url| seen.insert(url.to_string()))
            .map(str::to_string)
            .collect();

        if !kept.is_empty() {
            repaired.push(LegacyCategory {
                category: name,
                urls: kept,
            });
        }
    }

    let mut uncategorized: Vec<String> = Vec::new();
    for record in input {
        if seen.insert(record.url.clone()) {
            uncategorized.push(record.url.clone());
        }
    }
    if !uncategorized.is_empty() {
        repaired.push(LegacyCategory {
            category: UNCATEGORIZED.to_string(),
            urls: uncategorized,
        });
    }

    Some(LegacyPlan {
        categories: repaired,
    })
}

/// Collapse whitespace, cap at 60 characters, and fall back to "Untitled".
pub fn sanitize_category_name(name: &str) -> String {
    let collapsed = name.split_whitespace().collect::<Vec<_>>().join(" ");
    let capped: String = collapsed.chars().take(MAX_CATEGORY_NAME).collect();
    let trimmed = capped.trim();
    if trimmed.is_empty() {
        crate::bookmarks::types::UNTITLED.to_string()
    } else {
        trimmed.to_string()
    }
}

fn input_url_set(input: &[BookmarkRecord]) -> HashSet<&str> {
    input.iter().map(|record| record.url.as_str()).collect()
}

fn is_path(value: &Value) -> bool {
    value
        .as_array()
        .is_some_and(|segments| !segments.is_empty() && segments.iter().all(Value::is_string))
}

fn is_non_empty_string(value: Option<&Value>) -> bool {
    value
        .and_then(Value::as_str)
        .is_some_and(|text| !text.is_empty())
}
