use std::collections::{HashMap, HashSet};

use serde::Serialize;

use super::reconcile::PendingFolder;
use crate::bookmarks::BookmarkNode;
use crate::metrics::{extract_statistics, DomainCount};

const TOP_DOMAINS: usize = 20;
const TOP_KEYWORDS: usize = 50;
const MIN_KEYWORD_LEN: usize = 4;

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    "from", "as", "is", "was", "are", "been", "be", "have", "has", "had", "do", "does", "did",
    "will", "would", "should", "could", "may", "might", "can", "this", "that", "these", "those",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExistingFolder {
    pub name: String,
    pub path: Vec<String>,
    pub id: String,
    pub handle: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeywordCount {
    pub word: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NamingPolicy {
    pub max_length: usize,
    pub separator: String,
    pub allow_special_chars: bool,
}

impl Default for NamingPolicy {
    fn default() -> Self {
        Self {
            max_length: 50,
            separator: " - ".to_string(),
            allow_special_chars: false,
        }
    }
}

/// Read-only summary of the whole collection that every batch prompt sees.
/// Updated only by building a new snapshot via `with_created_folders`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalContext {
    pub total_bookmarks: usize,
    pub total_folders: usize,
    pub max_depth: usize,
    pub existing_folders: Vec<ExistingFolder>,
    pub created_folders: Vec<PendingFolder>,
    pub top_domains: Vec<DomainCount>,
    pub keyword_clusters: Vec<KeywordCount>,
    pub empty_folders: Vec<String>,
    pub naming_policy: NamingPolicy,
}

impl GlobalContext {
    pub fn from_tree(tree: &[BookmarkNode]) -> Self {
        let stats = extract_statistics(tree);
        let mut existing_folders = Vec::new();
        collect_folders(tree, &[], &mut existing_folders);

        Self {
            total_bookmarks: stats.total_bookmarks,
            total_folders: stats.total_folders,
            max_depth: stats.max_depth,
            existing_folders,
            created_folders: Vec::new(),
            top_domains: stats.top_domains.into_iter().take(TOP_DOMAINS).collect(),
            keyword_clusters: extract_keywords(tree),
            empty_folders: stats.empty_folders,
            naming_policy: NamingPolicy::default(),
        }
    }

    /// New snapshot with `folders` appended; handles already present are skipped.
    pub fn with_created_folders(&self, folders: &[PendingFolder]) -> Self {
        let mut next = self.clone();
        let mut known: HashSet<String> = next
            .created_folders
            .iter()
            .map(|folder| folder.handle.clone())
            .collect();

        for folder in folders {
            if known.insert(folder.handle.clone()) {
                next.created_folders.push(folder.clone());
            }
        }
        next
    }

    /// Handle of every existing folder mapped to its title path.
    pub fn existing_handles(&self) -> HashMap<String, Vec<String>> {
        self.existing_folders
            .iter()
            .map(|folder| (folder.handle.clone(), folder.path.clone()))
            .collect()
    }
}

/// `h-` followed by a lower-case, dash-separated slug of the path.
pub fn folder_handle(path: &[String]) -> String {
    let mut slug = String::new();
    for ch in path.join(" ").chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-');
    format!("h-{slug}")
}

fn collect_folders(nodes: &[BookmarkNode], path: &[String], out: &mut Vec<ExistingFolder>) {
    for node in nodes.iter().filter(|node| node.is_folder()) {
        // Nameless roots are not addressable by path; their children start the chain.
        if node.title.trim().is_empty() && node.parent_id.is_none() {
            collect_folders(node.children(), path, out);
            continue;
        }

        let mut current = path.to_vec();
        current.push(crate::bookmarks::display_title(&node.title).to_string());
        out.push(ExistingFolder {
            name: current.last().cloned().unwrap_or_default(),
            handle: folder_handle(&current),
            path: current.clone(),
            id: node.id.clone(),
        });
        collect_folders(node.children(), &current, out);
    }
}

/// Most frequent significant title words, ties broken alphabetically.
pub fn extract_keywords(tree: &[BookmarkNode]) -> Vec<KeywordCount> {
    let mut frequency: HashMap<String, usize> = HashMap::new();
    count_words(tree, &mut frequency);

    let mut keywords: Vec<KeywordCount> = frequency
        .into_iter()
        .map(|(word, count)| KeywordCount { word, count })
        .collect();
    keywords.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.word.cmp(&b.word)));
    keywords.truncate(TOP_KEYWORDS);
    keywords
}

fn count_words(nodes: &[BookmarkNode], frequency: &mut HashMap<String, usize>) {
    for node in nodes {
        let cleaned: String = node
            .title
            .to_lowercase()
            .chars()
            .filter(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch.is_whitespace())
            .collect();

        for word in cleaned.split_whitespace() {
            if word.len() >= MIN_KEYWORD_LEN && !STOP_WORDS.contains(&word) {
                *frequency.entry(word.to_string()).or_insert(0) += 1;
            }
        }
        count_words(node.children(), frequency);
    }
}
