use std::collections::{BTreeMap, HashMap};
use std::io;

use reqwest::Url;
use serde::Serialize;
use tracing::warn;

use crate::bookmarks::{display_title, flatten_bookmarks, BookmarkNode};
use crate::compression;
use crate::error::PipelineError;
use crate::models::{ModelRegistry, ModelSpec, Thresholds, Tier};

const BYTES_PER_TOKEN: u64 = 4;
const FALLBACK_GZIP_RATIO: f64 = 0.3;
const TOP_DOMAIN_LIMIT: usize = 20;

/// Size facts derived once per run from the full tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    pub bookmark_count: u64,
    pub raw_bytes: u64,
    pub estimated_tokens: u64,
    pub gzip_bytes: u64,
    pub tier: Tier,
    pub compression_estimated: bool,
    pub compression_ratio: f64,
    pub avg_bytes_per_bookmark: f64,
}

impl Metrics {
    pub fn raw_kb(&self) -> f64 {
        self.raw_bytes as f64 / 1024.0
    }

    pub fn gzip_kb(&self) -> f64 {
        self.gzip_bytes as f64 / 1024.0
    }
}

pub fn estimate_tokens(raw_bytes: u64) -> u64 {
    raw_bytes.div_ceil(BYTES_PER_TOKEN)
}

pub fn compute_metrics(
    tree: &[BookmarkNode],
    registry: &ModelRegistry,
) -> Result<Metrics, PipelineError> {
    let bookmark_count = flatten_bookmarks(tree).len() as u64;
    let serialized = serde_json::to_vec(tree).map_err(PipelineError::Serialization)?;
    let gzip = compression::gzip_len(&serialized);

    Ok(metrics_from_parts(
        bookmark_count,
        serialized.len() as u64,
        gzip,
        registry,
    ))
}

fn metrics_from_parts(
    bookmark_count: u64,
    raw_bytes: u64,
    gzip: io::Result<u64>,
    registry: &ModelRegistry,
) -> Metrics {
    let estimated_tokens = estimate_tokens(raw_bytes);
    let (gzip_bytes, compression_estimated) = match gzip {
        Ok(bytes) => (bytes, false),
        Err(err) => {
            warn!(?err, "Gzip sizing failed; estimating compressed size at 30% of raw");
            ((raw_bytes as f64 * FALLBACK_GZIP_RATIO).ceil() as u64, true)
        }
    };

    let tier = registry.classify(bookmark_count, estimated_tokens, gzip_bytes);

    Metrics {
        bookmark_count,
        raw_bytes,
        estimated_tokens,
        gzip_bytes,
        tier,
        compression_estimated,
        compression_ratio: if raw_bytes > 0 {
            gzip_bytes as f64 / raw_bytes as f64
        } else {
            0.0
        },
        avg_bytes_per_bookmark: if bookmark_count > 0 {
            raw_bytes as f64 / bookmark_count as f64
        } else {
            0.0
        },
    }
}

/// Single-shot is viable when the compressed payload fits under the ceiling and
/// the token estimate leaves headroom for the prompt scaffolding and the reply.
pub fn can_use_single_shot(metrics: &Metrics, model: &ModelSpec, thresholds: &Thresholds) -> bool {
    let token_budget = model.context_window as f64 * thresholds.safety_margin;
    metrics.gzip_bytes <= thresholds.single_shot_max_gzip_bytes
        && (metrics.estimated_tokens as f64) <= token_budget
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainCount {
    pub domain: String,
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeStatistics {
    pub total_folders: usize,
    pub total_bookmarks: usize,
    pub max_depth: usize,
    pub domain_frequency: HashMap<String, usize>,
    pub folder_sizes: BTreeMap<String, usize>,
    pub empty_folders: Vec<String>,
    pub top_domains: Vec<DomainCount>,
}

pub fn url_domain(url: &str) -> Option<String> {
    Url::parse(url.trim())
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_string))
}

pub fn extract_statistics(tree: &[BookmarkNode]) -> TreeStatistics {
    let mut stats = TreeStatistics::default();
    walk_statistics(tree, 0, &mut Vec::new(), &mut stats);

    let mut domains: Vec<DomainCount> = stats
        .domain_frequency
        .iter()
        .map(|(domain, count)| DomainCount {
            domain: domain.clone(),
            count: *count,
        })
        .collect();
    domains.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.domain.cmp(&b.domain)));
    domains.truncate(TOP_DOMAIN_LIMIT);
    stats.top_domains = domains;

    stats
}

fn walk_statistics(
    nodes: &[BookmarkNode],
    depth: usize,
    path: &mut Vec<String>,
    stats: &mut TreeStatistics,
) {
    stats.max_depth = stats.max_depth.max(depth);

    for node in nodes {
        if let Some(url) = &node.url {
            stats.total_bookmarks += 1;
            if let Some(domain) = url_domain(url) {
                *stats.domain_frequency.entry(domain).or_insert(0) += 1;
            }
        } else if node.children.is_some() {
            stats.total_folders += 1;
            path.push(display_title(&node.title).to_string());

            let key = path.join(" > ");
            let size = count_bookmarks(node);
            if size == 0 {
                stats.empty_folders.push(key.clone());
            }
            stats.folder_sizes.insert(key, size);

            walk_statistics(node.children(), depth + 1, path, stats);
            path.pop();
        }
    }
}

fn count_bookmarks(node: &BookmarkNode) -> usize {
    if node.url.is_some() {
        return 1;
    }
    node.children().iter().map(count_bookmarks).sum()
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::bookmarks::BookmarkNode;

    /// Browser-shaped tree with `count` bookmarks spread over a few folders.
    pub fn synthetic_tree(count: usize) -> Vec<BookmarkNode> {
        let hosts = ["github.com", "docs.rs", "news.ycombinator.com", "youtube.com"];
        let bookmarks: Vec<BookmarkNode> = (0..count)
            .map(|i| {
                let mut node = BookmarkNode::bookmark(
                    format!("{}", 1_000 + i),
                    format!(
                        "Reference article number {i} about distributed systems, practical tooling and field notes for engineers"
                    ),
                    format!("https://{}/articles/{i}/overview", hosts[i % hosts.len()]),
                );
                node.date_added = Some(1_700_000_000_000 + i as i64);
                node
            })
            .collect();

        vec![BookmarkNode::folder(
            "0",
            "",
            vec![
                BookmarkNode::folder("1", "Bookmarks bar", bookmarks),
                BookmarkNode::folder("2", "Other bookmarks", vec![]),
            ],
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::synthetic_tree;
    use super::*;

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(0), 0);
        assert_eq!(estimate_tokens(1), 1);
        assert_eq!(estimate_tokens(8), 2);
        assert_eq!(estimate_tokens(9), 3);
    }

    #[test]
    fn metrics_are_deterministic() {
        let registry = ModelRegistry::builtin();
        let tree = synthetic_tree(120);
        let first = compute_metrics(&tree, &registry).expect("metrics");
        let second = compute_metrics(&tree, &registry).expect("metrics");

        assert_eq!(first, second);
        assert_eq!(first.bookmark_count, 120);
        assert_eq!(first.estimated_tokens, first.raw_bytes.div_ceil(4));
        assert!(!first.compression_estimated);
        assert!(first.gzip_bytes < first.raw_bytes);
        assert_eq!(first.tier, Tier::T1);
    }

    #[test]
    fn failed_compression_falls_back_to_thirty_percent() {
        let registry = ModelRegistry::builtin();
        let failure = io::Error::new(io::ErrorKind::Other, "no encoder");
        let metrics = metrics_from_parts(10, 1_001, Err(failure), &registry);

        assert!(metrics.compression_estimated);
        assert_eq!(metrics.gzip_bytes, 301);
    }

    #[test]
    fn single_shot_viability_is_monotonic_in_collection_size() {
        let registry = ModelRegistry::builtin();
        let model = registry.model("gpt-4o").expect("model");
        let mut seen_false = false;

        for count in [10, 200, 600, 900, 1_200, 2_000, 3_000] {
            let metrics = compute_metrics(&synthetic_tree(count), &registry).expect("metrics");
            let viable = can_use_single_shot(&metrics, model, &registry.thresholds);
            assert!(
                !(seen_false && viable),
                "viability flipped back to true at {count} bookmarks"
            );
            seen_false |= !viable;
        }
        assert!(seen_false, "largest collection should exceed the token budget");
    }

    #[test]
    fn smaller_context_window_rejects_single_shot_sooner() {
        let registry = ModelRegistry::builtin();
        let metrics = compute_metrics(&synthetic_tree(400), &registry).expect("metrics");

        let large = registry.model("gpt-4o").expect("model");
        let small = registry.model("gpt-3.5-turbo").expect("model");
        assert!(can_use_single_shot(&metrics, large, &registry.thresholds));
        assert!(!can_use_single_shot(&metrics, small, &registry.thresholds));
    }

    #[test]
    fn statistics_rank_domains_and_track_empty_folders() {
        let stats = extract_statistics(&synthetic_tree(10));

        assert_eq!(stats.total_bookmarks, 10);
        assert_eq!(stats.total_folders, 3);
        assert_eq!(stats.max_depth, 2);
        assert_eq!(stats.top_domains[0].domain, "docs.rs");
        assert_eq!(stats.top_domains[0].count, 3);
        assert_eq!(stats.empty_folders, vec!["Untitled > Other bookmarks".to_string()]);
        assert_eq!(stats.folder_sizes["Untitled > Bookmarks bar"], 10);
    }
}
