use std::sync::Arc;

use async_trait::async_trait;

use super::types::BookmarkNode;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Node not found: {0}")]
    NotFound(String),

    #[error("Folder not found: {0}")]
    FolderNotFound(String),

    #[error("Node {0} is not a folder")]
    NotAFolder(String),

    #[error("Folder not empty: {0}")]
    NotEmpty(String),

    #[error("Cannot move {id} into its own subtree")]
    Cycle { id: String },

    #[error("Root node {0} cannot be modified")]
    RootNode(String),

    #[error("Cannot resolve an empty folder path")]
    EmptyPath,

    #[error("Store IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Backend(String),
}

/// Raw CRUD surface of the live bookmark store.
#[async_trait]
pub trait BookmarkStore: Send + Sync {
    async fn get_tree(&self) -> Result<Vec<BookmarkNode>, StoreError>;
    async fn get(&self, id: &str) -> Result<BookmarkNode, StoreError>;
    async fn get_children(&self, id: &str) -> Result<Vec<BookmarkNode>, StoreError>;
    async fn create_folder(&self, parent_id: &str, title: &str)
        -> Result<BookmarkNode, StoreError>;
    async fn move_node(&self, id: &str, new_parent_id: &str) -> Result<(), StoreError>;
    async fn rename(&self, id: &str, new_title: &str) -> Result<(), StoreError>;
    async fn remove(&self, id: &str) -> Result<(), StoreError>;

    /// Folder that receives newly created top-level folder chains.
    fn default_parent_id(&self) -> String {
        "1".to_string()
    }
}

pub type SharedBookmarkStore = Arc<dyn BookmarkStore>;

pub fn describe_path(path: &[String]) -> String {
    path.join(" > ")
}

/// Resolve a folder by title path. The first segment may match a folder at any
/// depth (first hit in depth-first order); later segments must be direct children.
pub async fn find_folder_by_path(
    store: &dyn BookmarkStore,
    path: &[String],
) -> Result<Option<BookmarkNode>, StoreError> {
    let Some((first, rest)) = path.split_first() else {
        return Ok(None);
    };

    let tree = store.get_tree().await?;
    let Some(mut current) = find_folder_anywhere(&tree, first) else {
        return Ok(None);
    };

    for segment in rest {
        match child_folder(current, segment) {
            Some(next) => current = next,
            None => return Ok(None),
        }
    }

    Ok(Some(current.shallow()))
}

/// Create every missing segment of `path` and return the id of the final folder.
/// Existing segments are reused, so repeated calls never duplicate a chain.
pub async fn create_folder_path(
    store: &dyn BookmarkStore,
    path: &[String],
) -> Result<String, StoreError> {
    let Some((first, rest)) = path.split_first() else {
        return Err(StoreError::EmptyPath);
    };

    let tree = store.get_tree().await?;
    let mut parent_id = match find_folder_anywhere(&tree, first) {
        Some(existing) => existing.id.clone(),
        None => {
            store
                .create_folder(&store.default_parent_id(), first)
                .await?
                .id
        }
    };

    for segment in rest {
        let children = store.get_children(&parent_id).await?;
        let existing = children
            .iter()
            .find(|child| child.url.is_none() && child.title == *segment);

        parent_id = match existing {
            Some(folder) => folder.id.clone(),
            None => store.create_folder(&parent_id, segment).await?.id,
        };
    }

    Ok(parent_id)
}

pub async fn is_folder_empty(store: &dyn BookmarkStore, id: &str) -> Result<bool, StoreError> {
    Ok(store.get_children(id).await?.is_empty())
}

fn find_folder_anywhere<'a>(nodes: &'a [BookmarkNode], title: &str) -> Option<&'a BookmarkNode> {
    for node in nodes {
        if node.url.is_none() && node.title == title {
            return Some(node);
        }
        if let Some(found) = find_folder_anywhere(node.children(), title) {
            return Some(found);
        }
    }
    None
}

fn child_folder<'a>(node: &'a BookmarkNode, title: &str) -> Option<&'a BookmarkNode> {
    node.children()
        .iter()
        .find(|child| child.url.is_none() && child.title == title)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bookmarks::memory::InMemoryBookmarkStore;

    fn path(segments: &[&str]) -> Vec<String> {
        segments.iter().map(|s| s.to_string()).collect()
    }

    fn store() -> InMemoryBookmarkStore {
        InMemoryBookmarkStore::from_tree(vec![BookmarkNode::folder(
            "0",
            "",
            vec![
                BookmarkNode::folder(
                    "1",
                    "Bookmarks bar",
                    vec![BookmarkNode::folder("5", "Work", vec![])],
                ),
                BookmarkNode::folder("2", "Other bookmarks", vec![]),
            ],
        )])
    }

    #[tokio::test]
    async fn first_segment_matches_at_any_depth() {
        let store = store();
        let found = find_folder_by_path(&store, &path(&["Work"]))
            .await
            .expect("lookup")
            .expect("folder exists");
        assert_eq!(found.id, "5");

        let nested = find_folder_by_path(&store, &path(&["Bookmarks bar", "Work"]))
            .await
            .expect("lookup");
        assert_eq!(nested.map(|n| n.id).as_deref(), Some("5"));

        let missing = find_folder_by_path(&store, &path(&["Other bookmarks", "Work"]))
            .await
            .expect("lookup");
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn create_folder_path_reuses_existing_segments() {
        let store = store();
        let before = store.node_count();

        let first = create_folder_path(&store, &path(&["Work", "Docs", "Specs"]))
            .await
            .expect("create chain");
        let after_first = store.node_count();
        assert_eq!(after_first, before + 2);

        let second = create_folder_path(&store, &path(&["Work", "Docs", "Specs"]))
            .await
            .expect("create chain again");
        assert_eq!(first, second);
        assert_eq!(store.node_count(), after_first);
    }

    #[tokio::test]
    async fn missing_top_level_segment_lands_under_default_parent() {
        let store = store();
        let id = create_folder_path(&store, &path(&["Reading"]))
            .await
            .expect("create");
        assert_eq!(store.parent_of(&id).as_deref(), Some("1"));
        assert!(matches!(
            create_folder_path(&store, &[]).await,
            Err(StoreError::EmptyPath)
        ));
    }
}
