use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use super::store::{BookmarkStore, StoreError};
use super::types::BookmarkNode;

#[derive(Debug, Clone)]
struct StoredNode {
    id: String,
    title: String,
    url: Option<String>,
    parent_id: Option<String>,
    date_added: Option<i64>,
    children: Option<Vec<String>>,
}

#[derive(Debug, Default)]
struct StoreState {
    nodes: HashMap<String, StoredNode>,
    roots: Vec<String>,
    next_id: u64,
}

/// Bookmark store held in memory, loadable from and savable to a JSON file
/// holding a `get_tree`-shaped array.
#[derive(Debug, Default)]
pub struct InMemoryBookmarkStore {
    state: Mutex<StoreState>,
    default_parent: String,
}

impl InMemoryBookmarkStore {
    pub fn from_tree(tree: Vec<BookmarkNode>) -> Self {
        let mut state = StoreState::default();
        for node in tree {
            state.roots.push(node.id.clone());
            state.insert_subtree(node, None);
        }
        state.next_id = state
            .nodes
            .keys()
            .filter_map(|id| id.parse::<u64>().ok())
            .max()
            .map_or(1, |max| max + 1);

        let default_parent = state.pick_default_parent();
        Self {
            state: Mutex::new(state),
            default_parent,
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let raw = fs::read_to_string(path.as_ref())?;
        let tree: Vec<BookmarkNode> = serde_json::from_str(&raw)?;
        Ok(Self::from_tree(tree))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let tree = self.lock()?.build_tree();
        let json = serde_json::to_string_pretty(&tree)?;
        fs::write(path.as_ref(), json)?;
        Ok(())
    }

    pub fn snapshot(&self) -> Result<Vec<BookmarkNode>, StoreError> {
        Ok(self.lock()?.build_tree())
    }

    pub fn parent_of(&self, id: &str) -> Option<String> {
        self.lock()
            .ok()?
            .nodes
            .get(id)
            .and_then(|node| node.parent_id.clone())
    }

    pub fn node_count(&self) -> usize {
        self.lock().map(|state| state.nodes.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Backend("bookmark store lock poisoned".to_string()))
    }
}

impl StoreState {
    fn insert_subtree(&mut self, node: BookmarkNode, parent_id: Option<String>) {
        let child_ids = node
            .children
            .as_ref()
            .map(|children| children.iter().map(|c| c.id.clone()).collect());

        let stored = StoredNode {
            id: node.id.clone(),
            title: node.title,
            url: node.url,
            parent_id: parent_id.or(node.parent_id),
            date_added: node.date_added,
            children: child_ids,
        };
        let id = stored.id.clone();
        self.nodes.insert(id.clone(), stored);

        for child in node.children.unwrap_or_default() {
            self.insert_subtree(child, Some(id.clone()));
        }
    }

    fn pick_default_parent(&self) -> String {
        if self.is_folder("1") {
            return "1".to_string();
        }
        let Some(root) = self.roots.first().and_then(|id| self.nodes.get(id)) else {
            return "1".to_string();
        };
        root.children
            .iter()
            .flatten()
            .find(|child| self.is_folder(child))
            .cloned()
            .unwrap_or_else(|| root.id.clone())
    }

    fn is_folder(&self, id: &str) -> bool {
        self.nodes
            .get(id)
            .is_some_and(|node| node.url.is_none() && node.children.is_some())
    }

    fn node(&self, id: &str) -> Result<&StoredNode, StoreError> {
        self.nodes
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn build_node(&self, id: &str) -> Option<BookmarkNode> {
        let stored = self.nodes.get(id)?;
        Some(BookmarkNode {
            id: stored.id.clone(),
            title: stored.title.clone(),
            url: stored.url.clone(),
            parent_id: stored.parent_id.clone(),
            date_added: stored.date_added,
            children: stored.children.as_ref().map(|ids| {
                ids.iter()
                    .filter_map(|child| self.build_node(child))
                    .collect()
            }),
        })
    }

    fn shallow_node(&self, id: &str) -> Result<BookmarkNode, StoreError> {
        let stored = self.node(id)?;
        Ok(BookmarkNode {
            id: stored.id.clone(),
            title: stored.title.clone(),
            url: stored.url.clone(),
            parent_id: stored.parent_id.clone(),
            date_added: stored.date_added,
            children: stored.children.as_ref().map(|_| Vec::new()),
        })
    }

    fn build_tree(&self) -> Vec<BookmarkNode> {
        self.roots
            .iter()
            .filter_map(|id| self.build_node(id))
            .collect()
    }

    fn is_ancestor(&self, ancestor: &str, id: &str) -> bool {
        let mut cursor = Some(id.to_string());
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            cursor = self
                .nodes
                .get(&current)
                .and_then(|node| node.parent_id.clone());
        }
        false
    }

    fn detach(&mut self, id: &str) {
        let parent = self.nodes.get(id).and_then(|node| node.parent_id.clone());
        if let Some(children) = parent
            .and_then(|parent| self.nodes.get_mut(&parent))
            .and_then(|parent| parent.children.as_mut())
        {
            children.retain(|child| child != id);
        }
    }
}

#[async_trait]
impl BookmarkStore for InMemoryBookmarkStore {
    async fn get_tree(&self) -> Result<Vec<BookmarkNode>, StoreError> {
        self.snapshot()
    }

    async fn get(&self, id: &str) -> Result<BookmarkNode, StoreError> {
        self.lock()?.shallow_node(id)
    }

    async fn get_children(&self, id: &str) -> Result<Vec<BookmarkNode>, StoreError> {
        let state = self.lock()?;
        let node = state.node(id)?;
        let children = node
            .children
            .as_ref()
            .ok_or_else(|| StoreError::NotAFolder(id.to_string()))?;

        children
            .iter()
            .map(|child| state.shallow_node(child))
            .collect()
    }

    async fn create_folder(
        &self,
        parent_id: &str,
        title: &str,
    ) -> Result<BookmarkNode, StoreError> {
        let mut state = self.lock()?;
        if !state.is_folder(parent_id) {
            state.node(parent_id)?;
            return Err(StoreError::NotAFolder(parent_id.to_string()));
        }

        let id = state.next_id.to_string();
        state.next_id += 1;
        state.nodes.insert(
            id.clone(),
            StoredNode {
                id: id.clone(),
                title: title.to_string(),
                url: None,
                parent_id: Some(parent_id.to_string()),
                date_added: Some(Utc::now().timestamp_millis()),
                children: Some(Vec::new()),
            },
        );
        if let Some(children) = state
            .nodes
            .get_mut(parent_id)
            .and_then(|parent| parent.children.as_mut())
        {
            children.push(id.clone());
        }

        state.shallow_node(&id)
    }

    async fn move_node(&self, id: &str, new_parent_id: &str) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if state.node(id)?.parent_id.is_none() {
            return Err(StoreError::RootNode(id.to_string()));
        }
        if !state.is_folder(new_parent_id) {
            state.node(new_parent_id)?;
            return Err(StoreError::NotAFolder(new_parent_id.to_string()));
        }
        if state.is_ancestor(id, new_parent_id) {
            return Err(StoreError::Cycle { id: id.to_string() });
        }

        state.detach(id);
        if let Some(children) = state
            .nodes
            .get_mut(new_parent_id)
            .and_then(|parent| parent.children.as_mut())
        {
            children.push(id.to_string());
        }
        if let Some(node) = state.nodes.get_mut(id) {
            node.parent_id = Some(new_parent_id.to_string());
        }
        Ok(())
    }

    async fn rename(&self, id: &str, new_title: &str) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let node = state
            .nodes
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        node.title = new_title.to_string();
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let node = state.node(id)?;
        if node.parent_id.is_none() {
            return Err(StoreError::RootNode(id.to_string()));
        }
        if node.children.as_ref().is_some_and(|c| !c.is_empty()) {
            return Err(StoreError::NotEmpty(node.title.clone()));
        }

        state.detach(id);
        state.nodes.remove(id);
        Ok(())
    }

    fn default_parent_id(&self) -> String {
        self.default_parent.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bookmarks::flatten_bookmarks;

    fn store() -> InMemoryBookmarkStore {
        InMemoryBookmarkStore::from_tree(vec![BookmarkNode::folder(
            "0",
            "",
            vec![
                BookmarkNode::folder(
                    "1",
                    "Bookmarks bar",
                    vec![
                        BookmarkNode::bookmark("10", "Rust", "https://www.rust-lang.org"),
                        BookmarkNode::folder("11", "Old", vec![]),
                    ],
                ),
                BookmarkNode::folder("2", "Other bookmarks", vec![]),
            ],
        )])
    }

    #[tokio::test]
    async fn new_ids_continue_after_existing_numeric_ids() {
        let store = store();
        let folder = store.create_folder("2", "Fresh").await.expect("create");
        assert_eq!(folder.id, "12");
        assert_eq!(folder.parent_id.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn move_updates_parent_and_children() {
        let store = store();
        store.move_node("10", "2").await.expect("move");

        assert_eq!(store.parent_of("10").as_deref(), Some("2"));
        let bar = store.get_children("1").await.expect("children");
        assert!(bar.iter().all(|child| child.id != "10"));
    }

    #[tokio::test]
    async fn move_rejects_cycles_and_non_folders() {
        let store = store();
        assert!(matches!(
            store.move_node("1", "11").await,
            Err(StoreError::Cycle { .. })
        ));
        assert!(matches!(
            store.move_node("11", "10").await,
            Err(StoreError::NotAFolder(_))
        ));
        assert!(matches!(
            store.move_node("missing", "2").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn remove_refuses_non_empty_folders() {
        let store = store();
        assert!(matches!(
            store.remove("1").await,
            Err(StoreError::NotEmpty(_))
        ));
        store.remove("11").await.expect("remove empty folder");
        assert!(store.get("11").await.is_err());
    }

    #[tokio::test]
    async fn save_and_load_round_trip_through_disk() {
        let store = store();
        store.rename("10", "Rust Lang").await.expect("rename");

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bookmarks.json");
        store.save(&path).expect("save");

        let reloaded = InMemoryBookmarkStore::load(&path).expect("load");
        let records = flatten_bookmarks(&reloaded.get_tree().await.expect("tree"));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].title, "Rust Lang");
        assert_eq!(reloaded.default_parent_id(), "1");
    }
}
