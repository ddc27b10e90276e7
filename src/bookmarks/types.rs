use serde::{Deserialize, Serialize};

/// Node shape returned by the store's `get_tree`: bookmarks carry a `url`,
/// folders carry `children` and no `url`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookmarkNode {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_added: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<BookmarkNode>>,
}

impl BookmarkNode {
    pub fn bookmark(
        id: impl Into<String>,
        title: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            url: Some(url.into()),
            parent_id: None,
            date_added: None,
            children: None,
        }
    }

    pub fn folder(id: impl Into<String>, title: impl Into<String>, children: Vec<Self>) -> Self {
        let id = id.into();
        let children = children
            .into_iter()
            .map(|mut child| {
                child.parent_id = Some(id.clone());
                child
            })
            .collect();

        Self {
            id,
            title: title.into(),
            url: None,
            parent_id: None,
            date_added: None,
            children: Some(children),
        }
    }

    pub fn is_folder(&self) -> bool {
        self.url.is_none() && self.children.is_some()
    }

    pub fn children(&self) -> &[BookmarkNode] {
        self.children.as_deref().unwrap_or_default()
    }

    /// Copy of this node without its subtree, matching what `get` returns.
    pub fn shallow(&self) -> Self {
        Self {
            children: self.children.as_ref().map(|_| Vec::new()),
            ..self.clone()
        }
    }
}

/// Flat view of a single bookmark leaf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookmarkRecord {
    pub id: String,
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub date_added: Option<i64>,
}

pub const UNTITLED: &str = "Untitled";

pub fn display_title(title: &str) -> &str {
    if title.is_empty() {
        UNTITLED
    } else {
        title
    }
}

/// Depth-first flattening of every bookmark leaf, preserving tree order.
pub fn flatten_bookmarks(tree: &[BookmarkNode]) -> Vec<BookmarkRecord> {
    fn walk(nodes: &[BookmarkNode], out: &mut Vec<BookmarkRecord>) {
        for node in nodes {
            if let Some(url) = &node.url {
                out.push(BookmarkRecord {
                    id: node.id.clone(),
                    title: display_title(&node.title).to_string(),
                    url: url.clone(),
                    parent_id: node.parent_id.clone(),
                    date_added: node.date_added,
                });
            }
            walk(node.children(), out);
        }
    }

    let mut out = Vec::new();
    walk(tree, &mut out);
    out
}

/// Path of the folder new top-level folders are created under. Browser trees
/// have a nameless root whose first child is the bookmarks bar.
pub fn default_root_path(tree: &[BookmarkNode]) -> Vec<String> {
    let Some(root) = tree.first() else {
        return Vec::new();
    };

    if root.title.is_empty() {
        return root
            .children()
            .iter()
            .find(|child| child.is_folder())
            .map(|folder| vec![display_title(&folder.title).to_string()])
            .unwrap_or_default();
    }

    if root.is_folder() {
        vec![root.title.clone()]
    } else {
        Vec::new()
    }
}
