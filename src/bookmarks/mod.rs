pub mod memory;
pub mod store;
pub mod types;

pub use memory::InMemoryBookmarkStore;
pub use store::{
    create_folder_path, describe_path, find_folder_by_path, is_folder_empty, BookmarkStore,
    SharedBookmarkStore, StoreError,
};
pub use types::{default_root_path, display_title, flatten_bookmarks, BookmarkNode, BookmarkRecord};
