use serde::{Deserialize, Serialize};

/// Pagination envelope shared by list results.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListMeta {
    pub total_count: i64,
    pub total_page: i64,
    pub current_page: i64,
    pub has_next: bool,
    pub next_cursor: String,
}
