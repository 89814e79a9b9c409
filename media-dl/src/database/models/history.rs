//! History (audit trail) database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Row of the append-only `history` table.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct HistoryDbModel {
    pub id: i64,
    pub task_id: String,
    pub event: String,
    pub details: Option<String>,
    pub created_at: i64,
}
