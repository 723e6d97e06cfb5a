// ============================================================================
// Transaction Change Tracking
// ============================================================================
//
// Each write made inside a store transaction records how to reverse it.
// ROLLBACK replays the log backwards; COMMIT drops it.
//
// ============================================================================

use crate::core::Row;
use crate::store::table::Table;

/// A single reversible write.
#[derive(Debug, Clone)]
pub enum Change {
    InsertRow { table: String, row_id: usize },

    UpdateRow {
        table: String,
        row_id: usize,
        old_row: Row,
    },

    DeleteRow {
        table: String,
        row_id: usize,
        old_row: Row,
    },
}

impl Change {
    pub fn table_name(&self) -> &str {
        match self {
            Change::InsertRow { table, .. } => table,
            Change::UpdateRow { table, .. } => table,
            Change::DeleteRow { table, .. } => table,
        }
    }

    /// Reverses this change on `table`.
    pub fn undo(self, table: &mut Table) {
        match self {
            Change::InsertRow { row_id, .. } => {
                table.delete(row_id);
            }
            Change::UpdateRow { row_id, old_row, .. } | Change::DeleteRow { row_id, old_row, .. } => {
                table.restore(row_id, old_row);
            }
        }
    }
}
