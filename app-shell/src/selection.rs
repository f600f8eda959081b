use data_feed::TableStore;
use serde::{Deserialize, Serialize};
use table_core::{Cell, RunNumber};

use crate::visibility::{visible_columns, VisibilitySettings};

/// Highlighted row and, optionally, the columns shown in the detail panel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub run: Option<RunNumber>,
    #[serde(default)]
    pub variables: Vec<String>,
}

impl Selection {
    /// Update only the fields that differ. Returns true if anything changed.
    pub fn select(&mut self, run: Option<RunNumber>, variables: Vec<String>) -> bool {
        let mut changed = false;
        if self.run != run {
            self.run = run;
            changed = true;
        }
        if self.variables != variables {
            self.variables = variables;
            changed = true;
        }
        changed
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Cells of the selected run for the detail panel, in column order.
///
/// Restricted to `selection.variables` when given, otherwise to the visible
/// columns. Variables the store has not received yet are skipped.
pub fn selected_cells<'a>(
    store: &'a TableStore,
    selection: &Selection,
    settings: &VisibilitySettings,
) -> Vec<(String, &'a Cell)> {
    let Some(run) = selection.run else {
        return Vec::new();
    };
    let Some(row) = store.row(run) else {
        return Vec::new();
    };
    let columns = if selection.variables.is_empty() {
        visible_columns(store.metadata(), settings)
    } else {
        selection.variables.clone()
    };
    columns
        .into_iter()
        .filter_map(|name| row.get(&name).map(|cell| (name, cell)))
        .collect()
}
