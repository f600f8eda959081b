//! UI-side state of the dashboard that the grid and plot panels read:
//! row selection, column visibility, open plots and the committed scroll
//! offset. Side effects on the surrounding layout (detail panel, tabs) are
//! emitted as [`ShellEvent`]s instead of being triggered directly.

use std::collections::BTreeMap;

use data_feed::{DataSink, TableEvent};
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use serde::{Deserialize, Serialize};
use table_core::{RunNumber, TableMetadata};
use thiserror::Error;
use tracing::debug;

pub mod plots;
pub mod scroll;
pub mod selection;
pub mod visibility;

pub use plots::{table_plot_data, PlotData, PlotId, PlotSource, PlotSpec, PlotsState, Trace};
pub use scroll::{Scroll, ScrollDebouncer, SCROLL_DEBOUNCE_MS};
pub use selection::{selected_cells, Selection};
pub use visibility::{column_visibility, visible_columns, VisibilitySettings};

pub const PLOTS_TAB: &str = "plots";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShellError {
    #[error("a plot takes one or two variables, got {0}")]
    PlotArity(usize),
}

/// Layout side effects requested by state changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ShellEvent {
    OpenDetails,
    CloseDetails,
    OpenTab { id: String, title: String },
    CloseTab { id: String },
}

#[derive(Debug, Clone, Default)]
pub struct ShellState {
    pub selection: Selection,
    pub visibility: VisibilitySettings,
    pub plots: PlotsState,
    pub scroll: Scroll,
}

/// Owner of [`ShellState`]. All mutation goes through its methods so that
/// every change that has a layout consequence emits exactly one event.
#[derive(Debug, Default)]
pub struct ShellStore {
    state: ShellState,
    listeners: Vec<UnboundedSender<ShellEvent>>,
}

impl ShellStore {
    pub fn new(initial: ShellState) -> Self {
        Self {
            state: initial,
            listeners: Vec::new(),
        }
    }

    pub fn with_default() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &ShellState {
        &self.state
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&mut self) -> UnboundedReceiver<ShellEvent> {
        let (tx, rx) = mpsc::unbounded();
        self.listeners.push(tx);
        rx
    }

    fn emit(&mut self, event: ShellEvent) {
        debug!(?event, listeners = self.listeners.len(), "shell event");
        self.listeners
            .retain(|tx| tx.unbounded_send(event.clone()).is_ok());
    }

    /// Select a row (or clear it with `None`). The detail panel follows.
    pub fn select_run(&mut self, run: Option<RunNumber>, variables: Vec<String>) {
        self.state.selection.select(run, variables);
        let event = if run.is_some() {
            ShellEvent::OpenDetails
        } else {
            ShellEvent::CloseDetails
        };
        self.emit(event);
    }

    pub fn set_variables_visibility(&mut self, entries: BTreeMap<String, bool>) {
        self.state.visibility.set_variables_visibility(entries);
    }

    pub fn set_group_visibility(&mut self, names: &[&str], visible: bool) {
        self.state
            .visibility
            .set_group_visibility(names.iter().copied(), visible);
    }

    pub fn toggle_variable(&mut self, name: &str) -> bool {
        self.state.visibility.toggle_variable(name)
    }

    pub fn set_tag_selected(&mut self, tag: &str, selected: bool) {
        self.state.visibility.set_tag_selected(tag, selected);
    }

    pub fn column_visibility(&self, metadata: &TableMetadata) -> BTreeMap<String, bool> {
        column_visibility(metadata, &self.state.visibility)
    }

    pub fn add_plot(
        &mut self,
        variables: Vec<String>,
        runs: Option<Vec<String>>,
        source: PlotSource,
        title: impl Into<String>,
    ) -> Result<PlotId, ShellError> {
        let id = self.state.plots.add_plot(variables, runs, source, title)?;
        self.emit(ShellEvent::OpenTab {
            id: PLOTS_TAB.to_string(),
            title: "Plots".to_string(),
        });
        Ok(id)
    }

    pub fn remove_plot(&mut self, id: &str) -> Option<PlotSpec> {
        let removed = self.state.plots.remove_plot(id)?;
        if self.state.plots.is_empty() {
            self.emit(ShellEvent::CloseTab {
                id: PLOTS_TAB.to_string(),
            });
        }
        Some(removed)
    }

    pub fn set_current_plot(&mut self, id: &str) -> bool {
        self.state.plots.set_current(id)
    }

    /// Closing the plots tab discards every plot.
    pub fn close_tab(&mut self, id: &str) {
        if id == PLOTS_TAB {
            self.state.plots.reset();
        }
        self.emit(ShellEvent::CloseTab { id: id.to_string() });
    }

    pub fn commit_scroll(&mut self, scroll: Scroll) {
        self.state.scroll = scroll;
    }

    /// Clear table-scoped state (selection and visibility overrides).
    pub fn reset_table(&mut self) {
        self.state.selection.clear();
        self.state.visibility.reset();
        self.state.scroll = Scroll::default();
    }
}

impl DataSink for ShellStore {
    fn on_event(&mut self, event: TableEvent) {
        match event {
            TableEvent::Refreshed(metadata) => self.state.visibility.sync_metadata(&metadata),
            TableEvent::Latest(update) => self.state.visibility.sync_metadata(&update.metadata),
            TableEvent::Page { update, .. } => {
                if let Some(metadata) = &update.metadata {
                    self.state.visibility.sync_metadata(metadata);
                }
            }
            TableEvent::Deferred { .. } => {}
            TableEvent::Reset => {
                self.reset_table();
                if !self.state.plots.is_empty() {
                    self.close_tab(PLOTS_TAB);
                }
            }
        }
    }
}
