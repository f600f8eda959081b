use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use table_core::{is_configurable, TableMetadata};

/// User toggles for the grid columns. Absent entries mean "visible" and
/// "not selected" respectively.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VisibilitySettings {
    #[serde(default)]
    overrides: BTreeMap<String, bool>,
    /// Keyed by tag name.
    #[serde(default)]
    tag_selection: BTreeMap<String, bool>,
}

impl VisibilitySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn overrides(&self) -> &BTreeMap<String, bool> {
        &self.overrides
    }

    pub fn tag_selection(&self) -> &BTreeMap<String, bool> {
        &self.tag_selection
    }

    /// Merge per-variable overrides.
    pub fn set_variables_visibility<I, S>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (S, bool)>,
        S: Into<String>,
    {
        for (name, visible) in entries {
            self.overrides.insert(name.into(), visible);
        }
    }

    pub fn set_group_visibility<'a, I>(&mut self, names: I, visible: bool)
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.set_variables_visibility(names.into_iter().map(|n| (n, visible)));
    }

    /// Flip one variable and return its new state.
    pub fn toggle_variable(&mut self, name: &str) -> bool {
        let next = !self.is_enabled(name);
        self.overrides.insert(name.to_string(), next);
        next
    }

    pub fn set_tag_selected(&mut self, tag: impl Into<String>, selected: bool) {
        self.tag_selection.insert(tag.into(), selected);
    }

    pub fn clear_tag_selection(&mut self) {
        self.tag_selection.clear();
    }

    /// Per-variable switch only, ignoring tags.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.overrides.get(name) != Some(&false)
    }

    pub fn selected_tags(&self) -> impl Iterator<Item = &str> {
        self.tag_selection
            .iter()
            .filter(|(_, selected)| **selected)
            .map(|(name, _)| name.as_str())
    }

    /// Forget overrides and tag selections that refer to names the new
    /// snapshot no longer has. New variables start out visible.
    pub fn sync_metadata(&mut self, metadata: &TableMetadata) {
        self.overrides
            .retain(|name, _| metadata.variables.contains_key(name));
        self.tag_selection
            .retain(|name, _| metadata.tags.contains_key(name));
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Variables belonging to at least one selected tag. `None` when no tag
/// filter is in effect.
fn tag_filter(metadata: &TableMetadata, settings: &VisibilitySettings) -> Option<BTreeSet<String>> {
    let mut members = BTreeSet::new();
    for name in settings.selected_tags() {
        let Some(tag) = metadata.tags.get(name) else {
            continue;
        };
        members.extend(tag.variables.iter().cloned());
        members.extend(
            metadata
                .variables
                .values()
                .filter(|v| v.tag_ids.contains(&tag.id))
                .map(|v| v.name.clone()),
        );
    }
    if members.is_empty() {
        None
    } else {
        Some(members)
    }
}

/// Effective visibility of every configurable variable:
/// `enabled AND (no tag filter OR member of a selected tag)`.
pub fn column_visibility(
    metadata: &TableMetadata,
    settings: &VisibilitySettings,
) -> BTreeMap<String, bool> {
    let filter = tag_filter(metadata, settings);
    metadata
        .configurable_variables()
        .map(|name| {
            let by_tag = filter.as_ref().map_or(true, |f| f.contains(name));
            (name.to_string(), settings.is_enabled(name) && by_tag)
        })
        .collect()
}

/// Columns the grid should render: the fixed columns first, then the
/// visible configurable ones.
pub fn visible_columns(metadata: &TableMetadata, settings: &VisibilitySettings) -> Vec<String> {
    let visibility = column_visibility(metadata, settings);
    let mut columns: Vec<String> = metadata
        .variable_names()
        .filter(|name| !is_configurable(name))
        .map(str::to_string)
        .collect();
    columns.extend(
        visibility
            .into_iter()
            .filter(|(_, visible)| *visible)
            .map(|(name, _)| name),
    );
    columns
}
