use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use table_core::{RunNumber, TableData, TableMetadata, RUN_VARIABLE};

use crate::ShellError;

pub type PlotId = String;

const UID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const UID_LEN: usize = 26;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlotSource {
    /// Summary values straight from the table.
    #[default]
    Table,
    /// Full values loaded per run from the extracted files.
    Extracted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlotSpec {
    pub id: PlotId,
    /// One variable (against run number) or two (x against y).
    pub variables: Vec<String>,
    pub runs: Option<Vec<String>>,
    pub source: PlotSource,
    #[serde(default)]
    pub title: String,
}

impl PlotSpec {
    /// Runs this plot is restricted to, if any. Unparseable entries are skipped.
    pub fn run_numbers(&self) -> Option<Vec<RunNumber>> {
        self.runs
            .as_ref()
            .map(|runs| runs.iter().filter_map(|r| r.trim().parse().ok()).collect())
    }
}

/// Open plots in insertion order plus the one currently shown.
#[derive(Debug, Clone)]
pub struct PlotsState {
    plots: Vec<PlotSpec>,
    current: Option<PlotId>,
    rng: StdRng,
}

impl Default for PlotsState {
    fn default() -> Self {
        Self::with_seed(chrono::Utc::now().timestamp_millis() as u64)
    }
}

impl PlotsState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            plots: Vec::new(),
            current: None,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn plots(&self) -> &[PlotSpec] {
        &self.plots
    }

    pub fn get(&self, id: &str) -> Option<&PlotSpec> {
        self.plots.iter().find(|p| p.id == id)
    }

    pub fn current(&self) -> Option<&PlotSpec> {
        self.current.as_deref().and_then(|id| self.get(id))
    }

    pub fn is_empty(&self) -> bool {
        self.plots.is_empty()
    }

    /// Register a plot and make it current.
    pub fn add_plot(
        &mut self,
        variables: Vec<String>,
        runs: Option<Vec<String>>,
        source: PlotSource,
        title: impl Into<String>,
    ) -> Result<PlotId, ShellError> {
        if !(1..=2).contains(&variables.len()) {
            return Err(ShellError::PlotArity(variables.len()));
        }
        let id = self.generate_uid();
        self.plots.push(PlotSpec {
            id: id.clone(),
            variables,
            runs,
            source,
            title: title.into(),
        });
        self.current = Some(id.clone());
        Ok(id)
    }

    /// Remove a plot; the most recently added remaining plot becomes current.
    pub fn remove_plot(&mut self, id: &str) -> Option<PlotSpec> {
        let index = self.plots.iter().position(|p| p.id == id)?;
        let removed = self.plots.remove(index);
        self.current = self.plots.last().map(|p| p.id.clone());
        Some(removed)
    }

    /// Unknown ids are ignored.
    pub fn set_current(&mut self, id: &str) -> bool {
        if self.get(id).is_some() {
            self.current = Some(id.to_string());
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.plots.clear();
        self.current = None;
    }

    fn generate_uid(&mut self) -> PlotId {
        loop {
            let id: String = (0..UID_LEN)
                .map(|_| UID_ALPHABET[self.rng.gen_range(0..UID_ALPHABET.len())] as char)
                .collect();
            if self.get(&id).is_none() {
                return id;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trace {
    pub name: String,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlotData {
    pub x: Trace,
    pub y: Trace,
}

fn trace_name(metadata: &TableMetadata, variable: &str) -> String {
    metadata
        .variables
        .get(variable)
        .map(|v| v.display_title().to_string())
        .unwrap_or_else(|| variable.to_string())
}

/// Scatter data for a table-sourced plot.
///
/// One variable is drawn against the run number, two against each other.
/// A run contributes a point only when every requested variable holds a number.
pub fn table_plot_data(spec: &PlotSpec, metadata: &TableMetadata, data: &TableData) -> PlotData {
    let runs: Vec<RunNumber> = match spec.run_numbers() {
        Some(runs) => runs,
        None if !metadata.runs.is_empty() => metadata.runs.clone(),
        None => data.keys().copied().collect(),
    };

    let (x_name, y_name) = match spec.variables.as_slice() {
        [y] => (RUN_VARIABLE.to_string(), y.clone()),
        [x, y, ..] => (x.clone(), y.clone()),
        [] => (RUN_VARIABLE.to_string(), RUN_VARIABLE.to_string()),
    };

    let mut x = Vec::new();
    let mut y = Vec::new();
    for run in runs {
        let Some(row) = data.get(&run) else {
            continue;
        };
        let numbers: Option<Vec<f64>> = spec
            .variables
            .iter()
            .map(|name| row.get(name).and_then(|c| c.value.as_number()))
            .collect();
        let Some(numbers) = numbers else {
            continue;
        };
        match numbers.as_slice() {
            [value] => {
                x.push(run as f64);
                y.push(*value);
            }
            [a, b, ..] => {
                x.push(*a);
                y.push(*b);
            }
            [] => {}
        }
    }

    PlotData {
        x: Trace {
            name: trace_name(metadata, &x_name),
            values: x,
        },
        y: Trace {
            name: trace_name(metadata, &y_name),
            values: y,
        },
    }
}
