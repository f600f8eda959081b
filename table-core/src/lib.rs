use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

pub mod pages;

pub use pages::{sorted_insert, sorted_search, visible_pages, PageRange, Pages, Rect};

/// Milliseconds since Unix epoch (server timestamps arrive as JS-style floats).
pub type Timestamp = f64;

/// Integer identifier of one row of the dataset.
pub type RunNumber = i64;

pub type TagId = i64;

/// Column that keys every row and is always requested.
pub const RUN_VARIABLE: &str = "run";

/// Variables that are never offered in visibility settings.
pub const NONCONFIGURABLE_VARIABLES: [&str; 3] = ["proposal", "added_at", RUN_VARIABLE];

pub fn is_configurable(name: &str) -> bool {
    !NONCONFIGURABLE_VARIABLES.contains(&name)
}

/// Value type tag carried next to every cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    None,
    Number,
    String,
    Boolean,
    Timestamp,
    Array,
    Image,
    Rgba,
    Png,
    Dataset,
    #[serde(other)]
    Unknown,
}

impl DType {
    /// Heavy values are nulled by the server in lightweight fetches and
    /// must be requested again in a deferred pass.
    pub fn is_heavy(&self) -> bool {
        matches!(self, DType::Array | DType::Image | DType::Rgba)
    }

    pub fn name(&self) -> &'static str {
        match self {
            DType::None => "none",
            DType::Number => "number",
            DType::String => "string",
            DType::Boolean => "boolean",
            DType::Timestamp => "timestamp",
            DType::Array => "array",
            DType::Image => "image",
            DType::Rgba => "rgba",
            DType::Png => "png",
            DType::Dataset => "dataset",
            DType::Unknown => "unknown",
        }
    }
}

/// Decoded cell payload. `Pending` means "not fetched yet" and is distinct
/// from `Empty`, which is a legitimate missing value.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Pending,
    Empty,
    Number(f64),
    Text(String),
    Bool(bool),
    Timestamp(Timestamp),
    Array(Vec<f64>),
    /// Base64 encoded PNG.
    Image(String),
    Json(Value),
}

impl CellValue {
    pub fn is_pending(&self) -> bool {
        matches!(self, CellValue::Pending)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            CellValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            CellValue::Pending | CellValue::Empty => Value::Null,
            CellValue::Number(n) | CellValue::Timestamp(n) => serde_json::json!(n),
            CellValue::Text(s) | CellValue::Image(s) => Value::String(s.clone()),
            CellValue::Bool(b) => Value::Bool(*b),
            CellValue::Array(values) => serde_json::json!(values),
            CellValue::Json(v) => v.clone(),
        }
    }
}

/// Shape of a cell on the wire: `{ "value": ..., "dtype": "..." }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireCell {
    #[serde(default)]
    pub value: Value,
    #[serde(default = "unknown_dtype")]
    pub dtype: DType,
}

fn unknown_dtype() -> DType {
    DType::Unknown
}

/// One table cell, decoded once at the store boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireCell", into = "WireCell")]
pub struct Cell {
    pub value: CellValue,
    pub dtype: DType,
}

impl Cell {
    pub fn new(value: CellValue, dtype: DType) -> Self {
        Self { value, dtype }
    }

    pub fn number(n: f64) -> Self {
        Self::new(CellValue::Number(n), DType::Number)
    }

    pub fn text(s: impl Into<String>) -> Self {
        Self::new(CellValue::Text(s.into()), DType::String)
    }

    pub fn pending(dtype: DType) -> Self {
        Self::new(CellValue::Pending, dtype)
    }

    /// Decode a raw JSON value according to its dtype.
    pub fn decode(value: Value, dtype: DType) -> Self {
        let value = match (value, dtype) {
            (Value::Null, dt) if dt.is_heavy() => CellValue::Pending,
            (Value::Null, _) => CellValue::Empty,
            (Value::Number(n), DType::Timestamp) => match n.as_f64() {
                Some(ts) => CellValue::Timestamp(ts),
                None => CellValue::Json(Value::Number(n)),
            },
            (Value::Number(n), _) => match n.as_f64() {
                Some(f) => CellValue::Number(f),
                None => CellValue::Json(Value::Number(n)),
            },
            (Value::Bool(b), _) => CellValue::Bool(b),
            (Value::String(s), DType::Image | DType::Rgba | DType::Png) => CellValue::Image(s),
            (Value::String(s), _) => CellValue::Text(s),
            (Value::Array(items), DType::Array) => {
                let numbers: Option<Vec<f64>> = items.iter().map(Value::as_f64).collect();
                match numbers {
                    Some(values) => CellValue::Array(values),
                    None => CellValue::Json(Value::Array(items)),
                }
            }
            (other, _) => CellValue::Json(other),
        };
        Self { value, dtype }
    }

    /// True when the value was withheld by a lightweight fetch.
    pub fn is_deferred(&self) -> bool {
        self.value.is_pending()
    }
}

impl From<WireCell> for Cell {
    fn from(wire: WireCell) -> Self {
        Cell::decode(wire.value, wire.dtype)
    }
}

impl From<Cell> for WireCell {
    fn from(cell: Cell) -> Self {
        WireCell {
            value: cell.value.to_json(),
            dtype: cell.dtype,
        }
    }
}

/// Variables of a single run, keyed by variable name.
pub type RunRow = BTreeMap<String, Cell>;

/// Partial or full table contents keyed by run number.
pub type TableData = BTreeMap<RunNumber, RunRow>;

/// Column description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(default, alias = "tags")]
    pub tag_ids: BTreeSet<TagId>,
}

impl Variable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: String::new(),
            tag_ids: BTreeSet::new(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_tags<I: IntoIterator<Item = TagId>>(mut self, tags: I) -> Self {
        self.tag_ids = tags.into_iter().collect();
        self
    }

    pub fn display_title(&self) -> &str {
        if self.title.is_empty() {
            &self.name
        } else {
            &self.title
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub id: TagId,
    pub name: String,
    #[serde(default)]
    pub variables: BTreeSet<String>,
}

/// Schema snapshot of the active dataset. Replaced wholesale, never merged.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TableMetadata {
    #[serde(default)]
    pub variables: BTreeMap<String, Variable>,
    #[serde(default, deserialize_with = "run_numbers")]
    pub runs: Vec<RunNumber>,
    #[serde(default)]
    pub timestamp: Timestamp,
    #[serde(default)]
    pub tags: BTreeMap<String, Tag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u64>,
}

impl TableMetadata {
    pub fn variable_names(&self) -> impl Iterator<Item = &str> {
        self.variables.keys().map(String::as_str)
    }

    pub fn configurable_variables(&self) -> impl Iterator<Item = &str> {
        self.variable_names().filter(|name| is_configurable(name))
    }

    /// Index of a run in the canonical row order.
    pub fn run_index(&self, run: RunNumber) -> Option<usize> {
        self.runs.iter().position(|r| *r == run)
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Run numbers travel as integers from the API but older payloads stringify them.
fn run_numbers<'de, D>(deserializer: D) -> Result<Vec<RunNumber>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RunKey {
        Int(RunNumber),
        Str(String),
    }

    let keys = Vec::<RunKey>::deserialize(deserializer)?;
    keys.into_iter()
        .map(|key| match key {
            RunKey::Int(n) => Ok(n),
            RunKey::Str(s) => s
                .trim()
                .parse::<RunNumber>()
                .map_err(|_| serde::de::Error::custom(format!("invalid run number {s:?}"))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn null_heavy_cell_is_pending_but_null_scalar_is_empty() {
        let image: Cell = serde_json::from_value(json!({"value": null, "dtype": "image"})).unwrap();
        assert!(image.is_deferred());
        let scalar: Cell =
            serde_json::from_value(json!({"value": null, "dtype": "number"})).unwrap();
        assert_eq!(scalar.value, CellValue::Empty);
        assert!(!scalar.is_deferred());
    }

    #[test]
    fn cells_decode_by_dtype() {
        let n: Cell = serde_json::from_value(json!({"value": 1.5, "dtype": "number"})).unwrap();
        assert_eq!(n.value.as_number(), Some(1.5));
        let arr: Cell =
            serde_json::from_value(json!({"value": [1, 2, 3], "dtype": "array"})).unwrap();
        assert_eq!(arr.value, CellValue::Array(vec![1.0, 2.0, 3.0]));
        let img: Cell =
            serde_json::from_value(json!({"value": "iVBOR", "dtype": "image"})).unwrap();
        assert_eq!(img.value, CellValue::Image("iVBOR".into()));
        let weird: Cell =
            serde_json::from_value(json!({"value": 3, "dtype": "complex128"})).unwrap();
        assert_eq!(weird.dtype, DType::Unknown);
        assert_eq!(weird.value, CellValue::Number(3.0));
    }

    #[test]
    fn metadata_accepts_string_runs_and_missing_fields() {
        let meta: TableMetadata = serde_json::from_value(json!({
            "runs": ["1", 2, " 3"],
            "variables": {
                "energy": {"name": "energy", "title": null, "tag_ids": [4]},
                "run": {"name": "run", "title": "Run"}
            },
            "timestamp": 1700000000123.5
        }))
        .unwrap();
        assert_eq!(meta.runs, vec![1, 2, 3]);
        assert_eq!(meta.variables["energy"].display_title(), "energy");
        assert_eq!(meta.variables["run"].display_title(), "Run");
        assert!(meta.tags.is_empty());
        assert_eq!(
            meta.configurable_variables().collect::<Vec<_>>(),
            vec!["energy"]
        );
        assert_eq!(meta.run_index(3), Some(2));
    }

    #[test]
    fn heavy_dtypes() {
        assert!(DType::Array.is_heavy());
        assert!(DType::Image.is_heavy());
        assert!(DType::Rgba.is_heavy());
        assert!(!DType::Number.is_heavy());
        assert!(!DType::Png.is_heavy());
    }
}
