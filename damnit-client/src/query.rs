//! GraphQL documents and response decoding.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use table_core::{Cell, RunNumber, RunRow, TableData, TableMetadata, Timestamp, RUN_VARIABLE};

use crate::{ClientError, Priority};

pub const TABLE_DATA_QUERY_NAME: &str = "TableDataQuery";
pub const DEFERRED_TABLE_DATA_QUERY_NAME: &str = "DeferredTableDataQuery";
pub const LATEST_DATA_FIELD_NAME: &str = "latest_data";
pub const EXTRACTED_DATA_FIELD_NAME: &str = "extracted_data";

const TABLE_METADATA_QUERY: &str = "query TableMetadataQuery($proposal: String) {
  metadata(database: { proposal: $proposal })
}";

const REFRESH_MUTATION: &str = "mutation RefreshMutation($proposal: String) {
  refresh(database: { proposal: $proposal })
}";

const LATEST_DATA_SUBSCRIPTION: &str =
    "subscription LatestRunSubcription($proposal: String, $timestamp: Timestamp!) {
  latest_data(database: { proposal: $proposal }, timestamp: $timestamp)
}";

const EXTRACTED_DATA_QUERY: &str =
    "query ExtractedDataQuery($proposal: String, $run: Int!, $variable: String!) {
  extracted_data(database: { proposal: $proposal }, run: $run, variable: $variable)
}";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphqlRequest {
    pub query: String,
    #[serde(rename = "operationName")]
    pub operation_name: String,
    pub variables: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphqlError {
    pub message: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GraphqlResponse {
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub errors: Option<Vec<GraphqlError>>,
}

impl GraphqlResponse {
    /// Extract `data.<field>`, turning server-side errors into `ClientError::GraphQl`.
    pub fn into_field(self, field: &str) -> Result<Value, ClientError> {
        if let Some(errors) = self.errors.filter(|e| !e.is_empty()) {
            return Err(ClientError::GraphQl(
                errors.into_iter().map(|e| e.message).collect(),
            ));
        }
        let mut data = match self.data {
            Some(Value::Object(map)) => map,
            _ => return Err(ClientError::Decode("response without data".to_string())),
        };
        data.remove(field)
            .ok_or_else(|| ClientError::Decode(format!("missing field {field}")))
    }
}

/// One page of rows for a fixed column set.
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    pub proposal: String,
    pub columns: Vec<String>,
    /// 1-based page number.
    pub page: u32,
    pub page_size: u32,
    /// Ask the server to null heavy values.
    pub lightweight: bool,
    pub priority: Priority,
}

impl PageRequest {
    pub fn new(proposal: impl Into<String>, page: u32, page_size: u32) -> Self {
        Self {
            proposal: proposal.into(),
            columns: Vec::new(),
            page,
            page_size,
            lightweight: false,
            priority: Priority::Interactive,
        }
    }

    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn lightweight(mut self) -> Self {
        self.lightweight = true;
        self
    }

    pub fn deferred(mut self) -> Self {
        self.priority = Priority::Background;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Requested fields: `run` first, then the named columns without duplicates.
    pub fn fields(&self) -> Vec<&str> {
        let mut fields = vec![RUN_VARIABLE];
        for column in &self.columns {
            if !fields.contains(&column.as_str()) {
                fields.push(column);
            }
        }
        fields
    }

    pub fn operation_name(&self) -> &'static str {
        match self.priority {
            Priority::Background => DEFERRED_TABLE_DATA_QUERY_NAME,
            Priority::Interactive => TABLE_DATA_QUERY_NAME,
        }
    }

    pub fn to_graphql(&self) -> GraphqlRequest {
        let selection = self
            .fields()
            .iter()
            .map(|f| format!("{f} {{ value dtype }}"))
            .collect::<Vec<_>>()
            .join(" ");
        let directive = if self.lightweight { " @lightweight" } else { "" };
        let name = self.operation_name();
        let query = format!(
            "query {name}($proposal: String, $page: Int, $per_page: Int) {{
  runs(database: {{ proposal: $proposal }}, page: $page, per_page: $per_page){directive} {{
    ... on p{proposal} {{ {selection} }}
  }}
}}",
            proposal = self.proposal
        );
        GraphqlRequest {
            query,
            operation_name: name.to_string(),
            variables: json!({
                "proposal": self.proposal,
                "page": self.page,
                "per_page": self.page_size,
            }),
        }
    }
}

pub fn metadata_request(proposal: &str) -> GraphqlRequest {
    GraphqlRequest {
        query: TABLE_METADATA_QUERY.to_string(),
        operation_name: "TableMetadataQuery".to_string(),
        variables: json!({ "proposal": proposal }),
    }
}

pub fn refresh_request(proposal: &str) -> GraphqlRequest {
    GraphqlRequest {
        query: REFRESH_MUTATION.to_string(),
        operation_name: "RefreshMutation".to_string(),
        variables: json!({ "proposal": proposal }),
    }
}

pub fn latest_request(proposal: &str, since: Timestamp) -> GraphqlRequest {
    GraphqlRequest {
        query: LATEST_DATA_SUBSCRIPTION.to_string(),
        operation_name: "LatestRunSubcription".to_string(),
        variables: json!({ "proposal": proposal, "timestamp": since }),
    }
}

pub fn extracted_request(proposal: &str, run: RunNumber, variable: &str) -> GraphqlRequest {
    GraphqlRequest {
        query: EXTRACTED_DATA_QUERY.to_string(),
        operation_name: "ExtractedDataQuery".to_string(),
        variables: json!({ "proposal": proposal, "run": run, "variable": variable }),
    }
}

/// Decode `runs` from a table query: a list of objects whose fields are
/// `{ value, dtype }` cells, keyed by the `run` cell.
pub fn rows_from_runs(runs: Value) -> Result<TableData, ClientError> {
    let items = match runs {
        Value::Null => return Ok(TableData::new()),
        Value::Array(items) => items,
        other => {
            return Err(ClientError::Decode(format!(
                "runs is not a list: {other}"
            )))
        }
    };
    let mut table = TableData::new();
    for item in items {
        let Value::Object(fields) = item else {
            return Err(ClientError::Decode("run entry is not an object".to_string()));
        };
        let (run, row) = decode_row(fields)?;
        table.insert(run, row);
    }
    Ok(table)
}

fn decode_row(fields: Map<String, Value>) -> Result<(RunNumber, RunRow), ClientError> {
    let run = fields
        .get(RUN_VARIABLE)
        .and_then(|cell| cell.get("value"))
        .and_then(run_number)
        .ok_or_else(|| ClientError::Decode("run entry without run number".to_string()))?;
    let mut row = RunRow::new();
    for (name, value) in fields {
        if name.starts_with("__") || value.is_null() {
            continue;
        }
        let cell: Cell = serde_json::from_value(value)?;
        row.insert(name, cell);
    }
    Ok((run, row))
}

fn run_number(value: &Value) -> Option<RunNumber> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as RunNumber)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// The refresh mutation answers `{ metadata: {...} }`.
pub fn metadata_from_refresh(value: Value) -> Result<TableMetadata, ClientError> {
    #[derive(Deserialize)]
    struct Refresh {
        metadata: TableMetadata,
    }
    Ok(serde_json::from_value::<Refresh>(value)?.metadata)
}
