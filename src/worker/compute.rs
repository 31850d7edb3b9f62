//! Compute worker: stateless, CPU-bound operations over JSON records.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use super::protocol::{TaskError, Worker, WorkerError, WorkerHandle};
use crate::ids;

/// Default deadline for compute round trips; tasks may be long-running.
pub const COMPUTE_TIMEOUT: Duration = Duration::from_secs(30);

/// Fields searched when the caller names none.
pub const DEFAULT_SEARCH_FIELDS: [&str; 4] = ["content", "sender", "title", "name"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
  #[default]
  Asc,
  Desc,
}

/// A filter condition on one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
  /// Field value must be one of these
  OneOf(Vec<Value>),
  /// Field value must equal this
  Equals(Value),
}

impl Condition {
  fn matches(&self, value: Option<&Value>) -> bool {
    let Some(value) = value else {
      return false;
    };
    match self {
      Self::OneOf(allowed) => allowed.contains(value),
      Self::Equals(expected) => value == expected,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComputeTask {
  Search {
    data: Vec<Value>,
    keyword: String,
    #[serde(default)]
    fields: Option<Vec<String>>,
  },
  Aggregate {
    data: Vec<Value>,
    group_by: String,
  },
  Filter {
    data: Vec<Value>,
    conditions: BTreeMap<String, Condition>,
  },
  Sort {
    data: Vec<Value>,
    field: String,
    #[serde(default)]
    order: SortOrder,
  },
  ParseJson {
    text: String,
  },
}

impl ComputeTask {
  pub fn kind(&self) -> &'static str {
    match self {
      Self::Search { .. } => "search",
      Self::Aggregate { .. } => "aggregate",
      Self::Filter { .. } => "filter",
      Self::Sort { .. } => "sort",
      Self::ParseJson { .. } => "parse_json",
    }
  }
}

#[derive(Debug)]
pub struct ComputeRequest {
  pub task_id: String,
  pub task: ComputeTask,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComputeOutput {
  pub task_id: String,
  pub result: Value,
  pub duration: Duration,
}

/// Records whose named string fields contain `keyword`, case-insensitively.
pub fn search(data: Vec<Value>, keyword: &str, fields: Option<&[String]>) -> Vec<Value> {
  let keyword = keyword.trim().to_lowercase();
  if keyword.is_empty() {
    return data;
  }

  let fields: Vec<&str> = match fields {
    Some(fields) => fields.iter().map(String::as_str).collect(),
    None => DEFAULT_SEARCH_FIELDS.to_vec(),
  };

  data
    .into_iter()
    .filter(|record| {
      fields.iter().any(|field| {
        record
          .get(field)
          .and_then(Value::as_str)
          .is_some_and(|text| text.to_lowercase().contains(&keyword))
      })
    })
    .collect()
}

/// Count records per distinct value of `group_by`; missing values count as "unknown".
pub fn aggregate(data: &[Value], group_by: &str) -> BTreeMap<String, u64> {
  let mut groups = BTreeMap::new();
  for record in data {
    let key = match record.get(group_by) {
      None | Some(Value::Null) => "unknown".to_string(),
      Some(value) => display(value),
    };
    *groups.entry(key).or_insert(0) += 1;
  }
  groups
}

/// Records satisfying every condition.
pub fn filter(data: Vec<Value>, conditions: &BTreeMap<String, Condition>) -> Vec<Value> {
  if conditions.is_empty() {
    return data;
  }
  data
    .into_iter()
    .filter(|record| {
      conditions
        .iter()
        .all(|(field, condition)| condition.matches(record.get(field)))
    })
    .collect()
}

/// Stable sort by `field`. Nulls go first ascending and last descending.
/// Text compares case-insensitively, with byte order breaking ties.
pub fn sort(mut data: Vec<Value>, field: &str, order: SortOrder) -> Vec<Value> {
  data.sort_by(|a, b| compare_field(a.get(field), b.get(field), order));
  data
}

fn compare_field(a: Option<&Value>, b: Option<&Value>, order: SortOrder) -> Ordering {
  let a = a.filter(|v| !v.is_null());
  let b = b.filter(|v| !v.is_null());

  let ordering = match (a, b) {
    (None, None) => return Ordering::Equal,
    (None, Some(_)) => Ordering::Less,
    (Some(_), None) => Ordering::Greater,
    (Some(Value::Number(x)), Some(Value::Number(y))) => {
      let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
      x.partial_cmp(&y).unwrap_or(Ordering::Equal)
    }
    (Some(x), Some(y)) => {
      let (x, y) = (display(x), display(y));
      x.to_lowercase()
        .cmp(&y.to_lowercase())
        .then_with(|| x.cmp(&y))
    }
  };

  match order {
    SortOrder::Asc => ordering,
    SortOrder::Desc => ordering.reverse(),
  }
}

fn display(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

fn run_task(task: ComputeTask) -> Result<Value, String> {
  let result = match task {
    ComputeTask::Search {
      data,
      keyword,
      fields,
    } => Value::Array(search(data, &keyword, fields.as_deref())),
    ComputeTask::Aggregate { data, group_by } => {
      let counts: Map<String, Value> = aggregate(&data, &group_by)
        .into_iter()
        .map(|(k, v)| (k, Value::from(v)))
        .collect();
      Value::Object(counts)
    }
    ComputeTask::Filter { data, conditions } => Value::Array(filter(data, &conditions)),
    ComputeTask::Sort { data, field, order } => Value::Array(sort(data, &field, order)),
    ComputeTask::ParseJson { text } => {
      serde_json::from_str(&text).map_err(|e| format!("invalid JSON: {}", e))?
    }
  };
  Ok(result)
}

#[derive(Default)]
pub struct ComputeWorker {
  completed: u64,
}

impl Worker for ComputeWorker {
  type Request = ComputeRequest;
  type Response = ComputeOutput;
  const NAME: &'static str = "compute";

  fn handle(&mut self, request: ComputeRequest) -> Result<ComputeOutput, TaskError> {
    let ComputeRequest { task_id, task } = request;
    let kind = task.kind();
    let started = Instant::now();

    let result = run_task(task).map_err(|e| TaskError::Failed(format!("task {}: {}", task_id, e)))?;

    self.completed += 1;
    let duration = started.elapsed();
    tracing::debug!(task_id = %task_id, kind, ?duration, completed = self.completed, "Compute task done");

    Ok(ComputeOutput {
      task_id,
      result,
      duration,
    })
  }
}

/// Caller-side API of the compute worker.
#[derive(Clone)]
pub struct ComputeClient {
  handle: WorkerHandle<ComputeWorker>,
}

fn expect_array(output: ComputeOutput) -> Result<Vec<Value>, WorkerError> {
  match output.result {
    Value::Array(items) => Ok(items),
    other => Err(WorkerError::Task(format!(
      "task {} returned {} instead of an array",
      output.task_id, other
    ))),
  }
}

impl ComputeClient {
  pub fn spawn(timeout: Duration) -> color_eyre::Result<Self> {
    let handle = WorkerHandle::spawn(ComputeWorker::default(), timeout)?;
    Ok(Self { handle })
  }

  /// Run a task under a freshly generated task id.
  pub async fn run(&self, task: ComputeTask) -> Result<ComputeOutput, WorkerError> {
    let request = ComputeRequest {
      task_id: ids::generate("task"),
      task,
    };
    self.handle.call(request).await
  }

  pub async fn search(
    &self,
    data: Vec<Value>,
    keyword: &str,
    fields: Option<Vec<String>>,
  ) -> Result<Vec<Value>, WorkerError> {
    let task = ComputeTask::Search {
      data,
      keyword: keyword.to_string(),
      fields,
    };
    expect_array(self.run(task).await?)
  }

  pub async fn aggregate(
    &self,
    data: Vec<Value>,
    group_by: &str,
  ) -> Result<BTreeMap<String, u64>, WorkerError> {
    let task = ComputeTask::Aggregate {
      data,
      group_by: group_by.to_string(),
    };
    let output = self.run(task).await?;
    serde_json::from_value(output.result).map_err(|e| WorkerError::Task(e.to_string()))
  }

  pub async fn filter(
    &self,
    data: Vec<Value>,
    conditions: BTreeMap<String, Condition>,
  ) -> Result<Vec<Value>, WorkerError> {
    expect_array(self.run(ComputeTask::Filter { data, conditions }).await?)
  }

  pub async fn sort(
    &self,
    data: Vec<Value>,
    field: &str,
    order: SortOrder,
  ) -> Result<Vec<Value>, WorkerError> {
    let task = ComputeTask::Sort {
      data,
      field: field.to_string(),
      order,
    };
    expect_array(self.run(task).await?)
  }

  pub async fn parse_json(&self, text: &str) -> Result<Value, WorkerError> {
    let task = ComputeTask::ParseJson {
      text: text.to_string(),
    };
    Ok(self.run(task).await?.result)
  }

  pub fn terminate(&self) {
    self.handle.terminate();
  }
}
