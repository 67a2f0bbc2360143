//! Task resource requests and per-attempt scaling strategies.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::CoreError;

/// An immutable resource request.
///
/// `requested_resources` is an opaque JSON object interpreted by the cluster
/// plugin (cores, memory, runtime, ...). Once a row id is assigned the
/// request must not be mutated; scaling derives a fresh, unbound request.
#[derive(Debug, Clone)]
pub struct TaskResources {
    /// Database id, set once bound.
    pub id: Option<i64>,
    pub queue_name: String,
    pub requested_resources: BTreeMap<String, Value>,
}

impl TaskResources {
    pub fn new(queue_name: impl Into<String>, requested_resources: BTreeMap<String, Value>) -> Self {
        Self {
            id: None,
            queue_name: queue_name.into(),
            requested_resources,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.id.is_some()
    }

    /// Derive a new unbound request with the given scalers applied.
    ///
    /// Resources without a scaler pass through unchanged. A scaler for a
    /// resource the request does not carry is ignored.
    pub fn scale(
        &self,
        scalers: &mut BTreeMap<String, ResourceScaler>,
    ) -> Result<TaskResources, CoreError> {
        let mut scaled = self.requested_resources.clone();
        for (resource, scaler) in scalers.iter_mut() {
            if let Some(current) = scaled.get(resource) {
                let next = scaler.next_value(resource, current)?;
                scaled.insert(resource.clone(), next);
            }
        }
        Ok(TaskResources {
            id: None,
            queue_name: self.queue_name.clone(),
            requested_resources: scaled,
        })
    }
}

/// User-supplied callable producing resource values.
pub type ScaleFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// Per-resource scaling strategy applied when a task re-queues after a
/// recoverable error.
#[derive(Clone)]
pub enum ResourceScaler {
    /// Multiply the current numeric value by `1 + factor`.
    Factor(f64),

    /// Take the next value from a fixed sequence; the last value repeats
    /// once the sequence is exhausted.
    Sequence { values: Vec<Value>, cursor: usize },

    /// Arbitrary function of the current value.
    Custom(ScaleFn),
}

impl std::fmt::Debug for ResourceScaler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Factor(factor) => f.debug_tuple("Factor").field(factor).finish(),
            Self::Sequence { values, cursor } => f
                .debug_struct("Sequence")
                .field("values", values)
                .field("cursor", cursor)
                .finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl ResourceScaler {
    pub fn next_value(&mut self, resource: &str, current: &Value) -> Result<Value, CoreError> {
        match self {
            Self::Factor(factor) => {
                let current = current.as_f64().ok_or_else(|| CoreError::ResourceScale {
                    resource: resource.to_string(),
                    reason: format!("cannot scale non-numeric value {current}"),
                })?;
                let scaled = current * (1.0 + *factor);
                // Integer resources stay integers (cores, memory in GiB).
                if scaled.fract() == 0.0 {
                    Ok(Value::from(scaled as i64))
                } else {
                    Ok(Value::from(scaled))
                }
            }
            Self::Sequence { values, cursor } => {
                if values.is_empty() {
                    return Err(CoreError::ResourceScale {
                        resource: resource.to_string(),
                        reason: "empty scale sequence".to_string(),
                    });
                }
                let idx = (*cursor).min(values.len() - 1);
                *cursor += 1;
                Ok(values[idx].clone())
            }
            Self::Custom(scale_fn) => Ok(scale_fn(current)),
        }
    }

    /// Reconstruct scalers from the JSON persisted at bind time.
    ///
    /// Numbers become factors and arrays become sequences. Sequences must be
    /// numeric: a resume cannot rehydrate arbitrary callables, so anything
    /// else is rejected.
    pub fn from_persisted(
        raw: &BTreeMap<String, Value>,
    ) -> Result<BTreeMap<String, ResourceScaler>, CoreError> {
        let mut scalers = BTreeMap::new();
        for (resource, value) in raw {
            let scaler = match value {
                Value::Number(n) => ResourceScaler::Factor(n.as_f64().unwrap_or(0.0)),
                Value::Array(values) => {
                    if values.iter().any(|v| !v.is_number()) {
                        return Err(CoreError::ResourceScale {
                            resource: resource.clone(),
                            reason: format!(
                                "cannot resume with non-numeric scale sequence {value}"
                            ),
                        });
                    }
                    ResourceScaler::Sequence {
                        values: values.clone(),
                        cursor: 0,
                    }
                }
                other => {
                    return Err(CoreError::ResourceScale {
                        resource: resource.clone(),
                        reason: format!("unsupported persisted scaler {other}"),
                    })
                }
            };
            scalers.insert(resource.clone(), scaler);
        }
        Ok(scalers)
    }
}

/// Deferred computation of a task's resource request, evaluated once before
/// the first bind.
pub type ComputeResourcesCallable = Arc<dyn Fn() -> Value + Send + Sync>;

/// Evaluate a compute-resources callable and validate its shape.
pub fn evaluate_compute_resources(
    task_id: i64,
    callable: &ComputeResourcesCallable,
) -> Result<BTreeMap<String, Value>, CoreError> {
    let value = callable();
    match value {
        Value::Object(map) => Ok(map.into_iter().collect()),
        other => Err(CoreError::InvalidComputeResources {
            task_id,
            got: match other {
                Value::Null => "null".to_string(),
                Value::Bool(_) => "a boolean".to_string(),
                Value::Number(_) => "a number".to_string(),
                Value::String(_) => "a string".to_string(),
                Value::Array(_) => "an array".to_string(),
                Value::Object(_) => unreachable!(),
            },
        }),
    }
}
