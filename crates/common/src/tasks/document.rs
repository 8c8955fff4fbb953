//! Task document schema and the normalisation applied at every boundary.
//!
//! On-disk field names (`TaskConfig`, `Default_Task`, `device_task_list`,
//! `CommandUUID`, ...) are kept as-is so existing data files load unchanged.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::registry::json_kind;

pub const DOCUMENT_VERSION: u32 = 1;
pub const DEFAULT_INTERVAL_SECS: i64 = 300;

/// Admin-defined command payload. The template name is its key in
/// [`TaskDocument::templates`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTemplate {
    #[serde(default)]
    pub body: Value,
    /// Forwarded verbatim as `type` in the command push.
    #[serde(rename = "type", default)]
    pub kind: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskTemplate {
    pub fn new(kind: impl Into<Value>, body: Value) -> Self {
        Self {
            body,
            kind: kind.into(),
            extra: Map::new(),
        }
    }

    fn from_value(name: &str, value: Value) -> Option<Self> {
        let Value::Object(mut obj) = value else {
            warn!(template = %name, kind = %json_kind(&value), "dropping non-object task template");
            return None;
        };
        let body = obj.remove("body").unwrap_or_else(|| Value::Object(Map::new()));
        let kind = obj.remove("type").unwrap_or(Value::Null);
        Some(Self {
            body,
            kind,
            extra: obj,
        })
    }
}

/// One entry of the policy applied to newly seen devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultTask {
    pub name: String,
    #[serde(default = "default_interval")]
    pub interval: i64,
}

fn default_interval() -> i64 {
    DEFAULT_INTERVAL_SECS
}

impl DefaultTask {
    pub fn new(name: impl Into<String>, interval: i64) -> Self {
        Self {
            name: name.into(),
            interval,
        }
    }

    fn from_value(value: Value) -> Option<Self> {
        let Value::Object(obj) = value else {
            warn!(kind = %json_kind(&value), "dropping non-object default task");
            return None;
        };
        Some(Self {
            name: obj.get("name").and_then(lenient_string).unwrap_or_default(),
            interval: obj
                .get("interval")
                .and_then(lenient_i64)
                .unwrap_or(DEFAULT_INTERVAL_SECS),
        })
    }
}

/// Per-device scheduling record of one template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstance {
    #[serde(rename = "task")]
    pub template: String,
    #[serde(rename = "CommandUUID", default)]
    pub command_uuid: String,
    #[serde(default)]
    pub interval: i64,
    /// Unix seconds of the last firing (or delivery).
    #[serde(rename = "lastExecuted", default)]
    pub last_executed: f64,
    #[serde(rename = "oneTime", default)]
    pub one_time: bool,
    #[serde(default)]
    pub consumed: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskInstance {
    /// Recurring instance that fires on the scheduler's next tick.
    pub fn recurring(template: impl Into<String>, interval: i64) -> Self {
        Self {
            template: template.into(),
            command_uuid: String::new(),
            interval,
            last_executed: 0.0,
            one_time: false,
            consumed: true,
            extra: Map::new(),
        }
    }

    /// Single-delivery instance, pending immediately.
    pub fn one_time(template: impl Into<String>, command_uuid: impl Into<String>, now: f64) -> Self {
        Self {
            template: template.into(),
            command_uuid: command_uuid.into(),
            interval: 0,
            last_executed: now,
            one_time: true,
            consumed: false,
            extra: Map::new(),
        }
    }

    fn from_value(device: &str, value: Value) -> Option<Self> {
        let Value::Object(mut obj) = value else {
            warn!(device = %device, kind = %json_kind(&value), "dropping non-object task instance");
            return None;
        };
        let mut take = |key: &str| obj.remove(key);

        let template = take("task").as_ref().and_then(lenient_string).unwrap_or_default();
        let command_uuid = take("CommandUUID")
            .as_ref()
            .and_then(lenient_string)
            .unwrap_or_default();
        let interval = take("interval").as_ref().and_then(lenient_i64).unwrap_or(0);
        let last_executed = take("lastExecuted").as_ref().and_then(lenient_f64).unwrap_or(0.0);
        let one_time = take("oneTime").as_ref().map(truthy).unwrap_or(false);
        let consumed = take("consumed").as_ref().map(truthy).unwrap_or(false);

        Some(Self {
            template,
            command_uuid,
            interval,
            last_executed,
            one_time,
            consumed,
            extra: obj,
        })
    }
}

/// The whole task-store document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value")]
pub struct TaskDocument {
    pub version: u32,
    #[serde(rename = "TaskConfig")]
    pub templates: BTreeMap<String, TaskTemplate>,
    #[serde(rename = "Default_Task")]
    pub default_tasks: Vec<DefaultTask>,
    #[serde(rename = "device_task_list")]
    pub device_tasks: BTreeMap<String, Vec<TaskInstance>>,
}

impl Default for TaskDocument {
    fn default() -> Self {
        Self {
            version: DOCUMENT_VERSION,
            templates: BTreeMap::new(),
            default_tasks: Vec::new(),
            device_tasks: BTreeMap::new(),
        }
    }
}

impl TaskDocument {
    /// Build a document from arbitrary JSON, resetting every missing or
    /// mistyped section to its empty form.
    pub fn from_value(value: Value) -> Self {
        let Value::Object(mut root) = value else {
            warn!(kind = %json_kind(&value), "task document is not an object, using empty document");
            return Self::default();
        };

        let version = root
            .get("version")
            .and_then(lenient_i64)
            .filter(|v| *v >= 1)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(DOCUMENT_VERSION);

        let templates = match root.remove("TaskConfig") {
            Some(Value::Object(map)) => map
                .into_iter()
                .filter_map(|(name, raw)| {
                    TaskTemplate::from_value(&name, raw).map(|template| (name, template))
                })
                .collect(),
            Some(other) => {
                warn!(kind = %json_kind(&other), "TaskConfig is not an object, resetting");
                BTreeMap::new()
            }
            None => BTreeMap::new(),
        };

        let default_tasks = match root.remove("Default_Task") {
            Some(Value::Array(items)) => items.into_iter().filter_map(DefaultTask::from_value).collect(),
            Some(other) => {
                warn!(kind = %json_kind(&other), "Default_Task is not an array, resetting");
                Vec::new()
            }
            None => Vec::new(),
        };

        let device_tasks = match root.remove("device_task_list") {
            Some(Value::Object(map)) => map
                .into_iter()
                .map(|(device, raw)| {
                    let list = match raw {
                        Value::Array(items) => items
                            .into_iter()
                            .filter_map(|item| TaskInstance::from_value(&device, item))
                            .collect(),
                        other => {
                            warn!(device = %device, kind = %json_kind(&other), "task list is not an array, resetting");
                            Vec::new()
                        }
                    };
                    (device, list)
                })
                .collect(),
            Some(other) => {
                warn!(kind = %json_kind(&other), "device_task_list is not an object, resetting");
                BTreeMap::new()
            }
            None => BTreeMap::new(),
        };

        Self {
            version,
            templates,
            default_tasks,
            device_tasks,
        }
    }

    /// Clamp fields a typed document can still get wrong.
    pub fn normalized(mut self) -> Self {
        if self.version < DOCUMENT_VERSION {
            self.version = DOCUMENT_VERSION;
        }
        self
    }
}

impl From<Value> for TaskDocument {
    fn from(value: Value) -> Self {
        Self::from_value(value)
    }
}

fn lenient_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn lenient_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|f| f.is_finite())
}

fn lenient_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| lenient_f64(value).map(|f| f as i64)),
        Value::String(_) => lenient_f64(value).map(|f| f as i64),
        _ => None,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !matches!(s.trim().to_ascii_lowercase().as_str(), "" | "0" | "false"),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn non_object_root_yields_default_document() {
        let doc = TaskDocument::from_value(json!([1, 2, 3]));
        assert_eq!(doc, TaskDocument::default());
        assert_eq!(doc.version, 1);
    }

    #[test]
    fn missing_and_mistyped_sections_are_reset() {
        let doc = TaskDocument::from_value(json!({
            "TaskConfig": [],
            "Default_Task": {"name": "x"},
            "device_task_list": {"dev-1": "oops", "dev-2": [{"task": "locate", "interval": 60}]}
        }));

        assert_eq!(doc.version, 1);
        assert!(doc.templates.is_empty());
        assert!(doc.default_tasks.is_empty());
        assert!(doc.device_tasks["dev-1"].is_empty());
        assert_eq!(doc.device_tasks["dev-2"][0].interval, 60);
    }

    #[test]
    fn instance_fields_are_coerced_leniently() {
        let doc = TaskDocument::from_value(json!({
            "version": "3",
            "device_task_list": {
                "dev-1": [
                    {"task": "locate", "interval": "120", "lastExecuted": 1700000000.5, "oneTime": 0, "note": "kept"},
                    42
                ]
            }
        }));

        assert_eq!(doc.version, 3);
        let list = &doc.device_tasks["dev-1"];
        assert_eq!(list.len(), 1);
        let instance = &list[0];
        assert_eq!(instance.interval, 120);
        assert_eq!(instance.last_executed, 1700000000.5);
        assert!(!instance.one_time);
        assert!(!instance.consumed, "missing consumed means pending");
        assert_eq!(instance.extra["note"], "kept");
    }

    #[test]
    fn default_task_interval_falls_back() {
        let doc = TaskDocument::from_value(json!({"Default_Task": [{"name": "locate"}]}));
        assert_eq!(doc.default_tasks, vec![DefaultTask::new("locate", DEFAULT_INTERVAL_SECS)]);
    }

    #[test]
    fn serialises_with_on_disk_names() {
        let mut doc = TaskDocument::default();
        doc.templates.insert(
            "locate".into(),
            TaskTemplate::new("locate", json!({"RequestType": "GPS"})),
        );
        doc.device_tasks
            .insert("dev-1".into(), vec![TaskInstance::recurring("locate", 60)]);

        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["TaskConfig"]["locate"]["type"], "locate");
        assert_eq!(value["device_task_list"]["dev-1"][0]["task"], "locate");
        assert_eq!(value["device_task_list"]["dev-1"][0]["CommandUUID"], "");
        assert_eq!(value["device_task_list"]["dev-1"][0]["consumed"], true);

        let back: TaskDocument = serde_json::from_value(value).unwrap();
        assert_eq!(back, doc);
    }
}
