//! Task node attribute schema.

use serde_json::{json, Value};
use uuid::Uuid;

use lieflow_core::error::{FlowError, Result};
use lieflow_core::types::{parse_timestamp, Attrs, TaskStatus};

pub const KEY: &str = "key";
pub const TASK_TYPE: &str = "task_type";
pub const STATUS: &str = "status";
pub const TASK_ID: &str = "task_id";
pub const RETRY_COUNT: &str = "retry_count";
pub const STORE_OUTPUT: &str = "store_output";
pub const BREAKPOINT: &str = "breakpoint";
pub const WORKDIR: &str = "workdir";
pub const STARTED_AT: &str = "startedAtTime";
pub const ENDED_AT: &str = "endedAtTime";
pub const INPUT_DATA: &str = "input_data";
pub const OUTPUT_DATA: &str = "output_data";
pub const CONFIGURATION: &str = "configuration";
pub const CUSTOM_FUNC: &str = "custom_func";
pub const URI: &str = "uri";
pub const GROUP_CONTEXT: &str = "group_context";

/// Edge attribute: producer output key -> consumer input key.
pub const DATA_MAPPING: &str = "data_mapping";

/// Graph attributes.
pub const TITLE: &str = "title";
pub const DESCRIPTION: &str = "description";
pub const PROJECT_DIR: &str = "project_dir";
pub const CREATED_AT: &str = "created_at";

/// Default attributes for a freshly created task node.
pub fn task_defaults(name: &str, task_type: &str, retry_count: u64) -> Attrs {
    let mut attrs = Attrs::new();
    attrs.insert(KEY.into(), json!(name));
    attrs.insert(TASK_TYPE.into(), json!(task_type));
    attrs.insert(STATUS.into(), json!(TaskStatus::Ready.as_str()));
    attrs.insert(TASK_ID.into(), json!(Uuid::new_v4().to_string()));
    attrs.insert(RETRY_COUNT.into(), json!(retry_count));
    attrs.insert(STORE_OUTPUT.into(), json!(true));
    attrs.insert(BREAKPOINT.into(), json!(false));
    attrs.insert(WORKDIR.into(), Value::Null);
    attrs.insert(STARTED_AT.into(), Value::Null);
    attrs.insert(ENDED_AT.into(), Value::Null);
    attrs.insert(INPUT_DATA.into(), json!({}));
    attrs.insert(OUTPUT_DATA.into(), json!({}));
    attrs.insert(CONFIGURATION.into(), json!({}));
    attrs
}

/// Problem with a single attribute value, if any.
///
/// Keys outside the task schema are unconstrained.
pub fn check_value(key: &str, value: &Value) -> Option<String> {
    let ok = match key {
        KEY | TASK_TYPE => value.as_str().map(|s| !s.is_empty()).unwrap_or(false),
        STATUS => value
            .as_str()
            .map(|s| s.parse::<TaskStatus>().is_ok())
            .unwrap_or(false),
        TASK_ID => value
            .as_str()
            .map(|s| Uuid::parse_str(s).is_ok())
            .unwrap_or(false),
        RETRY_COUNT => value.is_u64(),
        STORE_OUTPUT | BREAKPOINT => value.is_boolean(),
        WORKDIR | CUSTOM_FUNC | URI | GROUP_CONTEXT => value.is_null() || value.is_string(),
        STARTED_AT | ENDED_AT => {
            value.is_null()
                || value
                    .as_str()
                    .map(|s| parse_timestamp(s).is_some())
                    .unwrap_or(false)
        }
        INPUT_DATA | OUTPUT_DATA | CONFIGURATION => value.is_object(),
        _ => true,
    };
    if ok {
        None
    } else {
        Some(format!("{}: invalid value {}", key, value))
    }
}

/// Like [`check_value`], as a `Validation` error.
pub fn validate_value(key: &str, value: &Value) -> Result<()> {
    match check_value(key, value) {
        Some(problem) => Err(FlowError::Validation(problem)),
        None => Ok(()),
    }
}

const REQUIRED: [&str; 4] = [KEY, TASK_TYPE, STATUS, TASK_ID];

/// Every schema problem of a task node's attributes.
pub fn check(attrs: &Attrs) -> Vec<String> {
    let mut problems: Vec<String> = REQUIRED
        .iter()
        .filter(|key| !attrs.contains_key(**key))
        .map(|key| format!("{}: required", key))
        .collect();
    problems.extend(attrs.iter().filter_map(|(k, v)| check_value(k, v)));
    problems
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_pass_schema() {
        let attrs = task_defaults("t1", "PythonTask", 2);
        assert!(check(&attrs).is_empty());
        assert_eq!(attrs[RETRY_COUNT], json!(2));
        assert_eq!(attrs[STORE_OUTPUT], json!(true));
    }

    #[test]
    fn test_invalid_values() {
        assert!(check_value(STATUS, &json!("sleeping")).is_some());
        assert!(check_value(STATUS, &json!("failed")).is_none());
        assert!(check_value(TASK_ID, &json!("not-a-uuid")).is_some());
        assert!(check_value(RETRY_COUNT, &json!(-1)).is_some());
        assert!(check_value(STARTED_AT, &json!("2024-01-01T10:00:00Z")).is_none());
        assert!(check_value(STARTED_AT, &json!("10 o'clock")).is_some());
        assert!(check_value("anything", &json!([1, 2])).is_none());
    }

    #[test]
    fn test_missing_required() {
        let mut attrs = task_defaults("t1", "PythonTask", 0);
        attrs.remove(TASK_ID);
        attrs.insert(BREAKPOINT.into(), json!("yes"));
        let problems = check(&attrs);
        assert_eq!(problems.len(), 2);
        assert!(problems.iter().any(|p| p.starts_with("task_id")));
    }
}
