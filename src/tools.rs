use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::data::MockStore;
use crate::error::ToolError;

mod get_bug;
mod get_feature;
mod get_project_context;

type ToolHandler = fn(
    Arc<MockStore>,
    serde_json::Value,
) -> Pin<Box<dyn Future<Output = Result<String, ToolError>> + Send>>;

pub(crate) struct ToolDefinition {
    pub(crate) name: &'static str,
    pub(crate) description: &'static str,
    pub(crate) input_schema: serde_json::Value,
    pub(crate) handler: ToolHandler,
}

pub(crate) fn get_all_tools() -> Vec<ToolDefinition> {
    vec![
        get_feature::definition(),
        get_bug::definition(),
        get_project_context::definition(),
    ]
}

fn input_schema<T: schemars::JsonSchema>() -> serde_json::Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or_else(|_| {
        serde_json::json!({ "type": "object", "properties": {} })
    })
}
