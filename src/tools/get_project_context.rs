use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{ToolDefinition, input_schema};
use crate::data::MockStore;
use crate::error::ToolError;

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
struct GetProjectContextInput {}

async fn get_project_context_impl(
    store: Arc<MockStore>,
    input: serde_json::Value,
) -> Result<String, ToolError> {
    // Models sometimes send `null` for tools without parameters.
    if !input.is_null() {
        let _: GetProjectContextInput = serde_json::from_value(input)?;
    }
    Ok(serde_json::to_string(store.project_context())?)
}

pub(crate) fn definition() -> ToolDefinition {
    ToolDefinition {
        name: "get_project_context",
        description: "Retrieve the overall project context: goals, release timeline, critical user flows and known risk areas. Use this when prioritizing features by risk or aligning a test strategy with project goals.",
        input_schema: input_schema::<GetProjectContextInput>(),
        handler: |store, input| Box::pin(get_project_context_impl(store, input)),
    }
}
