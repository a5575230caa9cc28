use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{ToolDefinition, input_schema};
use crate::data::MockStore;
use crate::error::ToolError;

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
struct GetFeatureInput {
    #[schemars(description = "The JIRA feature key (e.g., \"FEAT-123\").")]
    feature_id: String,
}

async fn get_feature_impl(
    store: Arc<MockStore>,
    input: serde_json::Value,
) -> Result<String, ToolError> {
    let input: GetFeatureInput = serde_json::from_value(input)?;
    let record = store.feature(&input.feature_id);
    Ok(serde_json::to_string(&record)?)
}

pub(crate) fn definition() -> ToolDefinition {
    ToolDefinition {
        name: "get_feature_from_jira",
        description: "Retrieve a feature from JIRA by key.\n\nCall this tool when the user asks about test cases for a feature, needs context to generate test cases, or wants details about a feature. Returns the feature's title and description.",
        input_schema: input_schema::<GetFeatureInput>(),
        handler: |store, input| Box::pin(get_feature_impl(store, input)),
    }
}
