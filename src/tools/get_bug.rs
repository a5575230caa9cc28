use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{ToolDefinition, input_schema};
use crate::data::MockStore;
use crate::error::ToolError;

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
struct GetBugInput {
    #[schemars(description = "The JIRA bug key (e.g., \"BUG-123\").")]
    bug_id: String,
}

async fn get_bug_impl(
    store: Arc<MockStore>,
    input: serde_json::Value,
) -> Result<String, ToolError> {
    let input: GetBugInput = serde_json::from_value(input)?;
    let record = store.bug(&input.bug_id);
    Ok(serde_json::to_string(&record)?)
}

pub(crate) fn definition() -> ToolDefinition {
    ToolDefinition {
        name: "get_bug_from_jira",
        description: "Retrieve a bug from JIRA by key.\n\nCall this tool when the user asks how to retest a bug, verify a fix, or needs bug details to outline retest steps. Returns the bug's title and description.",
        input_schema: input_schema::<GetBugInput>(),
        handler: |store, input| Box::pin(get_bug_impl(store, input)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::tests::sample_store;
    use serde_json::json;

    #[tokio::test]
    async fn returns_record_as_json() {
        let store = Arc::new(sample_store());
        let output = get_bug_impl(store, json!({"bug_id": "bug-201"}))
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["title"], "Checkout total ignores discount");
    }

    #[tokio::test]
    async fn rejects_missing_bug_id() {
        let store = Arc::new(sample_store());
        let err = get_bug_impl(store, json!({"id": "BUG-201"})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidInput(_)));
    }
}
