use std::path::Path;

use tracing::{info, warn};

pub const QA_AGENT_INSTRUCTIONS: &str = "You are QA Assistant Agent, a senior-quality specialist. \
Guide users on testing strategy, answer QA questions, suggest targeted test cases, outline retest \
focus for defects, and prioritize features by risk and project goals. \
Draw on provided tools for JIRA data when feature or bug IDs are supplied, and on the project \
context tool when risk or priority depends on project goals.";

/// Returns the agent instructions, read from `path` when one is given.
///
/// An empty override file falls back to the built-in instructions.
pub fn load_instructions(path: Option<&Path>) -> std::io::Result<String> {
    let Some(path) = path else {
        info!("using built-in agent instructions");
        return Ok(QA_AGENT_INSTRUCTIONS.to_string());
    };

    let text = std::fs::read_to_string(path)?;
    let text = text.trim();
    if text.is_empty() {
        warn!(path = %path.display(), "instructions file is empty, using built-in instructions");
        return Ok(QA_AGENT_INSTRUCTIONS.to_string());
    }

    info!(path = %path.display(), "loaded agent instructions");
    Ok(text.to_string())
}
