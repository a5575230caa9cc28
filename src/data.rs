//! Mock JIRA records and project context loaded from JSON files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::DataError;

pub const FEATURES_FILE: &str = "features.json";
pub const BUGS_FILE: &str = "bugs.json";
pub const PROJECT_CONTEXT_FILE: &str = "project_context.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JiraRecord {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Default)]
pub struct MockStore {
    features: HashMap<String, JiraRecord>,
    bugs: HashMap<String, JiraRecord>,
    project: Value,
}

impl MockStore {
    /// Loads all three data files from `dir`. A missing file is logged and
    /// treated as empty; a file that exists but does not parse is an error.
    pub fn load(dir: &Path) -> Result<Self, DataError> {
        let features = load_records(&dir.join(FEATURES_FILE))?;
        let bugs = load_records(&dir.join(BUGS_FILE))?;
        let project = read_json(&dir.join(PROJECT_CONTEXT_FILE))?
            .unwrap_or_else(|| Value::Object(Default::default()));

        info!(
            dir = %dir.display(),
            features = features.len(),
            bugs = bugs.len(),
            "loaded mock data"
        );

        Ok(Self {
            features,
            bugs,
            project,
        })
    }

    pub fn feature(&self, feature_id: &str) -> JiraRecord {
        let key = normalize_key(feature_id);
        self.features.get(&key).cloned().unwrap_or_else(|| JiraRecord {
            title: format!("Unknown feature {key}"),
            description: "No mock data is available for that feature ID.".to_string(),
        })
    }

    pub fn bug(&self, bug_id: &str) -> JiraRecord {
        let key = normalize_key(bug_id);
        self.bugs.get(&key).cloned().unwrap_or_else(|| JiraRecord {
            title: format!("Unknown bug {key}"),
            description: "No mock data is available for that bug ID.".to_string(),
        })
    }

    pub fn project_context(&self) -> &Value {
        &self.project
    }
}

pub fn normalize_key(id: &str) -> String {
    id.trim().to_uppercase()
}

fn load_records(path: &Path) -> Result<HashMap<String, JiraRecord>, DataError> {
    let Some(raw) = read_json(path)? else {
        return Ok(HashMap::new());
    };
    let records: HashMap<String, JiraRecord> =
        serde_json::from_value(raw).map_err(|source| DataError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    Ok(records
        .into_iter()
        .map(|(key, record)| (normalize_key(&key), record))
        .collect())
}

fn read_json(path: &Path) -> Result<Option<Value>, DataError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "missing data file");
            return Ok(None);
        }
        Err(source) => {
            return Err(DataError::Io {
                path: PathBuf::from(path),
                source,
            });
        }
    };

    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| DataError::Parse {
            path: path.to_path_buf(),
            source,
        })
}
