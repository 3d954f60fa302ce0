//! Build job messages consumed from the job queue.

use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Component, Path, PathBuf};

use crate::{Error, Result};

/// A request to build a project and run commands inside the resulting image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildJob {
    #[serde(deserialize_with = "string_or_number")]
    pub project_id: String,
    #[serde(deserialize_with = "string_or_number")]
    pub build_id: String,
    /// Project source folder, relative to the projects root.
    pub folder: String,
    /// Commands to run in order, each an argument vector.
    #[serde(default)]
    pub commands: Vec<Vec<String>>,
}

impl BuildJob {
    /// Decode a job from a raw queue message body.
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body).map_err(|e| Error::InvalidInput(e.to_string()))
    }

    /// Resolve the job's source folder under `root`.
    ///
    /// The folder must be relative and must not climb out of `root`.
    pub fn source_path(&self, root: &Path) -> Result<PathBuf> {
        let folder = Path::new(&self.folder);
        for component in folder.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => {
                    return Err(Error::InvalidInput(format!(
                        "project folder must be a relative path inside the projects root: {}",
                        self.folder
                    )));
                }
            }
        }
        Ok(root.join(folder))
    }
}

/// Older producers send numeric identifiers.
fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(i64),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Number(n) => n.to_string(),
    })
}
