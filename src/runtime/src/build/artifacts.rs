//! Artifact files written by PUSH.
//!
//! Each tagged image gets a small YAML document describing what was built so
//! that deployment tooling can pick up the exact digest.

use chrono::{DateTime, Utc};
use kiln_core::error::{KilnError, Result};
use kiln_core::imagename::ImageName;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub pushed: bool,
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    pub image_id: String,
    /// `repository@digest`, set once the image was pushed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addressable: Option<String>,
    pub build_time: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Artifacts {
    artifacts: Vec<Artifact>,
}

impl Artifact {
    pub fn new(image: &ImageName, image_id: &str, pushed: bool) -> Self {
        Self {
            name: image.to_string(),
            pushed,
            tag: image.tag_or_latest().to_string(),
            digest: None,
            image_id: image_id.to_string(),
            addressable: None,
            build_time: Utc::now(),
        }
    }

    pub fn set_digest(&mut self, image: &ImageName, digest: &str) {
        self.digest = Some(digest.to_string());
        self.addressable = Some(format!("{}@{}", image.repository(), digest));
    }

    /// `<repository with slashes replaced>_<tag>.yml`
    pub fn file_name(image: &ImageName) -> String {
        let repository = image.repository().replace(['/', ':'], "_");
        format!("{}_{}.yml", repository, image.tag_or_latest())
    }

    /// Write the artifact file into `dir`, creating the directory if needed.
    pub fn write(&self, image: &ImageName, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir).map_err(|e| {
            KilnError::BuildError(format!(
                "Failed to create artifacts directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let path = dir.join(Self::file_name(image));
        let content = serde_yaml::to_string(&Artifacts {
            artifacts: vec![self.clone()],
        })?;
        std::fs::write(&path, content)?;
        Ok(path)
    }
}
