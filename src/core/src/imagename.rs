//! Image name parsing for FROM, TAG and PUSH.
//!
//! Parses names like `registry.example.com:5000/team/app:1.0` into a
//! repository and a tag.

use crate::error::{KilnError, Result};
use std::fmt;

/// Default tag when none is specified.
pub const DEFAULT_TAG: &str = "latest";

/// Parsed image name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageName {
    /// Registry hostname, if the name carries one
    pub registry: Option<String>,
    /// Repository path without registry (e.g. "team/app")
    pub name: String,
    /// Tag, `None` when only a digest or nothing was given
    pub tag: Option<String>,
    /// Digest (e.g. "sha256:abc...")
    pub digest: Option<String>,
}

impl ImageName {
    /// Parse an image name.
    ///
    /// - `alpine` → repository `alpine`, tag `latest`
    /// - `localhost:5000/app` → registry `localhost:5000`, tag `latest`
    /// - `app@sha256:...` → digest, no tag
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(KilnError::ConfigError("empty image name".to_string()));
        }

        let (rest, digest) = match s.rsplit_once('@') {
            Some((rest, digest)) if digest.contains(':') => (rest, Some(digest.to_string())),
            Some(_) => {
                return Err(KilnError::ConfigError(format!(
                    "invalid digest in image name '{}'",
                    s
                )))
            }
            None => (s, None),
        };

        // A colon after the last slash separates the tag; one before it is a port
        let last_slash = rest.rfind('/').map(|p| p + 1).unwrap_or(0);
        let (path, tag) = match rest[last_slash..].rfind(':') {
            Some(colon) => {
                let at = last_slash + colon;
                (&rest[..at], Some(rest[at + 1..].to_string()))
            }
            None => (rest, None),
        };

        let (registry, name) = match path.split_once('/') {
            Some((first, remainder))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (Some(first.to_string()), remainder.to_string())
            }
            _ => (None, path.to_string()),
        };

        if name.is_empty() || tag.as_deref() == Some("") {
            return Err(KilnError::ConfigError(format!("invalid image name '{}'", s)));
        }

        let tag = match (tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (tag, _) => tag,
        };

        Ok(Self {
            registry,
            name,
            tag,
            digest,
        })
    }

    /// Repository including the registry, without tag or digest.
    pub fn repository(&self) -> String {
        match &self.registry {
            Some(registry) => format!("{}/{}", registry, self.name),
            None => self.name.clone(),
        }
    }

    pub fn tag_or_latest(&self) -> &str {
        self.tag.as_deref().unwrap_or(DEFAULT_TAG)
    }

    /// The name carries an explicit registry.
    pub fn has_registry(&self) -> bool {
        self.registry.is_some()
    }
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.repository())?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}
