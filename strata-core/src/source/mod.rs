//! Build sources.
//!
//! A source materializes external inputs (images, git trees, local
//! contexts) into committed snapshots. The identifier grammar is
//! `scheme://body`; the scheme selects a registered [`Source`] plugin.
//! Concurrent pulls of the same identifier coalesce onto one backend call.

pub mod local;

use crate::cache::ImmutableRef;
use crate::error::{Result, StrataError};
use crate::singleflight::Group;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::debug;

pub const ATTR_KEEP_GIT_DIR: &str = "git.keepgitdir";
pub const ATTR_LOCAL_SESSION_ID: &str = "local.session";

/// Parsed source identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identifier {
    /// `docker-image://<reference>`
    Image { reference: String },
    /// `git://<remote>[#<ref>]`
    Git { remote: String, git_ref: String, keep_git_dir: bool },
    /// `local://<name>`
    Local { name: String, session_id: Option<String> },
    /// Reserved empty source; never pulled.
    Scratch,
}

impl Identifier {
    /// Parse an identifier with its attribute map, as carried by a source
    /// op.
    pub fn from_op(identifier: &str, attrs: &HashMap<String, String>) -> Result<Self> {
        if identifier == "scratch" {
            return Ok(Identifier::Scratch);
        }
        let (scheme, body) = identifier
            .split_once("://")
            .ok_or_else(|| StrataError::InvalidIdentifier { identifier: identifier.to_string() })?;
        if body.is_empty() {
            return Err(StrataError::InvalidIdentifier { identifier: identifier.to_string() });
        }
        match scheme {
            "docker-image" => Ok(Identifier::Image { reference: body.to_string() }),
            "git" => {
                let (remote, git_ref) = match body.split_once('#') {
                    Some((remote, r)) => (remote.to_string(), r.to_string()),
                    None => (body.to_string(), String::new()),
                };
                Ok(Identifier::Git {
                    remote,
                    git_ref,
                    keep_git_dir: attrs.get(ATTR_KEEP_GIT_DIR).map(|v| v == "true").unwrap_or(false),
                })
            }
            "local" => Ok(Identifier::Local {
                name: body.to_string(),
                session_id: attrs.get(ATTR_LOCAL_SESSION_ID).cloned(),
            }),
            _ => Err(StrataError::UnknownScheme { scheme: scheme.to_string() }),
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            Identifier::Image { .. } => "docker-image",
            Identifier::Git { .. } => "git",
            Identifier::Local { .. } => "local",
            Identifier::Scratch => "scratch",
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Image { reference } => write!(f, "docker-image://{}", reference),
            Identifier::Git { remote, git_ref, .. } if git_ref.is_empty() => {
                write!(f, "git://{}", remote)
            }
            Identifier::Git { remote, git_ref, .. } => write!(f, "git://{}#{}", remote, git_ref),
            Identifier::Local { name, .. } => write!(f, "local://{}", name),
            Identifier::Scratch => write!(f, "scratch"),
        }
    }
}

/// A source plugin.
#[async_trait]
pub trait Source: Send + Sync {
    /// The identifier scheme this source serves.
    fn scheme(&self) -> &'static str;

    /// Materialize the identified input as a committed snapshot.
    async fn pull(&self, id: &Identifier) -> Result<ImmutableRef>;
}

/// Registry of sources keyed by scheme.
#[derive(Default)]
pub struct SourceManager {
    sources: Mutex<HashMap<&'static str, Arc<dyn Source>>>,
    flight: Group<ImmutableRef>,
}

impl SourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, source: Arc<dyn Source>) {
        self.sources.lock().unwrap().insert(source.scheme(), source);
    }

    /// Pull through the registered source. Concurrent pulls of the same
    /// identifier run the backend at most once; every caller receives its
    /// own handle.
    pub async fn pull(&self, id: &Identifier) -> Result<ImmutableRef> {
        if matches!(id, Identifier::Scratch) {
            return Err(StrataError::InvalidOp {
                reason: "scratch is an empty source and cannot be pulled".to_string(),
            });
        }
        let source = self
            .sources
            .lock()
            .unwrap()
            .get(id.scheme())
            .cloned()
            .ok_or_else(|| StrataError::UnknownScheme { scheme: id.scheme().to_string() })?;

        let key = id.to_string();
        debug!(identifier = %key, "pulling source");
        let id = id.clone();
        let identifier = key.clone();
        self.flight
            .run(&key, async move { source.pull(&id).await })
            .await
            .map_err(|e| StrataError::Source { identifier, source: anyhow::Error::new(e) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_image() {
        let id = Identifier::from_op("docker-image://alpine:3.19", &HashMap::new()).unwrap();
        assert_eq!(id, Identifier::Image { reference: "alpine:3.19".to_string() });
        assert_eq!(id.to_string(), "docker-image://alpine:3.19");
    }

    #[test]
    fn test_parse_git_with_ref_and_attrs() {
        let mut attrs = HashMap::new();
        attrs.insert(ATTR_KEEP_GIT_DIR.to_string(), "true".to_string());
        let id =
            Identifier::from_op("git://github.com/example/app.git#main", &attrs).unwrap();
        assert_eq!(
            id,
            Identifier::Git {
                remote: "github.com/example/app.git".to_string(),
                git_ref: "main".to_string(),
                keep_git_dir: true,
            }
        );
        assert_eq!(id.to_string(), "git://github.com/example/app.git#main");
    }

    #[test]
    fn test_parse_local_with_session() {
        let mut attrs = HashMap::new();
        attrs.insert(ATTR_LOCAL_SESSION_ID.to_string(), "sess-1".to_string());
        let id = Identifier::from_op("local://context", &attrs).unwrap();
        assert_eq!(
            id,
            Identifier::Local { name: "context".to_string(), session_id: Some("sess-1".to_string()) }
        );
    }

    #[test]
    fn test_parse_scratch() {
        let id = Identifier::from_op("scratch", &HashMap::new()).unwrap();
        assert_eq!(id, Identifier::Scratch);
    }

    #[test]
    fn test_parse_rejects_bad_identifiers() {
        assert!(matches!(
            Identifier::from_op("no-scheme", &HashMap::new()),
            Err(StrataError::InvalidIdentifier { .. })
        ));
        assert!(matches!(
            Identifier::from_op("ftp://somewhere", &HashMap::new()),
            Err(StrataError::UnknownScheme { .. })
        ));
        assert!(matches!(
            Identifier::from_op("git://", &HashMap::new()),
            Err(StrataError::InvalidIdentifier { .. })
        ));
    }
}
