// Collection and document addressing.
//
// Collections live at odd path depth ("users", "users/alice/posts"),
// documents at even depth ("users/alice").

use crate::error::{DocError, Result};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionRef {
    id: String,
}

impl CollectionRef {
    /// Build a collection reference from a `/`-separated path. Empty segments
    /// are ignored.
    pub fn new(path: &str) -> Result<Self> {
        let segments = split_path(path)?;
        if segments.len() % 2 == 0 {
            return Err(DocError::Validation(format!(
                "Invalid collection reference '{path}': collections need an odd number of path segments, got {}",
                segments.len()
            )));
        }
        Ok(CollectionRef {
            id: segments.join("/"),
        })
    }

    /// Full collection path, the key documents are stored under.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn doc(&self, doc_id: &str) -> Result<DocumentRef> {
        DocumentRef::new(&format!("{}/{doc_id}", self.id))
    }
}

impl fmt::Display for CollectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentRef {
    collection_id: String,
    id: String,
}

impl DocumentRef {
    pub fn new(path: &str) -> Result<Self> {
        let mut segments = split_path(path)?;
        if segments.len() % 2 != 0 {
            return Err(DocError::Validation(format!(
                "Invalid document reference '{path}': documents need an even number of path segments, got {}",
                segments.len()
            )));
        }
        let id = segments.pop().unwrap_or_default().to_string();
        Ok(DocumentRef {
            collection_id: segments.join("/"),
            id,
        })
    }

    pub fn collection_id(&self) -> &str {
        &self.collection_id
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> String {
        format!("{}/{}", self.collection_id, self.id)
    }

    pub fn parent(&self) -> CollectionRef {
        CollectionRef {
            id: self.collection_id.clone(),
        }
    }
}

impl fmt::Display for DocumentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection_id, self.id)
    }
}

/// Every collection, at any depth, whose last path segment is `id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionGroupRef {
    id: String,
}

impl CollectionGroupRef {
    pub fn new(id: &str) -> Result<Self> {
        if id.is_empty() || id.contains('/') {
            return Err(DocError::Validation(format!(
                "Invalid collection group id '{id}': must be a single non-empty segment"
            )));
        }
        Ok(CollectionGroupRef { id: id.to_string() })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Segment-aware suffix match against a full collection path.
    pub fn matches(&self, collection_id: &str) -> bool {
        collection_id == self.id
            || collection_id
                .strip_suffix(&self.id)
                .map(|prefix| prefix.ends_with('/'))
                .unwrap_or(false)
    }
}

fn split_path(path: &str) -> Result<Vec<&str>> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return Err(DocError::Validation(format!(
            "Invalid path '{path}': no segments"
        )));
    }
    Ok(segments)
}
