//! Object catalog collaborator.
//!
//! The catalog resolves object references to metadata and expands
//! containers into their ordered child media. It is backed by the same
//! SQLite database as the stores (see [`crate::store::SqliteStore`]).

use crate::object::{ObjectRef, ObjectType};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Error type for catalog lookups
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Referenced object does not exist
    #[error("Catalog object not found: {0}")]
    NotFound(ObjectRef),

    /// Backend failure
    #[error("Catalog backend error: {0}")]
    Backend(String),
}

/// Metadata for one catalog object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogObject {
    pub object: ObjectRef,
    pub title: String,
    /// Media file on disk; containers have none.
    pub path: Option<PathBuf>,
}

/// Read access to the media catalog.
pub trait ObjectCatalog: Send + Sync {
    /// Look up a single object.
    fn lookup(&self, object: &ObjectRef) -> Result<Option<CatalogObject>, CatalogError>;

    /// Ordered child media of a container. Leaves have no children.
    fn children(&self, object: &ObjectRef) -> Result<Vec<CatalogObject>, CatalogError>;
}

/// Playable media behind a target: the children of a container, or the
/// object itself for a leaf.
pub fn media_of(
    catalog: &dyn ObjectCatalog,
    target: &ObjectRef,
) -> Result<Vec<CatalogObject>, CatalogError> {
    if target.object_type.is_container() {
        return catalog.children(target);
    }

    match catalog.lookup(target)? {
        Some(object) => Ok(vec![object]),
        None => Err(CatalogError::NotFound(*target)),
    }
}

/// Whether `object` is `target` itself or one of its container children.
pub fn is_part_of(
    catalog: &dyn ObjectCatalog,
    target: &ObjectRef,
    object: &ObjectRef,
) -> Result<bool, CatalogError> {
    if target == object {
        return Ok(true);
    }
    if !target.object_type.is_container() || !object.object_type.is_media() {
        return Ok(false);
    }

    Ok(catalog
        .children(target)?
        .iter()
        .any(|child| child.object == *object))
}

/// Returns the object when it can be served as a file.
pub fn media_file(
    catalog: &dyn ObjectCatalog,
    object: &ObjectRef,
) -> Result<CatalogObject, CatalogError> {
    match catalog.lookup(object)? {
        Some(found) if found.path.is_some() && found.object.object_type != ObjectType::Channel => {
            Ok(found)
        }
        _ => Err(CatalogError::NotFound(*object)),
    }
}
