//! # Manifest Rendering
//!
//! Template loading, the field-mapping transformer and the renderer that
//! produces the per-reconcile [`ResourceMap`].
//!
//! ## Module Structure
//!
//! - `path.rs` - JSON-pointer paths and deep merge
//! - `resource.rs` - Rendered resource document and `ResourceMap`
//! - `kustomize.rs` - In-process kustomization build
//! - `transform.rs` - Field mappings, name prefix and namespace passes
//! - `mappings.rs` - Versioned mapping rule set
//! - `names.rs` - Names and labels of rendered objects
//! - `context.rs` - `ManifestContext`
//! - `render.rs` - The rendering pipeline
//! - `filter.rs` - Feature-driven exclusion

mod context;
pub mod filter;
pub mod kustomize;
pub mod mappings;
pub mod names;
pub mod path;
mod render;
mod resource;
pub mod transform;

pub use context::ManifestContext;
pub use filter::{filter_resources, FilterOutcome};
pub use path::{FieldPath, PathError};
pub use render::{render_manifests, resolve_template_dir};
pub use resource::{Resource, ResourceKey, ResourceMap};
pub use transform::FieldMapping;

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("referenced template not found: {}", path.display())]
    MissingResource { path: PathBuf },
    #[error("no kustomization file in {}", path.display())]
    KustomizationNotFound { path: PathBuf },
    #[error("kustomization nesting too deep at {}", path.display())]
    KustomizationDepth { path: PathBuf },
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {}: {source}", path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid resource: {reason}")]
    InvalidResource { reason: String },
    #[error("field mapping on {resource} failed: {source}")]
    Path {
        resource: String,
        #[source]
        source: PathError,
    },
    #[error(transparent)]
    InvalidPath(#[from] PathError),
    #[error("distribution has no namespace")]
    MissingNamespace,
}
