//! Common error types for the Strata store.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`StrataError`].
pub type StrataResult<T> = Result<T, StrataError>;

/// Common errors across the Strata store.
#[derive(Error, Diagnostic, Debug)]
pub enum StrataError {
    /// The base image could not be resolved into layers.
    #[error("Failed to resolve base image {reference}: {message}")]
    #[diagnostic(code(strata::source::resolution))]
    SourceResolution {
        /// The image reference being resolved.
        reference: String,
        /// What went wrong.
        message: String,
    },

    /// The layers of the base image do not fit in the disk limit.
    #[error("Layers of {reference} need {required} bytes, exceeding the disk limit of {limit} bytes")]
    #[diagnostic(
        code(strata::quota::exceeded),
        help("Raise --disk-limit or pass --exclude-image-from-quota")
    )]
    QuotaExceeded {
        /// The image reference.
        reference: String,
        /// Sum of the layer sizes.
        required: u64,
        /// Configured disk limit.
        limit: u64,
    },

    /// No volume exists for the key.
    #[error("Volume not found: {key}")]
    #[diagnostic(code(strata::volume::not_found))]
    VolumeNotFound {
        /// The volume key.
        key: String,
    },

    /// The volume backend failed to create a volume.
    #[error("Failed to create volume {key}: {message}")]
    #[diagnostic(code(strata::volume::create))]
    VolumeCreation {
        /// The volume key.
        key: String,
        /// What went wrong.
        message: String,
    },

    /// The volume backend failed to destroy a volume.
    #[error("Failed to destroy volume {key}: {message}")]
    #[diagnostic(code(strata::volume::destroy))]
    VolumeDestroy {
        /// The volume key.
        key: String,
        /// What went wrong.
        message: String,
    },

    /// A layer could not be applied to its volume.
    #[error("Layer {index} ({blob_id}, chain {chain_id}) is corrupted: {message}")]
    #[diagnostic(
        code(strata::layer::corrupted),
        help("The partially unpacked volume was removed; pulling again fetches the layer anew")
    )]
    LayerCorrupted {
        /// Position of the layer, 0 being the root.
        index: usize,
        /// Chain id of the layer.
        chain_id: String,
        /// Blob the layer was streamed from.
        blob_id: String,
        /// What went wrong.
        message: String,
    },

    /// Dependencies could not be recorded for a reference.
    #[error("Failed to register dependencies of {name}: {message}")]
    #[diagnostic(code(strata::ledger::register))]
    DependencyRegistration {
        /// The reference name (`image:...` or `bundle:...`).
        name: String,
        /// What went wrong.
        message: String,
    },

    /// The store lock could not be acquired.
    #[error("Failed to lock {path}: {message}")]
    #[diagnostic(code(strata::lock::acquire))]
    Lock {
        /// The lock file.
        path: String,
        /// What went wrong.
        message: String,
    },

    /// The store lock was still held when the deadline passed.
    #[error("Timed out after {waited_ms}ms waiting for lock {path}")]
    #[diagnostic(
        code(strata::lock::timeout),
        help("Another create or clean is running against this store")
    )]
    LockTimeout {
        /// The lock file.
        path: String,
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// Some volumes could not be collected.
    #[error("Failed to collect {} volume(s): {}", .failures.len(), format_failures(.failures))]
    #[diagnostic(code(strata::gc::partial))]
    Collection {
        /// Volume keys with the reason their destroy failed.
        failures: Vec<(String, String)>,
    },

    /// Bundle not found.
    #[error("Bundle not found: {id}")]
    #[diagnostic(code(strata::bundle::not_found))]
    BundleNotFound {
        /// The bundle ID that was not found.
        id: String,
    },

    /// A bundle with this ID already exists.
    #[error("Bundle already exists: {id}")]
    #[diagnostic(code(strata::bundle::exists))]
    BundleExists {
        /// The conflicting bundle ID.
        id: String,
    },

    /// Invalid bundle ID format.
    #[error("Invalid bundle ID: {id}")]
    #[diagnostic(
        code(strata::bundle::invalid_id),
        help("Bundle IDs must start with an alphanumeric character and contain only alphanumerics, '-', '_' and '.', 1-64 characters")
    )]
    InvalidBundleId {
        /// The invalid bundle ID.
        id: String,
    },

    /// Invalid UID/GID mapping.
    #[error("Invalid id mapping: {value}")]
    #[diagnostic(
        code(strata::mapping::invalid),
        help("Mappings are written as 'namespace_id:host_id:size', e.g. '0:100000:65536'")
    )]
    InvalidIdMapping {
        /// The invalid value.
        value: String,
    },

    /// Invalid byte quantity format.
    #[error("Invalid byte quantity: {value}")]
    #[diagnostic(
        code(strata::quantity::invalid),
        help("Use formats like '1024', '512M', '10G', '500Mi' or '2Gi'")
    )]
    InvalidResourceQuantity {
        /// The invalid value.
        value: String,
    },

    /// The store was initialized with different id mappings.
    #[error("Store {store} was initialized with different id mappings")]
    #[diagnostic(
        code(strata::store::namespace_mismatch),
        help("Use the mappings the store was created with, or delete the store first")
    )]
    NamespaceMismatch {
        /// The store root.
        store: String,
    },

    /// The store has not been initialized.
    #[error("Store is not initialized: {store}")]
    #[diagnostic(code(strata::store::not_initialized), help("Run `strata init-store` first"))]
    StoreNotInitialized {
        /// The store root.
        store: String,
    },

    /// Feature not supported.
    #[error("Feature not supported: {feature}")]
    #[diagnostic(code(strata::unsupported))]
    Unsupported {
        /// The unsupported feature.
        feature: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(strata::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(strata::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(strata::serialization))]
    Serialization(String),

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(code(strata::internal), help("This is a bug, please report it"))]
    Internal {
        /// The error message.
        message: String,
    },
}

impl StrataError {
    /// Whether the error is a [`StrataError::VolumeNotFound`].
    #[must_use]
    pub const fn is_volume_not_found(&self) -> bool {
        matches!(self, Self::VolumeNotFound { .. })
    }
}

fn format_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(key, message)| format!("{key}: {message}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<serde_json::Error> for StrataError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for StrataError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
