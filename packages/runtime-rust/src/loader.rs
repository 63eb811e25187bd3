//! Resolution of artifact locators to wiring descriptors.
//!
//! Packaging formats are out of scope; a locator names a JSON descriptor
//! document (`file://`) or a descriptor registered in memory (`mem://name`).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use flowyard_core::WiringDescriptor;
use url::Url;

/// Why a locator could not be resolved.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("unsupported scheme '{0}'")]
    UnsupportedScheme(String),
    #[error("nothing found at locator")]
    NotFound,
    #[error("cannot read descriptor: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed descriptor: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Resolves a locator to the descriptor of the artifact it names.
#[async_trait]
pub trait DescriptorLoader: Send + Sync {
    /// # Errors
    ///
    /// Returns a `LoadError` if the locator cannot be resolved or parsed.
    async fn resolve(&self, locator: &Url) -> Result<WiringDescriptor, LoadError>;
}

// ---------------------------------------------------------------------------
// FileLoader
// ---------------------------------------------------------------------------

/// Reads JSON descriptors from `file://` locators.
#[derive(Debug, Default, Clone)]
pub struct FileLoader;

#[async_trait]
impl DescriptorLoader for FileLoader {
    async fn resolve(&self, locator: &Url) -> Result<WiringDescriptor, LoadError> {
        if locator.scheme() != "file" {
            return Err(LoadError::UnsupportedScheme(locator.scheme().to_string()));
        }
        let path = locator.to_file_path().map_err(|()| LoadError::NotFound)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(LoadError::NotFound)
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }
}

// ---------------------------------------------------------------------------
// MemoryLoader
// ---------------------------------------------------------------------------

/// Descriptors published in process under `mem://<name>`.
///
/// Republishing a name replaces the descriptor; later resolutions (for
/// example by `update`) see the new version.
#[derive(Debug, Default)]
pub struct MemoryLoader {
    descriptors: DashMap<String, WiringDescriptor>,
}

impl MemoryLoader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a descriptor and returns its locator.
    pub fn publish(&self, name: &str, descriptor: WiringDescriptor) -> String {
        self.descriptors.insert(name.to_string(), descriptor);
        format!("mem://{name}")
    }
}

#[async_trait]
impl DescriptorLoader for MemoryLoader {
    async fn resolve(&self, locator: &Url) -> Result<WiringDescriptor, LoadError> {
        if locator.scheme() != "mem" {
            return Err(LoadError::UnsupportedScheme(locator.scheme().to_string()));
        }
        let name = locator.host_str().unwrap_or_default();
        self.descriptors
            .get(name)
            .map(|d| d.value().clone())
            .ok_or(LoadError::NotFound)
    }
}

// ---------------------------------------------------------------------------
// SchemeLoader
// ---------------------------------------------------------------------------

/// Dispatches on the locator scheme.
#[derive(Default, Clone)]
pub struct SchemeLoader {
    loaders: HashMap<String, Arc<dyn DescriptorLoader>>,
}

impl SchemeLoader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loader for `file://` plus the given in-memory catalog for `mem://`.
    #[must_use]
    pub fn standard(memory: Arc<MemoryLoader>) -> Self {
        Self::new()
            .with("file", Arc::new(FileLoader))
            .with("mem", memory)
    }

    #[must_use]
    pub fn with(mut self, scheme: &str, loader: Arc<dyn DescriptorLoader>) -> Self {
        self.loaders.insert(scheme.to_string(), loader);
        self
    }
}

#[async_trait]
impl DescriptorLoader for SchemeLoader {
    async fn resolve(&self, locator: &Url) -> Result<WiringDescriptor, LoadError> {
        match self.loaders.get(locator.scheme()) {
            Some(loader) => loader.resolve(locator).await,
            None => Err(LoadError::UnsupportedScheme(locator.scheme().to_string())),
        }
    }
}
