//! The external collaborator that owns byte storage. The core never writes
//! to a filesystem or database directly — only through this trait — mirroring
//! the host application's own separation between a service and its storage
//! layer (`FileManager`/VFS).

use async_trait::async_trait;

use super::error::GradingError;

#[async_trait]
pub trait PersistenceDelegate: Send + Sync {
    /// Persists a page's bytes (`kind` is e.g. `"original"` or `"graded"`)
    /// and returns a URL the caller can later resolve.
    async fn put(&self, kind: &str, bytes: &[u8]) -> Result<String, GradingError>;

    /// Persists raw engine reply text for later replay, returning an
    /// opaque id. Only called when `debug.save_raw` is enabled.
    async fn put_artifact(&self, kind: &str, text: &str) -> Result<String, GradingError>;
}

/// A delegate that keeps everything in memory, for tests and for the CLI
/// harness where no real object store is wired up.
pub struct InMemoryDelegate {
    pub fail: bool,
}

impl InMemoryDelegate {
    pub fn new() -> Self {
        Self { fail: false }
    }
}

impl Default for InMemoryDelegate {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersistenceDelegate for InMemoryDelegate {
    async fn put(&self, kind: &str, bytes: &[u8]) -> Result<String, GradingError> {
        if self.fail {
            return Err(GradingError::DelegatePersistFailure(format!(
                "simulated failure persisting {kind}"
            )));
        }
        Ok(format!("mem://{kind}/{}", bytes.len()))
    }

    async fn put_artifact(&self, kind: &str, text: &str) -> Result<String, GradingError> {
        if self.fail {
            return Err(GradingError::DelegatePersistFailure(format!(
                "simulated failure persisting artifact {kind}"
            )));
        }
        Ok(format!("mem-artifact://{kind}/{}", text.len()))
    }
}
