//! Process-wide recognition backend.
//!
//! Engines are expensive to start, so the application installs one at
//! startup and hands [`handle`] to every [`crate::ReceiptPipeline`] it builds.
//! Nothing else in this crate reads this state.

use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

use crate::recognizer::{OcrBackend, OcrError};

static BACKEND: Mutex<Option<Arc<dyn OcrBackend>>> = Mutex::new(None);

fn slot() -> MutexGuard<'static, Option<Arc<dyn OcrBackend>>> {
    // The slot holds a plain Option, so a poisoned lock is still consistent.
    BACKEND.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Install the shared backend. Fails if one is already installed.
pub fn install(backend: impl OcrBackend + 'static) -> Result<Arc<dyn OcrBackend>, OcrError> {
    let mut slot = slot();
    if slot.is_some() {
        return Err(OcrError::AlreadyInitialized);
    }
    let backend: Arc<dyn OcrBackend> = Arc::new(backend);
    info!(backend = backend.name(), "OCR backend installed");
    *slot = Some(Arc::clone(&backend));
    Ok(backend)
}

/// The installed backend, if any.
pub fn handle() -> Result<Arc<dyn OcrBackend>, OcrError> {
    slot().clone().ok_or(OcrError::NotAvailable)
}

/// Drop the shared backend. Handles already given out stay valid.
pub fn shutdown() {
    if let Some(backend) = slot().take() {
        info!(backend = backend.name(), "OCR backend shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognizer::MockRecognizer;

    // One test owns the global slot so parallel tests can't interleave.
    #[test]
    fn install_handle_shutdown_lifecycle() {
        shutdown();
        assert!(matches!(handle(), Err(OcrError::NotAvailable)));

        let installed = install(MockRecognizer::new("x").named("first")).unwrap();
        assert_eq!(installed.name(), "first");
        assert_eq!(handle().unwrap().name(), "first");

        let second = install(MockRecognizer::new("y"));
        assert!(matches!(second, Err(OcrError::AlreadyInitialized)));

        shutdown();
        assert!(handle().is_err());
        // Outstanding handles survive teardown.
        assert_eq!(installed.name(), "first");

        install(MockRecognizer::new("z").named("again")).unwrap();
        assert_eq!(handle().unwrap().name(), "again");
        shutdown();
    }
}
