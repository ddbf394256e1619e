use std::sync::{Arc, Mutex};

/// Progress callback: `(uploaded, total)` in bytes
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Reports progress of one upload, never letting `uploaded` go backwards.
/// An unknown total is reported as 0 until the final call.
pub(crate) struct ProgressTracker {
    total: Option<u64>,
    uploaded: Mutex<u64>,
    callback: Option<ProgressCallback>,
}

impl ProgressTracker {
    pub fn new(total: Option<u64>, callback: Option<ProgressCallback>) -> Self {
        Self {
            total,
            uploaded: Mutex::new(0),
            callback,
        }
    }

    /// Reports an absolute byte count
    pub fn report(&self, uploaded: u64) {
        let reported = match self.uploaded.lock() {
            Ok(mut current) => {
                let uploaded = self.total.map_or(uploaded, |total| uploaded.min(total));
                *current = (*current).max(uploaded);
                *current
            }
            Err(_) => return,
        };
        if let Some(callback) = &self.callback {
            callback(reported, self.total.unwrap_or(0));
        }
    }

    pub fn add(&self, bytes: u64) {
        let uploaded = self.uploaded().saturating_add(bytes);
        self.report(uploaded);
    }

    /// Final call, with `uploaded == total`
    pub fn finish(&self) {
        let total = match self.total {
            Some(total) => total,
            None => self.uploaded(),
        };
        if let Ok(mut current) = self.uploaded.lock() {
            *current = total;
        }
        if let Some(callback) = &self.callback {
            callback(total, total);
        }
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.lock().map(|current| *current).unwrap_or(0)
    }
}
