use tokio::sync::{Semaphore, SemaphorePermit};

/// Daemon-wide single permit for large transfers.
///
/// At most one file above the configured size threshold is copied at a time,
/// across all jobs, so a pair of bulk transfers cannot saturate the disk
/// together. Small files are unaffected. The permit is released when the
/// guard returned by [`LargeFileGate::acquire`] is dropped, including on
/// cancellation or error.
pub struct LargeFileGate {
    permit: Semaphore,
}

impl LargeFileGate {
    pub fn new() -> Self {
        Self {
            permit: Semaphore::new(1),
        }
    }

    /// Waits for the single large-transfer slot.
    pub async fn acquire(&self) -> SemaphorePermit<'_> {
        self.permit
            .acquire()
            .await
            .expect("large file gate semaphore is never closed")
    }

    /// Whether a file of `size_bytes` must contend for the gate.
    pub fn is_large(size_bytes: u64, threshold_kb: u64) -> bool {
        size_bytes > threshold_kb.saturating_mul(1024)
    }
}

impl Default for LargeFileGate {
    fn default() -> Self {
        Self::new()
    }
}
