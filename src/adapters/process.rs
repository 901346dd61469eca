/// Detects configured "business software" whose presence must suspend all
/// backup activity.
pub trait ProcessProbe: Send + Sync {
    /// Name of a watched process currently running, if any.
    fn blocking_process(&self) -> Option<String>;

    fn is_blocking(&self) -> bool {
        self.blocking_process().is_some()
    }
}

/// Probe used when no business processes are configured; never blocks.
pub struct DisabledProbe;

impl ProcessProbe for DisabledProbe {
    fn blocking_process(&self) -> Option<String> {
        None
    }
}
