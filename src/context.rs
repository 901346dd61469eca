use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::JobManager;

/// Shared handles passed to every server task.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub manager: Arc<JobManager>,
}

impl AppContext {
    pub fn new(config: Arc<AppConfig>, manager: Arc<JobManager>) -> Self {
        Self { config, manager }
    }
}
