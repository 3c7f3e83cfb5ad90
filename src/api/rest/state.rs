use std::sync::Arc;

use crate::controller::EnvironmentManager;
use crate::shared::LabConfig;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<EnvironmentManager>,
    pub config: Arc<LabConfig>,
}

impl AppState {
    pub fn new(manager: EnvironmentManager, config: LabConfig) -> Self {
        Self {
            manager: Arc::new(manager),
            config: Arc::new(config),
        }
    }
}
