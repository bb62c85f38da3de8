use std::sync::Arc;

use crate::config::AppConfig;
use crate::driver::DeploymentDriver;

#[derive(Clone)]
pub struct AppState {
    pub driver: Arc<DeploymentDriver>,
    pub config: AppConfig,
}
