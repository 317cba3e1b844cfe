use std::sync::Arc;

use crate::devices::DeviceRegistry;
use crate::helper::InstrumentHelper;
use crate::orchestrator::Orchestrator;
use crate::settings::SettingsStore;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub devices: Arc<DeviceRegistry>,
    pub settings: Arc<SettingsStore>,
    pub helper: InstrumentHelper,
}
