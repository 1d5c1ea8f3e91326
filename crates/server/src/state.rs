use std::sync::Arc;

use assignrelay_core::{AssignmentOrchestrator, Config, SanitizedConfig, SessionGroups};

/// Shared application state
pub struct AppState {
    config: Config,
    orchestrator: Option<Arc<AssignmentOrchestrator>>,
    sessions: SessionGroups,
}

impl AppState {
    pub fn new(
        config: Config,
        orchestrator: Option<Arc<AssignmentOrchestrator>>,
        sessions: SessionGroups,
    ) -> Self {
        Self {
            config,
            orchestrator,
            sessions,
        }
    }

    pub fn sanitized_config(&self) -> SanitizedConfig {
        SanitizedConfig::from(&self.config)
    }

    /// The orchestrator, absent when disabled in config.
    pub fn orchestrator(&self) -> Option<&Arc<AssignmentOrchestrator>> {
        self.orchestrator.as_ref()
    }

    pub fn sessions(&self) -> &SessionGroups {
        &self.sessions
    }
}
