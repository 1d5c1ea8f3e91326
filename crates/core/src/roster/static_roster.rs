use async_trait::async_trait;

use crate::ids::WorkerId;

use super::{Roster, RosterError, RosterSource};

/// Roster taken from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticRoster {
    workers: Vec<WorkerId>,
}

impl StaticRoster {
    pub fn new(workers: Vec<WorkerId>) -> Self {
        Self { workers }
    }
}

#[async_trait]
impl RosterSource for StaticRoster {
    fn name(&self) -> &str {
        "static"
    }

    async fn load_worker_ids(&self) -> Result<Roster, RosterError> {
        Ok(Roster::new(self.workers.iter().copied()))
    }
}
