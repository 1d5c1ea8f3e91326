pub mod assignment;
pub mod broker;
pub mod config;
pub mod ids;
pub mod metrics;
pub mod notify;
pub mod orchestrator;
pub mod roster;
pub mod testing;
pub mod work_item;

pub use assignment::{AssignmentEvent, AssignmentProcessor, EventError, ProcessOutcome};
pub use broker::{
    AmqpConnector, BrokerChannel, BrokerConnection, BrokerConnector, BrokerError, Delivery,
    Disposition, ExchangeKind, QueueBinding, TopologyManager,
};
pub use config::{
    load_config, load_config_from_str, validate_config, Config, ConfigError, SanitizedConfig,
};
pub use ids::{ItemId, WorkerId};
pub use notify::{
    group_key_for, GroupSender, NotificationFanout, NotifyError, SessionGroups,
    ITEM_ASSIGNED_EVENT,
};
pub use orchestrator::{
    AssignmentOrchestrator, ConsumerState, OrchestratorConfig, OrchestratorError,
    OrchestratorStatus, StartupPhase, WorkerStatus,
};
pub use roster::{create_roster_source, Roster, RosterError, RosterSource};
pub use work_item::{HttpWorkItemService, ItemStatus, WorkItem, WorkItemError, WorkItemService};
