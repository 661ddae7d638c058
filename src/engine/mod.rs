pub mod broadcast;
pub mod hub;
pub mod poller;
pub mod publisher;
pub mod tasks;

pub use broadcast::{Broadcaster, Subscription, SubscriptionId};
pub use hub::{Hub, NewAgent, StartOptimization};
pub use poller::TelemetryPoller;
pub use publisher::{Envelope, Publisher, SharedEnvelope, StateSnapshot};
pub use tasks::{
    OptimizerConfig, ResourceKey, TaskHandle, TaskInfo, TaskManager, TaskRegistry,
    TerminationCause,
};
