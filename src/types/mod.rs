pub mod agent;
pub mod history;
pub mod planet;
pub mod telemetry;

pub use agent::{Agent, AgentStatus, TelemetryEndpoint, CRITICAL_SCORE_THRESHOLD};
pub use history::{TraceHistory, HISTORY_CAPACITY};
pub use planet::{Evaluation, Planet, PlanetStatus, Variant};
pub use telemetry::{PlanetTelemetry, TelemetryReport, PRIMARY_PLANET_ID, PRIMARY_PLANET_NAME};

pub type AgentId = String;
pub type PlanetId = String;
pub type VariantId = String;
