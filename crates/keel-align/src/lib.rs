pub mod enforcer;
pub mod error;
pub mod expr;
pub mod filter;
pub mod generator;
pub mod orchestrator;
pub mod planner;
pub mod prefilter;
pub mod prompts;
pub mod sensor;
pub mod snapshot;
pub mod tools;
pub mod types;

pub use enforcer::ConstraintEnforcer;
pub use error::AlignError;
pub use filter::RuleFilter;
pub use generator::ResponseGenerator;
pub use orchestrator::ScenarioOrchestrator;
pub use planner::ResponsePlanner;
pub use prefilter::ScopePreFilter;
pub use sensor::SituationSensor;
pub use snapshot::{ScenarioSignal, SchemaMask, Sentiment, SituationSnapshot, Urgency};
