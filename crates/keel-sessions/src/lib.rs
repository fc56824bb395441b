pub mod db;
pub mod error;
pub mod inmemory;
pub mod store;
pub mod types;

pub use error::SessionError;
pub use inmemory::InMemorySessionStore;
pub use store::{SessionStore, StepHashQuery};
pub use types::{
    InstanceStatus, PendingMigration, ScenarioInstance, Session, SessionStatus, StepVisit,
};
