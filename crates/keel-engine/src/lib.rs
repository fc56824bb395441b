pub mod audit;
pub mod engine;
pub mod observe;
pub mod result;
pub mod stream;
pub mod turns;

pub use audit::{AuditEvent, AuditSink, TracingAuditSink};
pub use engine::{AlignmentEngine, EngineDeps, TurnRequest};
pub use result::{AlignmentResult, PipelineTiming, TurnResolution};
pub use stream::TurnStreamEvent;
pub use turns::{InMemoryTurnStore, TurnRecord, TurnStore};
