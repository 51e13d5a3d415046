pub mod clock;
pub mod engine;
pub mod error;
pub mod events;
pub mod generator;
pub mod health;
pub mod ledger;
pub mod model;
pub mod random;
pub mod responsiveness;
pub mod scheduler;
pub mod selector;
pub mod store;
pub mod thread;

#[cfg(test)]
pub mod testing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{Engine, EngineStats, LabActivation, Published};
pub use error::{EngineError, Result};
pub use events::{EngineEvent, EventBus};
pub use generator::{parse_decision, Decision, ResponseGenerator, ThreadContext};
pub use health::{HealthReport, HealthStatus};
pub use ledger::{Ledger, LedgerStats};
pub use model::{
    AiFollower, Author, Circle, DelayRange, DispatchOutcome, DispatchRecord, Interaction,
    InteractionType, Lab, LabStatus, PendingResponse, PendingStatus, Post, PostStatus,
    Responsiveness,
};
pub use random::{RandomSource, StdRandom};
pub use scheduler::{Dispatcher, SchedulerHandle, SchedulerSettings, TickReport};
pub use store::Store;
pub use thread::{ThreadEntry, ThreadNode, ThreadTree};
