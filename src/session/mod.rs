pub mod classify;
pub mod events;
pub mod mediator;
pub mod registry;
pub mod state;

pub use classify::{classify, Intent};
pub use events::{InboundEvent, OutboundEvent, SqlResultPayload};
pub use mediator::{Mediator, SessionHandle, SessionSender, SubmitOutcome};
pub use registry::SessionRegistry;
pub use state::{SessionPhase, SessionState};
