//! Shared domain types for the shipwright workflow engine.
//!
//! Everything the engine exchanges with the outside world lives here:
//! tickets, the plan/patch payloads produced by the AI stages, and the
//! collaborator contracts (ticket source, code host, stage executors,
//! object storage) the engine drives but does not implement.

pub mod contracts;
pub mod payload;
pub mod ticket;

pub use contracts::{
    CodeHost, FixInput, ImplementationInput, Implementer, MemoryObjectStore, ObjectStore,
    Planner, PlanningInput, PullRequestRequest, ReviewFeedback, ReviewInput, Reviewer,
    StageFailure, TicketSource,
};
pub use payload::{
    ChangeKind, Patch, PatchFile, Plan, PlanStep, RepoContext, SecurityFinding, Severity,
};
pub use ticket::{Ticket, TicketStatus};
