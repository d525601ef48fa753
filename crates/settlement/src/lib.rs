//! Tranche Allocation Settlement Engine.
//!
//! Consumes a frozen contribution ledger plus a distributable pool
//! sampled once from custody, computes exact proportional allocations,
//! and drives the claim lifecycle with exactly-once, non-reentrant
//! claim semantics.
//!
//! External concerns are collaborator traits: authorization
//! ([`AdminPolicy`]), allow-listing ([`AllowList`]), pausing
//! ([`PauseSwitch`]), value custody ([`CustodyProvider`]), and event
//! emission ([`EventSink`]). In-memory reference implementations are
//! provided for embedding and tests.

#![deny(unsafe_code)]

mod custody;
mod engine;
mod error;
mod events;
mod policy;

pub use custody::{CustodyError, CustodyProvider, InMemoryCustody};
pub use engine::{EngineSummary, SettlementEngine};
pub use error::{SettlementError, SettlementResult};
pub use events::{EventSink, RecordingEventSink, TracingEventSink};
pub use policy::{
    AdminPolicy, AllowAll, AllowList, PauseError, PauseSwitch, PauseToggle, SingleAdmin,
    StaticAllowList,
};
