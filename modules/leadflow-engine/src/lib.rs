//! Signal aggregation and waterfall gating engine.
//!
//! Producers submit intent signals about business entities; the engine
//! deduplicates them across producers and time, folds them into a decayed,
//! confidence-weighted composite score, classifies each entity into an
//! action tier, and gates a fixed multi-stage waterfall so downstream
//! consumers only act once every upstream stage is done. Stage failures go
//! through an append-only blocker ledger; there are no silent drops.

pub mod aggregate;
pub mod dedup;
pub mod engine;
pub mod idempotency;
pub mod ledger;
pub mod traits;
pub mod waterfall;

pub use aggregate::Aggregator;
pub use dedup::{dedup_key, DedupDecision, Deduplicator};
pub use engine::Engine;
pub use idempotency::MemoryIdempotencyStore;
pub use ledger::MemoryLedger;
pub use traits::{BlockerLedger, IdempotencyStore, PutOutcome};
pub use waterfall::{TransitionOutcome, Waterfall};
