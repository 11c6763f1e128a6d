#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **apiary-capability** – Capability matching for task dispatch.
//!
//! Given a task and the currently available agents, the matcher scores
//! every agent against the task's requirements and returns a deterministic
//! ranking. Scoring combines required/preferred capability hits, language
//! and framework overlap, current health and workload, reliability, and a
//! complexity alignment term. Labels that are not a direct capability
//! surface fall back to a fixed concept vocabulary (`web-development`
//! covers `react`, `vue`, ...).
//!
//! The matcher never fails: an empty candidate set yields an empty
//! ranking.

pub mod requirements;
pub mod scoring;

pub use requirements::TaskRequirements;
pub use scoring::{CapabilityMatcher, MatchReason, RankedMatch};
