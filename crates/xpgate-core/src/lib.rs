//! Core types and traits for xpgate: requests, decisions, personas and
//! policies. No I/O happens here.

#![warn(clippy::unwrap_used, clippy::expect_used)]

pub mod decision;
pub mod fingerprint;
pub mod persona;
pub mod policy;
pub mod request;

pub use decision::{Decision, DecisionMeta, DecisionResponse, ReasonCode, RewardType};
pub use fingerprint::Fingerprint;
pub use persona::{ClassificationError, Persona, PersonaClassifier, PersonaDirectory, PersonaRecord};
pub use policy::{CapBasis, Policy, PolicyDocument, PolicyError, PolicyStore, XpComputation};
pub use request::{RewardRequest, TransactionType, ValidationError};
