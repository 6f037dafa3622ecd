//! Use cases on both sides of the pipeline.

pub mod order_service;
pub mod status_transition;

pub use order_service::OrderService;
pub use status_transition::{LedgerAction, StatusTransitionService, TransitionOutcome};
