pub mod reconciliation;
pub mod webhook;
