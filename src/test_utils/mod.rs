//! Test utilities.
//!
//! - Factories for valid subscriptions, provider snapshots and access tokens
//! - In-memory implementations of every port
//! - `TestAppStateBuilder` for route tests

mod app_state_builder;
mod factories;
mod provider_mocks;
mod subscription_mocks;

pub use app_state_builder::*;
pub use factories::*;
pub use provider_mocks::*;
pub use subscription_mocks::*;
