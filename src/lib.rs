//! usermesh - account and profile services over a shared message broker.
//!
//! The auth service stores accounts and announces them as `UserRegistered`
//! events; the user service consumes those events into a profile projection.
//! Delivery is at-least-once with idempotent effects: the broker may hand the
//! same event over several times, the projection applies it once.

pub mod accounts;
pub mod broker;
pub mod config;
pub mod dlq;
pub mod envelope;
pub mod http;
pub mod projection;
pub mod storage;
pub mod utils;
