//! Test doubles for the device and storage seams.

pub mod mocks;

pub use mocks::{FailingStore, MockDevice};
