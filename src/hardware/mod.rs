//! Backend implementations.
//!
//! Real transports (USB, serial) live outside this crate and plug in through
//! [`BackendRegistry::register`](crate::device::BackendRegistry::register).

pub mod mock;

pub use mock::MockSpectrometer;
