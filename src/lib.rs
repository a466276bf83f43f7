//! Core library for the spectrometer driver.
//!
//! - [`eeprom`]: byte-exact codec for the six-page EEPROM record
//! - [`device`]: the hardware-owning session and the backend seam
//! - [`worker`]: the isolated acquisition worker and its controlling handle
//! - [`balance`]: closed-loop integration time / laser power balancing
//!
//! Configuration, logging and errors follow the usual layout in
//! [`config`], [`logging`] and [`error`].

pub mod balance;
pub mod config;
pub mod device;
pub mod eeprom;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod messages;
pub mod reading;
pub mod worker;

pub use error::{AppResult, SpectroError};
