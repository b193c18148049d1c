//! Core types for the KNXnet/IP protocol stack
//!
//! This crate provides the error type, KNX addressing, and serial numbers
//! shared by all layers of the stack.

pub mod address;
pub mod error;
pub mod serial_number;

pub use address::{GroupAddress, IndividualAddress};
pub use error::{KnxError, KnxResult};
pub use serial_number::SerialNumber;
