//! TapeIO Common - Shared types and utilities
//!
//! This crate provides the error taxonomy, configuration structures,
//! digest helpers and value types shared by every TapeIO component.

pub mod checksum;
pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use checksum::{DigestCalculator, DigestReader, DigestType};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{OfferConfig, TarConfig};
pub use error::{Error, Result};
pub use types::*;
