//! RateFeed Common Types
//!
//! This crate contains shared types used across the RateFeed engine,
//! including currency pairs, provider identifiers, rate records and
//! the timing defaults shared by every provider connection.

pub mod currency;
pub mod error;
pub mod identifiers;
pub mod rates;
pub mod time;

pub use currency::*;
pub use error::*;
pub use identifiers::*;
pub use rates::*;
pub use time::*;
