//! Versioned JSON wire schema.
//!
//! Internal types carry no serde derives; everything that crosses a process boundary goes
//! through a versioned module here with explicit conversions.

pub mod v1;
