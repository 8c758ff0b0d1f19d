//! # hostcap-quantity
//!
//! Storage quantities for the hostcap capacity ledger.
//!
//! ## Format
//!
//! Quantities are non-negative byte counts written the way the orchestration
//! API writes them:
//!
//! - plain integers: `1048576`
//! - binary suffixes: `512Mi`, `10Gi`, `1Ti`
//! - decimal suffixes: `500M`, `2G`
//! - fractions with a suffix: `1.5Gi` (rounded up to a whole byte)
//!
//! Formatting always picks the largest binary suffix that divides the value
//! exactly, falling back to plain bytes, so `10737418240` renders as `10Gi`
//! and `1000` renders as `1000`.

mod error;
mod quantity;

pub use error::QuantityError;
pub use quantity::{Quantity, EIB, GIB, KIB, MIB, PIB, TIB};
