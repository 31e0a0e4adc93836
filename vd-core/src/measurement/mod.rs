//! Measurement and conversion pipeline
//!
//! - `store` - time-series samples bounded by staleness windows
//! - `conversion` - unit conversions compiled from configured equations
//! - `expression` - the single-variable expression language they share

mod conversion;
mod expression;
mod store;

pub use conversion::ConversionResolver;
pub use expression::{Expression, ParseError};
pub use store::{max_age, ChannelValue, InMemoryStore, MeasurementStore, Sample};
