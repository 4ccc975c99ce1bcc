//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod error;
mod keyrange;

pub use error::DhtError;
pub use keyrange::{KeyRange, RingView};
pub use print::{logger_init, me_prefix, ME};
