//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::num;

/// Customized error type for ringdht.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct DhtError(String);

impl DhtError {
    pub fn msg(msg: impl ToString) -> Self {
        DhtError(msg.to_string())
    }
}

impl fmt::Display for DhtError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl error::Error for DhtError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `DhtError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for DhtError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                DhtError(e.to_string())
            }
        }
    };
}

// Helper macro for saving boiler-plate `impl From<X<T>>`s for transparent
// conversion from various common generic error types to `DhtError`.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for DhtError {
            fn from(e: $error) -> DhtError {
                DhtError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::task::JoinError);

impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);
