//! Helper macros for logging (console printing).

use env_logger::Env;

tokio::task_local! {
    /// Identity string of the endpoint driven by the current task, used as
    /// logging prefix. Every node task runs inside a `ME.scope(..)`.
    pub static ME: String;
}

/// Returns the logging prefix of the current task, or `"-"` if the task is
/// not scoped to any endpoint.
#[doc(hidden)]
pub fn me_prefix() -> String {
    ME.try_with(|me| me.clone()).unwrap_or_else(|_| "-".into())
}

/// Log TRACE message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_trace!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_trace {
    ($($fmt_args:tt)*) => {
        log::trace!(
            "({}) {}",
            $crate::me_prefix(),
            format!($($fmt_args)*)
        )
    };
}

/// Log DEBUG message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_debug!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_debug {
    ($($fmt_args:tt)*) => {
        log::debug!(
            "({}) {}",
            $crate::me_prefix(),
            format!($($fmt_args)*)
        )
    };
}

/// Log INFO message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_info!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_info {
    ($($fmt_args:tt)*) => {
        log::info!(
            "({}) {}",
            $crate::me_prefix(),
            format!($($fmt_args)*)
        )
    };
}

/// Log WARN message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_warn!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_warn {
    ($($fmt_args:tt)*) => {
        log::warn!(
            "({}) {}",
            $crate::me_prefix(),
            format!($($fmt_args)*)
        )
    };
}

/// Log ERROR message with parenthesized prefix.
///
/// Example:
/// ```no_compile
/// pf_error!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_error {
    ($($fmt_args:tt)*) => {
        log::error!(
            "({}) {}",
            $crate::me_prefix(),
            format!($($fmt_args)*)
        )
    };
}

/// Initialize `env_logger` to desired configuration if haven't.
pub fn logger_init() {
    let _ =
        env_logger::Builder::from_env(Env::default().default_filter_or("info"))
            .format_timestamp(None)
            .format_module_path(false)
            .format_target(false)
            .try_init();
}

/// Log an error string to logger and then return a `DhtError`
/// containing the string.
///
/// Example:
/// ```no_compile
/// let e = logged_err!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! logged_err {
    ($($fmt_args:tt)*) => {
        {
            $crate::pf_error!($($fmt_args)*);
            Err($crate::DhtError::msg(format!($($fmt_args)*)))
        }
    };
}

#[cfg(test)]
mod print_tests {
    use super::*;
    use crate::utils::DhtError;

    #[test]
    fn error_no_args() {
        assert_eq!(
            logged_err!("interesting message"),
            Err::<(), DhtError>(DhtError::msg("interesting message"))
        );
    }

    #[test]
    fn error_with_args() {
        assert_eq!(
            logged_err!("got {} to print", 777),
            Err::<(), DhtError>(DhtError::msg("got 777 to print"))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn prefix_scoped() {
        assert_eq!(me_prefix(), "-");
        let inner = ME.scope("ep3".into(), async { me_prefix() }).await;
        assert_eq!(inner, "ep3");
    }
}
