//! Invariant checking helpers.
//!
//! `ensure!` is an assert equivalent that stays armed in release builds. It
//! guards invariants that must never silently pass (partition consistency,
//! exchange-descriptor symmetry); violating them means the global state is
//! corrupt and continuing would propagate garbage across ranks.

/// Asserts a condition in debug *and* release builds.
///
/// Use for invariants whose violation indicates internal corruption, not a
/// user error. User errors are returned as [`GridError`](crate::error::GridError).
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $($msg:tt)*) => {
        if !$cond {
            panic!("[invariant] {} ({}:{}): {}", stringify!($cond), file!(), line!(), format_args!($($msg)*));
        }
    };
}

/// Marks a branch that must be unreachable under the crate's invariants.
#[macro_export]
macro_rules! ensure_not_reached {
    ($($msg:tt)*) => {
        panic!("[invariant] entered unreachable branch ({}:{}): {}", file!(), line!(), format_args!($($msg)*))
    };
}

#[cfg(test)]
mod tests {
    #[test]
    fn ensure_passes_on_true() {
        ensure!(1 + 1 == 2, "arithmetic");
    }

    #[test]
    #[should_panic(expected = "[invariant]")]
    fn ensure_fires_on_false() {
        ensure!(false, "expected failure {}", 42);
    }
}
