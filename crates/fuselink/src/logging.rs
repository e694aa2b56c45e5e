//! Logging facade for the engine.
//!
//! When the `tracing` feature is active, the submission pipeline emits
//! `debug!` events per phase and `warn!` events for captured listener
//! panics and failed reaction callbacks. Without the feature the macros
//! below compile to nothing (the format arguments are still type-checked).

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, warn};

#[cfg(not(feature = "tracing"))]
macro_rules! debug {
    ($($arg:tt)*) => {{
        let _ = format_args!($($arg)*);
    }};
}

#[cfg(not(feature = "tracing"))]
macro_rules! warn_noop {
    ($($arg:tt)*) => {{
        let _ = format_args!($($arg)*);
    }};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use debug;
#[cfg(not(feature = "tracing"))]
pub(crate) use warn_noop as warn;
