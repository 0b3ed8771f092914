/// Per-event tracing that is compiled in only with `--cfg debug_mode_verbose`.
#[macro_export]
macro_rules! trace_verbose {
    ($($arg:tt)*) => {
        {
            #[cfg(debug_mode_verbose)]
            {
                tracing::trace!($($arg)*);
            }

            #[cfg(not(debug_mode_verbose))]
            {
                // do nothing
            }
        }
    };
}
