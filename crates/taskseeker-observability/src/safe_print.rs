// Best-effort stderr logging that never panics.
//
// Worker threads report warnings through this macro; a closed or broken stderr
// must not turn a teardown path into a panic.

#[macro_export]
macro_rules! safe_eprintln {
    ($($arg:tt)*) => {{
        use std::io::Write;
        let _ = writeln!(std::io::stderr(), $($arg)*);
    }};
}
