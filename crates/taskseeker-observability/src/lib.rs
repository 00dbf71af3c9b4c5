pub mod debug_log;
pub mod metrics;
pub mod panic_log;
mod safe_print;
pub mod trace;

pub use trace::Span;
