//! Admission algorithms executed against a scored-set store.

pub mod sliding_window;

pub use sliding_window::{run_window_steps, WindowOp, WindowOutcome, SLIDING_WINDOW_SCRIPT};
