//! Run driver: executes one step of a Run at a time.

pub mod machine;

pub use machine::{StepContext, StepOutcome, step};
