//! Terminal output for runs.

pub mod icons;
pub mod run_progress;

pub use run_progress::{RunUI, UiMode, format_duration};
