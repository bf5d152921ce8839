pub mod filter;
pub mod pipeline;
pub mod strength;

pub use filter::{basic_filter, FilterConditions, FilterStats, Rejection};
pub use pipeline::{run_screening, Picker, Progress, ScreeningRun, Stage};
pub use strength::above_average_ratio;
