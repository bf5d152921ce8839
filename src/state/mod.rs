pub mod board_store;

pub use board_store::{BoardSnapshot, BoardStore, RefreshOutcome};
