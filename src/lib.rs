pub mod cache;
pub mod config;
pub mod data;
pub mod error;
pub mod picker;
pub mod polling;
pub mod prefs;
pub mod remote;
pub mod state;
pub mod types;

#[cfg(test)]
mod testing;
