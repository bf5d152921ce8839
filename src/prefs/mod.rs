pub mod kv;
pub mod model;
pub mod preferences;

pub use kv::{KvStore, MemoryKv, SqliteKv};
pub use model::{
    AlertKind, AlertRule, ColorMode, FilterScheme, SearchEntry, Settings, WatchlistGroup,
    DEFAULT_GROUP_ID,
};
pub use preferences::{Preferences, StorageChange};
