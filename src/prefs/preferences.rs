use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use crate::config::{CHANGE_CHANNEL_CAPACITY, RECENT_FILTERS_MAX, SEARCH_HISTORY_MAX};
use crate::picker::FilterConditions;
use crate::prefs::kv::KvStore;
use crate::prefs::model::{
    keys, AlertBook, AlertRule, ColumnVisibility, FilterScheme, SearchEntry, Settings,
    WatchlistGroup, DEFAULT_GROUP_ID,
};

/// Emitted after every successful write, so other views can re-read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    pub key: String,
}

/// Typed, JSON-encoded access to the user's persisted preferences.
///
/// Reads never fail: a missing, unreadable or corrupt value yields the type's
/// default. Writes are best effort; failures are logged and reported as `false`.
pub struct Preferences {
    kv: Arc<dyn KvStore>,
    changes: broadcast::Sender<StorageChange>,
    /// Serialises read-modify-write sequences so concurrent updates don't lose each other.
    write_lock: Mutex<()>,
}

impl Preferences {
    pub fn new(kv: Arc<dyn KvStore>) -> Arc<Self> {
        let (changes, _rx) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Arc::new(Self {
            kv,
            changes,
            write_lock: Mutex::new(()),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }

    async fn load<T: DeserializeOwned + Default>(&self, key: &str) -> T {
        match self.kv.get(key).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(key, "[PREFS] corrupt value, using default: {e}");
                T::default()
            }),
            Ok(None) => T::default(),
            Err(e) => {
                warn!(key, "[PREFS] read failed, using default: {e}");
                T::default()
            }
        }
    }

    async fn store<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> bool {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key, "[PREFS] encode failed: {e}");
                return false;
            }
        };
        if let Err(e) = self.kv.set(key, &raw).await {
            warn!(key, "[PREFS] write failed: {e}");
            return false;
        }
        debug!(key, bytes = raw.len(), "[PREFS] saved");
        // No subscribers is fine.
        let _ = self.changes.send(StorageChange { key: key.to_string() });
        true
    }

    // -----------------------------------------------------------------------
    // Watch list
    // -----------------------------------------------------------------------

    /// All groups; the default group is always present and first.
    pub async fn watchlist(&self) -> Vec<WatchlistGroup> {
        let mut groups: Vec<WatchlistGroup> = self.load(keys::WATCHLIST).await;
        if !groups.iter().any(|g| g.id == DEFAULT_GROUP_ID) {
            groups.insert(0, WatchlistGroup::default_group());
        }
        groups
    }

    /// Every code across all groups, first occurrence wins.
    pub async fn watchlist_codes(&self) -> Vec<String> {
        let mut codes: Vec<String> = Vec::new();
        for group in self.watchlist().await {
            for code in group.codes {
                if !codes.contains(&code) {
                    codes.push(code);
                }
            }
        }
        codes
    }

    /// Returns false when the group doesn't exist or already holds `code`.
    pub async fn add_to_watchlist(&self, group_id: &str, code: &str) -> bool {
        let _w = self.write_lock.lock().await;
        let mut groups = self.watchlist().await;
        let Some(group) = groups.iter_mut().find(|g| g.id == group_id) else {
            return false;
        };
        if group.codes.iter().any(|c| c == code) {
            return false;
        }
        group.codes.push(code.to_string());
        self.store(keys::WATCHLIST, &groups).await
    }

    pub async fn remove_from_watchlist(&self, group_id: &str, code: &str) -> bool {
        let _w = self.write_lock.lock().await;
        let mut groups = self.watchlist().await;
        let Some(group) = groups.iter_mut().find(|g| g.id == group_id) else {
            return false;
        };
        let before = group.codes.len();
        group.codes.retain(|c| c != code);
        if group.codes.len() == before {
            return false;
        }
        self.store(keys::WATCHLIST, &groups).await
    }

    pub async fn create_group(&self, name: &str) -> Option<WatchlistGroup> {
        let _w = self.write_lock.lock().await;
        let mut groups = self.watchlist().await;

        let base = format!("g{}", now_ms());
        let mut id = base.clone();
        let mut n = 1;
        while groups.iter().any(|g| g.id == id) {
            id = format!("{base}-{n}");
            n += 1;
        }

        let group = WatchlistGroup {
            id,
            name: name.to_string(),
            codes: Vec::new(),
        };
        groups.push(group.clone());
        self.store(keys::WATCHLIST, &groups).await.then_some(group)
    }

    /// The default group cannot be deleted.
    pub async fn delete_group(&self, group_id: &str) -> bool {
        if group_id == DEFAULT_GROUP_ID {
            return false;
        }
        let _w = self.write_lock.lock().await;
        let mut groups = self.watchlist().await;
        let before = groups.len();
        groups.retain(|g| g.id != group_id);
        if groups.len() == before {
            return false;
        }
        self.store(keys::WATCHLIST, &groups).await
    }

    // -----------------------------------------------------------------------
    // Alerts
    // -----------------------------------------------------------------------

    pub async fn alerts(&self, code: &str) -> Vec<AlertRule> {
        let book: AlertBook = self.load(keys::ALERTS).await;
        book.get(code).cloned().unwrap_or_default()
    }

    /// Replaces the rules for `code`; an empty list removes the symbol.
    pub async fn set_alerts(&self, code: &str, rules: Vec<AlertRule>) -> bool {
        let _w = self.write_lock.lock().await;
        let mut book: AlertBook = self.load(keys::ALERTS).await;
        if rules.is_empty() {
            book.remove(code);
        } else {
            book.insert(code.to_string(), rules);
        }
        self.store(keys::ALERTS, &book).await
    }

    // -----------------------------------------------------------------------
    // Settings / columns
    // -----------------------------------------------------------------------

    pub async fn settings(&self) -> Settings {
        self.load(keys::SETTINGS).await
    }

    pub async fn save_settings(&self, settings: &Settings) -> bool {
        self.store(keys::SETTINGS, settings).await
    }

    /// Visible columns for `page`; None means the page's built-in default.
    pub async fn columns(&self, page: &str) -> Option<Vec<String>> {
        let columns: ColumnVisibility = self.load(keys::COLUMNS).await;
        columns.get(page).cloned()
    }

    pub async fn set_columns(&self, page: &str, visible: Vec<String>) -> bool {
        let _w = self.write_lock.lock().await;
        let mut columns: ColumnVisibility = self.load(keys::COLUMNS).await;
        columns.insert(page.to_string(), visible);
        self.store(keys::COLUMNS, &columns).await
    }

    // -----------------------------------------------------------------------
    // Search history
    // -----------------------------------------------------------------------

    /// Most recent first.
    pub async fn search_history(&self) -> Vec<SearchEntry> {
        self.load(keys::SEARCH_HISTORY).await
    }

    pub async fn push_search(&self, entry: SearchEntry) -> bool {
        let _w = self.write_lock.lock().await;
        let mut history: Vec<SearchEntry> = self.load(keys::SEARCH_HISTORY).await;
        push_bounded(&mut history, entry, SEARCH_HISTORY_MAX, |a, b| a.code == b.code);
        self.store(keys::SEARCH_HISTORY, &history).await
    }

    pub async fn clear_search_history(&self) -> bool {
        self.store(keys::SEARCH_HISTORY, &Vec::<SearchEntry>::new()).await
    }

    // -----------------------------------------------------------------------
    // Filters
    // -----------------------------------------------------------------------

    pub async fn filter_schemes(&self) -> Vec<FilterScheme> {
        self.load(keys::FILTER_SCHEMES).await
    }

    /// Saves `scheme`, replacing any scheme with the same name in place.
    pub async fn save_filter_scheme(&self, scheme: FilterScheme) -> bool {
        let _w = self.write_lock.lock().await;
        let mut schemes: Vec<FilterScheme> = self.load(keys::FILTER_SCHEMES).await;
        match schemes.iter_mut().find(|s| s.name == scheme.name) {
            Some(existing) => *existing = scheme,
            None => schemes.push(scheme),
        }
        self.store(keys::FILTER_SCHEMES, &schemes).await
    }

    pub async fn delete_filter_scheme(&self, name: &str) -> bool {
        let _w = self.write_lock.lock().await;
        let mut schemes: Vec<FilterScheme> = self.load(keys::FILTER_SCHEMES).await;
        let before = schemes.len();
        schemes.retain(|s| s.name != name);
        if schemes.len() == before {
            return false;
        }
        self.store(keys::FILTER_SCHEMES, &schemes).await
    }

    /// Most recent first.
    pub async fn recent_filters(&self) -> Vec<FilterConditions> {
        self.load(keys::RECENT_FILTERS).await
    }

    pub async fn push_recent_filter(&self, conditions: FilterConditions) -> bool {
        let _w = self.write_lock.lock().await;
        let mut recent: Vec<FilterConditions> = self.load(keys::RECENT_FILTERS).await;
        push_bounded(&mut recent, conditions, RECENT_FILTERS_MAX, |a, b| a == b);
        self.store(keys::RECENT_FILTERS, &recent).await
    }

    /// The conditions last used for a run, or the defaults.
    pub async fn current_filters(&self) -> FilterConditions {
        self.load(keys::CURRENT_FILTERS).await
    }

    pub async fn save_current_filters(&self, conditions: &FilterConditions) -> bool {
        self.store(keys::CURRENT_FILTERS, conditions).await
    }
}

/// Moves `item` to the front, dropping any earlier `same` entry and trimming to `max`.
fn push_bounded<T>(list: &mut Vec<T>, item: T, max: usize, same: impl Fn(&T, &T) -> bool) {
    list.retain(|existing| !same(existing, &item));
    list.insert(0, item);
    list.truncate(max);
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}
