pub mod key;
pub mod ttl;

pub use key::cache_key;
pub use ttl::TtlCache;
