//! Row models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Conversion into
//! domain types lives in the callers.

/// A cached response as stored in `cache_entries`.
#[derive(Debug, Clone)]
pub struct CacheEntryRow {
    pub status: i64,
    /// JSON array of `[name, value]` pairs.
    pub headers: String,
    pub body: Vec<u8>,
}
