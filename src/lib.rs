//! Offline caching and update notifications for the Bitcoin PeakDip site.
//!
//! - `worker`: the cache worker (install/activate, routing, live-data diff).
//! - `cache`, `clients`: versioned cache storage and the pages it controls.
//! - `articles`, `reading_list`, `version`: page-side service objects.
//! - `capabilities`, `storage`, `fetch`, `clock`: injected host services.

pub mod app;
pub mod articles;
pub mod cache;
pub mod capabilities;
pub mod clients;
pub mod clock;
pub mod config;
pub mod db;
pub mod fetch;
pub mod model;
mod poll;
pub mod reading_list;
pub mod storage;
pub mod telegram;
pub mod version;
pub mod worker;
