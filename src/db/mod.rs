//! Database module: row models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: typed rows returned by repositories.
//! - `repo`: SQL-only functions backing durable client storage and the
//!   cache generations.
//!
//! Higher layers (`storage`, `cache`) wrap these functions behind traits so
//! business logic never touches SQL directly.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::CacheEntryRow;
