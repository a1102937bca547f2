//! Byte-ordered bucket store on SQLite.

pub mod bulk;
pub mod database;
pub mod schema;

pub use bulk::BulkLoader;
pub use database::{buckets, Store, Txn};
