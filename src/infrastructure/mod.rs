//! Persistence layer: connection handling, migrations, and the SQL
//! repositories used by the credential provider and admin surface.

pub mod database;
pub mod groups;
pub mod keys;
pub mod logs;
pub mod migrations;

pub use database::{Database, Dialect};
