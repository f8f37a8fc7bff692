//! Offline admin commands.

mod migrate_keys;

pub use migrate_keys::MigrateKeysCommand;
