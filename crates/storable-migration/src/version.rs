//! Schema version numbers

/// Schema version of a persisted entry
pub type Version = i32;

/// Version recorded for an entry that was never migrated
pub const DEFAULT_VERSION: Version = -1;
