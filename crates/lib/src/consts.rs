//! Crate-wide constants.

/// Name of the store directory created inside a project root.
pub const STORE_DIR_NAME: &str = ".strata";

/// Environment variable overriding the store location.
pub const STORE_ENV_VAR: &str = "STRATA_STORE";

/// Number of hex characters of a slice hash used in sub-target names.
pub const SUB_TARGET_SUFFIX_LEN: usize = 8;

/// Hash recorded for a declared file that does not exist.
pub const MISSING_FILE_HASH: &str = "missing";
