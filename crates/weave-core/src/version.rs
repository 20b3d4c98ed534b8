/// The current version, read from Cargo.toml at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Schema version for the persisted cache layout.
/// Bump this when changing the entry format; old directories are simply ignored.
pub const CACHE_SCHEMA_VERSION: u32 = 2;

/// Banner written at the top of non-minified bundles.
#[must_use]
pub fn banner() -> String {
    format!("// weave {VERSION}")
}
