//! Stable error codes reported by builds.
//!
//! All codes are SCREAMING_SNAKE_CASE and stable across versions. They appear
//! in the CLI's JSON output and in log lines.

/// An import specifier could not be resolved to a file.
pub const RESOLVE_FAILED: &str = "RESOLVE_FAILED";

/// A file referenced by the graph could not be read.
pub const READ_FAILED: &str = "READ_FAILED";

/// A transform step failed for a module.
pub const TRANSFORM_FAILED: &str = "TRANSFORM_FAILED";

/// No registered transform chain matches a module.
pub const CONFIG_NO_CHAIN: &str = "CONFIG_NO_CHAIN";

/// Two equally specific transform chains match a module.
pub const CONFIG_AMBIGUOUS_CHAIN: &str = "CONFIG_AMBIGUOUS_CHAIN";

/// A predicate was registered twice.
pub const CONFIG_DUPLICATE_PREDICATE: &str = "CONFIG_DUPLICATE_PREDICATE";

/// Two predicates require the same file-name ending with equal specificity.
pub const CONFIG_OVERLAPPING_PREDICATES: &str = "CONFIG_OVERLAPPING_PREDICATES";

/// A predicate could not be compiled.
pub const CONFIG_INVALID_PREDICATE: &str = "CONFIG_INVALID_PREDICATE";

/// A transform step has an invalid configuration.
pub const CONFIG_INVALID_TRANSFORM: &str = "CONFIG_INVALID_TRANSFORM";

/// A configured entry file does not exist.
pub const CONFIG_ENTRY_NOT_FOUND: &str = "CONFIG_ENTRY_NOT_FOUND";

/// The configuration file could not be read or parsed.
pub const CONFIG_READ_FAILED: &str = "CONFIG_READ_FAILED";

/// Any other invalid configuration value.
pub const CONFIG_INVALID: &str = "CONFIG_INVALID";

/// The persisted cache could not be read or written.
pub const CACHE_IO_ERROR: &str = "CACHE_IO_ERROR";

/// An output artifact could not be written.
pub const WRITE_FAILED: &str = "WRITE_FAILED";

/// The file watcher could not be started.
pub const WATCH_FAILED: &str = "WATCH_FAILED";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_codes_are_screaming_snake_case() {
        let codes = [
            RESOLVE_FAILED,
            READ_FAILED,
            TRANSFORM_FAILED,
            CONFIG_NO_CHAIN,
            CONFIG_AMBIGUOUS_CHAIN,
            CONFIG_DUPLICATE_PREDICATE,
            CONFIG_OVERLAPPING_PREDICATES,
            CONFIG_INVALID_PREDICATE,
            CONFIG_INVALID_TRANSFORM,
            CONFIG_ENTRY_NOT_FOUND,
            CONFIG_READ_FAILED,
            CONFIG_INVALID,
            CACHE_IO_ERROR,
            WRITE_FAILED,
            WATCH_FAILED,
        ];

        for code in codes {
            assert!(
                code.chars().all(|c| c.is_uppercase() || c == '_'),
                "Code '{code}' should be SCREAMING_SNAKE_CASE"
            );
        }
    }
}
