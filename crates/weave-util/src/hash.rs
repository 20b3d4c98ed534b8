use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

/// Hex-encoded BLAKE3 digest of a byte slice.
#[must_use]
pub fn fingerprint_bytes(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Hex-encoded BLAKE3 digest of a file, streamed in 8 KiB blocks.
///
/// # Errors
/// Returns an error if the file cannot be opened or read.
pub fn fingerprint_file(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = blake3::Hasher::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize().to_hex().to_string())
}

/// Fingerprint an ordered list of parts.
///
/// Each part is length-prefixed so that `["ab", "c"]` and `["a", "bc"]`
/// produce different digests.
#[must_use]
pub fn fingerprint_parts<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<[u8]>,
{
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        let part = part.as_ref();
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    hasher.finalize().to_hex().to_string()
}

/// Truncate a hex fingerprint to `len` characters (used in file names).
#[must_use]
pub fn short(fingerprint: &str, len: usize) -> &str {
    &fingerprint[..len.min(fingerprint.len())]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_fingerprint_bytes_known_value() {
        assert_eq!(
            fingerprint_bytes(b"hello world"),
            "d74981efa70a0c880b8d8c1985d075dbcbf679b99a5f9914e5aaf96b831a9e24"
        );
    }

    #[test]
    fn test_fingerprint_file_matches_bytes() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"export default 1;").unwrap();
        file.flush().unwrap();

        assert_eq!(
            fingerprint_file(file.path()).unwrap(),
            fingerprint_bytes(b"export default 1;")
        );
    }

    #[test]
    fn test_fingerprint_file_not_found() {
        assert!(fingerprint_file(Path::new("/nonexistent/file")).is_err());
    }

    #[test]
    fn test_fingerprint_parts_is_boundary_sensitive() {
        assert_ne!(fingerprint_parts(["ab", "c"]), fingerprint_parts(["a", "bc"]));
        assert_eq!(fingerprint_parts(["a", "b"]), fingerprint_parts(["a", "b"]));
    }

    #[test]
    fn test_short() {
        assert_eq!(short("abcdef", 4), "abcd");
        assert_eq!(short("ab", 8), "ab");
    }
}
