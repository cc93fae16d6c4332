use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha1::{Digest, Sha1};

/// SHA-1 fingerprint of a byte buffer, as lower-case hex.
pub fn sha1_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// SHA-1 fingerprint of a file's contents. Identical bytes yield the same
/// value as [`sha1_hex`], regardless of path.
pub fn sha1_of_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha1::new();
    let mut buffer = [0u8; 65536];
    loop {
        match file.read(&mut buffer)? {
            0 => break,
            n => hasher.update(&buffer[..n]),
        }
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digests() {
        assert_eq!(sha1_hex(b"hello"), "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d");
        assert_eq!(sha1_hex(b""), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    }

    #[test]
    fn repeated_calls_are_stable() {
        assert_eq!(sha1_hex(b"payload"), sha1_hex(b"payload"));
    }

    #[test]
    fn file_matches_buffer_for_identical_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("a.kml");
        let second = dir.path().join("nested").join("b.kml");
        std::fs::create_dir_all(second.parent().unwrap()).unwrap();
        std::fs::write(&first, b"<kml/>").unwrap();
        std::fs::write(&second, b"<kml/>").unwrap();

        let from_buffer = sha1_hex(b"<kml/>");
        assert_eq!(sha1_of_file(&first).unwrap(), from_buffer);
        assert_eq!(sha1_of_file(&second).unwrap(), from_buffer);
    }

    #[test]
    fn missing_file_surfaces_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(sha1_of_file(&dir.path().join("absent.kml")).is_err());
    }
}
