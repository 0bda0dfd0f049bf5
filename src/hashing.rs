/**
 * Content hashing module for deduplicating ingested media using xxhash
 */

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use xxhash_rust::xxh3;

const DEFAULT_CHUNK_SIZE: usize = 65536; // 64KB chunks

#[derive(Debug, Clone)]
pub struct ContentHasher {
    chunk_size: usize,
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentHasher {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    /// Calculate the xxh3 digest of a file's full content
    ///
    /// The file is streamed in fixed-size chunks so memory stays bounded
    /// regardless of file size. Returns 16 lowercase hex characters.
    pub fn calculate_file_hash(&self, file_path: &Path) -> Result<String> {
        let file = File::open(file_path)
            .with_context(|| format!("Failed to open file for hashing: {}", file_path.display()))?;

        let mut reader = BufReader::new(file);
        let mut buffer = vec![0u8; self.chunk_size];
        let mut hasher = xxh3::Xxh3::default();

        loop {
            let bytes_read = reader.read(&mut buffer)
                .with_context(|| format!("Failed to read file for hashing: {}", file_path.display()))?;

            if bytes_read == 0 {
                break;
            }

            hasher.update(&buffer[..bytes_read]);
        }

        let hash = hasher.digest();
        Ok(format!("{:016x}", hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn identical_content_hashes_equal() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.jpg");
        let b = dir.path().join("nested_b.jpg");
        fs::write(&a, b"same bytes").unwrap();
        fs::write(&b, b"same bytes").unwrap();

        let hasher = ContentHasher::new();
        let ha = hasher.calculate_file_hash(&a).unwrap();
        assert_eq!(ha, hasher.calculate_file_hash(&b).unwrap());
        assert_eq!(ha.len(), 16);
    }

    #[test]
    fn chunk_size_does_not_change_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&path, &data).unwrap();

        let streamed = ContentHasher::with_chunk_size(7).calculate_file_hash(&path).unwrap();
        let whole = format!("{:016x}", xxh3::xxh3_64(&data));
        assert_eq!(streamed, whole);
    }

    #[test]
    fn missing_file_is_an_error() {
        let hasher = ContentHasher::new();
        let err = hasher.calculate_file_hash(Path::new("/definitely/not/here.jpg")).unwrap_err();
        assert!(err.to_string().contains("Failed to open file for hashing"));
    }
}
