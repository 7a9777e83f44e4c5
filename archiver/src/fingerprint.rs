//! Content fingerprints.
//!
//! Two digests are produced for every asset:
//!
//! - a whole-file MD5, used as the asset's stable identity in manifests and
//!   in the results ledger;
//! - a composite digest that reproduces the object store's multipart ETag:
//!   the MD5 of the concatenated binary MD5s of each `chunk_size` part,
//!   followed by `-{part_count}`. A file that fits in one part gets its plain
//!   MD5, with no suffix.
//!
//! Both are streamed through a small buffer, so memory use does not depend
//! on the file or chunk size.

use md5::{Digest, Md5};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use crate::utils::errors::{ArchiverError, Result};

/// One gibibyte.
pub const GIB: u64 = 1024 * 1024 * 1024;

/// MD5 of the empty byte string.
pub const EMPTY_MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Computes the MD5 of an entire file and returns the hex-encoded digest.
pub fn whole_file_digest(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Computes multipart ETags for a fixed chunk size.
///
/// Chunks larger than `max_read` are digested as a sequence of `max_read`
/// sub-reads folded into one running digest, so part boundaries still fall
/// on multiples of `chunk_size`. That only works when `chunk_size` is a
/// whole multiple of `max_read`, which [`EtagCalculator::with_max_read`]
/// enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EtagCalculator {
    chunk_size: u64,
    max_read: u64,
}

impl EtagCalculator {
    /// Calculator using the provider's 1 GiB sub-read limit.
    pub fn new(chunk_size: u64) -> Result<Self> {
        Self::with_max_read(chunk_size, GIB)
    }

    pub fn with_max_read(chunk_size: u64, max_read: u64) -> Result<Self> {
        if chunk_size == 0 {
            return Err(ArchiverError::Config(
                "Chunk size must be greater than zero".to_string(),
            ));
        }
        if max_read == 0 {
            return Err(ArchiverError::Config(
                "Sub-read size must be greater than zero".to_string(),
            ));
        }
        if chunk_size > max_read && chunk_size % max_read != 0 {
            return Err(ArchiverError::Config(format!(
                "Chunk sizes larger than {} bytes must be multiples of {} bytes (got {})",
                max_read, max_read, chunk_size
            )));
        }
        Ok(Self {
            chunk_size,
            max_read,
        })
    }

    /// Computes the ETag the object store will report for `path`.
    ///
    /// `known_md5` is the whole-file digest if one is already on hand; it is
    /// returned as-is for files too small to be split, skipping a re-read.
    pub fn composite_digest(&self, path: &Path, known_md5: Option<&str>) -> Result<String> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();

        if file_size == 0 {
            return Ok(EMPTY_MD5.to_string());
        }

        let min_unchunked_size = self.chunk_size.min(self.max_read);
        if file_size < min_unchunked_size {
            if let Some(md5) = known_md5.filter(|m| !m.is_empty()) {
                return Ok(md5.to_string());
            }
        }

        let mut reader = BufReader::new(file);
        let part_digests = self.part_digests(&mut reader)?;
        Ok(fold_part_digests(&part_digests))
    }

    /// Digests each `chunk_size` part of `reader`, in order.
    fn part_digests<R: Read>(&self, reader: &mut R) -> io::Result<Vec<[u8; 16]>> {
        let sub_read = self.chunk_size.min(self.max_read);
        let sub_reads_per_part = self.chunk_size / sub_read;
        let mut digests = Vec::new();

        loop {
            let mut hasher = Md5::new();
            let mut part_len = 0u64;

            for _ in 0..sub_reads_per_part {
                let n = io::copy(&mut reader.by_ref().take(sub_read), &mut hasher)?;
                part_len += n;
                if n < sub_read {
                    break;
                }
            }

            if part_len == 0 {
                break;
            }
            digests.push(hasher.finalize().into());
            if part_len < self.chunk_size {
                break;
            }
        }

        Ok(digests)
    }
}

/// Turns per-part MD5s into the provider's ETag string.
pub fn fold_part_digests(part_digests: &[[u8; 16]]) -> String {
    match part_digests {
        [] => EMPTY_MD5.to_string(),
        [single] => hex::encode(single),
        parts => {
            let mut hasher = Md5::new();
            for digest in parts {
                hasher.update(digest);
            }
            format!("{}-{}", hex::encode(hasher.finalize()), parts.len())
        }
    }
}

/// Convenience wrapper: composite digest with the default 1 GiB sub-read.
pub fn composite_digest(path: &Path, chunk_size: u64, known_md5: Option<&str>) -> Result<String> {
    EtagCalculator::new(chunk_size)?.composite_digest(path, known_md5)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const FOX: &[u8] = b"The quick brown fox jumps over the lazy dog\n";
    const FOX_MD5: &str = "37c4b87edffc5d198ff5a185cee7ee09";

    fn fixture(data: &[u8]) -> io::Result<NamedTempFile> {
        let mut file = NamedTempFile::new()?;
        file.write_all(data)?;
        file.flush()?;
        Ok(file)
    }

    #[test]
    fn test_whole_file_digest() -> io::Result<()> {
        let file = fixture(FOX)?;
        assert_eq!(whole_file_digest(file.path())?, FOX_MD5);
        Ok(())
    }

    #[test]
    fn test_whole_file_digest_missing_file() {
        let result = whole_file_digest(Path::new("/nonexistent/archiver/file.bin"));
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_single_chunk_matches_whole_file_digest() -> Result<()> {
        let file = fixture(FOX)?;
        for chunk_size in [FOX.len() as u64, 64, 1024 * 1024, 8 * GIB] {
            let etag = composite_digest(file.path(), chunk_size, None)?;
            assert_eq!(etag, whole_file_digest(file.path())?);
        }
        Ok(())
    }

    #[test]
    fn test_one_byte_chunks() -> Result<()> {
        let file = fixture(FOX)?;
        let etag = composite_digest(file.path(), 1, None)?;
        assert_eq!(etag, "1feb5cfe20e9c2eb629c27e8a1d9480b-44");
        Ok(())
    }

    #[test]
    fn test_uneven_last_chunk() -> Result<()> {
        let file = fixture(FOX)?;
        assert_eq!(
            composite_digest(file.path(), 8, None)?,
            "deafa83d06848aee34aedfe931f78895-6"
        );
        assert_eq!(
            composite_digest(file.path(), 16, None)?,
            "c948329e913dfda3a79df321df2127a1-3"
        );
        Ok(())
    }

    #[test]
    fn test_empty_file_for_any_chunk_size() -> Result<()> {
        let file = fixture(b"")?;
        for chunk_size in [1, 5 * 1024 * 1024, 4 * GIB] {
            assert_eq!(composite_digest(file.path(), chunk_size, None)?, EMPTY_MD5);
        }
        Ok(())
    }

    #[test]
    fn test_known_md5_is_reused_for_small_files() -> Result<()> {
        let file = fixture(FOX)?;
        let etag = composite_digest(file.path(), 1024, Some("precomputed"))?;
        assert_eq!(etag, "precomputed");

        // Not reachable once the file needs splitting
        let etag = composite_digest(file.path(), 8, Some("precomputed"))?;
        assert_eq!(etag, "deafa83d06848aee34aedfe931f78895-6");
        Ok(())
    }

    #[test]
    fn test_misaligned_large_chunk_is_config_error() {
        let err = EtagCalculator::new(GIB + 1).unwrap_err();
        assert!(matches!(err, ArchiverError::Config(_)));

        let err = EtagCalculator::new(3 * GIB / 2).unwrap_err();
        assert!(matches!(err, ArchiverError::Config(_)));

        assert!(EtagCalculator::new(4 * GIB).is_ok());
        assert!(EtagCalculator::new(0).is_err());
    }

    #[test]
    fn test_sub_reads_do_not_split_parts() -> Result<()> {
        // 1024 bytes, 256-byte parts: 4 parts
        let data: Vec<u8> = (0..=255u8).cycle().take(1024).collect();
        let file = fixture(&data)?;

        let direct = EtagCalculator::with_max_read(256, GIB)?.composite_digest(file.path(), None)?;
        let sub_read = EtagCalculator::with_max_read(256, 64)?.composite_digest(file.path(), None)?;

        assert_eq!(direct, "5bda7c3dc71a38676bca50fd235acdde-4");
        assert_eq!(sub_read, direct);
        Ok(())
    }

    #[test]
    fn test_sub_reads_with_short_last_part() -> Result<()> {
        // 1024 bytes, 300-byte parts: 300 + 300 + 300 + 124
        let data: Vec<u8> = (0..=255u8).cycle().take(1024).collect();
        let file = fixture(&data)?;

        let sub_read =
            EtagCalculator::with_max_read(300, 100)?.composite_digest(file.path(), None)?;
        assert_eq!(sub_read, "1e6d126440597ba7a5a3d05df01164bf-4");
        Ok(())
    }

    #[test]
    fn test_misaligned_sub_read_rejected() {
        assert!(EtagCalculator::with_max_read(300, 128).is_err());
        assert!(EtagCalculator::with_max_read(256, 128).is_ok());
    }

    #[test]
    fn test_fold_part_digests() {
        assert_eq!(fold_part_digests(&[]), EMPTY_MD5);
        let one: [u8; 16] = Md5::digest(FOX).into();
        assert_eq!(fold_part_digests(&[one]), FOX_MD5);
    }

    #[test]
    fn test_deterministic() -> Result<()> {
        let file = fixture(FOX)?;
        let calc = EtagCalculator::new(10)?;
        assert_eq!(
            calc.composite_digest(file.path(), None)?,
            calc.composite_digest(file.path(), None)?
        );
        Ok(())
    }
}
