//! Checksum listings: one `<md5><whitespace><path>` per line, as written by
//! `md5sum`.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use super::AssetDescriptor;
use crate::utils::errors::{ArchiverError, Result};

#[derive(Debug, Clone)]
pub struct Md5SumManifest {
    path: PathBuf,
}

impl Md5SumManifest {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn descriptors(&self) -> Result<Vec<AssetDescriptor>> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut descriptors = Vec::new();

        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim_start_matches('\u{feff}').trim();
            if line.is_empty() {
                continue;
            }

            let (md5, path) = split_line(line).ok_or_else(|| {
                ArchiverError::malformed(
                    &self.path,
                    format!("line {}: expected \"<checksum> <path>\"", index + 1),
                )
            })?;

            descriptors.push(AssetDescriptor {
                path: path.to_string(),
                md5: Some(md5.to_string()),
                manifest_row: vec![
                    ("MD5".to_string(), md5.to_string()),
                    ("PATH".to_string(), path.to_string()),
                ],
                ..Default::default()
            });
        }

        Ok(descriptors)
    }
}

/// Splits on the first run of whitespace. A leading `*` on the path is
/// md5sum's binary-mode marker, not part of the name.
fn split_line(line: &str) -> Option<(&str, &str)> {
    let (md5, rest) = line.split_once(char::is_whitespace)?;
    let path = rest.trim_start();
    let path = path.strip_prefix('*').unwrap_or(path);
    if path.is_empty() {
        return None;
    }
    Some((md5, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_split_line() {
        assert_eq!(
            split_line("d41d8cd98f00b204e9800998ecf8427e /data/empty.txt"),
            Some(("d41d8cd98f00b204e9800998ecf8427e", "/data/empty.txt"))
        );
        assert_eq!(split_line("abc  *bin/file name.dat"), Some(("abc", "bin/file name.dat")));
        assert_eq!(split_line("abc\t/x/y"), Some(("abc", "/x/y")));
        assert_eq!(split_line("abc"), None);
    }

    #[test]
    fn test_descriptors() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("manifest.txt");
        fs::write(
            &path,
            "d41d8cd98f00b204e9800998ecf8427e /data/empty.txt\n\n   \nabc123  /data/with space.txt\n",
        )?;

        let descriptors = Md5SumManifest::new(path).descriptors()?;
        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[0].path, "/data/empty.txt");
        assert_eq!(descriptors[0].md5.as_deref(), Some("d41d8cd98f00b204e9800998ecf8427e"));
        assert_eq!(descriptors[0].relpath, None);
        assert_eq!(descriptors[1].path, "/data/with space.txt");
        assert_eq!(
            descriptors[1].manifest_row,
            vec![
                ("MD5".to_string(), "abc123".to_string()),
                ("PATH".to_string(), "/data/with space.txt".to_string()),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_malformed_line() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("manifest.txt");
        fs::write(&path, "abc /ok.txt\njustonetoken\n")?;

        let err = Md5SumManifest::new(path).descriptors().unwrap_err();
        assert!(matches!(err, ArchiverError::MalformedManifest { .. }));
        assert!(err.to_string().contains("line 2"));
        Ok(())
    }
}
