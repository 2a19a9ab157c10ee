//! Local firmware image metadata

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::common::{Error, Result};

/// Marker sysupgrade images for UBI boards carry in their file name
const UBI_MARKER: &str = "-ubi-";

/// A firmware image on the host, hashed once per flash attempt
#[derive(Debug, Clone, Serialize)]
pub struct FirmwareImage {
    pub path: PathBuf,
    pub size: u64,
    /// Lowercase hex SHA-256
    pub sha256: String,
    /// Board the image is declared for
    pub board: Option<String>,
    pub is_ubi: bool,
}

impl FirmwareImage {
    /// Read and hash `path`
    pub fn load(path: &Path, declared_board: Option<&str>) -> Result<Self> {
        let (size, sha256) = sha256_file(path)?;
        let is_ubi = path
            .file_name()
            .map(|name| name.to_string_lossy().to_lowercase().contains(UBI_MARKER))
            .unwrap_or(false);

        tracing::debug!(path = %path.display(), size, %sha256, is_ubi, "Loaded firmware image");

        Ok(Self {
            path: path.to_path_buf(),
            size,
            sha256,
            board: declared_board.map(str::to_string),
            is_ubi,
        })
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    /// Case-insensitive comparison against a caller-supplied digest
    pub fn digest_matches(&self, expected: &str) -> bool {
        self.sha256.eq_ignore_ascii_case(expected.trim())
    }
}

/// Size and lowercase hex SHA-256 of a file
pub fn sha256_file(path: &Path) -> Result<(u64, String)> {
    let file = File::open(path).map_err(|e| Error::FileRead {
        path: path.display().to_string(),
        error: e.to_string(),
    })?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }

    Ok((size, hex::encode(hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_hashes_and_detects_ubi() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir
            .path()
            .join("openwrt-23.05.5-mediatek-mt7622-linksys_e8450-UBI-squashfs-sysupgrade.itb");
        File::create(&path).unwrap().write_all(b"abc").unwrap();

        let image = FirmwareImage::load(&path, Some("linksys,e8450-ubi")).unwrap();
        assert_eq!(image.size, 3);
        assert_eq!(
            image.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(image.is_ubi);
        assert!(image.digest_matches("BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD"));
    }

    #[test]
    fn test_missing_file_is_a_read_error() {
        let err = FirmwareImage::load(Path::new("/nonexistent/fw.bin"), None).unwrap_err();
        assert!(matches!(err, Error::FileRead { .. }));
    }
}
