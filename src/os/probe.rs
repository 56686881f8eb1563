//! Filesystem Signature Probing
//!
//! Identifies the filesystem on a block device by comparing magic byte
//! sequences at fixed offsets. The window read from the device covers the
//! furthest signature, so every probe is answered from a single read.

use crate::error::{Error, Result};
use std::path::Path;
use tokio::io::AsyncReadExt;
use tracing::debug;

/// A magic byte sequence at a fixed offset
#[derive(Debug, Clone, Copy)]
pub struct Signature {
    pub fs_type: &'static str,
    pub magic: &'static [u8],
    pub offset: usize,
}

impl Signature {
    fn end(&self) -> usize {
        self.offset + self.magic.len()
    }

    fn matches(&self, window: &[u8]) -> bool {
        window
            .get(self.offset..self.end())
            .map(|bytes| bytes == self.magic)
            .unwrap_or(false)
    }
}

/// Known signatures, checked in order
pub const SIGNATURES: &[Signature] = &[
    Signature {
        fs_type: "btrfs",
        magic: b"_BHRfS_M",
        offset: 0x10040,
    },
    Signature {
        fs_type: "ext4",
        magic: &[0x53, 0xEF],
        offset: 0x438,
    },
    Signature {
        fs_type: "xfs",
        magic: b"XFSB",
        offset: 0,
    },
];

/// Bytes needed to evaluate every signature
pub fn window_size() -> usize {
    SIGNATURES.iter().map(Signature::end).max().unwrap_or(0)
}

/// Match a window against the signature table
pub fn identify(window: &[u8]) -> Option<&'static str> {
    SIGNATURES
        .iter()
        .find(|sig| sig.matches(window))
        .map(|sig| sig.fs_type)
}

/// Probe the filesystem type of a device
///
/// Fails with [`Error::UnknownFileSystem`] when the device carries none of
/// the known signatures, and with an IO error when the device is shorter
/// than the probe window.
pub async fn probe_fs_type(device: impl AsRef<Path>) -> Result<&'static str> {
    let device = device.as_ref();
    let len = window_size();
    let mut window = vec![0u8; len];

    let mut file = tokio::fs::File::open(device).await?;
    file.read_exact(&mut window).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!(
                    "short read on {}: fewer than {} bytes",
                    device.display(),
                    len
                ),
            ))
        } else {
            Error::Io(e)
        }
    })?;

    match identify(&window) {
        Some(fs_type) => {
            debug!(device = %device.display(), fs_type, "Probed filesystem");
            Ok(fs_type)
        }
        None => Err(Error::UnknownFileSystem {
            device: device.display().to_string(),
        }),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    /// A zeroed device image carrying the given signature
    pub(crate) fn device_image(fs_type: Option<&str>) -> tempfile::NamedTempFile {
        let mut buf = vec![0u8; window_size()];
        if let Some(fs_type) = fs_type {
            let sig = SIGNATURES.iter().find(|s| s.fs_type == fs_type).unwrap();
            buf[sig.offset..sig.end()].copy_from_slice(sig.magic);
        }
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&buf).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_window_covers_furthest_signature() {
        assert_eq!(window_size(), 0x10040 + 8);
    }

    #[test]
    fn test_identify_buffers() {
        let mut buf = vec![0u8; window_size()];
        assert_eq!(identify(&buf), None);

        buf[..4].copy_from_slice(b"XFSB");
        assert_eq!(identify(&buf), Some("xfs"));

        let mut buf = vec![0u8; window_size()];
        buf[0x438] = 0x53;
        buf[0x439] = 0xEF;
        assert_eq!(identify(&buf), Some("ext4"));

        assert_eq!(identify(b"XFSB"), Some("xfs"));
        assert_eq!(identify(b"XFS"), None);
    }

    #[tokio::test]
    async fn test_probe_device_images() {
        for fs_type in ["btrfs", "ext4", "xfs"] {
            let image = device_image(Some(fs_type));
            assert_eq!(probe_fs_type(image.path()).await.unwrap(), fs_type);
        }

        let blank = device_image(None);
        assert_matches!(
            probe_fs_type(blank.path()).await,
            Err(Error::UnknownFileSystem { .. })
        );
    }

    #[tokio::test]
    async fn test_short_device_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"XFSB").unwrap();
        assert_matches!(probe_fs_type(file.path()).await, Err(Error::Io(_)));
    }
}
