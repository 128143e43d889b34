//! Record-stream codec for freezer tool image files.
//!
//! Layout: a 4-byte magic header, then `(u32 host-endian length, length
//! bytes of serialized message)` until end of file. EOF directly after a
//! complete record is the terminator; anything shorter mid-record is
//! corruption and surfaces as an error with the failing offset.

use crate::error::{IceboxError, Result};
use anyhow::Context as _;
use std::fs;
use std::path::Path;

pub const MAGIC_LEN: usize = 4;

/// One length-prefixed record, with the file offset of its body.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub offset: u64,
    pub body: Vec<u8>,
}

/// A fully parsed image file: magic header plus raw record bodies.
#[derive(Debug, Clone)]
pub struct RawImage {
    pub magic: [u8; MAGIC_LEN],
    pub records: Vec<RawRecord>,
}

fn format_err(path: &Path, offset: u64, reason: impl Into<String>) -> IceboxError {
    IceboxError::ImageFormat {
        file: path.display().to_string(),
        offset,
        reason: reason.into(),
    }
}

pub fn read_image(path: &Path) -> Result<RawImage> {
    let data =
        fs::read(path).with_context(|| format!("reading image file {}", path.display()))?;

    if data.len() < MAGIC_LEN {
        return Err(format_err(path, 0, "file shorter than magic header"));
    }
    let mut magic = [0u8; MAGIC_LEN];
    magic.copy_from_slice(&data[..MAGIC_LEN]);

    let mut records = Vec::new();
    let mut pos = MAGIC_LEN;
    while pos < data.len() {
        if pos + 4 > data.len() {
            return Err(format_err(path, pos as u64, "truncated record length"));
        }
        let len = u32::from_ne_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
            as usize;
        pos += 4;
        if pos + len > data.len() {
            return Err(format_err(
                path,
                pos as u64,
                format!(
                    "record length {} exceeds remaining {} bytes",
                    len,
                    data.len() - pos
                ),
            ));
        }
        records.push(RawRecord {
            offset: pos as u64,
            body: data[pos..pos + len].to_vec(),
        });
        pos += len;
    }

    Ok(RawImage { magic, records })
}

/// Write an image file with remove-then-create semantics, so a previous
/// destination (possibly a hard link shared with a source directory)
/// never sees partial content.
pub fn write_image(path: &Path, image: &RawImage) -> Result<()> {
    let mut out = Vec::with_capacity(
        MAGIC_LEN + image.records.iter().map(|r| 4 + r.body.len()).sum::<usize>(),
    );
    out.extend_from_slice(&image.magic);
    for record in &image.records {
        out.extend_from_slice(&(record.body.len() as u32).to_ne_bytes());
        out.extend_from_slice(&record.body);
    }
    replace_file(path, &out)
}

/// Remove any previous file at `path`, then write `data` fresh.
pub fn replace_file(path: &Path, data: &[u8]) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    fs::write(path, data).with_context(|| format!("writing image file {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn build_file(records: &[&[u8]]) -> Vec<u8> {
        let mut data = vec![0x19, 0x43, 0x56, 0x54]; // arbitrary magic
        for body in records {
            data.extend_from_slice(&(body.len() as u32).to_ne_bytes());
            data.extend_from_slice(body);
        }
        data
    }

    #[test]
    fn test_read_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("test.img");
        std::fs::write(&path, build_file(&[b"hello", b"", b"world!"])).unwrap();

        let image = read_image(&path).unwrap();
        assert_eq!(image.magic, [0x19, 0x43, 0x56, 0x54]);
        assert_eq!(image.records.len(), 3);
        assert_eq!(image.records[0].body, b"hello");
        assert_eq!(image.records[1].body, b"");
        assert_eq!(image.records[2].body, b"world!");

        let out = tmp.path().join("out.img");
        write_image(&out, &image).unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), std::fs::read(&path).unwrap());
    }

    #[test]
    fn test_truncated_record_body_is_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("short.img");
        let mut data = build_file(&[b"hello"]);
        data.truncate(data.len() - 2); // cut into the record body
        std::fs::write(&path, data).unwrap();

        let err = read_image(&path).unwrap_err();
        match err {
            IceboxError::ImageFormat { offset, .. } => assert_eq!(offset, 8),
            other => panic!("expected ImageFormat, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_length_prefix_is_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("short.img");
        let mut data = build_file(&[]);
        data.extend_from_slice(&[1, 0]); // half a length word
        std::fs::write(&path, data).unwrap();

        assert!(matches!(
            read_image(&path).unwrap_err(),
            IceboxError::ImageFormat { .. }
        ));
    }

    #[test]
    fn test_missing_file_is_error() {
        let tmp = TempDir::new().unwrap();
        let err = read_image(&tmp.path().join("nope.img")).unwrap_err();
        assert!(err.to_string().contains("nope.img"));
    }

    #[test]
    fn test_replace_file_overwrites_hard_link() {
        let tmp = TempDir::new().unwrap();
        let original = tmp.path().join("a.img");
        let linked = tmp.path().join("b.img");
        std::fs::write(&original, b"shared").unwrap();
        std::fs::hard_link(&original, &linked).unwrap();

        replace_file(&linked, b"rewritten").unwrap();
        // The link partner keeps the old content; the rewrite broke the link.
        assert_eq!(std::fs::read(&original).unwrap(), b"shared");
        assert_eq!(std::fs::read(&linked).unwrap(), b"rewritten");
    }
}
