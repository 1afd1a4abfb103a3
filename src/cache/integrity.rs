//! Container integrity checks for cached files
//!
//! A truncated or mislabelled download must never be reused as a cache entry.
//! ISO-BMFF files need their `moov` index, Matroska files need the EBML magic.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// Smallest file accepted as a media container
pub const MIN_VALID_BYTES: u64 = 8 * 1024;

/// Atoms inspected before giving up on finding `moov`
pub const MAX_SCANNED_ATOMS: usize = 100;

const EBML_MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];

/// Container family, chosen by extension and leading bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFamily {
    IsoBmff,
    Matroska,
}

impl ContainerFamily {
    /// Family for a file extension (with or without the leading dot)
    ///
    /// Returns `None` when the extension does not decide; the leading bytes
    /// have to be sniffed then.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "mp4" | "m4v" | "mov" => Some(Self::IsoBmff),
            "mkv" | "webm" => Some(Self::Matroska),
            _ => None,
        }
    }
}

/// Validate a file on disk, deriving the family from its own extension
pub fn is_valid_cache_file(path: &Path) -> bool {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    validate_file(path, ext)
}

/// Validate a file on disk as if it carried extension `ext`
///
/// Used for `.part` downloads whose final extension is already known.
pub fn validate_file(path: &Path, ext: &str) -> bool {
    let Ok(mut file) = File::open(path) else {
        return false;
    };
    let Ok(len) = file.metadata().map(|m| m.len()) else {
        return false;
    };
    validate_container(&mut file, len, ext)
}

/// Validate an already opened container of `len` bytes
pub fn validate_container<R: Read + Seek>(reader: &mut R, len: u64, ext: &str) -> bool {
    if len < MIN_VALID_BYTES {
        return false;
    }

    let family = match ContainerFamily::from_extension(ext) {
        Some(family) => family,
        None => {
            let mut magic = [0u8; 4];
            if reader.seek(SeekFrom::Start(0)).is_err() || reader.read_exact(&mut magic).is_err() {
                return false;
            }
            if magic == EBML_MAGIC {
                ContainerFamily::Matroska
            } else {
                ContainerFamily::IsoBmff
            }
        }
    };

    match family {
        ContainerFamily::Matroska => has_ebml_magic(reader),
        ContainerFamily::IsoBmff => has_moov_atom(reader, len),
    }
}

fn has_ebml_magic<R: Read + Seek>(reader: &mut R) -> bool {
    let mut magic = [0u8; 4];
    reader.seek(SeekFrom::Start(0)).is_ok() && reader.read_exact(&mut magic).is_ok() && magic == EBML_MAGIC
}

fn has_moov_atom<R: Read + Seek>(reader: &mut R, len: u64) -> bool {
    let mut header = [0u8; 8];
    if reader.seek(SeekFrom::Start(0)).is_err() || reader.read_exact(&mut header).is_err() {
        return false;
    }
    if &header[4..8] != b"ftyp" {
        return false;
    }

    let mut pos = 0u64;
    for _ in 0..MAX_SCANNED_ATOMS {
        if pos.checked_add(8).map_or(true, |end| end > len) {
            break;
        }
        if reader.seek(SeekFrom::Start(pos)).is_err() || reader.read_exact(&mut header).is_err() {
            return false;
        }

        if &header[4..8] == b"moov" {
            return true;
        }

        let mut size = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as u64;
        if size == 1 {
            let mut extended = [0u8; 8];
            if reader.read_exact(&mut extended).is_err() {
                return false;
            }
            size = u64::from_be_bytes(extended);
        }
        // Size 0 runs to the end of the file; nothing follows it
        if size < 8 {
            break;
        }
        pos = match pos.checked_add(size) {
            Some(next) if next <= len => next,
            _ => break,
        };
    }

    false
}
