//! The package list text format.
//!
//! One package per line: `name appid <ignored> <ignored> <ignored> gid[,gid...]`. Extra trailing
//! fields written by newer producers are ignored.

use thiserror::Error;
use tracing::warn;

use super::{AID_MEDIA_RW, AID_SDCARD_RW, AccessFlags, PackageEntry};

/// Longest accepted package name, in bytes.
pub const PACKAGE_NAME_MAX: usize = 127;
/// Smallest app id accepted for a package.
pub const APPID_MIN: u32 = 1000;
/// Largest app id accepted for a package.
pub const APPID_MAX: u32 = 99_999;

const MIN_FIELDS: usize = 6;

/// Reasons a single package line is rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LineError {
    /// Fewer fields than the format requires.
    #[error("expected at least {MIN_FIELDS} fields, found {0}")]
    FieldCount(usize),
    /// The app id is not a number.
    #[error("unparsable app id '{0}'")]
    BadAppId(String),
    /// The package name exceeds [`PACKAGE_NAME_MAX`].
    #[error("package name is {0} bytes long")]
    NameTooLong(usize),
    /// The app id is outside `APPID_MIN..=APPID_MAX`.
    #[error("app id {0} is out of range")]
    AppIdOutOfRange(u32),
}

/// Parse one package line.
pub fn parse_line(line: &str) -> Result<PackageEntry, LineError> {
    let fields: Vec<&str> = line.split_ascii_whitespace().collect();
    if fields.len() < MIN_FIELDS {
        return Err(LineError::FieldCount(fields.len()));
    }

    let name = fields[0];
    if name.len() > PACKAGE_NAME_MAX {
        return Err(LineError::NameTooLong(name.len()));
    }

    let appid: u32 = fields[1]
        .parse()
        .map_err(|_| LineError::BadAppId(fields[1].to_owned()))?;
    if !(APPID_MIN..=APPID_MAX).contains(&appid) {
        return Err(LineError::AppIdOutOfRange(appid));
    }

    // Non-numeric gids ("none") carry no grant.
    let access = fields[5]
        .split(',')
        .filter_map(|gid| gid.parse::<u32>().ok())
        .fold(AccessFlags::empty(), |acc, gid| match gid {
            AID_SDCARD_RW => acc | AccessFlags::SDCARD_RW,
            AID_MEDIA_RW => acc | AccessFlags::MEDIA_RW,
            _ => acc,
        });

    Ok(PackageEntry {
        name: name.into(),
        appid,
        access,
    })
}

/// Parse a complete package list, skipping and logging malformed lines.
///
/// Returns the accepted entries and the number of lines that were skipped.
pub fn parse_list(text: &str) -> (Vec<PackageEntry>, usize) {
    let mut entries = Vec::new();
    let mut skipped = 0;
    for (lineno, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(line) {
            Ok(entry) => entries.push(entry),
            Err(error) => {
                skipped += 1;
                warn!(line = lineno + 1, %error, "skipping malformed package line");
            }
        }
    }
    (entries, skipped)
}
