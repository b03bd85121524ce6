//! Mount option parsing.
//!
//! The option string is a comma-separated list:
//!
//! * `lower=UID:GID:FMODE:DMODE` and `upper=UID:GID:FMODE:DMODE` set the two presentation tuples.
//!   Ids accept decimal, `0x` hexadecimal or leading-zero octal; modes are always octal.
//! * `derive=none|legacy|unified|multi|public` (or the bare flag names) select the derivation
//!   policy. Flags accumulate; `derive=none` clears them.
//! * `confine` / `noconfine` toggle the write-access augmentation.
//! * `label=CONTEXT` sets the security label used while acting on the lower filesystem. It must
//!   come last: the label runs to the end of the string, commas included.
//!
//! Any other token is a hard error.

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use thiserror::Error;

use crate::cred::Identity;
use crate::derive::TreeClass;
use crate::pkgdb::{AID_MEDIA_RW, AID_SDCARD_RW};

/// Errors produced while parsing a mount option string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MountOptionError {
    /// The token is not a recognised option.
    #[error("unrecognized mount option '{0}'")]
    Unknown(String),
    /// A `lower=`/`upper=` value is not a `uid:gid:fmode:dmode` quad.
    #[error("'{key}=' expects UID:GID:FILEMODE:DIRMODE, got '{value}'")]
    BadTuple {
        /// The option key.
        key: &'static str,
        /// The offending value.
        value: String,
    },
    /// A numeric field failed to parse.
    #[error("invalid number '{0}'")]
    BadNumber(String),
    /// A mode has bits outside `0o7777`.
    #[error("mode {0:#o} is out of range")]
    ModeOutOfRange(u32),
    /// `derive=` named an unknown policy.
    #[error("unknown derivation mode '{0}'")]
    BadDerive(String),
    /// `label=` was empty.
    #[error("empty security label")]
    EmptyLabel,
}

impl From<MountOptionError> for i32 {
    fn from(_: MountOptionError) -> Self {
        libc::EINVAL
    }
}

/// One credential-presentation tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermTuple {
    /// Owner.
    pub uid: u32,
    /// Group.
    pub gid: u32,
    /// Mode for regular files.
    pub fmode: u32,
    /// Mode for directories.
    pub dmode: u32,
}

impl PermTuple {
    /// The identity this tuple names.
    #[must_use]
    pub fn identity(&self) -> Identity {
        Identity {
            uid: self.uid,
            gid: self.gid,
        }
    }

    fn parse(key: &'static str, value: &str) -> Result<Self, MountOptionError> {
        let bad = || MountOptionError::BadTuple {
            key,
            value: value.to_owned(),
        };
        let mut parts = value.split(':');
        let (Some(uid), Some(gid), Some(fmode), Some(dmode), None) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            return Err(bad());
        };
        Ok(Self {
            uid: parse_id(uid)?,
            gid: parse_id(gid)?,
            fmode: parse_mode(fmode)?,
            dmode: parse_mode(dmode)?,
        })
    }
}

impl fmt::Display for PermTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{:04o}:{:04o}", self.uid, self.gid, self.fmode, self.dmode)
    }
}

bitflags! {
    /// Mount-wide policy flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MountFlags: u32 {
        /// Single-user legacy layout.
        const DERIVE_LEGACY  = 1 << 0;
        /// Unified multi-user layout.
        const DERIVE_UNIFIED = 1 << 1;
        /// Per-user top-level directories.
        const DERIVE_MULTI   = 1 << 2;
        /// Public secondary storage.
        const DERIVE_PUBLIC  = 1 << 3;
        /// Enforce the package-based write augmentation.
        const DERIVE_CONFINE = 1 << 4;

        /// Every flag that turns derivation on.
        const DERIVE_ANY = Self::DERIVE_LEGACY.bits()
            | Self::DERIVE_UNIFIED.bits()
            | Self::DERIVE_MULTI.bits()
            | Self::DERIVE_PUBLIC.bits();
    }
}

/// Fully parsed per-mount configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOptions {
    /// Identity and modes used when acting on the lower filesystem.
    pub lower: PermTuple,
    /// Identity and modes presented to callers.
    pub upper: PermTuple,
    /// Policy flags.
    pub flags: MountFlags,
    /// Security label applied during credential override.
    pub label: Option<String>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            lower: PermTuple {
                uid: AID_MEDIA_RW,
                gid: AID_MEDIA_RW,
                fmode: 0o664,
                dmode: 0o775,
            },
            upper: PermTuple {
                uid: 0,
                gid: AID_SDCARD_RW,
                fmode: 0o664,
                dmode: 0o775,
            },
            flags: MountFlags::empty(),
            label: None,
        }
    }
}

impl MountOptions {
    /// Whether any derivation mode is enabled.
    #[must_use]
    pub fn derives(&self) -> bool {
        self.flags.intersects(MountFlags::DERIVE_ANY)
    }

    /// Whether the unified layout is in effect for link eligibility and pinning.
    #[must_use]
    pub fn unified(&self) -> bool {
        self.flags.contains(MountFlags::DERIVE_UNIFIED)
    }

    /// Whether the legacy layout is in effect.
    #[must_use]
    pub fn legacy(&self) -> bool {
        self.flags.contains(MountFlags::DERIVE_LEGACY)
    }

    /// Unified mode without the multi or public relaxations.
    ///
    /// Gates the `Android/user` transition and the protected Android subtree.
    #[must_use]
    pub fn restricted(&self) -> bool {
        self.unified()
            && !self
                .flags
                .intersects(MountFlags::DERIVE_MULTI | MountFlags::DERIVE_PUBLIC)
    }

    /// Whether the write augmentation is enforced.
    #[must_use]
    pub fn confined(&self) -> bool {
        self.flags.contains(MountFlags::DERIVE_CONFINE)
    }

    /// Classification of the mount root.
    #[must_use]
    pub fn root_class(&self) -> TreeClass {
        if self.legacy() {
            TreeClass::RootLegacy
        } else if self.derives() {
            TreeClass::Root
        } else {
            TreeClass::None
        }
    }

    fn apply_derive(&mut self, mode: &str) -> Result<(), MountOptionError> {
        let flag = match mode {
            "none" => {
                self.flags.remove(MountFlags::DERIVE_ANY);
                return Ok(());
            }
            "legacy" => MountFlags::DERIVE_LEGACY,
            "unified" => MountFlags::DERIVE_UNIFIED,
            "multi" => MountFlags::DERIVE_MULTI,
            "public" => MountFlags::DERIVE_PUBLIC,
            other => return Err(MountOptionError::BadDerive(other.to_owned())),
        };
        self.flags.insert(flag);
        Ok(())
    }
}

impl MountOptions {
    fn apply_token(&mut self, token: &str) -> Result<(), MountOptionError> {
        match token.split_once('=') {
            Some(("lower", value)) => self.lower = PermTuple::parse("lower", value)?,
            Some(("upper", value)) => self.upper = PermTuple::parse("upper", value)?,
            Some(("derive", value)) => self.apply_derive(value)?,
            Some(_) => return Err(MountOptionError::Unknown(token.to_owned())),
            None => match token {
                "confine" => self.flags.insert(MountFlags::DERIVE_CONFINE),
                "noconfine" => self.flags.remove(MountFlags::DERIVE_CONFINE),
                "legacy" | "unified" | "multi" | "public" => self.apply_derive(token)?,
                _ => return Err(MountOptionError::Unknown(token.to_owned())),
            },
        }
        Ok(())
    }
}

impl FromStr for MountOptions {
    type Err = MountOptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut opts = Self::default();
        let mut rest = s.trim();
        while !rest.is_empty() {
            // Security contexts may list categories separated by commas.
            if let Some(label) = rest.strip_prefix("label=") {
                let label = label.trim();
                if label.is_empty() {
                    return Err(MountOptionError::EmptyLabel);
                }
                opts.label = Some(label.to_owned());
                break;
            }
            let (token, tail) = rest.split_once(',').unwrap_or((rest, ""));
            let token = token.trim();
            if !token.is_empty() {
                opts.apply_token(token)?;
            }
            rest = tail.trim_start();
        }
        Ok(opts)
    }
}

impl fmt::Display for MountOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lower={},upper={}", self.lower, self.upper)?;
        for (name, flag) in [
            ("legacy", MountFlags::DERIVE_LEGACY),
            ("unified", MountFlags::DERIVE_UNIFIED),
            ("multi", MountFlags::DERIVE_MULTI),
            ("public", MountFlags::DERIVE_PUBLIC),
        ] {
            if self.flags.contains(flag) {
                write!(f, ",derive={name}")?;
            }
        }
        if self.confined() {
            f.write_str(",confine")?;
        }
        if let Some(label) = &self.label {
            write!(f, ",label={label}")?;
        }
        Ok(())
    }
}

/// Parse an id the way the kernel's general integer parser does: `0x` hex, leading `0` octal,
/// decimal otherwise.
fn parse_id(s: &str) -> Result<u32, MountOptionError> {
    let bad = || MountOptionError::BadNumber(s.to_owned());
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else if s.len() > 1
        && let Some(oct) = s.strip_prefix('0')
    {
        u32::from_str_radix(oct, 8)
    } else {
        s.parse()
    };
    parsed.map_err(|_| bad())
}

fn parse_mode(s: &str) -> Result<u32, MountOptionError> {
    let mode =
        u32::from_str_radix(s, 8).map_err(|_| MountOptionError::BadNumber(s.to_owned()))?;
    if mode > 0o7777 {
        return Err(MountOptionError::ModeOutOfRange(mode));
    }
    Ok(mode)
}
