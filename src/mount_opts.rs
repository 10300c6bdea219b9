//! Mount option parsing (§6). The only recognized option is `root=<u64>`,
//! overriding the default root inode number; any unknown key fails the
//! mount outright rather than being silently ignored.

use crate::error::{Error, Result};
use crate::ids::InodeNumber;

/// The parsed result of a mount-options string.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MountOpts {
    pub root: Option<InodeNumber>,
}

/// Parses a comma-separated `key=value` options string (e.g. `root=5`).
/// An empty string is a valid "no options" mount.
pub fn parse(opts: &str) -> Result<MountOpts> {
    let mut parsed = MountOpts::default();
    for field in opts.split(',') {
        let field = field.trim();
        if field.is_empty() {
            continue;
        }
        let (key, value) = field
            .split_once('=')
            .ok_or_else(|| Error::with_detail(crate::error::ErrorKind::InvalidArgument, "malformed mount option"))?;
        match key {
            "root" => {
                let ino: u64 = value
                    .parse()
                    .map_err(|_| Error::with_detail(crate::error::ErrorKind::InvalidArgument, "root= expects a u64"))?;
                parsed.root = Some(InodeNumber(ino));
            }
            _ => {
                return Err(Error::with_detail(crate::error::ErrorKind::InvalidArgument, "unknown mount option"));
            }
        }
    }
    Ok(parsed)
}
