#![forbid(unsafe_code)]

//! Shared security helpers used by the podcast binaries and the cache layer.

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Longest content ID accepted; real IDs are 11-character video IDs.
const MAX_CONTENT_ID_LEN: usize = 64;

/// Fails fast when a binary is started as root. The backend writes into the
/// audio cache and spawns `yt-dlp`, neither of which should ever happen with
/// root privileges.
pub fn ensure_not_root(process: &str) -> Result<()> {
    if Uid::current().is_root() {
        bail!("{process} must not be run as root; start it from an unprivileged service account");
    }
    Ok(())
}

/// Returns true when `id` can safely become a file name inside the cache
/// directory: one non-empty segment made of ASCII letters, digits, `-` or `_`.
pub fn is_safe_content_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_CONTENT_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}
