/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * Small filesystem/validation helpers `datadir.rs` and `main.rs` share,
 * grounded on `zerotier-system-service/src/datadir.rs`'s own use of
 * `read_limit`/`fs_restrict_permissions` (those helpers' bodies were not
 * retrieved in the pack, only their call sites, so they are rebuilt fresh
 * here from that call-site contract).
 */

use std::path::Path;

pub const DEFAULT_FILE_IO_READ_LIMIT: usize = 131072;

/// Read a file, refusing anything larger than `limit` bytes so a hostile or
/// corrupt data directory can't make us allocate unbounded memory.
pub async fn read_limit<P: AsRef<Path>>(path: P, limit: usize) -> std::io::Result<Vec<u8>> {
    let data = tokio::fs::read(path).await?;
    if data.len() > limit {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "file exceeds read limit"));
    }
    Ok(data)
}

/// Restrict a secret file to owner-only read/write (`0600`). No-op on
/// platforms without Unix permission bits.
#[cfg(unix)]
pub fn fs_restrict_permissions<P: AsRef<Path>>(path: P) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).is_ok()
}

#[cfg(not(unix))]
pub fn fs_restrict_permissions<P: AsRef<Path>>(_path: P) -> bool {
    true
}

/// `clap` value parser for `--listen-port`: any `u16`, including `0` (let
/// the kernel choose).
pub fn parse_port(s: &str) -> Result<u16, String> {
    s.parse::<u16>().map_err(|_| format!("not a valid port: {s:?}"))
}
