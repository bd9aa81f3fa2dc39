/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * The config-protocol error kinds of spec.md §7's *Configuration* category,
 * each carrying the POSIX errno its `errno=` response line reports. Reusing
 * real errno numbers rather than inventing a private numbering keeps the
 * wire contract legible to anything that already speaks the WireGuard UAPI
 * convention (see DESIGN.md's Open Question note on this).
 */

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("malformed request line: {0}")]
    InvalidValue(String),
    #[error("unrecognized key: {0}")]
    UnknownKey(String),
    #[error("io error")]
    Io,
    #[error("listen port already in use")]
    PortInUse,
    #[error("protocol error")]
    Protocol,
}

impl ConfigError {
    /// The POSIX errno this error reports in the response's `errno=` line.
    pub fn errno(&self) -> i64 {
        match self {
            ConfigError::InvalidValue(_) => 22, // EINVAL
            ConfigError::UnknownKey(_) => 22,   // EINVAL
            ConfigError::Io => 5,               // EIO
            ConfigError::PortInUse => 98,       // EADDRINUSE
            ConfigError::Protocol => 71,        // EPROTO
        }
    }
}
