/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * Serializes a `get=1` reply in the exact field order spec.md §4.8 fixes:
 * device keys first, then one block per peer. `Device`'s timers run off a
 * process-monotonic clock (wireguard_proto::util::now_ms), not wall clock,
 * so last-handshake times are rebased onto `SystemTime::now()` here rather
 * than threading wall-clock time through the protocol core.
 */

use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

use wireguard_proto::util::now_ms;
use wireguard_proto::Device;

use crate::error::ConfigError;

/// Render the full `get=1` response body, including the blank-line
/// terminator but not the `errno=0\n\n` trailer (callers append that).
pub fn render_get(device: &Device) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "private_key={}", hex::encode(device.private_key()));
    let _ = writeln!(out, "listen_port={}", *device.listen_port.read());
    let _ = writeln!(out, "fwmark={}", *device.fwmark.read());

    let now_mono = now_ms();
    let now_wall = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();

    for peer in device.peers() {
        let _ = writeln!(out, "public_key={}", hex::encode(peer.static_public));
        let psk = peer.preshared_key();
        if psk != [0u8; 32] {
            let _ = writeln!(out, "preshared_key={}", hex::encode(psk));
        }
        let _ = writeln!(out, "protocol_version=1");
        if let Some(endpoint) = peer.endpoint() {
            let _ = writeln!(out, "endpoint={endpoint}");
        }

        let (sec, nsec) = handshake_time(peer.last_handshake_completed_at(), now_mono, now_wall);
        let _ = writeln!(out, "last_handshake_time_sec={sec}");
        let _ = writeln!(out, "last_handshake_time_nsec={nsec}");

        let _ = writeln!(out, "tx_bytes={}", peer.tx_bytes.load(std::sync::atomic::Ordering::Relaxed));
        let _ = writeln!(out, "rx_bytes={}", peer.rx_bytes.load(std::sync::atomic::Ordering::Relaxed));

        let keepalive = peer.persistent_keepalive_interval_ms.read().map(|ms| ms / 1000).unwrap_or(0);
        let _ = writeln!(out, "persistent_keepalive_interval={keepalive}");

        device.allowed_ips.entries_for(&wireguard_proto::PeerHandle(peer.clone()), |prefix| {
            let _ = writeln!(out, "allowed_ip={prefix}");
        });
    }

    out.push('\n');
    out
}

/// Converts a monotonic `last_handshake_completed_at()` reading into
/// (unix_seconds, nanoseconds), or (0, 0) if no handshake has ever
/// completed (`i64::MIN` sentinel).
fn handshake_time(completed_mono_ms: i64, now_mono_ms: i64, now_wall: std::time::Duration) -> (i64, u32) {
    if completed_mono_ms == i64::MIN {
        return (0, 0);
    }
    let age_ms = (now_mono_ms - completed_mono_ms).max(0) as u64;
    let event_wall = now_wall.saturating_sub(std::time::Duration::from_millis(age_ms));
    (event_wall.as_secs() as i64, event_wall.subsec_nanos())
}

/// Render an `errno=<n>\n\n` trailer line for either a `get` or `set` reply.
pub fn render_errno(result: &Result<(), ConfigError>) -> String {
    let code = match result {
        Ok(()) => 0,
        Err(e) => e.errno(),
    };
    format!("errno={code}\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use wireguard_crypto::dh::KeyPair;

    #[test]
    fn renders_device_identity_and_listen_port() {
        let device = Device::new(KeyPair::generate());
        let body = render_get(&device);
        assert!(body.starts_with("private_key="));
        assert!(body.contains("listen_port=0"));
        assert!(body.ends_with('\n'));
    }

    #[test]
    fn renders_one_block_per_peer_with_protocol_version() {
        let device = Device::new(KeyPair::generate());
        device.add_peer([7u8; 32], [0u8; 32], &[("10.0.0.2".parse().unwrap(), 32)]);
        let body = render_get(&device);
        assert_eq!(body.matches("protocol_version=1").count(), 1);
        assert!(body.contains("allowed_ip=10.0.0.2/32"));
        assert!(body.contains("last_handshake_time_sec=0"));
    }

    #[test]
    fn errno_trailer_reports_zero_on_success() {
        assert_eq!(render_errno(&Ok(())), "errno=0\n\n");
    }

    #[test]
    fn errno_trailer_reports_einval_on_invalid_value() {
        let err: Result<(), ConfigError> = Err(ConfigError::InvalidValue("x".into()));
        assert_eq!(render_errno(&err), "errno=22\n\n");
    }
}
