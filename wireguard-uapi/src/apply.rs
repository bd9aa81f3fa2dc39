/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * Applies a parsed [`SetRequest`] to a live [`Device`]. Partial application
 * on error is intentional (spec.md §7 *Configuration*: "the partial
 * configuration applied so far is retained").
 */

use wireguard_crypto::dh::KeyPair;
use wireguard_proto::trie::Prefix;
use wireguard_proto::{Device, PeerHandle};

use crate::error::ConfigError;
use crate::message::{AllowedIpOp, PeerConfig, SetRequest};

/// Apply every key in `req` to `device` in order, stopping at the first
/// error. A peer block whose `public_key` equals the device's own is a
/// self-loop and is silently absorbed without mutating state (spec.md §4.8).
pub fn apply_set(device: &Device, req: &SetRequest) -> Result<(), ConfigError> {
    if let Some(private_key) = req.private_key {
        match private_key {
            Some(bytes) => device.set_private_key(KeyPair::from_bytes(&bytes)),
            // The core's identity is always live; there is no "no identity"
            // device state to transition into, so clearing is rejected
            // rather than silently ignored (see DESIGN.md).
            None => return Err(ConfigError::InvalidValue("private_key cannot be cleared".into())),
        }
    }
    if let Some(port) = req.listen_port {
        *device.listen_port.write() = port;
    }
    if let Some(fwmark) = req.fwmark {
        *device.fwmark.write() = fwmark;
    }
    if req.replace_peers {
        for peer in device.peers() {
            device.remove_peer(&peer.static_public);
        }
    }

    let our_public = device.public_key();
    for peer_cfg in &req.peers {
        if peer_cfg.public_key == our_public {
            tracing::debug!("ignoring self-referential peer block");
            continue;
        }
        apply_peer(device, peer_cfg)?;
    }
    Ok(())
}

fn apply_peer(device: &Device, cfg: &PeerConfig) -> Result<(), ConfigError> {
    if cfg.remove {
        device.remove_peer(&cfg.public_key);
        return Ok(());
    }

    let existing = device.peer_by_pubkey(&cfg.public_key);
    if cfg.update_only && existing.is_none() {
        return Ok(());
    }

    let peer = match existing {
        Some(peer) => peer,
        None => {
            let initial_ips: Vec<(std::net::IpAddr, u8)> = cfg
                .allowed_ips
                .iter()
                .filter_map(|op| match op {
                    AllowedIpOp::Add(addr, len) => Some((*addr, *len)),
                    AllowedIpOp::Remove(_, _) => None,
                })
                .collect();
            return Ok(finish_new_peer(device, cfg, &initial_ips));
        }
    };

    if let Some(psk) = cfg.preshared_key {
        peer.set_preshared_key(psk);
    }
    if let Some(endpoint) = &cfg.endpoint {
        let addr = endpoint
            .parse::<std::net::SocketAddr>()
            .map_err(|_| ConfigError::InvalidValue(format!("bad endpoint: {endpoint:?}")))?;
        peer.set_endpoint(addr);
    }
    if let Some(keepalive) = cfg.persistent_keepalive_interval {
        *peer.persistent_keepalive_interval_ms.write() =
            if keepalive == 0 { None } else { Some(keepalive as i64 * 1000) };
    }
    if cfg.replace_allowed_ips {
        device.allowed_ips.remove_all(&PeerHandle(peer.clone()));
    }
    for op in &cfg.allowed_ips {
        match op {
            AllowedIpOp::Add(addr, len) => {
                if let Some(prefix) = Prefix::new(*addr, *len) {
                    device.allowed_ips.insert(prefix, PeerHandle(peer.clone()));
                }
            }
            AllowedIpOp::Remove(addr, len) => {
                if let Some(prefix) = Prefix::new(*addr, *len) {
                    device.allowed_ips.remove(prefix, &PeerHandle(peer.clone()));
                }
            }
        }
    }
    Ok(())
}

fn finish_new_peer(device: &Device, cfg: &PeerConfig, initial_ips: &[(std::net::IpAddr, u8)]) {
    let psk = cfg.preshared_key.unwrap_or([0u8; 32]);
    let peer = device.add_peer(cfg.public_key, psk, initial_ips);
    if let Some(endpoint) = &cfg.endpoint {
        if let Ok(addr) = endpoint.parse::<std::net::SocketAddr>() {
            peer.set_endpoint(addr);
        }
    }
    if let Some(keepalive) = cfg.persistent_keepalive_interval {
        *peer.persistent_keepalive_interval_ms.write() =
            if keepalive == 0 { None } else { Some(keepalive as i64 * 1000) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wireguard_crypto::dh::KeyPair;

    fn new_device() -> Device {
        Device::new(KeyPair::generate())
    }

    #[test]
    fn self_referential_peer_block_is_absorbed() {
        let device = new_device();
        let our_public = device.public_key();
        let req = SetRequest { peers: vec![PeerConfig { public_key: our_public, ..Default::default() }], ..Default::default() };
        apply_set(&device, &req).unwrap();
        assert!(device.peers().is_empty());
    }

    #[test]
    fn update_only_on_unknown_peer_is_a_noop() {
        let device = new_device();
        let req = SetRequest {
            peers: vec![PeerConfig { public_key: [9u8; 32], update_only: true, ..Default::default() }],
            ..Default::default()
        };
        apply_set(&device, &req).unwrap();
        assert!(device.peer_by_pubkey(&[9u8; 32]).is_none());
    }

    #[test]
    fn replace_peers_clears_existing_before_new_blocks_apply() {
        let device = new_device();
        device.add_peer([1u8; 32], [0u8; 32], &[]);
        let req = SetRequest {
            replace_peers: true,
            peers: vec![PeerConfig { public_key: [2u8; 32], ..Default::default() }],
            ..Default::default()
        };
        apply_set(&device, &req).unwrap();
        assert!(device.peer_by_pubkey(&[1u8; 32]).is_none());
        assert!(device.peer_by_pubkey(&[2u8; 32]).is_some());
    }

    #[test]
    fn remove_true_removes_existing_peer() {
        let device = new_device();
        device.add_peer([3u8; 32], [0u8; 32], &[]);
        let req = SetRequest {
            peers: vec![PeerConfig { public_key: [3u8; 32], remove: true, ..Default::default() }],
            ..Default::default()
        };
        apply_set(&device, &req).unwrap();
        assert!(device.peer_by_pubkey(&[3u8; 32]).is_none());
    }

    #[test]
    fn allowed_ip_add_then_remove_mutates_routing_table() {
        let device = new_device();
        let addr: std::net::IpAddr = "10.0.0.5".parse().unwrap();
        let req = SetRequest {
            peers: vec![PeerConfig {
                public_key: [4u8; 32],
                allowed_ips: vec![AllowedIpOp::Add(addr, 32)],
                ..Default::default()
            }],
            ..Default::default()
        };
        apply_set(&device, &req).unwrap();
        assert_eq!(device.peer_for_destination(addr).unwrap().static_public, [4u8; 32]);

        let remove_req = SetRequest {
            peers: vec![PeerConfig {
                public_key: [4u8; 32],
                update_only: true,
                allowed_ips: vec![AllowedIpOp::Remove(addr, 32)],
                ..Default::default()
            }],
            ..Default::default()
        };
        apply_set(&device, &remove_req).unwrap();
        assert!(device.peer_for_destination(addr).is_none());
    }

    proptest::proptest! {
        // Invariant 9 (spec.md §8): applying the same `set` transcript
        // twice produces the same final state.
        #[test]
        fn prop_applying_same_transcript_twice_is_idempotent(
            octets in proptest::collection::vec((proptest::num::u8::ANY, proptest::num::u8::ANY, 0u8..=32), 1..12),
        ) {
            let device = new_device();
            let req = SetRequest {
                peers: vec![PeerConfig {
                    public_key: [5u8; 32],
                    allowed_ips: octets
                        .iter()
                        .map(|(a, b, len)| AllowedIpOp::Add(std::net::IpAddr::from([10u8, 0, *a, *b]), *len))
                        .collect(),
                    ..Default::default()
                }],
                ..Default::default()
            };
            apply_set(&device, &req).unwrap();
            let mut first: Vec<Prefix> = Vec::new();
            device.allowed_ips.entries_for(&PeerHandle(device.peer_by_pubkey(&[5u8; 32]).unwrap()), |p| first.push(p));

            apply_set(&device, &req).unwrap();
            let mut second: Vec<Prefix> = Vec::new();
            device.allowed_ips.entries_for(&PeerHandle(device.peer_by_pubkey(&[5u8; 32]).unwrap()), |p| second.push(p));

            first.sort_by_key(|p| p.to_string());
            second.sort_by_key(|p| p.to_string());
            proptest::prop_assert_eq!(first, second);
        }
    }
}
