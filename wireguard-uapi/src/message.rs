/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * Parses the `get=1`/`set=1` request bodies of spec.md §4.8. Grounded on
 * `controller/src/handler.rs`'s cursor idiom (`payload.read_u64(&mut
 * cursor)`, failing the whole parse the instant one field is malformed)
 * carried over to a line cursor instead of a byte cursor, since this wire
 * format is text lines rather than packed binary fields.
 */

use std::net::IpAddr;

use crate::error::ConfigError;

/// One `allowed_ip=<cidr>` or `allowed_ip=-<cidr>` entry from a peer block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedIpOp {
    Add(IpAddr, u8),
    Remove(IpAddr, u8),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerConfig {
    pub public_key: [u8; 32],
    pub remove: bool,
    pub update_only: bool,
    pub preshared_key: Option<[u8; 32]>,
    pub endpoint: Option<String>,
    pub persistent_keepalive_interval: Option<u16>,
    pub replace_allowed_ips: bool,
    pub allowed_ips: Vec<AllowedIpOp>,
    pub protocol_version: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetRequest {
    pub private_key: Option<Option<[u8; 32]>>,
    pub listen_port: Option<u16>,
    pub fwmark: Option<u32>,
    pub replace_peers: bool,
    pub peers: Vec<PeerConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Get,
    Set(SetRequest),
}

/// Parse one full request (the `get=1`/`set=1` header line through the
/// blank-line terminator; the terminator itself need not be present in
/// `body` since callers typically split transport frames on it already).
pub fn parse_request(body: &str) -> Result<Request, ConfigError> {
    let mut lines = body.lines().filter(|l| !l.is_empty());
    match lines.next() {
        Some("get=1") => Ok(Request::Get),
        Some("set=1") => Ok(Request::Set(parse_set_lines(lines)?)),
        Some(other) => Err(ConfigError::InvalidValue(format!("unrecognized request header {other:?}"))),
        None => Err(ConfigError::InvalidValue("empty request".into())),
    }
}

fn parse_set_lines<'a>(lines: impl Iterator<Item = &'a str>) -> Result<SetRequest, ConfigError> {
    let mut req = SetRequest::default();
    let mut current: Option<PeerConfig> = None;

    for line in lines {
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| ConfigError::InvalidValue(format!("line missing '=': {line:?}")))?;

        if key == "public_key" {
            if let Some(peer) = current.take() {
                req.peers.push(peer);
            }
            current = Some(PeerConfig { public_key: parse_key(value)?, ..Default::default() });
            continue;
        }

        match &mut current {
            Some(peer) => apply_peer_key(peer, key, value)?,
            None => apply_device_key(&mut req, key, value)?,
        }
    }
    if let Some(peer) = current.take() {
        req.peers.push(peer);
    }
    Ok(req)
}

fn apply_device_key(req: &mut SetRequest, key: &str, value: &str) -> Result<(), ConfigError> {
    match key {
        "private_key" => {
            req.private_key = Some(if value.is_empty() { None } else { Some(parse_key(value)?) });
        }
        "listen_port" => {
            req.listen_port = Some(parse_u16(value)?);
        }
        "fwmark" => {
            req.fwmark = Some(parse_u32(value)?);
        }
        "replace_peers" => {
            req.replace_peers = parse_bool(value)?;
        }
        other => return Err(ConfigError::UnknownKey(other.to_string())),
    }
    Ok(())
}

fn apply_peer_key(peer: &mut PeerConfig, key: &str, value: &str) -> Result<(), ConfigError> {
    match key {
        "update_only" => peer.update_only = parse_bool(value)?,
        "remove" => peer.remove = parse_bool(value)?,
        "preshared_key" => {
            peer.preshared_key = Some(if value.chars().all(|c| c == '0') && value.len() == 64 {
                [0u8; 32]
            } else {
                parse_key(value)?
            });
        }
        "endpoint" => peer.endpoint = Some(value.to_string()),
        "persistent_keepalive_interval" => peer.persistent_keepalive_interval = Some(parse_u16(value)?),
        "replace_allowed_ips" => peer.replace_allowed_ips = parse_bool(value)?,
        "allowed_ip" => peer.allowed_ips.push(parse_allowed_ip(value)?),
        "protocol_version" => peer.protocol_version = Some(parse_u32(value)?),
        other => return Err(ConfigError::UnknownKey(other.to_string())),
    }
    Ok(())
}

fn parse_allowed_ip(value: &str) -> Result<AllowedIpOp, ConfigError> {
    let (remove, cidr) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value),
    };
    let (addr, len) = cidr
        .split_once('/')
        .ok_or_else(|| ConfigError::InvalidValue(format!("allowed_ip missing prefix length: {value:?}")))?;
    let addr: IpAddr = addr.parse().map_err(|_| ConfigError::InvalidValue(format!("bad address: {addr:?}")))?;
    let len: u8 = len.parse().map_err(|_| ConfigError::InvalidValue(format!("bad prefix length: {len:?}")))?;
    Ok(if remove { AllowedIpOp::Remove(addr, len) } else { AllowedIpOp::Add(addr, len) })
}

fn parse_key(value: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = hex::decode(value).map_err(|_| ConfigError::InvalidValue(format!("bad hex key: {value:?}")))?;
    bytes.try_into().map_err(|_| ConfigError::InvalidValue(format!("key is not 32 bytes: {value:?}")))
}

fn parse_bool(value: &str) -> Result<bool, ConfigError> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(ConfigError::InvalidValue(format!("not a bool: {other:?}"))),
    }
}

fn parse_u16(value: &str) -> Result<u16, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue(format!("not a u16: {value:?}")))
}

fn parse_u32(value: &str) -> Result<u32, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue(format!("not a u32: {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_get_request() {
        assert_eq!(parse_request("get=1\n\n").unwrap(), Request::Get);
    }

    #[test]
    fn parses_device_only_set_request() {
        let req = parse_request("set=1\nlisten_port=51820\nfwmark=42\n\n").unwrap();
        match req {
            Request::Set(s) => {
                assert_eq!(s.listen_port, Some(51820));
                assert_eq!(s.fwmark, Some(42));
                assert!(s.peers.is_empty());
            }
            _ => panic!("expected Set"),
        }
    }

    #[test]
    fn groups_peer_scoped_keys_into_blocks() {
        let pk = hex::encode([0x11u8; 32]);
        let body = format!(
            "set=1\npublic_key={pk}\nendpoint=10.0.0.1:51820\nallowed_ip=10.0.0.0/24\nallowed_ip=-10.0.0.5/32\n\n"
        );
        let req = parse_request(&body).unwrap();
        match req {
            Request::Set(s) => {
                assert_eq!(s.peers.len(), 1);
                let peer = &s.peers[0];
                assert_eq!(peer.public_key, [0x11u8; 32]);
                assert_eq!(peer.endpoint.as_deref(), Some("10.0.0.1:51820"));
                assert_eq!(peer.allowed_ips.len(), 2);
            }
            _ => panic!("expected Set"),
        }
    }

    #[test]
    fn rejects_unknown_device_key() {
        assert!(matches!(parse_request("set=1\nbogus=1\n\n"), Err(ConfigError::UnknownKey(_))));
    }

    #[test]
    fn rejects_line_without_equals() {
        assert!(matches!(parse_request("set=1\nnotakeyvalue\n\n"), Err(ConfigError::InvalidValue(_))));
    }
}
