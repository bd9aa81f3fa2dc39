/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * Serves spec.md §4.8's `get=1`/`set=1` protocol over a Unix domain socket.
 * Grounded on `zerotier-system-service`'s local-API socket pattern (one
 * task accepting connections, each connection handled on its own spawned
 * task) referenced from `main.rs`'s `localsocket` module; that file's body
 * was not retrieved in the pack, so the accept-loop/per-connection-task
 * shape is rebuilt fresh from the call-site contract and from
 * `wireguard-uapi`'s own transport-agnostic request/response API.
 */

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

use wireguard_proto::Device;
use wireguard_uapi::{apply_set, parse_request, render_errno, render_get, Request};

/// Bind `path` (removing a stale socket file left by a previous run) and
/// serve the `get=1`/`set=1` protocol against `device` until the returned
/// task is aborted.
pub fn serve(path: PathBuf, device: Arc<Device>) -> std::io::Result<tokio::task::JoinHandle<()>> {
    if path.exists() {
        std::fs::remove_file(&path)?;
    }
    let listener = UnixListener::bind(&path)?;
    Ok(tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let device = device.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, &device).await {
                            tracing::debug!(?err, "uapi connection ended");
                        }
                    });
                }
                Err(err) => {
                    tracing::warn!(?err, "uapi accept failed");
                }
            }
        }
    }))
}

/// A connection may carry several pipelined requests; each is framed by a
/// blank line (`\n\n`), per spec.md §4.8.
async fn handle_connection(mut stream: UnixStream, device: &Arc<Device>) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        while let Some(pos) = find_double_newline(&buf) {
            let body = buf.drain(..pos + 2).collect::<Vec<u8>>();
            let body = String::from_utf8_lossy(&body);
            let reply = handle_request(device, &body);
            stream.write_all(reply.as_bytes()).await?;
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn handle_request(device: &Device, body: &str) -> String {
    match parse_request(body) {
        Ok(Request::Get) => {
            let mut reply = render_get(device);
            reply.push_str("errno=0\n\n");
            reply
        }
        Ok(Request::Set(req)) => {
            let result = apply_set(device, &req);
            render_errno(&result)
        }
        Err(err) => render_errno(&Err(err)),
    }
}

fn find_double_newline(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

/// The conventional per-interface control socket path, mirroring the real
/// WireGuard UAPI's `/var/run/wireguard/<iface>.sock` convention.
pub fn default_socket_path(base: &Path, interface: &str) -> PathBuf {
    base.join(format!("{interface}.sock"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wireguard_crypto::dh::KeyPair;

    #[test]
    fn handles_get_request() {
        let device = Device::new(KeyPair::generate());
        let reply = handle_request(&device, "get=1\n\n");
        assert!(reply.starts_with("private_key="));
        assert!(reply.ends_with("errno=0\n\n"));
    }

    #[test]
    fn handles_set_request_and_reports_errno() {
        let device = Device::new(KeyPair::generate());
        let reply = handle_request(&device, "set=1\nlisten_port=51820\n\n");
        assert_eq!(reply, "errno=0\n\n");
        assert_eq!(*device.listen_port.read(), 51820);
    }

    #[test]
    fn malformed_request_reports_nonzero_errno() {
        let device = Device::new(KeyPair::generate());
        let reply = handle_request(&device, "bogus=1\n\n");
        assert!(reply.starts_with("errno="));
        assert_ne!(reply, "errno=0\n\n");
    }

    #[test]
    fn double_newline_framing_is_found_at_the_right_offset() {
        let buf = b"get=1\n\nset=1\nfwmark=1\n\n".to_vec();
        let pos = find_double_newline(&buf).unwrap();
        assert_eq!(&buf[..pos], b"get=1");
    }
}
