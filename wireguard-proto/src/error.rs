/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use thiserror::Error;

/// Errors surfaced by the handshake and transport state machines. Per
/// spec.md §7, authentication failures and malformed packets are silent
/// protocol violations to the network but are still reported up to callers
/// as typed errors so the runtime can log/count them.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("message too short or wrong type")]
    Malformed,
    #[error("mac1 did not verify")]
    BadMac1,
    #[error("mac2 required: peer is under load")]
    CookieRequired,
    #[error("mac2 did not verify")]
    BadMac2,
    #[error("aead authentication failed")]
    AuthenticationFailed,
    #[error("unknown receiver index")]
    UnknownIndex,
    #[error("handshake state machine received a message out of order")]
    OutOfOrder,
    #[error("replayed or too-old timestamp")]
    StaleTimestamp,
    #[error("initiation arrived faster than HANDSHAKE_INITIATION_RATE since the last one from this peer")]
    InitiationFlood,
    #[error("counter already seen or window exceeded")]
    Replayed,
    #[error("keypair has exceeded its message or time limit and must be rekeyed")]
    KeypairExpired,
    #[error("no valid keypair to encrypt with")]
    NoSession,
    #[error("static-static DH agreement with this peer yields an all-zero result")]
    DegenerateDh,
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
