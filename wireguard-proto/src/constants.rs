/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * Protocol constants from spec.md §4.7. These are contractual values, not
 * tunables -- do not change them.
 */

/// Initiator-side rekey trigger on send counter.
pub const REKEY_AFTER_MESSAGES: u64 = 1 << 60;

/// Absolute counter ceiling; nonces at or above this are rejected.
pub const REJECT_AFTER_MESSAGES: u64 = u64::MAX - (1 << 13);

/// Initiator-side rekey trigger on keypair age, in milliseconds.
pub const REKEY_AFTER_TIME_MS: i64 = 120_000;

/// Hard keypair expiry, in milliseconds.
pub const REJECT_AFTER_TIME_MS: i64 = 180_000;

/// Give-up window for handshake retries, in milliseconds.
pub const REKEY_ATTEMPT_TIME_MS: i64 = 90_000;

/// Base handshake retransmit interval, in milliseconds.
pub const REKEY_TIMEOUT_MS: i64 = 5_000;

/// After an authenticated receive with no send, send an empty keepalive.
pub const KEEPALIVE_TIMEOUT_MS: i64 = 10_000;

/// Minimum time between accepted initiations from the same peer, in milliseconds.
pub const HANDSHAKE_INITIATION_RATE_MS: i64 = 50;

/// Latch time for the under-load flag, in milliseconds.
pub const UNDER_LOAD_AFTER_TIME_MS: i64 = 1_000;

/// Cookie secret rotation interval, in milliseconds.
pub const COOKIE_REFRESH_TIME_MS: i64 = 120_000;

/// Transport padding quantum, in bytes.
pub const PADDING_MULTIPLE: usize = 16;

/// Default capacity of the handshake queue (tunable, see spec.md §9 design notes).
pub const DEFAULT_HANDSHAKE_QUEUE_CAPACITY: usize = 256;

/// Token-bucket rate per source IP, packets/second.
pub const RATE_LIMITER_PACKETS_PER_SECOND: u32 = 20;

/// Token-bucket burst allowance per source IP.
pub const RATE_LIMITER_BURST: u32 = 5;

/// Rate limiter per-entry GC lifetime, in milliseconds.
pub const RATE_LIMITER_ENTRY_LIFETIME_MS: i64 = 1_000;
