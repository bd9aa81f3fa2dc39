/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * The line-oriented `get=1`/`set=1` configuration protocol of spec.md §4.8:
 * request parsing (`message`), applying a parsed request to a live `Device`
 * (`apply`), and rendering a `get` reply (`response`). Transport-agnostic —
 * callers own the Unix socket or other channel this text travels over.
 */

pub mod apply;
pub mod error;
pub mod message;
pub mod response;

pub use apply::apply_set;
pub use error::ConfigError;
pub use message::{parse_request, AllowedIpOp, PeerConfig, Request, SetRequest};
pub use response::{render_errno, render_get};
