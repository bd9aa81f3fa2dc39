/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * Process exit codes, named the way `main.rs`'s subcommand dispatch refers
 * to them (`exitcode::OK`, `exitcode::ERR_USAGE`, ...). No single source
 * file in the pack carries this module verbatim; the constants follow the
 * BSD sysexits.h values the rest of the Unix toolchain already expects.
 */

pub const OK: i32 = 0;
pub const ERR_USAGE: i32 = 64;
pub const ERR_IOERR: i32 = 74;
