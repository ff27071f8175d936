//! Minimal chat fabric over TCP.
//!
//! Two ways to talk, sharing one line protocol (UTF-8, `\n`-terminated,
//! at most 65,536 bytes per line):
//!
//! - **Two-party mode**: a listener and a connector take turns. The holder of
//!   the turn sends lines until it sends `#`; either side ends the session
//!   with `Exit`, which the other side echoes before both close.
//! - **Relay mode**: a server accepts any number of clients and fans every
//!   line out to all of them as `[<name>] <text>`. `Exit` gets an `Exit`
//!   back and the client is evicted.
//!
//! Modules:
//!
//! - [`protocol`] defines the sentinels, the line bound and relay formats.
//! - [`transport`] frames lines over any async byte stream.
//! - [`turn`] is the two-party state machine.
//! - [`registry`] tracks relay clients and their identities.
//! - [`relay`] accepts clients and runs the single-threaded dispatcher.
//! - [`peer`], [`client`] and [`operator`] are the terminal front-ends used by
//!   the binary; [`cli`] parses its arguments.
//!
//! The core modules never touch a terminal: presentation subscribes to
//! [`turn::SessionEvent`] and [`relay::RelayNotice`] streams.

pub mod cli;
pub mod client;
pub mod console;
pub mod error;
pub mod operator;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod transport;
pub mod turn;
