//! Reserved line contents and the relay's line formats.

/// Hands the turn to the other side (two-party mode only).
pub const TURN_MARKER: &str = "#";

/// Requests the end of a session.
pub const EXIT: &str = "Exit";

/// Longest line, in bytes, a connection will accept before giving up on it.
pub const MAX_LINE_LEN: usize = 65_536;

/// Display name used for operator announcements from the relay itself.
pub const SERVER_NAME: &str = "Server";

/// A received line classified by protocol meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame<'a> {
    TurnHandoff,
    Exit,
    Text(&'a str),
}

impl<'a> Frame<'a> {
    /// Exact, case-sensitive classification with no trimming.
    pub fn parse(line: &'a str) -> Self {
        match line {
            TURN_MARKER => Frame::TurnHandoff,
            EXIT => Frame::Exit,
            text => Frame::Text(text),
        }
    }

    /// The line content as it appeared on the wire.
    pub fn as_str(self) -> &'a str {
        match self {
            Frame::TurnHandoff => TURN_MARKER,
            Frame::Exit => EXIT,
            Frame::Text(text) => text,
        }
    }

    /// Relay-side classification: surrounding whitespace is dropped and the
    /// turn marker carries no meaning. Returns `None` for blank lines.
    pub fn parse_relay(line: &'a str) -> Option<Self> {
        match line.trim() {
            "" => None,
            EXIT => Some(Frame::Exit),
            text => Some(Frame::Text(text)),
        }
    }
}

/// Default display name for a relay client.
pub fn display_name(id: u64) -> String {
    format!("User{id}")
}

pub fn welcome_line(name: &str) -> String {
    format!("Welcome! You are connected as {name}")
}

/// `[<name>] <text>`, the framing of every relayed message.
pub fn broadcast_line(name: &str, text: &str) -> String {
    format!("[{name}] {text}")
}
