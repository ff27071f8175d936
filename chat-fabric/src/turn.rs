//! Alternating-turn protocol for two peers.
//!
//! Exactly one side holds the turn. The holder sends operator lines until it
//! sends `#`, which hands the turn over. Either side may send `Exit`; the
//! other side answers with its own `Exit` and both close.

use std::fmt;

use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite},
    sync::mpsc,
};
use tracing::{debug, info, warn};

use crate::{
    error::TransportError,
    protocol::{EXIT, Frame, TURN_MARKER},
    transport::Connection,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Turn {
    Sending,
    Receiving,
    Done,
}

/// Which end of the pair this process is. The connecting peer talks first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Listener,
    Connector,
}

impl Role {
    pub fn initial_turn(self) -> Turn {
        match self {
            Role::Listener => Turn::Receiving,
            Role::Connector => Turn::Sending,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Listener => f.write_str("listener"),
            Role::Connector => f.write_str("connector"),
        }
    }
}

/// What happened during a session, for whoever is presenting it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Started(Turn),
    PeerLine(String),
    /// The peer sent `#`; it is now our turn.
    TurnReceived,
    /// We sent `#`; it is now the peer's turn.
    TurnPassed,
    PeerExit,
    LocalExit,
    SendFailed(String),
    ConnectionLost(String),
    Finished,
}

pub struct TurnSession<R, W> {
    connection: Connection<R, W>,
    role: Role,
    turn: Turn,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl<R, W> TurnSession<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(
        connection: Connection<R, W>,
        role: Role,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            connection,
            role,
            turn: role.initial_turn(),
            events,
        }
    }

    pub fn turn(&self) -> Turn {
        self.turn
    }

    /// Drives the session until it is done, then closes the connection.
    /// `input` supplies the local operator's lines.
    pub async fn run<I>(mut self, input: &mut I)
    where
        I: AsyncBufRead + Unpin,
    {
        info!(role = %self.role, turn = ?self.turn, "session started");
        self.emit(SessionEvent::Started(self.turn));

        while self.turn != Turn::Done {
            self.step(input).await;
        }

        self.connection.shutdown().await;
        info!(role = %self.role, "session ended");
        self.emit(SessionEvent::Finished);
    }

    /// Performs a single transition and returns the resulting state.
    pub async fn step<I>(&mut self, input: &mut I) -> Turn
    where
        I: AsyncBufRead + Unpin,
    {
        self.turn = match self.turn {
            Turn::Receiving => self.receive().await,
            Turn::Sending => self.send(input).await,
            Turn::Done => Turn::Done,
        };
        self.turn
    }

    async fn receive(&mut self) -> Turn {
        let line = match self.connection.recv_line().await {
            Ok(line) => line,
            Err(error) => {
                self.lost(&error);
                return Turn::Done;
            }
        };

        match Frame::parse(&line) {
            Frame::Exit => {
                self.emit(SessionEvent::PeerExit);
                if let Err(error) = self.connection.send_line(EXIT).await {
                    debug!(?error, "failed to answer peer exit");
                }
                Turn::Done
            }
            Frame::TurnHandoff => {
                self.emit(SessionEvent::TurnReceived);
                Turn::Sending
            }
            Frame::Text(text) => {
                self.emit(SessionEvent::PeerLine(text.to_string()));
                Turn::Receiving
            }
        }
    }

    async fn send<I>(&mut self, input: &mut I) -> Turn
    where
        I: AsyncBufRead + Unpin,
    {
        // Running out of local input is the operator saying goodbye.
        let Some(line) = read_operator_line(input).await else {
            self.emit(SessionEvent::LocalExit);
            if let Err(error) = self.connection.send_line(EXIT).await {
                debug!(?error, "failed to send exit after end of input");
            }
            return Turn::Done;
        };

        match Frame::parse(&line) {
            Frame::Exit => {
                self.emit(SessionEvent::LocalExit);
                if let Err(error) = self.connection.send_line(EXIT).await {
                    debug!(?error, "failed to send exit");
                    return Turn::Done;
                }
                self.await_exit_echo().await;
                Turn::Done
            }
            Frame::TurnHandoff => match self.connection.send_line(TURN_MARKER).await {
                Ok(()) => {
                    self.emit(SessionEvent::TurnPassed);
                    Turn::Receiving
                }
                Err(error) => self.send_failed(&error),
            },
            Frame::Text(text) => match self.connection.send_line(text).await {
                Ok(()) => Turn::Sending,
                Err(error) => self.send_failed(&error),
            },
        }
    }

    /// Best effort: the peer may just as well hang up without answering.
    async fn await_exit_echo(&mut self) {
        match self.connection.recv_line().await {
            Ok(line) if line == EXIT => self.emit(SessionEvent::PeerExit),
            Ok(line) => debug!(line, "expected exit echo"),
            Err(error) => debug!(%error, "no exit echo from peer"),
        }
    }

    fn send_failed(&mut self, error: &TransportError) -> Turn {
        warn!(%error, "send failed");
        self.emit(SessionEvent::SendFailed(error.to_string()));
        Turn::Done
    }

    fn lost(&mut self, error: &TransportError) {
        if error.is_disconnect() {
            info!(%error, "peer went away");
        } else {
            warn!(%error, "closing connection");
        }
        self.emit(SessionEvent::ConnectionLost(error.to_string()));
    }

    fn emit(&self, event: SessionEvent) {
        // Nobody listening is fine; the protocol carries on regardless.
        let _ = self.events.send(event);
    }
}

/// Next operator line without its line ending, or `None` once input is
/// exhausted or unreadable.
async fn read_operator_line<I>(input: &mut I) -> Option<String>
where
    I: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        match input.read_line(&mut line).await {
            Ok(0) => return None,
            Ok(_) => break,
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(error) => {
                warn!(?error, "failed to read local input");
                return None;
            }
        }
    }

    if line.ends_with('\n') {
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
    }
    Some(line)
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf, duplex, split};

    use super::*;
    use crate::protocol::MAX_LINE_LEN;

    type Session = TurnSession<BufReader<ReadHalf<DuplexStream>>, WriteHalf<DuplexStream>>;

    fn pair() -> (
        (Session, mpsc::UnboundedReceiver<SessionEvent>),
        (Session, mpsc::UnboundedReceiver<SessionEvent>),
    ) {
        let (a, b) = duplex(4096);
        (session(a, Role::Connector), session(b, Role::Listener))
    }

    fn session(
        stream: DuplexStream,
        role: Role,
    ) -> (Session, mpsc::UnboundedReceiver<SessionEvent>) {
        let (reader, writer) = split(stream);
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Connection::new(BufReader::new(reader), writer);
        (TurnSession::new(connection, role, tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn complementary(a: Turn, b: Turn) -> bool {
        matches!(
            (a, b),
            (Turn::Sending, Turn::Receiving) | (Turn::Receiving, Turn::Sending)
        )
    }

    #[test]
    fn connector_talks_first() {
        assert_eq!(Role::Connector.initial_turn(), Turn::Sending);
        assert_eq!(Role::Listener.initial_turn(), Turn::Receiving);
    }

    #[tokio::test]
    async fn turns_stay_complementary_across_handoffs() {
        let ((mut connector, _), (mut listener, mut listener_events)) = pair();
        let mut connector_input = &b"one\n#\nthree\n#\n"[..];
        let mut listener_input = &b"two\n#\n"[..];
        assert!(complementary(connector.turn(), listener.turn()));

        // connector: "one", listener sees it
        assert_eq!(connector.step(&mut connector_input).await, Turn::Sending);
        assert_eq!(listener.step(&mut listener_input).await, Turn::Receiving);
        // connector hands over
        assert_eq!(connector.step(&mut connector_input).await, Turn::Receiving);
        assert_eq!(listener.step(&mut listener_input).await, Turn::Sending);
        assert!(complementary(connector.turn(), listener.turn()));

        // listener: "two", then hands back
        assert_eq!(listener.step(&mut listener_input).await, Turn::Sending);
        assert_eq!(connector.step(&mut connector_input).await, Turn::Receiving);
        assert_eq!(listener.step(&mut listener_input).await, Turn::Receiving);
        assert_eq!(connector.step(&mut connector_input).await, Turn::Sending);
        assert!(complementary(connector.turn(), listener.turn()));

        assert_eq!(
            drain(&mut listener_events),
            vec![
                SessionEvent::PeerLine("one".into()),
                SessionEvent::TurnReceived,
                SessionEvent::TurnPassed,
            ]
        );
    }

    #[tokio::test]
    async fn exit_is_answered_exactly_once() {
        let (a, b) = duplex(4096);
        let (mut receiver, _) = session(a, Role::Listener);
        let (b_reader, b_writer) = split(b);
        let mut raw_peer = Connection::new(BufReader::new(b_reader), b_writer);

        raw_peer.send_line("Exit").await.expect("send exit");
        let mut no_input = &b""[..];
        assert_eq!(receiver.step(&mut no_input).await, Turn::Done);
        receiver.connection.shutdown().await;

        assert_eq!(raw_peer.recv_line().await.expect("echo"), "Exit");
        assert!(matches!(
            raw_peer.recv_line().await,
            Err(TransportError::PeerClosed)
        ));
    }

    #[tokio::test]
    async fn end_of_local_input_sends_exit() {
        let (a, b) = duplex(4096);
        let (mut sender, mut events) = session(a, Role::Connector);
        let (b_reader, b_writer) = split(b);
        let mut raw_peer = Connection::new(BufReader::new(b_reader), b_writer);

        let mut input = &b"last words\n"[..];
        assert_eq!(sender.step(&mut input).await, Turn::Sending);
        assert_eq!(sender.step(&mut input).await, Turn::Done);

        assert_eq!(raw_peer.recv_line().await.expect("line"), "last words");
        assert_eq!(raw_peer.recv_line().await.expect("exit"), "Exit");
        assert_eq!(drain(&mut events), vec![SessionEvent::LocalExit]);
    }

    #[tokio::test]
    async fn peer_hangup_ends_the_session() {
        let (a, b) = duplex(4096);
        let (mut receiver, mut events) = session(a, Role::Listener);
        drop(b);

        let mut no_input = &b""[..];
        assert_eq!(receiver.step(&mut no_input).await, Turn::Done);
        assert!(matches!(
            drain(&mut events).as_slice(),
            [SessionEvent::ConnectionLost(_)]
        ));
        // Done is terminal.
        assert_eq!(receiver.step(&mut no_input).await, Turn::Done);
    }

    #[tokio::test]
    async fn oversized_peer_line_ends_the_session() {
        let (a, b) = duplex(4096);
        let (mut receiver, mut events) = session(a, Role::Listener);
        let (_b_reader, mut b_writer) = split(b);

        let flood = tokio::spawn(async move {
            let payload = vec![b'x'; MAX_LINE_LEN + 1];
            let _ = b_writer.write_all(&payload).await;
            b_writer
        });

        let mut no_input = &b""[..];
        assert_eq!(receiver.step(&mut no_input).await, Turn::Done);
        let _b_writer = flood.await.expect("flood task");

        let events = drain(&mut events);
        assert!(
            matches!(events.as_slice(), [SessionEvent::ConnectionLost(reason)] if reason.contains("65536")),
            "got {events:?}"
        );
    }

    #[tokio::test]
    async fn operator_lines_are_sent_verbatim() {
        let (a, b) = duplex(4096);
        let (mut sender, _) = session(a, Role::Connector);
        let (b_reader, b_writer) = split(b);
        let mut raw_peer = Connection::new(BufReader::new(b_reader), b_writer);

        let mut input = &b"  spaced  \r\n exit\n"[..];
        sender.step(&mut input).await;
        sender.step(&mut input).await;

        assert_eq!(raw_peer.recv_line().await.expect("line"), "  spaced  ");
        assert_eq!(raw_peer.recv_line().await.expect("line"), " exit");
        assert_eq!(sender.turn(), Turn::Sending);
    }

    #[tokio::test]
    async fn full_conversation() {
        let ((connector, mut connector_events), (listener, mut listener_events)) = pair();
        let mut connector_input = &b"hello\n#\nExit\n"[..];
        let mut listener_input = &b"hi back\n#\n"[..];

        tokio::join!(
            connector.run(&mut connector_input),
            listener.run(&mut listener_input),
        );

        assert_eq!(
            drain(&mut connector_events),
            vec![
                SessionEvent::Started(Turn::Sending),
                SessionEvent::TurnPassed,
                SessionEvent::PeerLine("hi back".into()),
                SessionEvent::TurnReceived,
                SessionEvent::LocalExit,
                SessionEvent::PeerExit,
                SessionEvent::Finished,
            ]
        );
        assert_eq!(
            drain(&mut listener_events),
            vec![
                SessionEvent::Started(Turn::Receiving),
                SessionEvent::PeerLine("hello".into()),
                SessionEvent::TurnReceived,
                SessionEvent::TurnPassed,
                SessionEvent::PeerExit,
                SessionEvent::Finished,
            ]
        );
    }
}
