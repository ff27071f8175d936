//! One-to-many broadcast relay.
//!
//! A single dispatcher owns the [`ClientRegistry`] and handles one
//! [`RelayEvent`] at a time, so registration, fan-out and eviction never
//! overlap and need no locking. Each accepted socket gets two helper tasks:
//!
//! - a reader that frames inbound lines into [`RelayEvent::Line`] and reports
//!   the end of the stream as [`RelayEvent::Closed`];
//! - a writer that drains the client's [`ClientOutbox`], so a slow client only
//!   ever delays itself. The outbox is bounded; a client that lets it fill up
//!   is evicted like any other failed delivery.
//!
//! [`RelayState`] is the dispatcher proper and is generic over [`Outbox`],
//! which keeps it usable without any sockets.

use std::{future::Future, io, net::SocketAddr};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::{
        broadcast,
        mpsc::{self, error::TrySendError},
    },
    task::AbortHandle,
};
use tracing::{debug, info, warn};

use crate::{
    error::TransportError,
    protocol::{EXIT, Frame, MAX_LINE_LEN, SERVER_NAME, broadcast_line, welcome_line},
    registry::{ClientId, ClientRegistry, ConnectionId},
    transport::{read_line, write_line},
};

// Readers wait once this many events are queued for the dispatcher.
const EVENT_QUEUE_DEPTH: usize = 256;
const NOTICE_BUFFER: usize = 128;
// Lines queued for one client before it counts as stalled and is dropped.
const OUTBOX_DEPTH: usize = 256;

/// Whether a client's own messages are echoed back to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EchoPolicy {
    #[default]
    IncludeSender,
    ExcludeSender,
}

#[derive(Debug, Clone, Default)]
pub struct RelayConfig {
    pub echo: EchoPolicy,
}

#[derive(Debug)]
pub enum RelayEvent {
    Line {
        connection: ConnectionId,
        line: String,
    },
    Closed {
        connection: ConnectionId,
        reason: TransportError,
    },
    /// Operator text to broadcast under the server's name.
    Announce(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Departure {
    /// The client sent `Exit`.
    Requested,
    /// The connection failed or was closed by the peer.
    Lost(String),
    Shutdown,
}

/// Things presentation layers may want to show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayNotice {
    ClientJoined {
        id: ClientId,
        name: String,
        peer: SocketAddr,
    },
    ClientLeft {
        id: ClientId,
        name: String,
        departure: Departure,
    },
    Message {
        from: String,
        text: String,
    },
}

/// Outbound side of one client as seen by the dispatcher.
pub trait Outbox {
    /// Queues a line for the client. An error means the client is gone.
    fn deliver(&self, line: &str) -> Result<(), TransportError>;

    /// Stops reading from the client. Queued lines are still flushed.
    fn close(&self);

    /// Tears the client down without flushing anything still queued.
    fn abort(&self) {
        self.close();
    }
}

pub struct ClientOutbox {
    lines: mpsc::Sender<String>,
    reader: AbortHandle,
    writer: AbortHandle,
}

impl Outbox for ClientOutbox {
    fn deliver(&self, line: &str) -> Result<(), TransportError> {
        self.lines.try_send(line.to_string()).map_err(|error| {
            let (kind, message) = match error {
                TrySendError::Full(_) => (io::ErrorKind::WouldBlock, "client is not reading"),
                TrySendError::Closed(_) => (io::ErrorKind::BrokenPipe, "client writer has stopped"),
            };
            TransportError::WriteFailed(io::Error::new(kind, message))
        })
    }

    fn close(&self) {
        self.reader.abort();
    }

    fn abort(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

pub struct RelayState<C> {
    registry: ClientRegistry<C>,
    config: RelayConfig,
    notices: broadcast::Sender<RelayNotice>,
}

impl<C: Outbox> RelayState<C> {
    pub fn new(config: RelayConfig) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_BUFFER);
        Self {
            registry: ClientRegistry::new(),
            config,
            notices,
        }
    }

    pub fn registry(&self) -> &ClientRegistry<C> {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayNotice> {
        self.notices.subscribe()
    }

    /// Registers a freshly accepted client and greets it.
    pub fn admit(&mut self, connection: ConnectionId, handle: C, peer: SocketAddr) -> ClientId {
        let (id, name, welcomed) = {
            let record = self.registry.register(connection, handle, peer);
            let welcomed = record.handle.deliver(&welcome_line(&record.name));
            (record.id, record.name.clone(), welcomed)
        };

        info!(%connection, %peer, name = %name, clients = self.registry.len(), "client connected");
        self.notify(RelayNotice::ClientJoined { id, name, peer });

        if let Err(error) = welcomed {
            self.evict(connection, Departure::Lost(error.to_string()));
        }
        id
    }

    pub fn dispatch(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Line { connection, line } => self.handle_line(connection, &line),
            RelayEvent::Closed { connection, reason } => self.handle_closed(connection, reason),
            RelayEvent::Announce(text) => self.announce(&text),
        }
    }

    pub fn handle_line(&mut self, connection: ConnectionId, line: &str) {
        let Some(record) = self.registry.lookup(connection) else {
            debug!(%connection, "dropping line from unregistered connection");
            return;
        };

        match Frame::parse_relay(line) {
            None => {}
            Some(Frame::Exit) => {
                if let Err(error) = record.handle.deliver(EXIT) {
                    debug!(%connection, %error, "could not answer exit");
                }
                self.evict(connection, Departure::Requested);
            }
            Some(frame) => {
                let name = record.name.clone();
                let text = frame.as_str();
                debug!(from = %name, text, "relaying message");
                self.notify(RelayNotice::Message {
                    from: name.clone(),
                    text: text.to_string(),
                });
                self.broadcast(Some(connection), &broadcast_line(&name, text));
            }
        }
    }

    /// The connection is already unusable, so the client is dropped without
    /// a reply.
    pub fn handle_closed(&mut self, connection: ConnectionId, reason: TransportError) {
        if reason.is_disconnect() {
            debug!(%connection, %reason, "connection closed");
        } else {
            warn!(%connection, %reason, "dropping client");
        }
        self.evict(connection, Departure::Lost(reason.to_string()));
    }

    /// Broadcasts `[Server] <text>` to every client. Multi-line text goes
    /// out as one framed message per non-blank line.
    pub fn announce(&mut self, text: &str) {
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if self.registry.is_empty() {
                info!("no clients connected to send message to");
                return;
            }

            self.notify(RelayNotice::Message {
                from: SERVER_NAME.to_string(),
                text: line.to_string(),
            });
            self.broadcast(None, &broadcast_line(SERVER_NAME, line));
        }
    }

    pub fn shutdown(&mut self) {
        info!(clients = self.registry.len(), "relay shutting down");
        for connection in self.registry.connections() {
            self.evict(connection, Departure::Shutdown);
        }
    }

    /// Best-effort fan-out. Clients that can't take the line are evicted once
    /// everyone else has been served.
    fn broadcast(&mut self, sender: Option<ConnectionId>, line: &str) {
        let skip = match self.config.echo {
            EchoPolicy::IncludeSender => None,
            EchoPolicy::ExcludeSender => sender,
        };

        let mut unreachable = Vec::new();
        for record in self.registry.all() {
            if Some(record.connection) == skip {
                continue;
            }
            if let Err(error) = record.handle.deliver(line) {
                warn!(connection = %record.connection, name = %record.name, %error, "delivery failed");
                unreachable.push((record.connection, error.to_string()));
            }
        }

        for (connection, reason) in unreachable {
            self.evict(connection, Departure::Lost(reason));
        }
    }

    fn evict(&mut self, connection: ConnectionId, departure: Departure) {
        let Some(record) = self.registry.unregister(connection) else {
            return;
        };
        match departure {
            // A lost client may be stuck in a write that will never finish.
            Departure::Lost(_) => record.handle.abort(),
            Departure::Requested | Departure::Shutdown => record.handle.close(),
        }

        info!(
            %connection,
            name = %record.name,
            ?departure,
            clients = self.registry.len(),
            "client disconnected"
        );
        self.notify(RelayNotice::ClientLeft {
            id: record.id,
            name: record.name,
            departure,
        });
    }

    fn notify(&self, notice: RelayNotice) {
        // No subscribers is the common case outside the CLI.
        let _ = self.notices.send(notice);
    }
}

/// Feeds operator input into a running relay.
#[derive(Clone)]
pub struct RelayHandle {
    events: mpsc::Sender<RelayEvent>,
}

impl RelayHandle {
    pub async fn announce(&self, text: impl Into<String>) -> Result<()> {
        self.events
            .send(RelayEvent::Announce(text.into()))
            .await
            .context("relay is no longer running")
    }
}

pub struct Relay {
    listener: TcpListener,
    state: RelayState<ClientOutbox>,
    events: mpsc::Sender<RelayEvent>,
    inbox: mpsc::Receiver<RelayEvent>,
}

impl Relay {
    pub fn new(listener: TcpListener, config: RelayConfig) -> Self {
        let (events, inbox) = mpsc::channel(EVENT_QUEUE_DEPTH);
        Self {
            listener,
            state: RelayState::new(config),
            events,
            inbox,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> RelayHandle {
        RelayHandle {
            events: self.events.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayNotice> {
        self.state.subscribe()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Relay {
            listener,
            mut state,
            events,
            mut inbox,
        } = self;
        let mut next_connection = 0;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    state.shutdown();
                    break;
                }
                accept_result = listener.accept() => {
                    next_connection += 1;
                    let connection = ConnectionId(next_connection);
                    handle_accept_result(accept_result, connection, &mut state, &events);
                }
                Some(event) = inbox.recv() => state.dispatch(event),
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: io::Result<(TcpStream, SocketAddr)>,
    connection: ConnectionId,
    state: &mut RelayState<ClientOutbox>,
    events: &mpsc::Sender<RelayEvent>,
) {
    match result {
        Ok((stream, peer)) => {
            let outbox = spawn_connection_tasks(connection, stream, events);
            state.admit(connection, outbox, peer);
        }
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_tasks(
    connection: ConnectionId,
    stream: TcpStream,
    events: &mpsc::Sender<RelayEvent>,
) -> ClientOutbox {
    if let Err(error) = stream.set_nodelay(true) {
        debug!(%connection, ?error, "failed to disable nagle");
    }
    let (reader, writer) = stream.into_split();
    let (lines, outgoing) = mpsc::channel(OUTBOX_DEPTH);

    let writer = tokio::spawn(write_outgoing(connection, writer, outgoing, events.clone()));
    let reader = tokio::spawn(read_incoming(
        connection,
        BufReader::new(reader),
        events.clone(),
    ));

    ClientOutbox {
        lines,
        reader: reader.abort_handle(),
        writer: writer.abort_handle(),
    }
}

async fn read_incoming(
    connection: ConnectionId,
    mut reader: BufReader<OwnedReadHalf>,
    events: mpsc::Sender<RelayEvent>,
) {
    loop {
        let (event, finished) = match read_line(&mut reader, MAX_LINE_LEN).await {
            Ok(line) => (RelayEvent::Line { connection, line }, false),
            Err(reason) => (RelayEvent::Closed { connection, reason }, true),
        };
        if events.send(event).await.is_err() || finished {
            return;
        }
    }
}

async fn write_outgoing(
    connection: ConnectionId,
    mut writer: OwnedWriteHalf,
    mut outgoing: mpsc::Receiver<String>,
    events: mpsc::Sender<RelayEvent>,
) {
    while let Some(line) = outgoing.recv().await {
        if let Err(reason) = write_line(&mut writer, &line).await {
            debug!(%connection, %reason, "write failed");
            let _ = events.send(RelayEvent::Closed { connection, reason }).await;
            return;
        }
    }

    // The dispatcher dropped the outbox: everything queued is out, hang up.
    if let Err(error) = writer.shutdown().await {
        debug!(%connection, ?error, "failed to shut down client writer");
    }
}
