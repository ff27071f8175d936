//! Terminal front-end for the two-party mode.

use anyhow::{Context, Result};
use tokio::{
    io::{self, BufReader},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tracing::info;

use crate::{
    cli::{ConnectArgs, ListenArgs},
    console::{write_stderr, write_stdout},
    transport::Connection,
    turn::{Role, SessionEvent, Turn, TurnSession},
};

/// Accepts exactly one peer, then runs the session receiving first.
pub async fn listen(args: ListenArgs) -> Result<()> {
    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to listen on {}", args.listen))?;
    info!("waiting for a peer on {}", listener.local_addr()?);

    let (stream, peer) = listener
        .accept()
        .await
        .context("failed to accept peer")?;
    // Single peer only.
    drop(listener);
    info!(%peer, "peer connected");

    run_session(stream, Role::Listener).await
}

pub async fn connect(args: ConnectArgs) -> Result<()> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;
    info!("connected to {}", args.server);

    run_session(stream, Role::Connector).await
}

async fn run_session(stream: TcpStream, role: Role) -> Result<()> {
    let (events, events_rx) = mpsc::unbounded_channel();
    let session = TurnSession::new(Connection::from_tcp(stream), role, events);
    let mut stdin = BufReader::new(io::stdin());

    let ((), rendered) = tokio::join!(session.run(&mut stdin), render_events(events_rx));
    rendered?;
    Ok(())
}

async fn render_events(mut events: mpsc::UnboundedReceiver<SessionEvent>) -> io::Result<()> {
    while let Some(event) = events.recv().await {
        render_event(event).await?;
    }
    Ok(())
}

async fn render_event(event: SessionEvent) -> io::Result<()> {
    match event {
        SessionEvent::Started(Turn::Sending) => {
            write_stdout("*** you send first; end your turn with '#', type 'Exit' to finish").await
        }
        SessionEvent::Started(_) => write_stdout("*** peer sends first; waiting for '#'").await,
        SessionEvent::PeerLine(line) => write_stdout(&format!("[peer] {line}")).await,
        SessionEvent::TurnReceived => {
            write_stdout("[peer] #  (your turn: end it with '#', type 'Exit' to finish)").await
        }
        SessionEvent::TurnPassed => write_stdout("*** turn ended, waiting for peer").await,
        SessionEvent::PeerExit => write_stdout("[peer] Exit").await,
        SessionEvent::LocalExit => write_stdout("*** leaving").await,
        SessionEvent::SendFailed(error) => write_stderr(&format!("!!! send failed: {error}")).await,
        SessionEvent::ConnectionLost(reason) => {
            write_stdout(&format!("*** connection closed: {reason}")).await
        }
        SessionEvent::Finished => write_stdout("*** session ended").await,
    }
}
