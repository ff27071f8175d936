use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncWrite, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::mpsc,
};
use tracing::{debug, info, warn};

use crate::{
    cli::JoinArgs,
    console::{spawn_line_reader, write_stderr, write_stdout},
    error::TransportError,
    protocol::{EXIT, Frame, MAX_LINE_LEN},
    transport::{Connection, read_line, write_line},
};

pub async fn run(args: JoinArgs) -> Result<()> {
    let (reader, mut writer) = establish_connection(&args).await?;
    let mut server = spawn_server_reader(reader);
    let mut input = spawn_line_reader();

    run_client_loop(&mut server, &mut writer, &mut input).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(
    args: &JoinArgs,
) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);

    Ok(Connection::from_tcp(stream).into_parts())
}

/// Frames server lines on their own task; `read_line` is not cancel safe, so
/// it must not sit directly in the `select!` below.
fn spawn_server_reader(
    mut reader: BufReader<OwnedReadHalf>,
) -> mpsc::Receiver<Result<String, TransportError>> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        loop {
            let line = read_line(&mut reader, MAX_LINE_LEN).await;
            let finished = line.is_err();
            if tx.send(line).await.is_err() || finished {
                return;
            }
        }
    });
    rx
}

async fn run_client_loop(
    server: &mut mpsc::Receiver<Result<String, TransportError>>,
    writer: &mut OwnedWriteHalf,
    input: &mut mpsc::Receiver<String>,
) -> Result<()> {
    let mut input_open = true;
    loop {
        select! {
            server_line = server.recv() => {
                let Some(server_line) = server_line else {
                    break;
                };
                if !handle_server_line(server_line).await? {
                    break;
                }
            }
            local_line = input.recv(), if input_open => {
                match local_line {
                    Some(line) => {
                        if !handle_local_line(&line, writer).await? {
                            break;
                        }
                    }
                    None => {
                        // Out of input: ask the relay to let us go and wait for its answer.
                        input_open = false;
                        if !handle_local_line(EXIT, writer).await? {
                            break;
                        }
                    }
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                say_goodbye(writer).await;
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_line(line: Result<String, TransportError>) -> Result<bool> {
    match line {
        Ok(line) => match Frame::parse_relay(&line) {
            Some(Frame::Exit) => {
                write_stdout("*** server closed the session").await?;
                Ok(false)
            }
            Some(_) => {
                write_stdout(&line).await?;
                Ok(true)
            }
            None => Ok(true),
        },
        Err(TransportError::PeerClosed) => {
            write_stdout("*** server closed the connection").await?;
            Ok(false)
        }
        Err(error) => {
            write_stderr(&format!("!!! connection lost: {error}")).await?;
            Ok(false)
        }
    }
}

/// Sends one trimmed operator line. Returns `false` once the relay can no
/// longer be reached.
async fn handle_local_line<W>(input: &str, writer: &mut W) -> Result<bool>
where
    W: AsyncWrite + Unpin,
{
    let text = input.trim();
    if text.is_empty() {
        return Ok(true);
    }

    if let Err(error) = write_line(writer, text).await {
        write_stderr(&format!("!!! failed to send: {error}")).await?;
        return Ok(false);
    }
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

/// Best effort `Exit` so the relay sees a clean departure rather than a drop.
async fn say_goodbye<W>(writer: &mut W)
where
    W: AsyncWrite + Unpin,
{
    if let Err(error) = write_line(writer, EXIT).await {
        debug!(%error, "could not send exit on interrupt");
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}
