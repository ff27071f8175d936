use std::{io, net::SocketAddr};

use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};
use tracing::debug;

use crate::{error::TransportError, protocol::MAX_LINE_LEN};

/// A connection over TCP, split into a buffered reader and a raw writer.
pub type TcpConnection = Connection<BufReader<OwnedReadHalf>, OwnedWriteHalf>;

/// Reads one `\n`-terminated line and returns it without the terminator.
///
/// Fails with `LineTooLong` once more than `limit` bytes have accumulated,
/// even if the terminator has not shown up yet, so an endless line cannot hang
/// the caller. End of stream yields `PeerClosed`; an unterminated tail is
/// dropped.
pub async fn read_line<R>(reader: &mut R, limit: usize) -> Result<String, TransportError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        let (terminated, used) = {
            let available = match reader.fill_buf().await {
                Ok(available) => available,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(TransportError::ReadFailed(err)),
            };
            if available.is_empty() {
                return Err(TransportError::PeerClosed);
            }

            match available.iter().position(|&byte| byte == b'\n') {
                Some(index) => {
                    line.extend_from_slice(&available[..index]);
                    (true, index + 1)
                }
                None => {
                    line.extend_from_slice(available);
                    (false, available.len())
                }
            }
        };
        reader.consume(used);

        if line.len() > limit {
            return Err(TransportError::LineTooLong { limit });
        }
        if terminated {
            return Ok(String::from_utf8_lossy(&line).into_owned());
        }
    }
}

/// Writes `text` followed by `\n` (unless it already ends with one) and
/// flushes. Interrupted writes are retried.
pub async fn write_line<W>(writer: &mut W, text: &str) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let mut framed = Vec::with_capacity(text.len() + 1);
    framed.extend_from_slice(text.as_bytes());
    if !text.ends_with('\n') {
        framed.push(b'\n');
    }

    let mut written = 0;
    while written < framed.len() {
        match writer.write(&framed[written..]).await {
            Ok(0) => {
                return Err(TransportError::WriteFailed(io::ErrorKind::WriteZero.into()));
            }
            Ok(count) => written += count,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(TransportError::WriteFailed(err)),
        }
    }

    loop {
        match writer.flush().await {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(TransportError::WriteFailed(err)),
        }
    }
}

/// A byte-stream channel to exactly one peer, framed as lines.
pub struct Connection<R, W> {
    reader: R,
    writer: W,
    max_line_len: usize,
}

impl TcpConnection {
    pub fn from_tcp(stream: TcpStream) -> Self {
        // Chat lines are tiny; don't let Nagle hold them back.
        if let Err(error) = stream.set_nodelay(true) {
            debug!(?error, "failed to disable nagle");
        }
        let (reader, writer) = stream.into_split();
        Self::new(BufReader::new(reader), writer)
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.writer.peer_addr()
    }
}

impl<R, W> Connection<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            max_line_len: MAX_LINE_LEN,
        }
    }

    pub async fn send_line(&mut self, text: &str) -> Result<(), TransportError> {
        write_line(&mut self.writer, text).await
    }

    pub async fn recv_line(&mut self) -> Result<String, TransportError> {
        read_line(&mut self.reader, self.max_line_len).await
    }

    /// Half-closes the write side. Failures are logged and otherwise ignored
    /// since the connection is being torn down anyway.
    pub async fn shutdown(&mut self) {
        if let Err(error) = self.writer.shutdown().await {
            debug!(?error, "failed to shut down connection writer");
        }
    }

    pub fn into_parts(self) -> (R, W) {
        (self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        pin::Pin,
        task::{Context, Poll},
        time::Duration,
    };

    use tokio::io::{AsyncRead, ReadBuf, duplex, split};

    use super::*;

    /// Fails the first read or write with `Interrupted`, then passes through.
    struct InterruptOnce<T> {
        inner: T,
        interrupted: bool,
    }

    impl<T> InterruptOnce<T> {
        fn new(inner: T) -> Self {
            Self {
                inner,
                interrupted: false,
            }
        }
    }

    impl<T: AsyncRead + Unpin> AsyncRead for InterruptOnce<T> {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if !self.interrupted {
                self.interrupted = true;
                return Poll::Ready(Err(io::ErrorKind::Interrupted.into()));
            }
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl<T: AsyncWrite + Unpin> AsyncWrite for InterruptOnce<T> {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if !self.interrupted {
                self.interrupted = true;
                return Poll::Ready(Err(io::ErrorKind::Interrupted.into()));
            }
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    #[tokio::test]
    async fn roundtrip_over_duplex() {
        let (left, right) = duplex(1024);
        let (left_reader, left_writer) = split(left);
        let (right_reader, right_writer) = split(right);
        let mut sender = Connection::new(BufReader::new(left_reader), left_writer);
        let mut receiver = Connection::new(BufReader::new(right_reader), right_writer);

        sender.send_line("hello there").await.expect("send");
        sender.send_line("").await.expect("send empty");
        sender.send_line("héllo wörld").await.expect("send utf-8");

        assert_eq!(receiver.recv_line().await.expect("recv"), "hello there");
        assert_eq!(receiver.recv_line().await.expect("recv"), "");
        assert_eq!(receiver.recv_line().await.expect("recv"), "héllo wörld");
    }

    #[tokio::test]
    async fn existing_terminator_is_not_doubled() {
        let mut out = Vec::new();
        write_line(&mut out, "done\n").await.expect("write");
        write_line(&mut out, "next").await.expect("write");
        assert_eq!(out, b"done\nnext\n");
    }

    #[tokio::test]
    async fn interrupted_io_is_retried() {
        let mut writer = InterruptOnce::new(Vec::new());
        write_line(&mut writer, "ping").await.expect("write retried");
        assert_eq!(writer.inner, b"ping\n");

        let mut reader = BufReader::new(InterruptOnce::new(&b"pong\n"[..]));
        let line = read_line(&mut reader, MAX_LINE_LEN)
            .await
            .expect("read retried");
        assert_eq!(line, "pong");
    }

    #[tokio::test]
    async fn end_of_stream_is_peer_closed() {
        let mut reader = &b""[..];
        let result = read_line(&mut reader, MAX_LINE_LEN).await;
        assert!(matches!(result, Err(TransportError::PeerClosed)));

        let mut partial = &b"no terminator"[..];
        let result = read_line(&mut partial, MAX_LINE_LEN).await;
        assert!(matches!(result, Err(TransportError::PeerClosed)));
    }

    #[tokio::test]
    async fn line_at_the_limit_is_accepted() {
        let mut data = vec![b'a'; MAX_LINE_LEN];
        data.push(b'\n');
        let mut reader = &data[..];
        let line = read_line(&mut reader, MAX_LINE_LEN).await.expect("read");
        assert_eq!(line.len(), MAX_LINE_LEN);
    }

    #[tokio::test]
    async fn terminated_line_over_the_limit_is_rejected() {
        let mut data = vec![b'a'; MAX_LINE_LEN + 1];
        data.push(b'\n');
        let mut reader = &data[..];
        let result = read_line(&mut reader, MAX_LINE_LEN).await;
        assert!(matches!(
            result,
            Err(TransportError::LineTooLong { limit: MAX_LINE_LEN })
        ));
    }

    #[tokio::test]
    async fn oversized_unterminated_input_fails_instead_of_hanging() {
        let (client, server) = duplex(16 * 1024);
        let (server_reader, server_writer) = split(server);
        let mut connection = Connection::new(BufReader::new(server_reader), server_writer);

        // Keep the writing side open so only the length bound can end the read.
        let writer = tokio::spawn(async move {
            let mut client = client;
            let payload = vec![b'x'; MAX_LINE_LEN + 1];
            let _ = client.write_all(&payload).await;
            client
        });

        let result = tokio::time::timeout(Duration::from_secs(5), connection.recv_line())
            .await
            .expect("read should not hang");
        assert!(matches!(result, Err(TransportError::LineTooLong { .. })));
        drop(writer.await.expect("writer task"));
    }

    #[tokio::test]
    async fn write_to_closed_peer_fails() {
        let (client, server) = duplex(64);
        drop(server);
        let (_, mut writer) = split(client);
        let result = write_line(&mut writer, "anyone there?").await;
        assert!(matches!(result, Err(TransportError::WriteFailed(_))));
    }

    #[test]
    fn disconnect_classification() {
        assert!(TransportError::PeerClosed.is_disconnect());
        assert!(TransportError::WriteFailed(io::ErrorKind::BrokenPipe.into()).is_disconnect());
        assert!(!TransportError::LineTooLong { limit: 1 }.is_disconnect());
    }
}
