//! Frame-level transport bindings.
//!
//! A transport is a pair of halves: a [`FrameSink`] for outbound frames and
//! a [`FrameSource`] for inbound ones, so the sender and the reader loop can
//! live in different tasks. Three interchangeable bindings: an in-process
//! duplex channel, an OS pipe to a worker subprocess (one JSON record per
//! line), and a websocket text channel.

use std::process::Stdio;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter, Lines};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::{Result, StreamError};
use crate::lmtp::message::Frame;

/// Outbound half of a transport.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: Frame) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

/// Inbound half of a transport. Implementations skip unknown frame types.
#[async_trait]
pub trait FrameSource: Send {
    /// The next frame, or `None` once the peer closed.
    async fn recv(&mut self) -> Result<Option<Frame>>;
}

pub type TransportPair = (Box<dyn FrameSink>, Box<dyn FrameSource>);

// ── in-process duplex ───────────────────────────────────────────────────

struct ChannelSink {
    tx: Option<mpsc::UnboundedSender<Frame>>,
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(frame)
                .map_err(|_| StreamError::Lmtp("peer closed".into())),
            None => Err(StreamError::Lmtp("transport closed".into())),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.tx.take();
        Ok(())
    }
}

struct ChannelSource {
    rx: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl FrameSource for ChannelSource {
    async fn recv(&mut self) -> Result<Option<Frame>> {
        Ok(self.rx.recv().await)
    }
}

/// Two connected in-process transports, one per endpoint. Used for
/// in-process model hosting and tests.
pub fn duplex_pair() -> (TransportPair, TransportPair) {
    let (left_tx, right_rx) = mpsc::unbounded_channel();
    let (right_tx, left_rx) = mpsc::unbounded_channel();
    (
        (
            Box::new(ChannelSink { tx: Some(left_tx) }),
            Box::new(ChannelSource { rx: left_rx }),
        ),
        (
            Box::new(ChannelSink { tx: Some(right_tx) }),
            Box::new(ChannelSource { rx: right_rx }),
        ),
    )
}

// ── subprocess pipe ─────────────────────────────────────────────────────

struct PipeSink {
    writer: BufWriter<ChildStdin>,
    child: Option<Child>,
}

#[async_trait]
impl FrameSink for PipeSink {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        let mut line = frame.to_line();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.writer.shutdown().await.ok();
        if let Some(mut child) = self.child.take() {
            child.start_kill().ok();
        }
        Ok(())
    }
}

struct PipeSource {
    lines: Lines<BufReader<ChildStdout>>,
}

#[async_trait]
impl FrameSource for PipeSource {
    async fn recv(&mut self) -> Result<Option<Frame>> {
        loop {
            match self.lines.next_line().await? {
                None => return Ok(None),
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => match Frame::from_line(&line) {
                    Some(frame) => return Ok(Some(frame)),
                    None => {
                        tracing::warn!(line, "skipping undecodable pipe frame");
                    }
                },
            }
        }
    }
}

/// Transport to a worker subprocess over its stdio.
///
/// The child is expected to run an LMTP worker loop (see
/// [`run_worker`](crate::lmtp::worker::run_worker)); it observes parent
/// death as EOF on its stdin and exits.
pub struct PipeTransport;

impl PipeTransport {
    pub fn spawn(mut command: Command) -> Result<TransportPair> {
        command.stdin(Stdio::piped()).stdout(Stdio::piped());
        let mut child = command.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| StreamError::Lmtp("worker stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| StreamError::Lmtp("worker stdout unavailable".into()))?;
        Ok((
            Box::new(PipeSink {
                writer: BufWriter::new(stdin),
                child: Some(child),
            }),
            Box::new(PipeSource {
                lines: BufReader::new(stdout).lines(),
            }),
        ))
    }
}

// ── worker-side stdio ───────────────────────────────────────────────────

struct StdoutSink {
    writer: BufWriter<tokio::io::Stdout>,
}

#[async_trait]
impl FrameSink for StdoutSink {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        let mut line = frame.to_line();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.writer.flush().await.ok();
        Ok(())
    }
}

struct StdinSource {
    lines: Lines<BufReader<tokio::io::Stdin>>,
}

#[async_trait]
impl FrameSource for StdinSource {
    async fn recv(&mut self) -> Result<Option<Frame>> {
        loop {
            match self.lines.next_line().await? {
                None => return Ok(None),
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => match Frame::from_line(&line) {
                    Some(frame) => return Ok(Some(frame)),
                    None => {
                        tracing::warn!(line, "skipping undecodable stdin frame");
                    }
                },
            }
        }
    }
}

/// The worker end of a subprocess pipe: frames over this process's own
/// stdin/stdout.
pub fn stdio_pair() -> TransportPair {
    (
        Box::new(StdoutSink {
            writer: BufWriter::new(tokio::io::stdout()),
        }),
        Box::new(StdinSource {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }),
    )
}

// ── websocket client ────────────────────────────────────────────────────

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct WsSink {
    inner: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        self.inner
            .send(Message::Text(frame.to_ws_text()))
            .await
            .map_err(|e| StreamError::Lmtp(e.to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        self.inner
            .close()
            .await
            .map_err(|e| StreamError::Lmtp(e.to_string()))
    }
}

struct WsSource {
    inner: SplitStream<WsStream>,
}

#[async_trait]
impl FrameSource for WsSource {
    async fn recv(&mut self) -> Result<Option<Frame>> {
        loop {
            match self.inner.next().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(StreamError::Lmtp(e.to_string())),
                Some(Ok(Message::Text(text))) => match Frame::from_ws_text(&text) {
                    Some(frame) => return Ok(Some(frame)),
                    None => {
                        tracing::warn!(%text, "skipping undecodable websocket frame");
                    }
                },
                Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(_)) => continue,
            }
        }
    }
}

/// Websocket client transport for a remote LMTP endpoint.
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub async fn connect(url: &str) -> Result<TransportPair> {
        let (socket, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| StreamError::Lmtp(e.to_string()))?;
        let (sink, stream) = socket.split();
        Ok((
            Box::new(WsSink { inner: sink }),
            Box::new(WsSource { inner: stream }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lmtp::message::{FrameKind, TokenPayload};
    use serde_json::json;

    #[tokio::test]
    async fn test_duplex_round_trip() {
        let ((mut left_sink, _left_source), (_right_sink, mut right_source)) = duplex_pair();
        let frame = Frame::token(&TokenPayload::end(1, crate::chunk::FinishReason::Stop));
        left_sink.send(frame.clone()).await.unwrap();
        let received = right_source.recv().await.unwrap().unwrap();
        assert_eq!(received, frame);
    }

    #[tokio::test]
    async fn test_duplex_close_ends_peer() {
        let ((mut left_sink, _left_source), (right_sink, mut right_source)) = duplex_pair();
        left_sink.close().await.unwrap();
        drop(right_sink);
        assert!(right_source.recv().await.unwrap().is_none());
        assert!(left_sink
            .send(Frame::new(FrameKind::Msg, json!({})))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_pipe_transport_round_trip_through_cat() {
        // `cat` echoes our frames line for line
        let (mut sink, mut source) = PipeTransport::spawn(Command::new("cat")).unwrap();
        let frame = Frame::new(FrameKind::Msg, json!({"stream_id": 9, "name": "model_info"}));
        sink.send(frame.clone()).await.unwrap();
        let received = source.recv().await.unwrap().unwrap();
        assert_eq!(received, frame);
        sink.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_pipe_source_skips_garbage_lines() {
        // a shell that prints garbage, then echoes stdin: the source skips
        // the garbage and yields the real frame
        let mut command = Command::new("sh");
        command.arg("-c").arg("echo 'not a frame'; cat");
        let (mut sink, mut source) = PipeTransport::spawn(command).unwrap();
        let frame = Frame::new(FrameKind::Token, json!({"stream_id": 1}));
        sink.send(frame.clone()).await.unwrap();
        let received = source.recv().await.unwrap().unwrap();
        assert_eq!(received, frame);
        sink.close().await.unwrap();
    }
}
