//! LMTP: the local-model token-streaming protocol.
//!
//! A client and a model-hosting session exchange framed messages over an
//! interchangeable transport: an in-process duplex channel, an OS pipe to a
//! worker subprocess, or a websocket. Commands are `GENERATE`, `SCORE`, and
//! `MSG`; results stream back as `TOKEN` frames, demultiplexed by
//! `stream_id`.

pub mod client;
pub mod message;
pub mod model;
pub mod server;
pub mod session;
pub mod transport;
pub mod worker;

pub use client::{ClientRef, GenerateOptions, LmtpClient, LmtpStream};
pub use message::{Frame, FrameKind, GenerateArgs, MsgReply, MsgRequest, ScoreArgs, TokenPayload};
pub use model::{LocalModel, MockModel, TokenSink};
pub use session::{serve_transport, TokenSession};
pub use transport::{
    duplex_pair, stdio_pair, FrameSink, FrameSource, PipeTransport, TransportPair,
    WebSocketTransport,
};
pub use worker::run_worker;
