//! Pipes connecting the session processes.

pub mod handshake;
pub mod stream;

pub use handshake::{handshake_pipe, HandshakeReceiver, HandshakeSender, ABORT, READY};
pub use stream::{sample_stream, StreamReader, StreamWriter};
