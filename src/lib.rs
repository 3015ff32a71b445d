//! Streaming chat sessions against a question/answer backend.
//!
//! The core is [`SessionController`]: submit a question, then step it until idle.  Answers
//! arrive either as one JSON document or as newline-delimited records, and a backend that is
//! still waking up gets a countdown and one automatic retry.

// Public modules
pub mod chat;
pub mod cold_start;
pub mod config;
pub mod decoder;
pub mod dispatcher;
pub mod error;
pub mod log;
pub mod render;
pub mod session;
pub mod transport;

mod observability;

// Re-exports
pub use cold_start::{ColdStartRetry, Tick};
pub use config::{ColdStartConfig, DispatchConfig, FallbackText};
pub use decoder::{StreamDecoder, StreamEvent, Utf8Decoder, decode_stream};
pub use dispatcher::{AbortHandle, Answer, AnswerStream, PendingRequest, Reply, RequestDispatcher};
pub use error::{Error, ErrorKind, Result};
pub use log::{ConversationLog, Role, Turn};
pub use observability::register_biometrics;
pub use render::{PlainTextRenderer, Renderer};
pub use session::{
    Interrupter, SessionController, SessionEvent, SessionOptions, SessionState, SessionStats,
    Submission,
};
pub use transport::{ChatRequest, ChatResponse, HttpTransport, Transport};
