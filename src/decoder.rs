//! Newline-delimited answer stream decoding.
//!
//! Streaming backends send zero or more newline-terminated JSON records of the shape
//! `{"answer": "..."}`.  This module turns a stream of arbitrarily-split byte chunks into a
//! stream of [`StreamEvent`]s, one delta per record, independent of where the network happened
//! to split the bytes.

use std::collections::VecDeque;

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;

use crate::observability::{STREAM_BYTES, STREAM_DELTAS, STREAM_MALFORMED};
use crate::{Error, Result};

/// The record separator between streamed JSON records.
pub const RECORD_SEPARATOR: char = '\n';

/// One item produced by the decoder.
#[derive(Clone, Debug)]
pub enum StreamEvent {
    /// A fragment of the answer, to be appended to the in-progress turn.
    Delta(String),
    /// A record was skipped because it did not parse.  Decoding continued with the next record.
    Warning(Error),
}

impl StreamEvent {
    /// Returns the delta text, if this is a delta.
    pub fn as_delta(&self) -> Option<&str> {
        match self {
            StreamEvent::Delta(text) => Some(text),
            StreamEvent::Warning(_) => None,
        }
    }
}

#[derive(Deserialize)]
struct Record {
    answer: String,
}

////////////////////////////////////////// Utf8Decoder /////////////////////////////////////////

/// Stateful UTF-8 decoder.
///
/// An incomplete multi-byte sequence at the end of a chunk is held back until the next chunk
/// completes it.  Invalid sequences decode to U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Creates a decoder with nothing held back.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes `chunk`, prefixed by whatever the previous call held back.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::with_capacity(self.pending.len());
        let mut input = &self.pending[..];
        loop {
            match std::str::from_utf8(input) {
                Ok(valid) => {
                    out.push_str(valid);
                    input = &[];
                    break;
                }
                Err(err) => {
                    let (valid, rest) = input.split_at(err.valid_up_to());
                    if let Ok(valid) = std::str::from_utf8(valid) {
                        out.push_str(valid);
                    }
                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            input = &rest[len..];
                        }
                        None => {
                            input = rest;
                            break;
                        }
                    }
                }
            }
        }
        let held = input.to_vec();
        self.pending = held;
        out
    }

    /// Returns true if bytes are held back waiting for the rest of a character.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Flushes held-back bytes at end of input.  A dangling partial character becomes U+FFFD.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(tail)
    }
}

///////////////////////////////////////// StreamDecoder ////////////////////////////////////////

/// Splits decoded text into records and parses each record into a delta.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    utf8: Utf8Decoder,
    residual: String,
}

impl StreamDecoder {
    /// Creates a decoder with an empty residual buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one network chunk and returns the events for every record it completed.
    ///
    /// Events are returned in record order.  The trailing partial record stays buffered.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        STREAM_BYTES.count(chunk.len() as u64);
        let text = self.utf8.decode(chunk);
        self.residual.push_str(&text);
        let Some(cut) = self.residual.rfind(RECORD_SEPARATOR) else {
            return Vec::new();
        };
        let rest = self.residual.split_off(cut + RECORD_SEPARATOR.len_utf8());
        let complete = std::mem::replace(&mut self.residual, rest);
        complete
            .split_terminator(RECORD_SEPARATOR)
            .filter_map(parse_segment)
            .collect()
    }

    /// Returns the buffered partial record without consuming it.
    pub fn residual(&self) -> &str {
        &self.residual
    }

    /// Ends decoding.  Returns the unterminated trailing text, which is discarded, if any.
    pub fn finish(mut self) -> Option<String> {
        if let Some(tail) = self.utf8.finish() {
            self.residual.push_str(&tail);
        }
        if self.residual.is_empty() {
            None
        } else {
            Some(self.residual)
        }
    }
}

fn parse_segment(segment: &str) -> Option<StreamEvent> {
    let segment = segment.strip_suffix('\r').unwrap_or(segment);
    if segment.trim().is_empty() {
        return None;
    }
    match serde_json::from_str::<Record>(segment) {
        Ok(record) => {
            STREAM_DELTAS.click();
            Some(StreamEvent::Delta(record.answer))
        }
        Err(err) => {
            STREAM_MALFORMED.click();
            tracing::warn!(segment, error = %err, "skipping malformed stream record");
            Some(StreamEvent::Warning(Error::malformed_segment(
                segment,
                Some(Box::new(err)),
            )))
        }
    }
}

/////////////////////////////////////////// decode_stream //////////////////////////////////////

/// Lazily decodes a byte stream into answer events.
///
/// Transport errors from the byte stream are passed through as `Err` and end nothing on their
/// own; the caller decides whether to keep polling.  At end of stream any unterminated residual
/// is dropped.
pub fn decode_stream<S>(byte_stream: S) -> impl Stream<Item = Result<StreamEvent>>
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    let state = (
        byte_stream,
        Some(StreamDecoder::new()),
        VecDeque::<StreamEvent>::new(),
    );
    stream::unfold(
        state,
        |(mut byte_stream, mut decoder, mut ready)| async move {
            loop {
                if let Some(event) = ready.pop_front() {
                    return Some((Ok(event), (byte_stream, decoder, ready)));
                }
                let active = decoder.as_mut()?;
                match byte_stream.next().await {
                    Some(Ok(chunk)) => ready.extend(active.push(&chunk)),
                    Some(Err(err)) => return Some((Err(err), (byte_stream, decoder, ready))),
                    None => {
                        if let Some(residual) = decoder.take().and_then(StreamDecoder::finish) {
                            tracing::debug!(
                                residual = %residual,
                                "discarding unterminated stream tail"
                            );
                        }
                        return None;
                    }
                }
            }
        },
    )
}
