//! Server-Sent Events framing shared by the HTTP adapters.
//!
//! Bytes are buffered until a full line is available, so a multi-byte
//! character split across two network chunks decodes correctly. Only
//! `data:` lines matter; comments (`:`), `event:` and blank lines are
//! dropped.

use super::{Delta, DeltaStream};
use crate::{Error, TransportError};
use std::collections::VecDeque;
use tracing::{debug, trace};

/// Incremental `data:` line extractor.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    /// Feed a chunk; returns the payloads of every complete `data:` line.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(data) = data_payload(&String::from_utf8_lossy(&line)) {
                out.push(data);
            }
        }
        out
    }

    /// Flush a trailing line that had no newline.
    pub(crate) fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        data_payload(&String::from_utf8_lossy(&rest))
    }
}

fn data_payload(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    let data = line.strip_prefix("data:")?;
    Some(data.strip_prefix(' ').unwrap_or(data).to_string())
}

struct SseState<F> {
    response: Option<reqwest::Response>,
    decoder: SseDecoder,
    pending: VecDeque<Result<Delta, Error>>,
    parse: F,
}

impl<F: FnMut(&str) -> Result<Vec<Delta>, Error>> SseState<F> {
    /// Queue the deltas for each payload. Returns `false` at `[DONE]` or
    /// after queueing a payload error, which ends the stream.
    fn absorb(&mut self, payloads: Vec<String>) -> bool {
        for data in payloads {
            if data == "[DONE]" {
                trace!("SSE stream reached [DONE]");
                return false;
            }
            match (self.parse)(&data) {
                Ok(deltas) => self.pending.extend(deltas.into_iter().map(Ok)),
                Err(e) => {
                    self.pending.push_back(Err(e));
                    return false;
                }
            }
        }
        true
    }
}

/// Adapt an SSE response into a [`DeltaStream`]. `parse` turns one `data:`
/// payload into zero or more deltas. The stream ends at `[DONE]`, at end of
/// body, or right after the first error `parse` returns.
pub(crate) fn delta_stream<F>(response: reqwest::Response, parse: F) -> DeltaStream
where
    F: FnMut(&str) -> Result<Vec<Delta>, Error> + Send + 'static,
{
    let state = SseState {
        response: Some(response),
        decoder: SseDecoder::default(),
        pending: VecDeque::new(),
        parse,
    };
    Box::pin(futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                return Some((item, st));
            }
            let response = st.response.as_mut()?;
            let next = response.chunk().await;
            match next {
                Ok(Some(bytes)) => {
                    let payloads = st.decoder.push(&bytes);
                    if !st.absorb(payloads) {
                        st.response = None;
                    }
                }
                Ok(None) => {
                    let tail = st.decoder.finish().into_iter().collect();
                    st.absorb(tail);
                    st.response = None;
                    debug!("SSE body ended");
                }
                Err(e) => {
                    st.response = None;
                    let err = TransportError::new(format!("failed to read streaming chunk: {e}"));
                    return Some((Err(Error::from(err)), st));
                }
            }
        }
    }))
}
