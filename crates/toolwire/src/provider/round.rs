//! Reassembly of streamed deltas into a [`Round`].

use super::{Delta, DeltaStream, FinishReason, Reply, Round, fallback_call_id};
use crate::tools::executor::ToolCallRequest;
use crate::{Error, Usage};
use futures::StreamExt;
use std::collections::BTreeMap;
use tracing::{trace, warn};

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Accumulates one round's deltas.
///
/// Fragments are keyed by index, so interleaved fragments of different
/// calls reassemble correctly and calls come out in index order.
#[derive(Debug, Default)]
pub struct RoundBuilder {
    text: String,
    fragments: BTreeMap<usize, PartialCall>,
    complete: Vec<ToolCallRequest>,
    usage: Option<Usage>,
    finish: Option<FinishReason>,
}

impl RoundBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, delta: &Delta) {
        match delta {
            Delta::Text(t) => self.text.push_str(t),
            Delta::ToolCallFragment {
                index,
                id,
                name,
                arguments,
            } => {
                let entry = self.fragments.entry(*index).or_default();
                if let Some(id) = id {
                    entry.id = Some(id.clone());
                }
                if let Some(name) = name {
                    entry.name = Some(name.clone());
                }
                entry.arguments.push_str(arguments);
            }
            Delta::ToolCalls(calls) => self.complete.extend(calls.iter().cloned()),
            Delta::Usage(u) => self.usage = Some(*u),
            Delta::Finish { reason } => {
                trace!("Stream finish_reason: {reason:?}");
                self.finish = Some(reason.clone());
            }
        }
    }

    /// Text accumulated so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn usage(&self) -> Option<Usage> {
        self.usage
    }

    pub fn finish_reason(&self) -> Option<&FinishReason> {
        self.finish.as_ref()
    }

    /// Whether any tool call (whole or fragmentary) has been seen.
    pub fn has_calls(&self) -> bool {
        !self.complete.is_empty() || !self.fragments.is_empty()
    }

    /// Close the round. Fragmented calls without a name are dropped; calls
    /// without an id get `"{name}_{index}"`.
    pub fn finish(self) -> Reply {
        let mut calls: Vec<ToolCallRequest> = self
            .complete
            .into_iter()
            .enumerate()
            .map(|(i, mut call)| {
                if call.id.is_empty() {
                    call.id = fallback_call_id(&call.name, i);
                }
                call
            })
            .collect();

        for (index, partial) in self.fragments {
            let Some(name) = partial.name else {
                warn!("Dropping streamed tool call {index} with no name");
                continue;
            };
            let id = partial
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| fallback_call_id(&name, index));
            calls.push(ToolCallRequest::from_raw(id, name, &partial.arguments));
        }

        Reply {
            round: Round::from_parts(self.text, calls),
            usage: self.usage,
        }
    }
}

/// Drain `stream` into a [`Reply`], showing each delta to `on_delta` first.
pub async fn collect_round(
    mut stream: DeltaStream,
    mut on_delta: impl FnMut(&Delta),
) -> Result<Reply, Error> {
    let mut builder = RoundBuilder::new();
    while let Some(delta) = stream.next().await {
        let delta = delta?;
        on_delta(&delta);
        builder.push(&delta);
    }
    Ok(builder.finish())
}
