// Streaming delivery: throttled draft edits driven by a fragment stream.
//
// Each break-delimited run of text becomes one platform message. The first text
// sends a plain draft; later text edits it in place at most once per throttle
// interval; the end of the run issues one formatted final edit when the last
// transmitted content is stale. Binary segments bypass the throttle.

use std::future::Future;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::time::Instant;

use super::types::{DeliveryHandle, MessageChain, Segment, StreamFragment, StreamSettings};
use super::util::{char_len, split_message};
use crate::{ulog_debug, ulog_warn};

/// Per-platform throttle knobs
#[derive(Debug, Clone, PartialEq)]
pub struct StreamPolicy {
    /// Minimum spacing between two edits of the same draft
    pub throttle_interval: Duration,
    pub max_message_len: usize,
}

impl From<&StreamSettings> for StreamPolicy {
    fn from(s: &StreamSettings) -> Self {
        Self {
            throttle_interval: Duration::from_millis(s.throttle_interval_ms),
            max_message_len: s.max_message_length.max(1),
        }
    }
}

/// Platform operations the throttler drives
pub trait DraftSink {
    /// Send a new plain-text draft, returning its handle
    fn send_draft(&self, text: &str) -> impl Future<Output = Option<DeliveryHandle>> + Send;

    /// Replace the draft's text (plain, no format conversion)
    fn edit_draft(&self, handle: &DeliveryHandle, text: &str) -> impl Future<Output = bool> + Send;

    /// Last edit of a draft: rich format, plain fallback
    fn finalize_draft(&self, handle: &DeliveryHandle, text: &str) -> impl Future<Output = bool> + Send;

    /// Send a finished message in rich format
    fn send_final(&self, text: &str) -> impl Future<Output = Option<DeliveryHandle>> + Send;

    /// Deliver a whole chain through the normal send path
    fn send_chain(&self, chain: &MessageChain) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    /// Nothing accumulated for the current message
    Idle,
    /// Everything accumulated so far has been transmitted
    Accumulating,
    /// Text is waiting for the throttle interval to pass
    AwaitingThrottle,
}

/// State of the message currently being streamed
#[derive(Debug)]
pub struct StreamingState {
    delta: String,
    target: Option<DeliveryHandle>,
    last_mutation: Instant,
    /// Content of the last successful send/edit
    last_sent: String,
}

impl StreamingState {
    pub fn new() -> Self {
        Self {
            delta: String::new(),
            target: None,
            last_mutation: Instant::now(),
            last_sent: String::new(),
        }
    }

    pub fn phase(&self) -> StreamPhase {
        if self.delta.is_empty() && self.target.is_none() {
            StreamPhase::Idle
        } else if self.delta != self.last_sent {
            StreamPhase::AwaitingThrottle
        } else {
            StreamPhase::Accumulating
        }
    }

    /// Start a fresh message
    fn reset(&mut self) {
        self.delta.clear();
        self.target = None;
        self.last_sent.clear();
    }

    fn mark_sent(&mut self, content: String) {
        self.last_sent = content;
        self.last_mutation = Instant::now();
    }
}

impl Default for StreamingState {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream fragments by editing drafts in place.
pub async fn run_stream<S, F>(sink: &S, mut fragments: F, policy: &StreamPolicy)
where
    S: DraftSink + Sync,
    F: Stream<Item = StreamFragment> + Unpin,
{
    let mut state = StreamingState::new();

    while let Some(fragment) = fragments.next().await {
        let chain = match fragment {
            StreamFragment::Break => {
                flush(sink, &mut state).await;
                state.reset();
                continue;
            }
            StreamFragment::Chain(chain) => chain,
        };

        let mut text_changed = false;
        for segment in chain.segments {
            match segment {
                Segment::Text(text) => {
                    state.delta.push_str(&text);
                    text_changed = true;
                }
                Segment::Mention { user_id, name } => {
                    state.delta.push_str(&Segment::mention_display(&user_id, name.as_deref()));
                    state.delta.push(' ');
                    text_changed = true;
                }
                binary @ (Segment::Image { .. } | Segment::File { .. } | Segment::Voice { .. }) => {
                    sink.send_chain(&MessageChain::new().with(binary)).await;
                }
                other => {
                    ulog_warn!("[im-stream] Dropping {} segment in streaming mode", other.kind());
                }
            }
        }

        if text_changed {
            step(sink, &mut state, policy).await;
        }
    }

    flush(sink, &mut state).await;
}

/// Decide between send, edit and defer after the delta changed
async fn step<S: DraftSink + Sync>(sink: &S, state: &mut StreamingState, policy: &StreamPolicy) {
    if state.delta.trim().is_empty() {
        return;
    }

    if char_len(&state.delta) > policy.max_message_len {
        overflow(sink, state, policy).await;
        return;
    }

    match state.target.clone() {
        None => {
            if let Some(handle) = sink.send_draft(&state.delta).await {
                state.target = Some(handle);
                let sent = state.delta.clone();
                state.mark_sent(sent);
            }
        }
        Some(handle) => {
            if state.last_mutation.elapsed() >= policy.throttle_interval {
                if sink.edit_draft(&handle, &state.delta).await {
                    let sent = state.delta.clone();
                    state.mark_sent(sent);
                } else {
                    state.last_mutation = Instant::now();
                }
            } else {
                ulog_debug!(
                    "[im-stream] Deferring edit ({} chars pending, phase {:?})",
                    char_len(&state.delta),
                    state.phase()
                );
            }
        }
    }
}

/// Delta outgrew one message: close the current one and continue in a new draft
async fn overflow<S: DraftSink + Sync>(sink: &S, state: &mut StreamingState, policy: &StreamPolicy) {
    let mut chunks = split_message(&state.delta, policy.max_message_len);
    let tail = chunks.pop().unwrap_or_default();

    for (i, chunk) in chunks.iter().enumerate() {
        match (i, state.target.take()) {
            (0, Some(handle)) => {
                sink.finalize_draft(&handle, chunk).await;
            }
            _ => {
                sink.send_final(chunk).await;
            }
        }
    }

    state.reset();
    state.delta = tail;
    if let Some(handle) = sink.send_draft(&state.delta).await {
        state.target = Some(handle);
        let sent = state.delta.clone();
        state.mark_sent(sent);
    }
}

/// Make sure the last accumulated state reaches the platform
async fn flush<S: DraftSink + Sync>(sink: &S, state: &mut StreamingState) {
    if state.delta.trim().is_empty() || state.delta == state.last_sent {
        return;
    }
    match &state.target {
        Some(handle) => {
            if sink.finalize_draft(handle, &state.delta).await {
                let sent = state.delta.clone();
                state.mark_sent(sent);
            }
        }
        None => {
            if let Some(handle) = sink.send_final(&state.delta).await {
                state.target = Some(handle);
                let sent = state.delta.clone();
                state.mark_sent(sent);
            }
        }
    }
}

/// Buffered streaming: collect each break-delimited run and send it once.
pub async fn run_buffered<S, F>(sink: &S, mut fragments: F)
where
    S: DraftSink + Sync,
    F: Stream<Item = StreamFragment> + Unpin,
{
    let mut pending = MessageChain::new();
    while let Some(fragment) = fragments.next().await {
        match fragment {
            StreamFragment::Chain(chain) => pending.extend(chain),
            StreamFragment::Break => send_pending(sink, &mut pending).await,
        }
    }
    send_pending(sink, &mut pending).await;
}

async fn send_pending<S: DraftSink + Sync>(sink: &S, pending: &mut MessageChain) {
    let mut chain = std::mem::take(pending);
    chain.squash_text();
    let blank = chain
        .segments
        .iter()
        .all(|s| matches!(s, Segment::Text(t) if t.trim().is_empty()));
    if blank {
        return;
    }
    sink.send_chain(&chain).await;
}
