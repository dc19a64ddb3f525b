//! Throttled, ordered delivery of one run's output as chat events.
//!
//! Non-terminal `delta` events are rate limited by a fixed window: the first
//! chunk after an idle window goes out at once and opens the window; chunks
//! inside the window only mark the state dirty, and a dirty window emits
//! once more when it closes. Terminal events are never delayed.
//!
//! Every emission takes the next sequence number, starting at 1, and
//! carries the cumulative text and reasoning buffers.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::protocol::{
    AssistantMessage, CHAT_EVENT, ChatEventPayload, ChatEventState, Frame, event_frame,
};

/// Frame sink failure.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Connection closed")]
    Closed,
    #[error("Failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Destination for outbound frames of one connection.
pub trait FrameSink: Send + Sync {
    /// Queue a frame for the client.
    ///
    /// # Errors
    /// Returns error if the frame cannot be delivered.
    fn send_frame(&self, frame: Frame) -> Result<(), SinkError>;
}

impl FrameSink for mpsc::UnboundedSender<Frame> {
    fn send_frame(&self, frame: Frame) -> Result<(), SinkError> {
        self.send(frame).map_err(|_| SinkError::Closed)
    }
}

#[derive(Debug, Default)]
struct DeliveryState {
    seq: u64,
    text: String,
    reasoning: String,
    dirty: bool,
    timer: Option<JoinHandle<()>>,
    finished: bool,
}

struct Shared {
    sink: Arc<dyn FrameSink>,
    run_id: String,
    session_key: String,
    throttle: Duration,
    state: Mutex<DeliveryState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, DeliveryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Emit one event. Callers hold the state lock, which orders emissions.
    fn emit(&self, state: &mut DeliveryState, kind: ChatEventState, error: Option<String>) {
        state.seq += 1;
        let message = match kind {
            ChatEventState::Error => None,
            _ => Some(AssistantMessage::assemble(&state.text, &state.reasoning)),
        };
        let payload = ChatEventPayload {
            run_id: self.run_id.clone(),
            session_key: self.session_key.clone(),
            seq: state.seq,
            state: kind,
            message,
            error_message: error,
        };

        let sent = serde_json::to_value(&payload)
            .map_err(SinkError::from)
            .and_then(|payload| {
                self.sink
                    .send_frame(event_frame(CHAT_EVENT, Some(payload), Some(state.seq)))
            });
        if let Err(e) = sent {
            tracing::debug!(run_id = %self.run_id, seq = state.seq, error = %e, "Dropped chat event");
        }
    }
}

fn spawn_throttle_timer(shared: Arc<Shared>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(shared.throttle).await;
            let mut state = shared.lock();
            if state.finished {
                return;
            }
            if !state.dirty {
                state.timer = None;
                return;
            }
            state.dirty = false;
            shared.emit(&mut state, ChatEventState::Delta, None);
        }
    })
}

/// Streams one run's output to a connection.
///
/// Exactly one terminal event is sent; later terminal calls and chunks are
/// ignored. Dropping the delivery cancels its pending timer.
pub struct StreamingDelivery {
    shared: Arc<Shared>,
}

impl StreamingDelivery {
    /// Create a delivery for `run_id`. Must be used inside a tokio runtime.
    #[must_use]
    pub fn new(
        sink: Arc<dyn FrameSink>,
        run_id: impl Into<String>,
        session_key: impl Into<String>,
        throttle: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                sink,
                run_id: run_id.into(),
                session_key: session_key.into(),
                throttle,
                state: Mutex::new(DeliveryState::default()),
            }),
        }
    }

    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.shared.run_id
    }

    /// Append reply text.
    pub fn push_chunk(&self, text: &str) {
        self.push(|state| state.text.push_str(text));
    }

    /// Append reasoning text.
    pub fn push_reasoning_chunk(&self, text: &str) {
        self.push(|state| state.reasoning.push_str(text));
    }

    fn push(&self, append: impl FnOnce(&mut DeliveryState)) {
        let mut state = self.shared.lock();
        if state.finished {
            return;
        }
        append(&mut *state);

        if state.timer.is_some() {
            state.dirty = true;
            return;
        }
        self.shared.emit(&mut state, ChatEventState::Delta, None);
        state.timer = Some(spawn_throttle_timer(Arc::clone(&self.shared)));
    }

    pub fn send_final(&self) {
        self.terminate(ChatEventState::Final, None);
    }

    pub fn send_error(&self, message: impl Into<String>) {
        self.terminate(ChatEventState::Error, Some(message.into()));
    }

    pub fn send_aborted(&self) {
        self.terminate(ChatEventState::Aborted, None);
    }

    fn terminate(&self, kind: ChatEventState, error: Option<String>) {
        let mut state = self.shared.lock();
        if state.finished {
            tracing::debug!(run_id = %self.shared.run_id, "Terminal event already sent");
            return;
        }
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.dirty = false;
        state.finished = true;
        self.shared.emit(&mut state, kind, error);
    }

    /// Cumulative reply text.
    #[must_use]
    pub fn buffer(&self) -> String {
        self.shared.lock().text.clone()
    }

    /// Cumulative reasoning text.
    #[must_use]
    pub fn reasoning_buffer(&self) -> String {
        self.shared.lock().reasoning.clone()
    }

    /// Last sequence number used.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.shared.lock().seq
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.shared.lock().finished
    }
}

impl Drop for StreamingDelivery {
    fn drop(&mut self) {
        if let Some(timer) = self.shared.lock().timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::protocol::ContentBlock;

    const THROTTLE: Duration = Duration::from_millis(150);

    fn delivery() -> (StreamingDelivery, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (StreamingDelivery::new(Arc::new(tx), "run-1", "webchat:dm:u1", THROTTLE), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Vec<ChatEventPayload> {
        let mut events = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            let event = match frame {
                Frame::Event(event) => event,
                other => panic!("expected event frame, got {other:?}"),
            };
            assert_eq!(event.event, CHAT_EVENT);
            let payload: ChatEventPayload = serde_json::from_value(event.payload.unwrap()).unwrap();
            assert_eq!(event.seq, Some(payload.seq));
            events.push(payload);
        }
        events
    }

    fn text_of(event: &ChatEventPayload) -> &str {
        event
            .message
            .as_ref()
            .and_then(|m| {
                m.content.iter().find_map(|block| match block {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    ContentBlock::Thinking { .. } => None,
                })
            })
            .unwrap_or_default()
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunks_in_window_then_final_emit_two_frames() {
        let (delivery, mut rx) = delivery();
        delivery.push_chunk("a");
        delivery.push_chunk("b");
        delivery.send_final();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!((events[0].seq, events[0].state), (1, ChatEventState::Delta));
        assert_eq!(text_of(&events[0]), "a");
        assert_eq!((events[1].seq, events[1].state), (2, ChatEventState::Final));
        assert_eq!(text_of(&events[1]), "ab");

        // The aborted timer never fires.
        tokio::time::sleep(THROTTLE * 3).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dirty_window_flushes_when_timer_fires() {
        let (delivery, mut rx) = delivery();
        delivery.push_chunk("a");
        delivery.push_chunk("b");
        delivery.push_chunk("c");

        tokio::time::sleep(THROTTLE + Duration::from_millis(1)).await;
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!(text_of(&events[1]), "abc");
        assert_eq!(events[1].state, ChatEventState::Delta);

        // A clean window closes the timer; the next chunk emits immediately.
        tokio::time::sleep(THROTTLE * 2).await;
        assert!(drain(&mut rx).is_empty());
        delivery.push_chunk("d");
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!((events[0].seq, text_of(&events[0])), (3, "abcd"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_is_gapless_through_terminal() {
        let (delivery, mut rx) = delivery();
        for chunk in ["one ", "two ", "three ", "four"] {
            delivery.push_chunk(chunk);
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        delivery.send_error("engine failed");

        let events = drain(&mut rx);
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        let expected: Vec<u64> = (1..=u64::try_from(events.len()).unwrap()).collect();
        assert_eq!(seqs, expected);

        let last = events.last().unwrap();
        assert_eq!(last.state, ChatEventState::Error);
        assert_eq!(last.error_message.as_deref(), Some("engine failed"));
        assert!(last.message.is_none());
        assert!(events[..events.len() - 1].iter().all(|e| e.state == ChatEventState::Delta));
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_first_terminal_is_sent() {
        let (delivery, mut rx) = delivery();
        delivery.push_chunk("partial");
        delivery.send_aborted();
        delivery.send_final();
        delivery.push_chunk("late");

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].state, ChatEventState::Aborted);
        assert_eq!(text_of(&events[1]), "partial");
        assert_eq!(delivery.buffer(), "partial");
        assert!(delivery.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reasoning_precedes_text() {
        let (delivery, mut rx) = delivery();
        delivery.push_reasoning_chunk("thinking");
        delivery.push_chunk("answer");
        delivery.send_final();

        let events = drain(&mut rx);
        let message = events.last().unwrap().message.clone().unwrap();
        assert_eq!(
            message.content,
            vec![
                ContentBlock::Thinking {
                    thinking: "thinking".into()
                },
                ContentBlock::Text {
                    text: "answer".into()
                },
            ]
        );
        // First delta had reasoning only, so an empty text block follows it.
        assert_eq!(events[0].message.as_ref().unwrap().content.len(), 2);
        assert_eq!(delivery.reasoning_buffer(), "thinking");
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_sink_is_swallowed() {
        let (delivery, rx) = delivery();
        drop(rx);
        delivery.push_chunk("a");
        delivery.push_chunk("b");
        delivery.send_final();

        assert_eq!(delivery.seq(), 2);
        assert_eq!(delivery.buffer(), "ab");
    }

    struct FlakySink {
        fail_next: AtomicBool,
        frames: Mutex<Vec<Frame>>,
    }

    impl FrameSink for FlakySink {
        fn send_frame(&self, frame: Frame) -> Result<(), SinkError> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(SinkError::Closed);
            }
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_does_not_retry_or_reset() {
        let sink = Arc::new(FlakySink {
            fail_next: AtomicBool::new(true),
            frames: Mutex::new(Vec::new()),
        });
        let delivery = StreamingDelivery::new(
            Arc::clone(&sink) as Arc<dyn FrameSink>,
            "run-1",
            "webchat:dm:u1",
            THROTTLE,
        );
        delivery.push_chunk("a");
        delivery.send_final();

        let frames = sink.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        let Frame::Event(event) = &frames[0] else {
            panic!("expected event frame");
        };
        assert_eq!(event.seq, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels_pending_timer() {
        let (delivery, mut rx) = delivery();
        delivery.push_chunk("a");
        delivery.push_chunk("b");
        drop(delivery);

        tokio::time::sleep(THROTTLE * 2).await;
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(text_of(&events[0]), "a");
    }
}
