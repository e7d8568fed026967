//! Session Mediator
//!
//! One tokio task per live session. Utterances arrive on a bounded FIFO channel and are
//! handled strictly one at a time, so a session never runs two pipelines at once.
//! Events leave through a single outbound channel in stage-completion order. Closing
//! the session flips a watch flag; the loop checks it before every queued utterance and
//! the emitter checks it before every send.

use crate::pipeline::Pipeline;
use crate::session::classify::{classify, Intent, HELP_TEXT};
use crate::session::events::{OutboundEvent, SqlResultPayload};
use crate::session::registry::SessionRegistry;
use crate::session::state::{SessionPhase, SessionState};
use crate::error::Result;
use crate::translator::Utterance;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued,
    /// The queue was full; a busy error event was emitted instead.
    Busy,
    Closed,
}

/// Cloneable input side of a session.
#[derive(Clone)]
pub struct SessionSender {
    session_id: Uuid,
    inbound: mpsc::Sender<String>,
    outbound: mpsc::Sender<OutboundEvent>,
    close: Arc<watch::Sender<bool>>,
    queue_depth: usize,
}

impl SessionSender {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn submit(&self, text: impl Into<String>) -> SubmitOutcome {
        if *self.close.borrow() {
            return SubmitOutcome::Closed;
        }
        match self.inbound.try_send(text.into()) {
            Ok(()) => SubmitOutcome::Queued,
            Err(TrySendError::Full(_)) => {
                warn!(session_id = %self.session_id, queue_depth = self.queue_depth, "Session queue full; utterance rejected");
                let _ = self.outbound.try_send(OutboundEvent::busy(self.queue_depth));
                SubmitOutcome::Busy
            }
            Err(TrySendError::Closed(_)) => SubmitOutcome::Closed,
        }
    }

    /// Disconnect: queued utterances are cancelled and nothing more is emitted.
    pub fn close(&self) {
        self.close.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.close.borrow()
    }
}

pub struct SessionHandle {
    pub id: Uuid,
    pub sender: SessionSender,
    pub events: mpsc::Receiver<OutboundEvent>,
    pub task: JoinHandle<()>,
}

pub struct Mediator {
    pipeline: Arc<Pipeline>,
    registry: SessionRegistry,
    queue_depth: usize,
}

impl Mediator {
    pub fn new(pipeline: Arc<Pipeline>, queue_depth: usize) -> Self {
        Self {
            pipeline,
            registry: SessionRegistry::new(),
            queue_depth: queue_depth.max(1),
        }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Opens a session and spawns its task. The first event is the connect status.
    pub fn connect(&self) -> SessionHandle {
        let id = Uuid::new_v4();
        let (inbound_tx, inbound_rx) = mpsc::channel(self.queue_depth);
        let (outbound_tx, outbound_rx) = mpsc::channel(EVENT_BUFFER);
        let (close_tx, close_rx) = watch::channel(false);
        self.registry.register(id);

        let session = Session {
            state: SessionState::new(id),
            pipeline: self.pipeline.clone(),
            registry: self.registry.clone(),
            inbound: inbound_rx,
            emitter: Emitter {
                session_id: id,
                tx: outbound_tx.clone(),
                closed: close_rx,
            },
        };
        let task = tokio::spawn(session.run());

        SessionHandle {
            id,
            sender: SessionSender {
                session_id: id,
                inbound: inbound_tx,
                outbound: outbound_tx,
                close: Arc::new(close_tx),
                queue_depth: self.queue_depth,
            },
            events: outbound_rx,
            task,
        }
    }
}

struct Emitter {
    session_id: Uuid,
    tx: mpsc::Sender<OutboundEvent>,
    closed: watch::Receiver<bool>,
}

impl Emitter {
    fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.tx.is_closed()
    }

    async fn emit(&self, event: OutboundEvent) {
        if self.is_closed() {
            debug!(session_id = %self.session_id, event = event.name(), "Session closed; event discarded");
            return;
        }
        if self.tx.send(event).await.is_err() {
            debug!(session_id = %self.session_id, "Event receiver gone");
        }
    }
}

struct Session {
    state: SessionState,
    pipeline: Arc<Pipeline>,
    registry: SessionRegistry,
    inbound: mpsc::Receiver<String>,
    emitter: Emitter,
}

impl Session {
    async fn run(mut self) {
        let session_id = self.state.session_id;
        info!(session_id = %session_id, "Session opened");
        self.announce().await;

        let mut closed = self.emitter.closed.clone();
        loop {
            tokio::select! {
                biased;
                changed = closed.changed() => {
                    if changed.is_err() || *closed.borrow() {
                        break;
                    }
                }
                next = self.inbound.recv() => match next {
                    Some(text) => {
                        if self.emitter.is_closed() {
                            break;
                        }
                        self.handle(text).await;
                    }
                    None => break,
                },
            }
        }

        self.state.phase = SessionPhase::Closed;
        self.inbound.close();
        let mut cancelled = 0usize;
        while self.inbound.try_recv().is_ok() {
            cancelled += 1;
        }
        self.registry.remove(&session_id);
        info!(session_id = %session_id, cancelled, "Session closed");
    }

    async fn announce(&self) {
        let mut text = String::from("Connected to SQL Genie.");
        if !self.pipeline.model_configured() {
            text.push_str(" Warning: the language model is not configured, so questions cannot be answered.");
        }
        if self.pipeline.database_ready().await {
            text.push_str(" Type '/sql your question' for database queries, or '/help' for usage.");
        } else {
            text.push_str(" Error: database connection not established.");
        }
        self.emitter.emit(OutboundEvent::Status(text)).await;
    }

    async fn handle(&mut self, text: String) {
        self.state.touch();
        match classify(&text, self.pipeline.schema()) {
            Intent::Help => {
                self.emitter
                    .emit(OutboundEvent::Message(HELP_TEXT.to_string()))
                    .await
            }
            Intent::Chat(message) => {
                let event = match self.pipeline.reply(&message).await {
                    Ok(reply) => OutboundEvent::Chat(reply),
                    Err(e) => {
                        warn!(session_id = %self.state.session_id, category = e.category(), error = %e, "Chat reply failed");
                        OutboundEvent::error(&e)
                    }
                };
                self.emitter.emit(event).await;
            }
            Intent::Query(question) => self.answer(question).await,
        }
    }

    async fn answer(&mut self, question: String) {
        let started = Instant::now();
        self.state.pending_query = Some(question.clone());
        let outcome = self.run_pipeline(&question).await;
        let stage = self.state.phase;
        self.state.pending_query = None;
        self.state.phase = SessionPhase::Idle;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(Some(payload)) => {
                info!(session_id = %self.state.session_id, rows = payload.row_count, elapsed_ms, "Question answered");
                self.emitter.emit(OutboundEvent::SqlResult(payload)).await;
            }
            Ok(None) => {
                debug!(session_id = %self.state.session_id, %stage, "Session closed mid-pipeline; result discarded")
            }
            Err(e) => {
                warn!(
                    session_id = %self.state.session_id,
                    %stage,
                    category = e.category(),
                    error = %e,
                    elapsed_ms,
                    "Pipeline failed"
                );
                self.emitter.emit(OutboundEvent::error(&e)).await;
            }
        }
    }

    /// `Ok(None)` when the session closed between stages.
    async fn run_pipeline(&mut self, question: &str) -> Result<Option<SqlResultPayload>> {
        let utterance = Utterance::new(self.state.session_id, question);

        self.enter(SessionPhase::Translating).await;
        let candidate = self.pipeline.translate(&utterance).await?;
        if self.emitter.is_closed() {
            return Ok(None);
        }

        self.enter(SessionPhase::Guarding).await;
        let query = self.pipeline.check(&candidate)?;
        if self.emitter.is_closed() {
            return Ok(None);
        }

        self.enter(SessionPhase::Executing).await;
        let result = self.pipeline.execute(&query).await?;
        if self.emitter.is_closed() {
            return Ok(None);
        }

        Ok(Some(self.pipeline.payload(&query, result)))
    }

    async fn enter(&mut self, phase: SessionPhase) {
        debug!(session_id = %self.state.session_id, from = %self.state.phase, to = %phase, "Stage transition");
        self.state.phase = phase;
        if let Some(text) = phase.status_text() {
            self.emitter.emit(OutboundEvent::Status(text.to_string())).await;
        }
    }
}
