//! Protocol loop: the worker's side of the coordinator protocol.
//!
//! Each pass reads everything the coordinator has sent and everything the
//! agent supervisor has finished, handles it, then waits at most one poll
//! interval. Acknowledgments go out before a task is handed to the
//! supervisor, so they never wait on the agent.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use taskfleet_core::{
    CompletionEvent, CompletionKind, ConnectionState, Message, RequestId, TaskAssignment, WorkerId,
};

use crate::bus::LoopEndpoint;
use crate::config::Config;
use crate::connection::{Connection, PROGRESS_INTERVAL};
use crate::error::WorkerError;
use crate::json_output;
use crate::shutdown::ShutdownTrigger;
use crate::signals::SignalCount;

/// Poll intervals of the active loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTiming {
    pub interval: Duration,
    /// Interval used right after a task request.
    pub fast_interval: Duration,
    pub fast_window: Duration,
}

impl From<&Config> for PollTiming {
    fn from(config: &Config) -> Self {
        Self {
            interval: config.poll_interval,
            fast_interval: config.fast_poll_interval,
            fast_window: config.fast_poll_window,
        }
    }
}

pub struct ProtocolLoop {
    conn: Connection,
    bus: LoopEndpoint,
    worker_id: WorkerId,
    state: ConnectionState,
    signals: SignalCount,
    signals_open: bool,
    signals_seen: usize,
    timing: PollTiming,
    /// Messages that arrived together with JOIN_ACK.
    backlog: VecDeque<Message>,
    /// Acknowledged tasks not yet handed to the supervisor.
    pending: VecDeque<TaskAssignment>,
    in_flight: Option<RequestId>,
    fast_until: Option<Instant>,
    joined: bool,
}

impl ProtocolLoop {
    pub fn new(
        conn: Connection,
        bus: LoopEndpoint,
        worker_id: WorkerId,
        signals: SignalCount,
        timing: PollTiming,
    ) -> Self {
        Self {
            conn,
            bus,
            worker_id,
            state: ConnectionState::Connecting,
            signals,
            signals_open: true,
            signals_seen: 0,
            timing,
            backlog: VecDeque::new(),
            pending: VecDeque::new(),
            in_flight: None,
            fast_until: None,
            joined: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Signal count at the moment shutdown began.
    pub fn signals_seen(&self) -> usize {
        self.signals_seen
    }

    /// Send JOIN and wait, without a timeout, for JOIN_ACK.
    ///
    /// Returns a trigger if a termination signal arrives while waiting.
    pub async fn handshake(&mut self) -> Result<Option<ShutdownTrigger>, WorkerError> {
        self.state.transition(ConnectionState::Joining)?;
        self.conn
            .send(&Message::join(&self.worker_id))
            .await
            .map_err(|e| WorkerError::Handshake(format!("failed to send JOIN: {}", e)))?;
        info!(worker_id = %self.worker_id, "JOIN sent, waiting for JOIN_ACK");

        let started = Instant::now();
        let mut progress = tokio::time::interval_at(started + PROGRESS_INTERVAL, PROGRESS_INTERVAL);

        loop {
            if let Some(trigger) = self.check_signals() {
                self.begin_shutdown(trigger);
                return Ok(Some(trigger));
            }

            let inbound = self
                .conn
                .receive()
                .map_err(|e| WorkerError::Handshake(e.to_string()))?;

            let mut messages = inbound.messages.into_iter();
            if let Some(first) = messages.next() {
                let Message::JoinAck { .. } = first else {
                    return Err(WorkerError::Handshake(format!(
                        "expected JOIN_ACK, got {}",
                        first.kind()
                    )));
                };
                self.backlog.extend(messages);
                self.state.transition(ConnectionState::Active)?;
                self.joined = true;

                let coordinator = self.conn.peer_addr().to_string();
                info!(
                    worker_id = %self.worker_id,
                    coordinator = %coordinator,
                    "Joined coordinator"
                );
                json_output::emit_worker_joined(self.worker_id.as_str(), &coordinator);
                return Ok(None);
            }

            if inbound.eof {
                return Err(WorkerError::Handshake(
                    "coordinator closed the connection".to_string(),
                ));
            }

            tokio::select! {
                ready = self.conn.readable() => {
                    ready.map_err(|e| WorkerError::Handshake(e.to_string()))?;
                }
                _ = progress.tick() => {
                    info!(waited_secs = started.elapsed().as_secs(), "Still waiting for JOIN_ACK");
                }
                changed = self.signals.changed(), if self.signals_open => {
                    if changed.is_err() {
                        self.signals_open = false;
                    }
                }
            }
        }
    }

    /// Serve the coordinator until something ends the session.
    pub async fn run(&mut self) -> ShutdownTrigger {
        info!(
            poll_interval_ms = self.timing.interval.as_millis() as u64,
            "Serving coordinator"
        );
        loop {
            if let Some(trigger) = self.poll_once().await {
                self.begin_shutdown(trigger);
                return trigger;
            }
            self.wait().await;
        }
    }

    async fn poll_once(&mut self) -> Option<ShutdownTrigger> {
        if let Some(trigger) = self.check_signals() {
            return Some(trigger);
        }

        let inbound = match self.conn.receive() {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!(error = %e, "Coordinator read failed");
                return Some(ShutdownTrigger::TransportLost);
            }
        };

        let mut messages: Vec<Message> = self.backlog.drain(..).collect();
        messages.extend(inbound.messages);
        for message in messages {
            if let Some(trigger) = self.dispatch(message).await {
                return Some(trigger);
            }
        }
        if inbound.eof {
            info!("Coordinator closed the connection");
            return Some(ShutdownTrigger::Disconnect);
        }

        if let Some(trigger) = self.report_completions().await {
            return Some(trigger);
        }
        self.forward_next().await
    }

    async fn dispatch(&mut self, message: Message) -> Option<ShutdownTrigger> {
        match message {
            Message::Check { req_id, .. } => {
                debug!(req_id = %req_id, "Health check");
                self.reply(Message::check_ack(req_id)).await
            }
            Message::Request { msg, req_id } => {
                if let Some(trigger) = self.reply(Message::request_ack(req_id.clone())).await {
                    return Some(trigger);
                }

                self.fast_until = Some(Instant::now() + self.timing.fast_window);
                info!(
                    req_id = %req_id,
                    prompt_len = msg.len(),
                    busy = self.in_flight.is_some(),
                    queued = self.pending.len(),
                    "Task request accepted"
                );
                json_output::emit_task_accepted(req_id.as_str(), self.pending.len());

                self.pending.push_back(TaskAssignment::new(req_id, msg));
                self.forward_next().await
            }
            Message::Disconnect { .. } => {
                info!("Coordinator requested disconnect");
                Some(ShutdownTrigger::Disconnect)
            }
            Message::JoinAck { .. } => {
                debug!("Ignoring repeated JOIN_ACK");
                None
            }
            other => {
                warn!(kind = other.kind(), "Ignoring unexpected message");
                None
            }
        }
    }

    /// Hand the next queued task to the supervisor if none is running.
    async fn forward_next(&mut self) -> Option<ShutdownTrigger> {
        while self.in_flight.is_none() {
            let task = self.pending.pop_front()?;
            let req_id = task.req_id.clone();

            match self.bus.forward(task.clone()) {
                Ok(()) => {
                    debug!(req_id = %req_id, "Task forwarded to agent supervisor");
                    self.in_flight = Some(req_id);
                }
                Err(e) => {
                    error!(req_id = %req_id, error = %e, "Cannot hand task to agent supervisor");
                    let report = CompletionEvent::new(CompletionKind::Failed, &task)
                        .into_report(&self.worker_id);
                    if let Some(trigger) = self.reply(report).await {
                        return Some(trigger);
                    }
                }
            }
        }
        None
    }

    async fn report_completions(&mut self) -> Option<ShutdownTrigger> {
        for event in self.bus.drain() {
            self.in_flight = None;
            let report = event.into_report(&self.worker_id);
            info!(kind = report.kind(), "Reporting task outcome");
            if let Some(trigger) = self.reply(report).await {
                return Some(trigger);
            }
        }
        None
    }

    async fn reply(&mut self, message: Message) -> Option<ShutdownTrigger> {
        match self.conn.send(&message).await {
            Ok(()) => None,
            Err(e) => {
                warn!(error = %e, kind = message.kind(), "Coordinator send failed");
                Some(ShutdownTrigger::TransportLost)
            }
        }
    }

    /// Wait one poll interval, or less if the coordinator sends something.
    async fn wait(&mut self) {
        let interval = self.current_interval();
        tokio::select! {
            _ = self.conn.readable() => {}
            _ = tokio::time::sleep(interval) => {}
            changed = self.signals.changed(), if self.signals_open => {
                if changed.is_err() {
                    self.signals_open = false;
                }
            }
        }
    }

    fn current_interval(&mut self) -> Duration {
        match self.fast_until {
            Some(until) if Instant::now() < until => self.timing.fast_interval,
            Some(_) => {
                self.fast_until = None;
                debug!("Fast polling window over");
                self.timing.interval
            }
            None => self.timing.interval,
        }
    }

    fn check_signals(&mut self) -> Option<ShutdownTrigger> {
        let count = *self.signals.borrow();
        if count > 0 {
            self.signals_seen = count;
            Some(ShutdownTrigger::Signal)
        } else {
            None
        }
    }

    fn begin_shutdown(&mut self, trigger: ShutdownTrigger) {
        if trigger != ShutdownTrigger::Signal {
            self.signals_seen = *self.signals.borrow();
        }
        if self.state.is_terminating() {
            return;
        }
        if let Err(e) = self.state.transition(ConnectionState::ShuttingDown) {
            warn!(error = %e, "Unexpected state at shutdown");
        }
        info!(trigger = %trigger, state = %self.state, "Leaving active service");
    }

    /// Ask the supervisor to stop after its current step.
    pub fn request_supervisor_exit(&self) {
        if let Err(e) = self.bus.request_exit() {
            debug!(error = %e, "Agent supervisor already stopped");
        }
    }

    /// Report finished tasks and fail the ones that never started.
    pub async fn flush_completions(&mut self) {
        if self.report_completions().await.is_some() {
            return;
        }
        while let Some(task) = self.pending.pop_front() {
            warn!(req_id = %task.req_id, "Abandoning queued task");
            let report =
                CompletionEvent::new(CompletionKind::Failed, &task).into_report(&self.worker_id);
            if self.reply(report).await.is_some() {
                return;
            }
        }
    }

    /// Tell the coordinator this worker is leaving. Best effort, and only
    /// once the coordinator has admitted it.
    pub async fn leave(&mut self) {
        if !self.joined || self.conn.is_broken() {
            return;
        }
        match self.conn.send(&Message::leave()).await {
            Ok(()) => info!(worker_id = %self.worker_id, "LEAVE sent"),
            Err(e) => debug!(error = %e, "Could not send LEAVE"),
        }
    }

    pub async fn close(&mut self) {
        if !self.state.is_terminating() {
            self.begin_shutdown(ShutdownTrigger::TransportLost);
        }
        self.conn.close().await;
        if self.state != ConnectionState::Closed {
            if let Err(e) = self.state.transition(ConnectionState::Closed) {
                warn!(error = %e, "Unexpected state at close");
            }
        }
    }
}
