//! Worker startup and lifetime.

use tracing::{debug, info};

use taskfleet_claude_sdk::{AgentBackend, ClaudeProcess, Preflight};
use taskfleet_core::WorkerId;

use crate::bus::{self, BUS_CAPACITY};
use crate::config::Config;
use crate::connection::Connection;
use crate::error::WorkerError;
use crate::protocol::{PollTiming, ProtocolLoop};
use crate::shutdown::{ShutdownCoordinator, ShutdownOutcome};
use crate::signals::{self, SignalCount};
use crate::supervisor::AgentSupervisor;

/// Check the backend, then serve the coordinator with a Claude Code agent.
pub async fn run(config: Config) -> Result<ShutdownOutcome, WorkerError> {
    let preflight = Preflight::from_env(config.claude_path.clone());
    run_with(config, &preflight, |key| std::env::var(key).ok()).await
}

/// [`run`] with an explicit preflight and environment lookup.
///
/// Nothing touches the network until the preflight has passed.
pub async fn run_with(
    config: Config,
    preflight: &Preflight,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<ShutdownOutcome, WorkerError> {
    let version = preflight.run(lookup).await?;
    info!(version = %version, root_dir = %config.root_dir.display(), "Agent backend ready");

    let signals = signals::listen()?;

    let mut backend =
        ClaudeProcess::new(config.claude_path.clone()).with_working_dir(config.root_dir.clone());
    if let Some(model) = config.model_tier.model_alias() {
        backend = backend.with_model(model);
    }

    serve(&config, backend, signals).await
}

/// Start the supervisor, join the coordinator and serve until shutdown.
pub async fn serve<B: AgentBackend + 'static>(
    config: &Config,
    backend: B,
    signals: SignalCount,
) -> Result<ShutdownOutcome, WorkerError> {
    let (loop_end, sup_end) = bus::channel(BUS_CAPACITY);
    let supervisor = AgentSupervisor::new(
        backend,
        config.model_tier,
        sup_end,
        config.clear_timeout,
        config.shutdown_grace,
    )
    .start()
    .await?;

    let conn = Connection::connect(&config.host, config.port)
        .await
        .map_err(|e| {
            supervisor.force_kill();
            e
        })?;
    let port = conn.local_port().map_err(|e| {
        supervisor.force_kill();
        WorkerError::Transport(e)
    })?;
    let worker_id = WorkerId::from_local_port(port);
    info!(worker_id = %worker_id, "Worker identity assigned");

    let mut protocol = ProtocolLoop::new(
        conn,
        loop_end,
        worker_id,
        signals.clone(),
        PollTiming::from(config),
    );

    let trigger = match protocol.handshake().await {
        Ok(Some(trigger)) => trigger,
        Ok(None) => protocol.run().await,
        Err(e) => {
            supervisor.force_kill();
            protocol.close().await;
            return Err(e);
        }
    };

    let mut shutdown = ShutdownCoordinator::new(signals, config.shutdown_grace);
    let outcome = shutdown.run(trigger, &mut protocol, supervisor).await;
    debug!(
        phase = ?shutdown.phase(),
        state = %protocol.state(),
        outcome = ?outcome,
        "Shutdown finished"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::CLEAR_COMMAND;
    use crate::testing::{Reply, ReplyKind, ScriptedBackend};
    use std::time::Duration;
    use taskfleet_claude_sdk::{ClaudePaths, PreflightError};
    use taskfleet_core::{ConnectionState, Message, RequestId};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::net::TcpListener;
    use tokio::sync::watch;
    use tokio::task::JoinHandle;

    /// The coordinator end of one worker session.
    struct FakeCoordinator {
        lines: Lines<BufReader<OwnedReadHalf>>,
        writer: OwnedWriteHalf,
        worker_port: u16,
    }

    impl FakeCoordinator {
        async fn accept(listener: &TcpListener) -> Self {
            let (socket, peer) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
                .await
                .unwrap()
                .unwrap();
            let (read, writer) = socket.into_split();
            Self {
                lines: BufReader::new(read).lines(),
                writer,
                worker_port: peer.port(),
            }
        }

        async fn send(&mut self, raw: &str) {
            self.writer.write_all(raw.as_bytes()).await.unwrap();
        }

        async fn next(&mut self) -> Option<Message> {
            let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
                .await
                .expect("worker went quiet")
                .ok()??;
            Some(serde_json::from_str(&line).unwrap())
        }

        async fn expect(&mut self) -> Message {
            self.next().await.expect("worker closed the session")
        }

        /// Accept the JOIN and acknowledge it.
        async fn admit(&mut self) {
            assert_eq!(
                self.expect().await,
                Message::Join {
                    msg: self.worker_port.to_string()
                }
            );
            self.send(r#"{"type":"JOIN_ACK","msg":""}"#).await;
        }
    }

    struct Harness {
        coordinator: FakeCoordinator,
        signal_tx: watch::Sender<usize>,
        worker: JoinHandle<Result<ShutdownOutcome, WorkerError>>,
    }

    impl Harness {
        async fn start(backend: ScriptedBackend, tweak: impl FnOnce(&mut Config)) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let mut config = Config {
                host: "127.0.0.1".to_string(),
                port: listener.local_addr().unwrap().port(),
                poll_interval: Duration::from_millis(20),
                shutdown_grace: Duration::from_secs(5),
                clear_timeout: Duration::from_secs(5),
                ..Config::default()
            };
            tweak(&mut config);

            let (signal_tx, signals) = watch::channel(0usize);
            let worker = tokio::spawn(async move { serve(&config, backend, signals).await });
            let coordinator = FakeCoordinator::accept(&listener).await;
            Self {
                coordinator,
                signal_tx,
                worker,
            }
        }

        fn signal(&self) {
            self.signal_tx.send_modify(|count| *count += 1);
        }

        async fn finish(self) -> Result<ShutdownOutcome, WorkerError> {
            tokio::time::timeout(Duration::from_secs(5), self.worker)
                .await
                .expect("worker did not exit")
                .unwrap()
        }
    }

    fn ack_ids(messages: &[Message]) -> Vec<(&'static str, String)> {
        messages
            .iter()
            .map(|m| {
                (
                    m.kind(),
                    m.req_id().map(|id| id.to_string()).unwrap_or_default(),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_check_and_request_then_disconnect() {
        let backend = ScriptedBackend::new();
        let log = backend.log();
        let mut h = Harness::start(backend, |_| {}).await;

        assert_eq!(
            h.coordinator.expect().await,
            Message::Join {
                msg: h.coordinator.worker_port.to_string()
            }
        );
        // JOIN_ACK and a CHECK in one write.
        h.coordinator
            .send(r#"{"type":"JOIN_ACK","msg":""}{"type":"CHECK","msg":"","req_id":"r1"}"#)
            .await;
        assert_eq!(
            h.coordinator.expect().await,
            Message::check_ack(RequestId::new("r1"))
        );

        h.coordinator
            .send("{\"type\":\"REQUEST\",\"msg\":\"say hello\",\"req_id\":\"r2\"}\n")
            .await;
        assert_eq!(
            h.coordinator.expect().await,
            Message::request_ack(RequestId::new("r2"))
        );
        assert_eq!(
            h.coordinator.expect().await,
            Message::Done {
                msg: "task_r2".to_string()
            }
        );

        h.coordinator.send(r#"{"type":"DISCONNECT","msg":""}"#).await;
        assert_eq!(h.coordinator.next().await, None);
        assert_eq!(h.finish().await.unwrap(), ShutdownOutcome::Graceful);
        assert_eq!(log.prompts(), vec!["say hello", CLEAR_COMMAND]);
    }

    #[tokio::test]
    async fn test_check_ack_within_poll_interval() {
        let mut h = Harness::start(ScriptedBackend::new(), |_| {}).await;
        h.coordinator.admit().await;

        let sent = tokio::time::Instant::now();
        h.coordinator
            .send(r#"{"type":"CHECK","msg":"","req_id":"r1"}"#)
            .await;
        assert_eq!(
            h.coordinator.expect().await,
            Message::check_ack(RequestId::new("r1"))
        );
        assert!(sent.elapsed() < Duration::from_millis(500));

        drop(h.coordinator);
        // EOF without a signal is a disconnect, which still exits cleanly.
        let outcome = tokio::time::timeout(Duration::from_secs(5), h.worker)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.unwrap(), ShutdownOutcome::Graceful);
    }

    #[tokio::test]
    async fn test_usage_limit_keeps_worker_connected() {
        let backend = ScriptedBackend::new().reply("expensive", Reply::new(ReplyKind::UsageLimit));
        let mut h = Harness::start(backend, |_| {}).await;
        h.coordinator.admit().await;
        let identity = h.coordinator.worker_port.to_string();

        h.coordinator
            .send(r#"{"type":"REQUEST","msg":"expensive","req_id":"r1"}"#)
            .await;
        assert_eq!(
            h.coordinator.expect().await,
            Message::request_ack(RequestId::new("r1"))
        );
        assert_eq!(
            h.coordinator.expect().await,
            Message::UsageLimited { msg: identity }
        );

        h.coordinator
            .send(r#"{"type":"CHECK","msg":"","req_id":"r2"}"#)
            .await;
        assert_eq!(
            h.coordinator.expect().await,
            Message::check_ack(RequestId::new("r2"))
        );

        h.coordinator
            .send(r#"{"type":"REQUEST","msg":"cheap","req_id":"r3"}"#)
            .await;
        h.coordinator.expect().await;
        assert_eq!(
            h.coordinator.expect().await,
            Message::Done {
                msg: "task_r3".to_string()
            }
        );

        h.coordinator.send(r#"{"type":"DISCONNECT","msg":""}"#).await;
        assert_eq!(h.finish().await.unwrap(), ShutdownOutcome::Graceful);
    }

    #[tokio::test]
    async fn test_second_request_acked_at_once_and_serialized() {
        let backend = ScriptedBackend::new()
            .reply("first", Reply::default().after(Duration::from_millis(300)));
        let log = backend.log();
        let mut h = Harness::start(backend, |_| {}).await;
        h.coordinator.admit().await;

        h.coordinator
            .send(concat!(
                r#"{"type":"REQUEST","msg":"first","req_id":"r1"}"#,
                "\n",
                r#"{"type":"REQUEST","msg":"second","req_id":"r2"}"#,
                "\n",
                r#"{"type":"CHECK","msg":"","req_id":"r3"}"#,
            ))
            .await;

        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(h.coordinator.expect().await);
        }
        assert_eq!(
            ack_ids(&seen),
            vec![
                ("REQUEST_ACK", "r1".to_string()),
                ("REQUEST_ACK", "r2".to_string()),
                ("CHECK_ACK", "r3".to_string()),
                ("DONE", String::new()),
                ("DONE", String::new()),
            ]
        );
        assert_eq!(
            seen[3],
            Message::Done {
                msg: "task_r1".to_string()
            }
        );
        assert_eq!(
            seen[4],
            Message::Done {
                msg: "task_r2".to_string()
            }
        );
        assert_eq!(
            log.prompts(),
            vec!["first", CLEAR_COMMAND, "second", CLEAR_COMMAND]
        );

        h.coordinator.send(r#"{"type":"DISCONNECT","msg":""}"#).await;
        h.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_during_clear_fails_queued_task() {
        let backend = ScriptedBackend::new()
            .reply(CLEAR_COMMAND, Reply::default().after(Duration::from_millis(400)));
        let log = backend.log();
        let mut h = Harness::start(backend, |_| {}).await;
        h.coordinator.admit().await;

        h.coordinator
            .send(concat!(
                r#"{"type":"REQUEST","msg":"first","req_id":"r1"}"#,
                "\n",
                r#"{"type":"REQUEST","msg":"second","req_id":"r2"}"#,
                "\n",
            ))
            .await;
        assert_eq!(
            h.coordinator.expect().await,
            Message::request_ack(RequestId::new("r1"))
        );
        assert_eq!(
            h.coordinator.expect().await,
            Message::request_ack(RequestId::new("r2"))
        );
        assert_eq!(
            h.coordinator.expect().await,
            Message::Done {
                msg: "task_r1".to_string()
            }
        );

        // r2 is now waiting behind the clear of r1.
        h.coordinator.send(r#"{"type":"DISCONNECT","msg":""}"#).await;
        assert_eq!(
            h.coordinator.expect().await,
            Message::Failed {
                msg: "task_r2".to_string()
            }
        );
        assert_eq!(h.coordinator.next().await, None);
        assert_eq!(h.finish().await.unwrap(), ShutdownOutcome::Graceful);
        assert_eq!(log.prompts(), vec!["first", CLEAR_COMMAND]);
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_messages_are_skipped() {
        let mut h = Harness::start(ScriptedBackend::new(), |_| {}).await;
        h.coordinator.admit().await;

        h.coordinator
            .send("garbage that is not json\n{\"type\":\"PING\",\"msg\":\"\"}\n{\"type\":\"CHECK\",\"msg\":\"\",\"req_id\":\"r9\"}\n")
            .await;
        assert_eq!(
            h.coordinator.expect().await,
            Message::check_ack(RequestId::new("r9"))
        );

        h.coordinator.send(r#"{"type":"DISCONNECT","msg":""}"#).await;
        h.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_mid_task_reports_failure() {
        let backend = ScriptedBackend::new()
            .reply("endless", Reply::default().after(Duration::from_secs(30)));
        let mut h = Harness::start(backend, |_| {}).await;
        h.coordinator.admit().await;

        h.coordinator
            .send(r#"{"type":"REQUEST","msg":"endless","req_id":"r1"}"#)
            .await;
        h.coordinator.expect().await;
        h.coordinator.send(r#"{"type":"DISCONNECT","msg":""}"#).await;

        assert_eq!(
            h.coordinator.expect().await,
            Message::Failed {
                msg: "task_r1".to_string()
            }
        );
        assert_eq!(h.coordinator.next().await, None);
        assert_eq!(h.finish().await.unwrap(), ShutdownOutcome::Graceful);
    }

    #[tokio::test]
    async fn test_signal_shutdown_sends_leave() {
        let mut h = Harness::start(ScriptedBackend::new(), |_| {}).await;
        h.coordinator.admit().await;
        h.coordinator
            .send(r#"{"type":"CHECK","msg":"","req_id":"r1"}"#)
            .await;
        h.coordinator.expect().await;

        h.signal();
        assert_eq!(h.coordinator.expect().await, Message::leave());
        assert_eq!(h.coordinator.next().await, None);
        assert_eq!(h.finish().await.unwrap(), ShutdownOutcome::Graceful);
    }

    #[tokio::test]
    async fn test_second_signal_forces_kill() {
        // The clear step cannot be interrupted by an exit instruction.
        let backend = ScriptedBackend::new()
            .reply(CLEAR_COMMAND, Reply::default().after(Duration::from_secs(30)));
        let mut h = Harness::start(backend, |config| {
            config.shutdown_grace = Duration::from_secs(60);
        })
        .await;
        h.coordinator.admit().await;

        h.coordinator
            .send(r#"{"type":"REQUEST","msg":"quick","req_id":"r1"}"#)
            .await;
        h.coordinator.expect().await;
        h.coordinator.expect().await;

        h.signal();
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.signal();

        let started = tokio::time::Instant::now();
        let Harness {
            mut coordinator,
            worker,
            ..
        } = h;
        let outcome = tokio::time::timeout(Duration::from_secs(2), worker)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.unwrap(), ShutdownOutcome::Forced);
        assert!(started.elapsed() < Duration::from_secs(2));
        // No LEAVE on the forced path.
        assert_eq!(coordinator.next().await, None);
    }

    #[tokio::test]
    async fn test_grace_expiry_kills_agent() {
        let backend = ScriptedBackend::new()
            .reply(CLEAR_COMMAND, Reply::default().after(Duration::from_secs(30)));
        let mut h = Harness::start(backend, |config| {
            config.shutdown_grace = Duration::from_millis(200);
        })
        .await;
        h.coordinator.admit().await;

        h.coordinator
            .send(r#"{"type":"REQUEST","msg":"quick","req_id":"r1"}"#)
            .await;
        h.coordinator.expect().await;
        h.coordinator.expect().await;

        h.signal();
        assert_eq!(h.coordinator.expect().await, Message::leave());
        assert_eq!(h.finish().await.unwrap(), ShutdownOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_signal_while_joining() {
        let mut h = Harness::start(ScriptedBackend::new(), |_| {}).await;
        h.coordinator.expect().await;

        h.signal();
        assert_eq!(h.coordinator.next().await, None);
        assert_eq!(h.finish().await.unwrap(), ShutdownOutcome::Graceful);
    }

    #[tokio::test]
    async fn test_handshake_rejected() {
        let backend = ScriptedBackend::new();
        let mut h = Harness::start(backend, |_| {}).await;
        h.coordinator.expect().await;
        h.coordinator
            .send(r#"{"type":"CHECK","msg":"","req_id":"r1"}"#)
            .await;

        let err = h.finish().await.unwrap_err();
        assert!(matches!(err, WorkerError::Handshake(_)));
    }

    #[tokio::test]
    async fn test_handshake_eof() {
        let h = Harness::start(ScriptedBackend::new(), |_| {}).await;
        let Harness {
            coordinator,
            worker,
            ..
        } = h;
        drop(coordinator);

        let result = tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(WorkerError::Handshake(_))));
    }

    #[tokio::test]
    async fn test_connect_refused_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = Config {
            host: "127.0.0.1".to_string(),
            port,
            ..Config::default()
        };
        let (_tx, signals) = watch::channel(0usize);
        let err = serve(&config, ScriptedBackend::new(), signals)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Connect { .. }));
    }

    #[tokio::test]
    async fn test_agent_start_failure_is_fatal() {
        let config = Config::default();
        let (_tx, signals) = watch::channel(0usize);
        let err = serve(&config, ScriptedBackend::new().failing_start(), signals)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Agent(_)));
    }

    fn preflight_in(dir: &std::path::Path, claude_path: &str) -> Preflight {
        Preflight::from_env(claude_path).with_paths(ClaudePaths {
            global_config: dir.join(".claude.json"),
            config_dir: dir.join(".claude"),
        })
    }

    async fn assert_never_connected(listener: &TcpListener) {
        let accepted =
            tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
        assert!(accepted.is_err(), "worker reached the coordinator");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unauthenticated_backend_fails_before_connecting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: listener.local_addr().unwrap().port(),
            ..Config::default()
        };
        let dir = tempfile::tempdir().unwrap();

        // `true` passes the install check but no login files exist.
        let err = run_with(config, &preflight_in(dir.path(), "true"), |_| None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Preflight(PreflightError::Unauthenticated(_))
        ));
        assert_never_connected(&listener).await;
    }

    #[tokio::test]
    async fn test_api_key_fails_before_connecting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: listener.local_addr().unwrap().port(),
            ..Config::default()
        };
        let dir = tempfile::tempdir().unwrap();

        let lookup = |key: &str| (key == "ANTHROPIC_API_KEY").then(|| "sk-ant-test".to_string());
        let err = run_with(config, &preflight_in(dir.path(), "claude"), lookup)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Preflight(PreflightError::ApiKeyCredential(_))
        ));
        assert_never_connected(&listener).await;
    }

    #[test]
    fn test_states_used_by_the_loop_are_legal() {
        let mut state = ConnectionState::default();
        for next in [
            ConnectionState::Joining,
            ConnectionState::Active,
            ConnectionState::ShuttingDown,
            ConnectionState::Closed,
        ] {
            state.transition(next).unwrap();
        }
    }
}
