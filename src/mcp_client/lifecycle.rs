//! Server lifecycle management.
//!
//! Each configured server gets one supervisor task that owns its transport:
//! it opens the transport, performs the handshake within the startup
//! timeout, publishes the server's tools while the connection is `Ready`,
//! and restarts it with exponential backoff when the connection drops or
//! startup fails. After the restart budget is spent the server stays down
//! until restarted by hand.
//!
//! Supervisors never share state with each other; a slow or crashing server
//! only affects its own task.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::config::{ServerDescriptor, TransportKind};
use super::connection::{handshake, Connection};
use super::errors::McpError;
use super::registry::SharedRegistry;
use super::transport::{self, TransportHandle};

// ─── Status & Events ─────────────────────────────────────────────────────────

/// Where a supervised server currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    /// Transport opening or handshake in progress.
    Starting,
    /// Connected; tools are in the registry.
    Ready,
    /// Waiting out the backoff before the next start attempt.
    Restarting,
    /// Restart budget exhausted. Stays here until restarted by hand.
    Failed,
    /// Stopped on request.
    Stopped,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Restarting => "restarting",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        };
        f.pad(s)
    }
}

/// Point-in-time view of one server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub transport: TransportKind,
    pub state: ServerState,
    /// Restart attempts made over the server's lifetime.
    pub restarts: u32,
    /// Tools currently published to the registry.
    pub tool_count: usize,
    pub last_error: Option<String>,
    /// When `state` last changed.
    pub since: DateTime<Utc>,
}

/// Lifecycle notifications for observability sinks.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    Started { server: String, tools: usize },
    StartupFailed { server: String, reason: String },
    ConnectionLost { server: String, reason: String },
    Restarting { server: String, attempt: u32, delay_ms: u64 },
    GaveUp { server: String, attempts: u32 },
    Stopped { server: String },
}

/// Buffered events per subscriber before old ones are dropped.
pub const EVENT_CAPACITY: usize = 256;

enum Control {
    Restart,
    Stop,
}

// ─── ServerHandle ────────────────────────────────────────────────────────────

/// The orchestrator's handle on one supervised server.
///
/// Dropping the handle stops the supervisor and releases the transport.
pub struct ServerHandle {
    name: String,
    call_timeout: Duration,
    current: Arc<RwLock<Option<Arc<Connection>>>>,
    status: watch::Receiver<ServerStatus>,
    control: mpsc::UnboundedSender<Control>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ServerHandle {
    /// Start supervising `descriptor`.
    ///
    /// The returned receiver resolves with the outcome of the first start
    /// attempt (tool count or the startup error). Later restarts happen in
    /// the background regardless.
    pub fn spawn(
        descriptor: ServerDescriptor,
        registry: Arc<SharedRegistry>,
        events: broadcast::Sender<ServerEvent>,
    ) -> (Self, oneshot::Receiver<Result<usize, McpError>>) {
        let (status_tx, status_rx) = watch::channel(ServerStatus {
            name: descriptor.name.clone(),
            transport: descriptor.transport_kind(),
            state: ServerState::Starting,
            restarts: 0,
            tool_count: 0,
            last_error: None,
            since: Utc::now(),
        });
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let current = Arc::new(RwLock::new(None));

        let name = descriptor.name.clone();
        let call_timeout = descriptor.call_timeout;
        let supervisor = Supervisor {
            descriptor,
            current: current.clone(),
            status: status_tx,
            registry,
            events,
        };
        let task = tokio::spawn(supervisor.run(control_rx, ready_tx));

        let handle = Self {
            name,
            call_timeout,
            current,
            status: status_rx,
            control: control_tx,
            task: Mutex::new(Some(task)),
        };
        (handle, ready_rx)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Default timeout for calls routed to this server.
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub fn status(&self) -> ServerStatus {
        self.status.borrow().clone()
    }

    /// Watch status changes.
    pub fn subscribe(&self) -> watch::Receiver<ServerStatus> {
        self.status.clone()
    }

    /// The live connection, if the server has one.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Tear down the current connection (if any) and start again with a
    /// fresh restart budget.
    pub fn restart(&self) -> Result<(), McpError> {
        self.control
            .send(Control::Restart)
            .map_err(|_| McpError::ServerUnavailable {
                name: self.name.clone(),
                state: ServerState::Stopped.to_string(),
            })
    }

    /// Stop the server gracefully and wait for its handles to be released.
    pub async fn stop(&self) {
        let _ = self.control.send(Control::Stop);
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

// ─── Supervisor ──────────────────────────────────────────────────────────────

struct Supervisor {
    descriptor: ServerDescriptor,
    current: Arc<RwLock<Option<Arc<Connection>>>>,
    status: watch::Sender<ServerStatus>,
    registry: Arc<SharedRegistry>,
    events: broadcast::Sender<ServerEvent>,
}

/// What ended a `Ready` period.
enum ReadyEnd {
    Lost,
    Restart,
    Stop,
}

impl Supervisor {
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    async fn run(
        self,
        mut control: mpsc::UnboundedReceiver<Control>,
        ready: oneshot::Sender<Result<usize, McpError>>,
    ) {
        let policy = self.descriptor.restart;
        let grace = self.descriptor.shutdown_grace;
        let mut ready = Some(ready);
        // Restart attempts since the budget was last reset.
        let mut attempts: u32 = 0;

        'supervise: loop {
            self.transition(ServerState::Starting, |_| {});

            let started = tokio::select! {
                started = self.start_once() => started,
                cmd = control.recv() => {
                    // Dropping the start future releases whatever it opened.
                    self.set_current(None);
                    match cmd {
                        Some(Control::Restart) => {
                            attempts = 0;
                            continue 'supervise;
                        }
                        Some(Control::Stop) | None => break 'supervise,
                    }
                }
            };

            match started {
                Ok((conn, mut handle)) => {
                    let tools = conn.tools();
                    let count = tools.len();
                    self.registry.publish(self.name(), tools);
                    self.transition(ServerState::Ready, |s| {
                        s.tool_count = count;
                        s.last_error = None;
                    });
                    tracing::info!(server = %self.name(), tools = count, "server ready");
                    self.emit(ServerEvent::Started {
                        server: self.name().to_string(),
                        tools: count,
                    });
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Ok(count));
                    }

                    let end = tokio::select! {
                        _ = conn.faulted() => ReadyEnd::Lost,
                        cmd = control.recv() => match cmd {
                            Some(Control::Restart) => ReadyEnd::Restart,
                            Some(Control::Stop) | None => ReadyEnd::Stop,
                        },
                    };

                    // Withdraw first so nothing new is routed here.
                    self.set_current(None);
                    self.registry.withdraw(self.name());

                    match end {
                        ReadyEnd::Lost => {
                            handle.shutdown(Duration::ZERO).await;
                            let reason = conn
                                .close_reason()
                                .unwrap_or_else(|| "connection closed".to_string());
                            tracing::warn!(server = %self.name(), reason = %reason, "connection lost");
                            self.emit(ServerEvent::ConnectionLost {
                                server: self.name().to_string(),
                                reason: reason.clone(),
                            });
                            self.status.send_modify(|s| {
                                s.tool_count = 0;
                                s.last_error = Some(reason);
                            });
                        }
                        ReadyEnd::Restart => {
                            tracing::info!(server = %self.name(), "manual restart requested");
                            handle.shutdown(grace).await;
                            attempts = 0;
                            continue 'supervise;
                        }
                        ReadyEnd::Stop => {
                            handle.shutdown(grace).await;
                            break 'supervise;
                        }
                    }
                }
                Err(e) => {
                    self.set_current(None);
                    let reason = e.to_string();
                    tracing::warn!(server = %self.name(), error = %reason, "server failed to start");
                    self.emit(ServerEvent::StartupFailed {
                        server: self.name().to_string(),
                        reason: reason.clone(),
                    });
                    self.status.send_modify(|s| s.last_error = Some(reason));
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Err(e));
                    }
                }
            }

            // ─── Backoff ─────────────────────────────────────────────────
            if attempts >= policy.max_attempts {
                let exhausted = McpError::RestartExhausted {
                    name: self.name().to_string(),
                    attempts,
                };
                tracing::error!(server = %self.name(), attempts, "restart attempts exhausted, giving up");
                self.emit(ServerEvent::GaveUp {
                    server: self.name().to_string(),
                    attempts,
                });
                self.transition(ServerState::Failed, |s| {
                    s.tool_count = 0;
                    s.last_error = Some(exhausted.to_string());
                });
                match control.recv().await {
                    Some(Control::Restart) => {
                        attempts = 0;
                        continue 'supervise;
                    }
                    Some(Control::Stop) | None => break 'supervise,
                }
            }

            let delay = policy.delay_for(attempts);
            attempts += 1;
            tracing::info!(
                server = %self.name(),
                attempt = attempts,
                max_attempts = policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "scheduling restart"
            );
            self.emit(ServerEvent::Restarting {
                server: self.name().to_string(),
                attempt: attempts,
                delay_ms: delay.as_millis() as u64,
            });
            self.transition(ServerState::Restarting, |s| {
                s.restarts += 1;
                s.tool_count = 0;
            });

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                cmd = control.recv() => match cmd {
                    Some(Control::Restart) => attempts = 0,
                    Some(Control::Stop) | None => break 'supervise,
                },
            }
        }

        self.set_current(None);
        self.registry.withdraw(self.name());
        self.transition(ServerState::Stopped, |s| s.tool_count = 0);
        tracing::info!(server = %self.name(), "server stopped");
        self.emit(ServerEvent::Stopped {
            server: self.name().to_string(),
        });
        if let Some(tx) = ready.take() {
            let _ = tx.send(Err(McpError::ServerUnavailable {
                name: self.name().to_string(),
                state: ServerState::Stopped.to_string(),
            }));
        }
    }

    /// Open the transport and complete the handshake inside one
    /// `startup_timeout` budget. On failure every opened handle is released
    /// before returning.
    async fn start_once(&self) -> Result<(Arc<Connection>, TransportHandle), McpError> {
        let name = self.name();
        let timeout = self.descriptor.startup_timeout;
        let deadline = tokio::time::Instant::now() + timeout;
        let timed_out = || format!("initialization timed out after {}ms", timeout.as_millis());

        let (conn, mut handle) =
            match tokio::time::timeout_at(deadline, transport::open(&self.descriptor)).await {
                Ok(opened) => opened?,
                Err(_) => {
                    return Err(McpError::StartupFailure {
                        name: name.to_string(),
                        reason: timed_out(),
                    })
                }
            };
        self.set_current(Some(conn.clone()));

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let failure = match tokio::time::timeout_at(deadline, handshake(&conn, remaining)).await {
            Ok(Ok(_)) => return Ok((conn, handle)),
            Ok(Err(e)) => e.to_string(),
            Err(_) => timed_out(),
        };

        self.set_current(None);
        handle.shutdown(Duration::ZERO).await;
        Err(McpError::StartupFailure {
            name: name.to_string(),
            reason: format!("{failure}{}", handle.diagnostics()),
        })
    }

    fn set_current(&self, conn: Option<Arc<Connection>>) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = conn;
    }

    fn transition(&self, state: ServerState, update: impl FnOnce(&mut ServerStatus)) {
        self.status.send_modify(|s| {
            if s.state != state {
                s.state = state;
                s.since = Utc::now();
            }
            update(s);
        });
    }

    fn emit(&self, event: ServerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::mcp_client::config::{Launch, RestartPolicy, SseLaunch, StdioLaunch};
    use std::collections::BTreeMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// A shell "server" that answers `initialize` (id 1) with one inline
    /// tool, then runs `after`.
    fn sh_server(name: &str, after: &str, restart: RestartPolicy) -> ServerDescriptor {
        let script = format!(
            r#"read line; echo '{{"jsonrpc":"2.0","id":1,"result":{{"tools":[{{"name":"ping"}}]}}}}'; read line; {after}"#
        );
        ServerDescriptor {
            name: name.to_string(),
            launch: Launch::Stdio(StdioLaunch {
                command: "sh".into(),
                args: vec!["-c".into(), script],
                env: BTreeMap::new(),
                cwd: None,
            }),
            startup_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_millis(100),
            restart,
        }
    }

    fn fast_restarts(max_attempts: u32) -> RestartPolicy {
        RestartPolicy {
            max_attempts,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        }
    }

    async fn wait_for_state(handle: &ServerHandle, state: ServerState) {
        let mut rx = handle.subscribe();
        tokio::time::timeout(Duration::from_secs(10), rx.wait_for(|s| s.state == state))
            .await
            .expect("state not reached in time")
            .expect("supervisor gone");
    }

    #[tokio::test]
    async fn test_start_publishes_tools_and_stop_withdraws() {
        let registry = Arc::new(SharedRegistry::new(None));
        let (events, mut events_rx) = broadcast::channel(EVENT_CAPACITY);
        let (handle, ready) = ServerHandle::spawn(
            sh_server("pinger", "sleep 30", fast_restarts(3)),
            registry.clone(),
            events,
        );

        assert_eq!(ready.await.unwrap().unwrap(), 1);
        assert_eq!(handle.status().state, ServerState::Ready);
        assert!(registry.snapshot().get("pinger.ping").is_some());
        assert!(handle.connection().is_some());

        handle.stop().await;
        assert_eq!(handle.status().state, ServerState::Stopped);
        assert!(registry.snapshot().is_empty());
        assert!(handle.connection().is_none());

        assert!(matches!(events_rx.recv().await.unwrap(), ServerEvent::Started { tools: 1, .. }));
        assert!(matches!(events_rx.recv().await.unwrap(), ServerEvent::Stopped { .. }));
    }

    #[tokio::test]
    async fn test_startup_timeout_reports_failure_and_gives_up() {
        let registry = Arc::new(SharedRegistry::new(None));
        let (events, mut events_rx) = broadcast::channel(EVENT_CAPACITY);
        let mut descriptor = sh_server("sleepy", "true", fast_restarts(0));
        descriptor.launch = Launch::Stdio(StdioLaunch {
            command: "sh".into(),
            args: vec!["-c".into(), "echo warming up >&2; sleep 30".into()],
            env: BTreeMap::new(),
            cwd: None,
        });
        descriptor.startup_timeout = Duration::from_millis(200);

        let (handle, ready) = ServerHandle::spawn(descriptor, registry.clone(), events);
        let err = ready.await.unwrap().unwrap_err();
        match err {
            McpError::StartupFailure { name, reason } => {
                assert_eq!(name, "sleepy");
                assert!(reason.contains("timed out"), "{reason}");
                assert!(reason.contains("warming up"), "{reason}");
            }
            other => panic!("expected StartupFailure, got {other:?}"),
        }

        wait_for_state(&handle, ServerState::Failed).await;
        assert!(registry.snapshot().is_empty());
        assert!(matches!(events_rx.recv().await.unwrap(), ServerEvent::StartupFailed { .. }));
        assert!(matches!(events_rx.recv().await.unwrap(), ServerEvent::GaveUp { attempts: 0, .. }));
        handle.stop().await;
    }

    /// An SSE endpoint that opens its stream after `delay` and never
    /// answers a POST.
    async fn slow_sse_server(delay: Duration) -> reqwest::Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    if buf[..n].starts_with(b"GET") {
                        tokio::time::sleep(delay).await;
                        let _ = socket
                            .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\n\r\nevent: endpoint\ndata: /messages\n\n")
                            .await;
                    }
                    tokio::time::sleep(Duration::from_secs(30)).await;
                });
            }
        });
        reqwest::Url::parse(&format!("http://{addr}/sse")).unwrap()
    }

    #[tokio::test]
    async fn test_connect_and_handshake_share_one_startup_budget() {
        let registry = Arc::new(SharedRegistry::new(None));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let mut descriptor = sh_server("remote", "true", fast_restarts(0));
        descriptor.launch = Launch::Sse(SseLaunch {
            url: slow_sse_server(Duration::from_millis(700)).await,
            headers: BTreeMap::new(),
        });
        descriptor.startup_timeout = Duration::from_secs(1);

        let started = std::time::Instant::now();
        let (handle, ready) = ServerHandle::spawn(descriptor, registry, events);
        let err = ready.await.unwrap().unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, McpError::StartupFailure { ref reason, .. } if reason.contains("timed out")), "{err}");
        assert!(elapsed < Duration::from_millis(1600), "startup took {elapsed:?}");
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_crash_after_ready_restarts_until_budget_spent() {
        let registry = Arc::new(SharedRegistry::new(None));
        let (events, mut events_rx) = broadcast::channel(EVENT_CAPACITY);
        let (handle, ready) = ServerHandle::spawn(
            sh_server("flaky", "exit 1", fast_restarts(2)),
            registry.clone(),
            events,
        );
        assert_eq!(ready.await.unwrap().unwrap(), 1);

        wait_for_state(&handle, ServerState::Failed).await;
        let status = handle.status();
        assert_eq!(status.restarts, 2);
        assert_eq!(status.tool_count, 0);
        assert!(status.last_error.unwrap().contains("restart attempts"));
        assert!(registry.snapshot().is_empty());

        let mut seen = Vec::new();
        while let Ok(event) = events_rx.try_recv() {
            seen.push(event);
        }
        let started = seen.iter().filter(|e| matches!(e, ServerEvent::Started { .. })).count();
        let lost = seen.iter().filter(|e| matches!(e, ServerEvent::ConnectionLost { .. })).count();
        assert_eq!(started, 3);
        assert_eq!(lost, 3);
        assert!(matches!(seen.last(), Some(ServerEvent::GaveUp { attempts: 2, .. })));

        // A manual restart resets the budget.
        handle.restart().unwrap();
        let mut rx = handle.subscribe();
        tokio::time::timeout(Duration::from_secs(10), rx.wait_for(|s| s.restarts > 2))
            .await
            .expect("no restart after manual restart")
            .expect("supervisor gone");
        handle.stop().await;
        assert!(handle.restart().is_err());
    }

    #[tokio::test]
    async fn test_spawn_failure_does_not_panic() {
        let registry = Arc::new(SharedRegistry::new(None));
        let (events, _rx) = broadcast::channel(EVENT_CAPACITY);
        let mut descriptor = sh_server("ghost", "true", fast_restarts(0));
        descriptor.launch = Launch::Stdio(StdioLaunch {
            command: "/no/such/server/binary".into(),
            args: vec![],
            env: BTreeMap::new(),
            cwd: None,
        });
        let (handle, ready) = ServerHandle::spawn(descriptor, registry, events);
        assert!(matches!(ready.await.unwrap(), Err(McpError::SpawnFailed { .. })));
        wait_for_state(&handle, ServerState::Failed).await;
        handle.stop().await;
        assert_eq!(handle.status().state, ServerState::Stopped);
    }
}
