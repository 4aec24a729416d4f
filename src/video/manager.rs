//! Pipeline and broadcast manager
//!
//! Owns every running pipeline session and every broadcast endpoint. A
//! session is keyed by its source (the simulation, a capture device or a
//! remote URL); starting a key that is already running replaces the old
//! pipeline unless the request is identical.
//!
//! ```text
//!   source ──stdout──▶ transcoder ──stdout──▶ hub ──▶ client 1..N
//!                          │
//!                          └──▶ recording.mp4
//! ```

use super::broadcast::{BroadcastHub, BroadcastListener};
use super::config::VideoConfig;
use super::ffmpeg::{build_transcoder_args, resolve_ffmpeg_path, TranscoderInput};
use super::process::{ExitReport, ProcessHandle, SpawnedProcess, StopSignal};
use super::source::{validate_device, validate_remote_url, SourceCommand};
use super::types::{
    PipelineEvent, ProcessRole, SessionInfo, SessionKey, SessionState, StartOutcome, VideoError,
    VideoResult,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{ChildStdout, Command};
use tokio::sync::broadcast;
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Parameters for starting the simulation pipeline
#[derive(Debug, Clone)]
pub struct SimulationStart {
    /// Resolved simulator command, see [`super::source::SimulatorLocator`]
    pub command: SourceCommand,
    pub recording_path: PathBuf,
    /// Broadcast port, `None` for the configured default
    pub port: Option<u16>,
}

/// What makes two start requests for the same key identical
#[derive(Debug, Clone, PartialEq, Eq)]
struct Fingerprint {
    source: Option<SourceCommand>,
    recording_path: PathBuf,
    port: u16,
}

struct PipelineSession {
    id: Uuid,
    key: SessionKey,
    fingerprint: Fingerprint,
    recording_path: PathBuf,
    ws_url: String,
    source: Option<ProcessHandle>,
    transcoder: Option<ProcessHandle>,
    stop_requested: Arc<AtomicBool>,
    started_at: DateTime<Utc>,
}

impl PipelineSession {
    fn is_running(&self) -> bool {
        self.transcoder.as_ref().map_or(false, |t| !t.has_exited())
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            key: self.key.clone(),
            state: SessionState::Running,
            recording_path: self.recording_path.clone(),
            ws_url: self.ws_url.clone(),
            source_pid: self.source.as_ref().and_then(ProcessHandle::pid),
            transcoder_pid: self.transcoder.as_ref().and_then(ProcessHandle::pid),
            started_at: self.started_at,
        }
    }
}

#[derive(Default)]
struct Registry {
    active: HashMap<SessionKey, PipelineSession>,
    /// Stopped sessions whose transcoder has not exited yet
    draining: HashMap<Uuid, SessionKey>,
}

/// State shared with the process watcher tasks
struct Shared {
    registry: Mutex<Registry>,
    event_tx: broadcast::Sender<PipelineEvent>,
    grace: Option<Duration>,
}

impl Shared {
    fn emit(&self, event: PipelineEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    fn emit_state(&self, key: &SessionKey, session_id: Uuid, state: SessionState) {
        tracing::debug!("Session {} ({}) -> {:?}", key, session_id, state);
        self.emit(PipelineEvent::StateChanged {
            key: key.clone(),
            session_id,
            state,
        });
    }

    fn handle_exit(
        &self,
        session_id: Uuid,
        key: &SessionKey,
        report: ExitReport,
        stop_requested: &AtomicBool,
    ) {
        let mut registry = self.registry.lock();
        let requested = stop_requested.load(Ordering::SeqCst);

        self.emit(PipelineEvent::ProcessExited {
            key: key.clone(),
            session_id,
            role: report.role,
            code: report.code,
            requested,
        });

        if report.role != ProcessRole::Transcoder {
            return;
        }

        if registry.draining.remove(&session_id).is_some() {
            if !registry.active.contains_key(key) {
                self.emit_state(key, session_id, SessionState::Idle);
            }
            return;
        }

        let is_current = registry
            .active
            .get(key)
            .map_or(false, |session| session.id == session_id);
        if !is_current {
            return;
        }
        let Some(mut session) = registry.active.remove(key) else {
            return;
        };

        session.stop_requested.store(true, Ordering::SeqCst);
        let err = VideoError::UnexpectedExit {
            process: ProcessRole::Transcoder,
            code: report.code,
        };
        tracing::error!("Session {} failed: {}", key, err);

        self.emit(PipelineEvent::Failed {
            key: key.clone(),
            session_id,
            message: err.to_string(),
        });
        self.emit_state(key, session_id, SessionState::Stopping);
        if let Some(source) = session.source.take() {
            source.terminate(StopSignal::Terminate, self.grace);
        }
        self.emit_state(key, session_id, SessionState::Idle);
    }
}

/// The broadcast endpoint of one session key. The hub outlives listener
/// restarts so a running session keeps feeding it.
struct Endpoint {
    /// Port as requested, 0 for ephemeral
    port: u16,
    hub: Arc<BroadcastHub>,
    listener: Option<BroadcastListener>,
}

impl Endpoint {
    fn bound_port(&self) -> Option<u16> {
        self.listener.as_ref().map(|l| l.local_addr().port())
    }

    /// Whether this endpoint holds the fixed port `port`
    fn holds(&self, port: u16) -> bool {
        port != 0 && (self.port == port || self.bound_port() == Some(port))
    }

    async fn close(&mut self) -> bool {
        match self.listener.take() {
            Some(listener) => {
                listener.close().await;
                true
            }
            None => false,
        }
    }
}

/// Starts, stops and supervises video pipelines
pub struct VideoManager {
    config: VideoConfig,
    ffmpeg_path: PathBuf,
    shared: Arc<Shared>,
    endpoints: tokio::sync::Mutex<HashMap<SessionKey, Endpoint>>,
    /// Serializes start and stop operations
    ops: tokio::sync::Mutex<()>,
}

impl VideoManager {
    pub fn new(config: VideoConfig) -> VideoResult<Self> {
        config.validate()?;
        let ffmpeg_path = resolve_ffmpeg_path(&config);
        tracing::info!("Using ffmpeg at {:?}", ffmpeg_path);

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            registry: Mutex::new(Registry::default()),
            event_tx,
            grace: config.stop_grace_period(),
        });

        Ok(Self {
            config,
            ffmpeg_path,
            shared,
            endpoints: tokio::sync::Mutex::new(HashMap::new()),
            ops: tokio::sync::Mutex::new(()),
        })
    }

    pub fn config(&self) -> &VideoConfig {
        &self.config
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.shared.event_tx.subscribe()
    }

    /// Start the simulator and pipe its raw frames through the transcoder
    pub async fn start_simulation(&self, start: SimulationStart) -> VideoResult<StartOutcome> {
        let port = start.port.unwrap_or(self.config.port);
        let fingerprint = Fingerprint {
            source: Some(start.command.clone()),
            recording_path: start.recording_path.clone(),
            port,
        };

        self.start_pipeline(
            SessionKey::Simulation,
            fingerprint,
            Some(start.command),
            TranscoderInput::Pipe,
        )
        .await
    }

    /// Start transcoding a local capture device
    ///
    /// The device is checked before any running pipeline is touched.
    pub async fn start_camera(
        &self,
        device_path: impl AsRef<Path>,
        recording_path: impl Into<PathBuf>,
        port: Option<u16>,
    ) -> VideoResult<StartOutcome> {
        let device = validate_device(device_path.as_ref())?;
        let fingerprint = Fingerprint {
            source: None,
            recording_path: recording_path.into(),
            port: port.unwrap_or(self.config.port),
        };

        self.start_pipeline(
            SessionKey::Camera(device.clone()),
            fingerprint,
            None,
            TranscoderInput::Device(device),
        )
        .await
    }

    /// Start transcoding a remote network stream
    pub async fn start_remote_stream(
        &self,
        url: &str,
        recording_path: impl Into<PathBuf>,
        port: Option<u16>,
    ) -> VideoResult<StartOutcome> {
        let remote = validate_remote_url(url)?;
        let fingerprint = Fingerprint {
            source: None,
            recording_path: recording_path.into(),
            port: port.unwrap_or(self.config.port),
        };

        self.start_pipeline(
            SessionKey::Remote(remote.url.to_string()),
            fingerprint,
            None,
            TranscoderInput::Remote(remote),
        )
        .await
    }

    async fn start_pipeline(
        &self,
        key: SessionKey,
        fingerprint: Fingerprint,
        source: Option<SourceCommand>,
        input: TranscoderInput,
    ) -> VideoResult<StartOutcome> {
        let _ops = self.ops.lock().await;

        let existing = {
            let registry = self.shared.registry.lock();
            registry
                .active
                .get(&key)
                .filter(|s| s.fingerprint == fingerprint && s.is_running())
                .map(|s| s.id)
        };
        if let Some(session_id) = existing {
            let (_, ws_url) = self.ensure_endpoint(&key, fingerprint.port).await?;
            tracing::info!("Session {} already running with the same parameters", key);
            return Ok(StartOutcome::AlreadyRunning { session_id, ws_url });
        }

        self.stop_session(&key);
        let (hub, ws_url) = self.ensure_endpoint(&key, fingerprint.port).await?;

        let session_id = Uuid::new_v4();
        self.shared
            .emit_state(&key, session_id, SessionState::Starting);

        let result = self.spawn_session(
            session_id,
            key.clone(),
            fingerprint,
            source,
            input,
            hub,
            ws_url.clone(),
        );
        match result {
            Ok(()) => {
                tracing::info!("Session {} started, streaming at {}", key, ws_url);
                Ok(StartOutcome::Started { session_id, ws_url })
            }
            Err(e) => {
                tracing::error!("Failed to start session {}: {}", key, e);
                self.shared.emit_state(&key, session_id, SessionState::Idle);
                Err(e)
            }
        }
    }

    /// Spawn both processes, wire their pipes and register the session
    ///
    /// The registry stays locked until the session is inserted so an
    /// immediate exit is always attributed to it.
    #[allow(clippy::too_many_arguments)]
    fn spawn_session(
        &self,
        id: Uuid,
        key: SessionKey,
        fingerprint: Fingerprint,
        source: Option<SourceCommand>,
        input: TranscoderInput,
        hub: Arc<BroadcastHub>,
        ws_url: String,
    ) -> VideoResult<()> {
        let stop_requested = Arc::new(AtomicBool::new(false));
        let mut registry = self.shared.registry.lock();

        let source = match source {
            Some(command) => {
                let mut cmd = Command::new(&command.program);
                cmd.args(&command.args)
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::inherit())
                    .kill_on_drop(true);
                Some(ProcessHandle::spawn(
                    ProcessRole::Source,
                    &mut cmd,
                    self.exit_handler(id, key.clone(), stop_requested.clone()),
                )?)
            }
            None => None,
        };

        let args = build_transcoder_args(&input, &fingerprint.recording_path, &self.config);
        tracing::debug!("Transcoder args: {:?}", args);
        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.args(&args)
            .stdin(match input {
                TranscoderInput::Pipe => Stdio::piped(),
                _ => Stdio::null(),
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let transcoder = match ProcessHandle::spawn(
            ProcessRole::Transcoder,
            &mut cmd,
            self.exit_handler(id, key.clone(), stop_requested.clone()),
        ) {
            Ok(transcoder) => transcoder,
            Err(e) => {
                if let Some(source) = source {
                    stop_requested.store(true, Ordering::SeqCst);
                    source.handle.kill();
                }
                return Err(e);
            }
        };

        let SpawnedProcess {
            handle: transcoder,
            stdin: transcoder_stdin,
            stdout: transcoder_stdout,
        } = transcoder;

        let source = source.map(|source| {
            let SpawnedProcess { handle, stdout, .. } = source;
            if let (Some(mut stdout), Some(mut stdin)) = (stdout, transcoder_stdin) {
                tokio::spawn(async move {
                    match tokio::io::copy(&mut stdout, &mut stdin).await {
                        Ok(bytes) => tracing::debug!("Source output closed after {} bytes", bytes),
                        Err(e) => tracing::debug!("Source pipe ended: {}", e),
                    }
                    // Dropping stdin here signals end of input to the transcoder
                });
            }
            handle
        });

        if let Some(stdout) = transcoder_stdout {
            tokio::spawn(relay_output(
                stdout,
                hub,
                self.config.read_chunk_size,
                stop_requested.clone(),
            ));
        }

        let recording_path = fingerprint.recording_path.clone();
        registry.active.insert(
            key.clone(),
            PipelineSession {
                id,
                key: key.clone(),
                fingerprint,
                recording_path,
                ws_url,
                source,
                transcoder: Some(transcoder),
                stop_requested,
                started_at: Utc::now(),
            },
        );
        self.shared.emit_state(&key, id, SessionState::Running);
        Ok(())
    }

    fn exit_handler(
        &self,
        session_id: Uuid,
        key: SessionKey,
        stop_requested: Arc<AtomicBool>,
    ) -> impl FnOnce(ExitReport) + Send + 'static {
        let shared = self.shared.clone();
        move |report| shared.handle_exit(session_id, &key, report, &stop_requested)
    }

    /// Signal both processes of the session under `key` and forget it
    ///
    /// Returns false when nothing was running.
    fn stop_session(&self, key: &SessionKey) -> bool {
        let mut registry = self.shared.registry.lock();
        let Some(mut session) = registry.active.remove(key) else {
            return false;
        };

        tracing::info!("Stopping session {} ({})", key, session.id);
        session.stop_requested.store(true, Ordering::SeqCst);
        self.shared
            .emit_state(key, session.id, SessionState::Stopping);

        if let Some(source) = session.source.take() {
            source.terminate(StopSignal::Terminate, self.shared.grace);
        }

        match session.transcoder.take() {
            Some(transcoder) if !transcoder.has_exited() => {
                registry.draining.insert(session.id, key.clone());
                // SIGINT lets the transcoder finalize the recording
                transcoder.terminate(StopSignal::Interrupt, self.shared.grace);
            }
            _ => self.shared.emit_state(key, session.id, SessionState::Idle),
        }
        true
    }

    /// Stop the session under `key`. Stopping an idle key does nothing.
    pub async fn stop_all(&self, key: &SessionKey) -> bool {
        let _ops = self.ops.lock().await;
        self.stop_session(key)
    }

    /// Stop every running session
    pub async fn stop_everything(&self) -> usize {
        let _ops = self.ops.lock().await;
        let keys: Vec<SessionKey> = self.shared.registry.lock().active.keys().cloned().collect();

        let mut stopped = 0;
        for key in &keys {
            if self.stop_session(key) {
                stopped += 1;
            }
        }
        stopped
    }

    /// Make sure the endpoint of `key` is listening and return its URL
    pub async fn ensure_server(&self, key: &SessionKey, port: u16) -> VideoResult<String> {
        let (_, ws_url) = self.ensure_endpoint(key, port).await?;
        Ok(ws_url)
    }

    /// Get or create the endpoint of `key` on `port`
    ///
    /// A fixed port held by another running session is refused. One held by
    /// an idle key is taken over.
    async fn ensure_endpoint(
        &self,
        key: &SessionKey,
        port: u16,
    ) -> VideoResult<(Arc<BroadcastHub>, String)> {
        let mut endpoints = self.endpoints.lock().await;

        let holders: Vec<SessionKey> = endpoints
            .iter()
            .filter(|(other, endpoint)| *other != key && endpoint.holds(port))
            .map(|(other, _)| other.clone())
            .collect();
        for holder in holders {
            let running = self.shared.registry.lock().active.contains_key(&holder);
            if running {
                return Err(VideoError::PortInUse {
                    port,
                    holder: holder.to_string(),
                });
            }
            if let Some(mut idle) = endpoints.remove(&holder) {
                tracing::debug!("Releasing port {} from idle {}", port, holder);
                idle.close().await;
            }
        }

        let endpoint = endpoints.entry(key.clone()).or_insert_with(|| Endpoint {
            port,
            hub: Arc::new(BroadcastHub::new(
                self.config.client_queue_depth,
                self.shared.event_tx.clone(),
            )),
            listener: None,
        });
        if endpoint.port != port {
            endpoint.close().await;
            endpoint.port = port;
        }

        let ws_url = match endpoint.listener {
            Some(ref listener) => listener.ws_url(),
            None => {
                let listener =
                    BroadcastListener::bind(&self.config.bind_host, port, endpoint.hub.clone())
                        .await?;
                let ws_url = listener.ws_url();
                endpoint.listener = Some(listener);
                ws_url
            }
        };

        Ok((endpoint.hub.clone(), ws_url))
    }

    /// Close the listener bound to `port` and disconnect its clients
    ///
    /// A running session keeps transcoding; its output reaches clients
    /// again once its endpoint is served.
    pub async fn stop_server(&self, port: u16) -> bool {
        let mut endpoints = self.endpoints.lock().await;
        let Some(endpoint) = endpoints
            .values_mut()
            .find(|e| e.bound_port() == Some(port))
        else {
            return false;
        };
        endpoint.close().await
    }

    /// Stop every session and every listener
    pub async fn shutdown(&self) {
        let stopped = self.stop_everything().await;
        let mut endpoints = self.endpoints.lock().await;
        for endpoint in endpoints.values_mut() {
            endpoint.close().await;
        }
        tracing::info!("Video manager shut down ({} sessions stopped)", stopped);
    }

    /// Connected clients on the endpoint of `key`
    pub async fn client_count(&self, key: &SessionKey) -> usize {
        self.endpoints
            .lock()
            .await
            .get(key)
            .map_or(0, |e| e.hub.client_count())
    }

    pub fn state(&self, key: &SessionKey) -> SessionState {
        let registry = self.shared.registry.lock();
        if registry.active.contains_key(key) {
            SessionState::Running
        } else if registry.draining.values().any(|k| k == key) {
            SessionState::Stopping
        } else {
            SessionState::Idle
        }
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.shared
            .registry
            .lock()
            .active
            .values()
            .map(PipelineSession::info)
            .collect()
    }
}

/// Read transcoder output and hand each chunk to the hub
async fn relay_output(
    mut stdout: ChildStdout,
    hub: Arc<BroadcastHub>,
    chunk_size: usize,
    stop_requested: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; chunk_size];
    let mut total: u64 = 0;

    loop {
        let n = match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("Failed to read transcoder output: {}", e);
                break;
            }
        };
        total += n as u64;

        // Keep draining after a stop so the transcoder can finish its recording
        if stop_requested.load(Ordering::SeqCst) {
            continue;
        }
        hub.broadcast(Bytes::copy_from_slice(&buf[..n]));
    }

    tracing::debug!("Transcoder output closed after {} bytes", total);
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use futures_util::{Stream, StreamExt};
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::{tempdir, TempDir};
    use tokio::sync::broadcast::error::RecvError;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::{Error as WsError, Message};

    /// Stand-in transcoder: copies its input to both the recording and stdout
    const FAKE_FFMPEG: &str = r#"#!/bin/sh
rec=""
input=""
prev=""
for arg in "$@"; do
  case "$prev" in
    -y) rec="$arg" ;;
    -i) input="$arg" ;;
  esac
  prev="$arg"
done
if [ "$input" = "pipe:0" ]; then
  exec tee "$rec"
fi
tee "$rec" < "$input"
exec sleep 30
"#;

    const STUBBORN_FFMPEG: &str = "#!/bin/sh\ntrap '' INT TERM\nexec sleep 30\n";

    const FAILING_FFMPEG: &str = "#!/bin/sh\nexit 1\n";

    fn script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, body).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn manager(ffmpeg: PathBuf, grace: Option<u64>) -> VideoManager {
        VideoManager::new(VideoConfig {
            ffmpeg_path: Some(ffmpeg),
            port: 0,
            stop_grace_period_ms: grace,
            ..Default::default()
        })
        .unwrap()
    }

    fn sh_source(body: &str) -> SourceCommand {
        SourceCommand::new("/bin/sh", vec!["-c".to_string(), body.to_string()])
    }

    /// Emits `letter` forever in 512-byte bursts
    fn endless(letter: char) -> SourceCommand {
        sh_source(&format!(
            "while true; do head -c 512 /dev/zero | tr '\\0' {}; sleep 0.05; done",
            letter
        ))
    }

    fn simulation(command: SourceCommand, dir: &TempDir) -> SimulationStart {
        SimulationStart {
            command,
            recording_path: dir.path().join("recording.mp4"),
            port: Some(0),
        }
    }

    async fn wait_for<F>(rx: &mut broadcast::Receiver<PipelineEvent>, pred: F) -> PipelineEvent
    where
        F: Fn(&PipelineEvent) -> bool,
    {
        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => panic!("event channel closed"),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(10), wait)
            .await
            .expect("timed out waiting for event")
    }

    async fn wait_for_clients(manager: &VideoManager, key: &SessionKey, count: usize) {
        for _ in 0..500 {
            if manager.client_count(key).await == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} clients", count);
    }

    fn port_of(ws_url: &str) -> u16 {
        ws_url.rsplit(':').next().unwrap().parse().unwrap()
    }

    async fn read_bytes<S>(client: &mut S, want: usize) -> Vec<u8>
    where
        S: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        let mut out = Vec::new();
        while out.len() < want {
            let message = tokio::time::timeout(Duration::from_secs(10), client.next())
                .await
                .expect("timed out reading stream")
                .expect("stream ended")
                .unwrap();
            if let Message::Binary(data) = message {
                out.extend(data);
            }
        }
        out
    }

    fn transcoder_exit(session_id: Uuid) -> impl Fn(&PipelineEvent) -> bool {
        move |event| {
            matches!(event, PipelineEvent::ProcessExited { session_id: id, role: ProcessRole::Transcoder, .. } if *id == session_id)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_simulation_streams_and_records_in_order() {
        let dir = tempdir().unwrap();
        let manager = manager(script(&dir, "ffmpeg", FAKE_FFMPEG), Some(2000));
        let mut events = manager.subscribe();

        // Give the client time to connect before the first frame
        let source = sh_source(
            "sleep 1; for c in a b c d e f g h i j; do head -c 1024 /dev/zero | tr '\\0' $c; sleep 0.1; done; exec sleep 30",
        );
        let outcome = manager
            .start_simulation(simulation(source, &dir))
            .await
            .unwrap();
        assert!(matches!(outcome, StartOutcome::Started { .. }));
        assert_eq!(manager.state(&SessionKey::Simulation), SessionState::Running);

        let (mut client, _) = connect_async(outcome.ws_url()).await.unwrap();
        wait_for_clients(&manager, &SessionKey::Simulation, 1).await;

        let received = read_bytes(&mut client, 10 * 1024).await;
        let expected: Vec<u8> = b"abcdefghij"
            .iter()
            .flat_map(|c| std::iter::repeat(*c).take(1024))
            .collect();
        assert_eq!(received, expected);

        assert!(manager.stop_all(&SessionKey::Simulation).await);
        let exit = wait_for(&mut events, transcoder_exit(outcome.session_id())).await;
        assert!(matches!(exit, PipelineEvent::ProcessExited { requested: true, .. }));

        let recording = fs::read(dir.path().join("recording.mp4")).unwrap();
        assert_eq!(recording.len(), 10 * 1024);
        assert_eq!(manager.state(&SessionKey::Simulation), SessionState::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_camera_records_device_input() {
        let dir = tempdir().unwrap();
        let manager = manager(script(&dir, "ffmpeg", FAKE_FFMPEG), Some(2000));
        let device = dir.path().join("video0");
        fs::write(&device, b"frames").unwrap();
        let recording = dir.path().join("camera.mp4");

        manager
            .start_camera(&device, &recording, Some(0))
            .await
            .unwrap();
        let key = SessionKey::Camera(device.clone());
        assert_eq!(manager.state(&key), SessionState::Running);
        assert_eq!(manager.sessions()[0].key, key);

        for _ in 0..500 {
            if fs::read(&recording).map_or(false, |r| r == b"frames") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(fs::read(&recording).unwrap(), b"frames");

        manager.shutdown().await;
        assert!(manager.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_missing_device_leaves_state_idle() {
        let dir = tempdir().unwrap();
        let manager = manager(script(&dir, "ffmpeg", FAKE_FFMPEG), Some(2000));
        let device = dir.path().join("video7");

        let result = manager
            .start_camera(&device, dir.path().join("out.mp4"), Some(0))
            .await;
        assert!(matches!(result, Err(VideoError::DeviceUnavailable(_))));
        let key = SessionKey::Camera(device);
        assert_eq!(manager.state(&key), SessionState::Idle);
        assert_eq!(manager.client_count(&key).await, 0);
    }

    #[tokio::test]
    async fn test_invalid_remote_url_is_rejected_before_spawn() {
        let dir = tempdir().unwrap();
        let manager = manager(script(&dir, "ffmpeg", FAKE_FFMPEG), Some(2000));

        let result = manager
            .start_remote_stream("ftp://camera.local/live", dir.path().join("out.mp4"), Some(0))
            .await;
        assert!(matches!(result, Err(VideoError::InvalidUrl(_))));
        assert!(manager.sessions().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_restart_replaces_previous_pipeline() {
        let dir = tempdir().unwrap();
        let manager = manager(script(&dir, "ffmpeg", FAKE_FFMPEG), Some(2000));
        let mut events = manager.subscribe();

        let first = manager
            .start_simulation(simulation(endless('a'), &dir))
            .await
            .unwrap();
        let second = manager
            .start_simulation(simulation(endless('b'), &dir))
            .await
            .unwrap();
        assert!(matches!(second, StartOutcome::Started { .. }));
        assert_ne!(first.session_id(), second.session_id());
        assert_eq!(first.ws_url(), second.ws_url());

        let exit = wait_for(&mut events, transcoder_exit(first.session_id())).await;
        assert!(matches!(exit, PipelineEvent::ProcessExited { requested: true, .. }));
        assert_eq!(manager.state(&SessionKey::Simulation), SessionState::Running);

        let (mut client, _) = connect_async(second.ws_url()).await.unwrap();
        let received = read_bytes(&mut client, 2048).await;
        assert!(received.iter().all(|b| *b == b'b'));

        manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_identical_request_is_already_running() {
        let dir = tempdir().unwrap();
        let manager = manager(script(&dir, "ffmpeg", FAKE_FFMPEG), Some(2000));

        let first = manager
            .start_simulation(simulation(endless('a'), &dir))
            .await
            .unwrap();
        let again = manager
            .start_simulation(simulation(endless('a'), &dir))
            .await
            .unwrap();

        assert!(matches!(again, StartOutcome::AlreadyRunning { .. }));
        assert_eq!(again.session_id(), first.session_id());
        assert_eq!(manager.sessions().len(), 1);

        manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_disconnecting_client_does_not_affect_others() {
        let dir = tempdir().unwrap();
        let manager = manager(script(&dir, "ffmpeg", FAKE_FFMPEG), Some(2000));
        let outcome = manager
            .start_simulation(simulation(endless('a'), &dir))
            .await
            .unwrap();

        let (mut leaving, _) = connect_async(outcome.ws_url()).await.unwrap();
        let (mut staying, _) = connect_async(outcome.ws_url()).await.unwrap();
        wait_for_clients(&manager, &SessionKey::Simulation, 2).await;

        read_bytes(&mut leaving, 512).await;
        read_bytes(&mut staying, 512).await;

        let _ = leaving.close(None).await;
        drop(leaving);
        wait_for_clients(&manager, &SessionKey::Simulation, 1).await;

        let more = read_bytes(&mut staying, 2048).await;
        assert!(more.iter().all(|b| *b == b'a'));

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_stopped_server_refuses_connections() {
        let dir = tempdir().unwrap();
        let manager = manager(script(&dir, "ffmpeg", FAKE_FFMPEG), Some(2000));

        let key = SessionKey::Simulation;

        let ws_url = manager.ensure_server(&key, 0).await.unwrap();
        assert_eq!(manager.ensure_server(&key, 0).await.unwrap(), ws_url);
        let (_client, _) = connect_async(ws_url.as_str()).await.unwrap();
        wait_for_clients(&manager, &key, 1).await;

        let port = port_of(&ws_url);
        assert!(manager.stop_server(port).await);
        assert_eq!(manager.client_count(&key).await, 0);
        assert!(connect_async(ws_url.as_str()).await.is_err());
        assert!(!manager.stop_server(port).await);

        let reopened = manager.ensure_server(&key, 0).await.unwrap();
        assert!(connect_async(reopened.as_str()).await.is_ok());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_all_is_idempotent() {
        let dir = tempdir().unwrap();
        let manager = manager(script(&dir, "ffmpeg", FAKE_FFMPEG), Some(2000));

        assert!(!manager.stop_all(&SessionKey::Simulation).await);
        assert!(!manager.stop_all(&SessionKey::Simulation).await);
        assert_eq!(manager.stop_everything().await, 0);
        assert_eq!(manager.state(&SessionKey::Simulation), SessionState::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_transcoder_spawn_failure_kills_source() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path().join("missing-ffmpeg"), Some(2000));
        let mut events = manager.subscribe();

        let result = manager
            .start_simulation(simulation(endless('a'), &dir))
            .await;
        assert!(matches!(
            result,
            Err(VideoError::ProcessSpawn {
                process: ProcessRole::Transcoder,
                ..
            })
        ));
        assert_eq!(manager.state(&SessionKey::Simulation), SessionState::Idle);

        let exit = wait_for(&mut events, |e| {
            matches!(e, PipelineEvent::ProcessExited { role: ProcessRole::Source, .. })
        })
        .await;
        assert!(matches!(exit, PipelineEvent::ProcessExited { requested: true, .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unexpected_transcoder_exit_fails_session() {
        let dir = tempdir().unwrap();
        let manager = manager(script(&dir, "ffmpeg", FAILING_FFMPEG), Some(2000));
        let mut events = manager.subscribe();

        let outcome = manager
            .start_simulation(simulation(endless('a'), &dir))
            .await
            .unwrap();

        let failed = wait_for(&mut events, |e| matches!(e, PipelineEvent::Failed { .. })).await;
        match failed {
            PipelineEvent::Failed {
                session_id,
                message,
                ..
            } => {
                assert_eq!(session_id, outcome.session_id());
                assert!(message.contains("transcoder exited unexpectedly"));
            }
            _ => unreachable!(),
        }

        wait_for(&mut events, |e| {
            matches!(e, PipelineEvent::StateChanged { state: SessionState::Idle, .. })
        })
        .await;
        assert_eq!(manager.state(&SessionKey::Simulation), SessionState::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stubborn_transcoder_is_force_killed() {
        let dir = tempdir().unwrap();
        let manager = manager(script(&dir, "ffmpeg", STUBBORN_FFMPEG), Some(300));
        let mut events = manager.subscribe();

        let outcome = manager
            .start_simulation(simulation(endless('a'), &dir))
            .await
            .unwrap();
        // Let the script install its trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        manager.stop_all(&SessionKey::Simulation).await;
        assert_eq!(manager.state(&SessionKey::Simulation), SessionState::Stopping);

        wait_for(&mut events, transcoder_exit(outcome.session_id())).await;
        wait_for(&mut events, |e| {
            matches!(e, PipelineEvent::StateChanged { state: SessionState::Idle, .. })
        })
        .await;
        assert_eq!(manager.state(&SessionKey::Simulation), SessionState::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_sessions_stream_separately() {
        let dir = tempdir().unwrap();
        let manager = manager(script(&dir, "ffmpeg", FAKE_FFMPEG), Some(2000));

        let sim = manager
            .start_simulation(simulation(endless('a'), &dir))
            .await
            .unwrap();
        let (mut viewer, _) = connect_async(sim.ws_url()).await.unwrap();
        wait_for_clients(&manager, &SessionKey::Simulation, 1).await;

        let device = dir.path().join("video0");
        fs::write(&device, vec![b'b'; 4096]).unwrap();
        let camera = manager
            .start_camera(&device, dir.path().join("camera.mp4"), Some(0))
            .await
            .unwrap();
        assert_ne!(camera.ws_url(), sim.ws_url());
        assert_eq!(manager.sessions().len(), 2);

        let camera_key = SessionKey::Camera(device);
        let (_camera_viewer, _) = connect_async(camera.ws_url()).await.unwrap();
        wait_for_clients(&manager, &camera_key, 1).await;
        assert_eq!(manager.client_count(&SessionKey::Simulation).await, 1);

        let received = read_bytes(&mut viewer, 8192).await;
        assert!(received.iter().all(|b| *b == b'a'));

        manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fixed_port_held_by_running_session_is_refused() {
        let dir = tempdir().unwrap();
        let manager = manager(script(&dir, "ffmpeg", FAKE_FFMPEG), Some(2000));
        let device = dir.path().join("video0");
        fs::write(&device, b"frames").unwrap();

        let sim = manager
            .start_simulation(simulation(endless('a'), &dir))
            .await
            .unwrap();
        let port = port_of(sim.ws_url());

        let result = manager
            .start_camera(&device, dir.path().join("camera.mp4"), Some(port))
            .await;
        match result {
            Err(VideoError::PortInUse { port: p, holder }) => {
                assert_eq!(p, port);
                assert_eq!(holder, "simulation");
            }
            other => panic!("expected PortInUse, got {:?}", other),
        }
        assert_eq!(manager.state(&SessionKey::Simulation), SessionState::Running);

        // Once the simulation is idle its port can be taken over
        manager.stop_all(&SessionKey::Simulation).await;
        let camera = manager
            .start_camera(&device, dir.path().join("camera.mp4"), Some(port))
            .await
            .unwrap();
        assert_eq!(port_of(camera.ws_url()), port);

        manager.shutdown().await;
    }
}
