//! Session control plane.
//!
//! A session binds one engine process to one shared-memory ring and fans the
//! engine's frames out to any number of subscribers. The session performs
//! the handshake when it is created, owns the shared memory for its whole
//! life, and guarantees teardown (engine reaped, name unlinked, subscribers
//! closed) on every exit path, including engine crashes.
//!
//! All mutation of control state happens on the cooperative scheduler; the
//! only lock held across a suspension point is the async mutex serializing
//! outbound commands.

use std::collections::HashMap;
use std::io;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::process::{Child, Command as ProcessCommand};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use std::{env, fmt};

use log::{debug, warn};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::channel::{
    AsyncEndpoint, COMM_FD_ENV, SLOT_FD_ENV, SlotReceiver, seqpacket_pair, set_cloexec, slot_pair,
};
use crate::error::{Error, Result};
use crate::proto::{Command, MAX_MESSAGE_SIZE, MessageFlags, Reply, SlotRecord};
use crate::shm::{SLOT_COUNT, SharedRing, unlink_name};
use crate::sink::FrameSink;
use crate::skeleton::SkeletonDescriptor;

/// Default engine frame cadence.
pub const DEFAULT_FPS: u32 = 60;

/// Environment variable overriding the engine binary path.
pub const ENGINE_PATH_ENV: &str = "POSED_ENGINE";

/// Default handshake deadline: the engine must report `InitSuccess` within
/// this unless the launcher overrides it.
const INIT_DEADLINE: Duration = Duration::from_secs(10);

/// Grace period between asking the engine to stop and force-killing it.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Validated session identifier: 1..=64 characters of `[A-Za-z0-9_-]`, safe
/// for use as a shared-memory name suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Validate and take ownership of an id chosen by the caller.
    pub fn parse(raw: &str) -> Result<SessionId> {
        if raw.is_empty() || raw.len() > 64 {
            return Err(Error::InvalidInput(format!(
                "session id must be 1..=64 characters, got {}",
                raw.len()
            )));
        }
        if !raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(Error::InvalidInput(format!(
                "session id '{raw}' contains characters outside [A-Za-z0-9_-]"
            )));
        }
        Ok(SessionId(raw.to_owned()))
    }

    /// The id as given by the caller.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Shared-memory name for a session, unique per machine.
pub(crate) fn shm_name(id: &SessionId) -> String {
    format!("/posed-{id}")
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Engine spawned, handshake in flight.
    Initializing,
    /// Handshake done, no subscribers yet.
    Ready,
    /// At least one subscriber has been attached.
    Streaming,
    /// `close()` in progress.
    Closing,
    /// Fully torn down.
    Closed,
    /// The engine was lost; the session is unusable but still inspectable.
    Failed,
}

/// Handle returned by [`Session::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// Lifecycle state slot, created before the engine is spawned so the
/// `Initializing` phase (and a failure out of it) is observable while
/// `create` is still in flight.
pub(crate) type StateCell = Arc<Mutex<SessionState>>;

/// Fresh cell in the `Initializing` state.
pub(crate) fn new_state_cell() -> StateCell {
    Arc::new(Mutex::new(SessionState::Initializing))
}

/// Spawns `posed-engine` processes. The binary is located through
/// [`ENGINE_PATH_ENV`], next to the current executable, or on `PATH`, in
/// that order.
#[derive(Debug, Clone)]
pub struct EngineLauncher {
    binary: PathBuf,
    target_fps: u32,
    init_deadline: Duration,
}

impl EngineLauncher {
    /// Locate the engine binary with the default search order.
    pub fn detect() -> EngineLauncher {
        let binary = match env::var_os(ENGINE_PATH_ENV) {
            Some(path) => PathBuf::from(path),
            None => env::current_exe()
                .ok()
                .and_then(|exe| {
                    let candidate = exe.parent()?.join("posed-engine");
                    candidate.is_file().then_some(candidate)
                })
                .unwrap_or_else(|| PathBuf::from("posed-engine")),
        };
        EngineLauncher {
            binary,
            target_fps: DEFAULT_FPS,
            init_deadline: INIT_DEADLINE,
        }
    }

    /// Use an explicit engine binary.
    pub fn with_binary(binary: impl Into<PathBuf>) -> EngineLauncher {
        EngineLauncher {
            binary: binary.into(),
            target_fps: DEFAULT_FPS,
            init_deadline: INIT_DEADLINE,
        }
    }

    /// Override the engine frame cadence.
    pub fn target_fps(mut self, fps: u32) -> EngineLauncher {
        self.target_fps = fps.max(1);
        self
    }

    /// Override the handshake deadline (default 10 s).
    pub fn init_deadline(mut self, deadline: Duration) -> EngineLauncher {
        self.init_deadline = deadline;
        self
    }

    fn spawn(
        &self,
        id: &SessionId,
        kind: &str,
        source: &str,
        command_fd: i32,
        slot_fd: i32,
    ) -> io::Result<Child> {
        ProcessCommand::new(&self.binary)
            .arg("--session")
            .arg(id.as_str())
            .arg("--kind")
            .arg(kind)
            .arg("--source")
            .arg(source)
            .arg("--fps")
            .arg(self.target_fps.to_string())
            .env(COMM_FD_ENV, command_fd.to_string())
            .env(SLOT_FD_ENV, slot_fd.to_string())
            .spawn()
    }
}

impl Default for EngineLauncher {
    fn default() -> Self {
        EngineLauncher::detect()
    }
}

/// State shared between the session handle and its broadcast task. The
/// state cell predates the session itself; see [`StateCell`].
struct Shared {
    id: SessionId,
    state: StateCell,
    subscribers: AsyncMutex<HashMap<u64, Box<dyn FrameSink>>>,
    engine: Mutex<Option<Child>>,
    ring: SharedRing,
}

/// One streaming session. Created through
/// [`SessionRegistry`](crate::registry::SessionRegistry).
pub struct Session {
    shared: Arc<Shared>,
    kind: String,
    source: String,
    skeleton: SkeletonDescriptor,
    frame_bytes: u32,
    engine_pid: u32,
    command: AsyncMutex<AsyncEndpoint>,
    broadcast: Mutex<Option<JoinHandle<()>>>,
    destroy: Mutex<Option<oneshot::Sender<()>>>,
    next_subscription: AtomicU64,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("frame_bytes", &self.frame_bytes)
            .finish()
    }
}

impl Session {
    /// Spawn an engine, run the handshake, allocate the ring, and start the
    /// broadcast task. Inputs are validated by the registry before the
    /// lifecycle starts. On any failure the state cell is marked `Failed`,
    /// the engine is reaped, and the ring (if it was created) unlinked
    /// before the error is returned.
    pub(crate) async fn create(
        id: SessionId,
        kind: &str,
        source: &str,
        launcher: &EngineLauncher,
        state: StateCell,
    ) -> Result<Arc<Session>> {
        match Session::create_inner(id, kind, source, launcher, state.clone()).await {
            Ok(session) => Ok(session),
            Err(err) => {
                *state.lock() = SessionState::Failed;
                Err(err)
            }
        }
    }

    async fn create_inner(
        id: SessionId,
        kind: &str,
        source: &str,
        launcher: &EngineLauncher,
        state: StateCell,
    ) -> Result<Arc<Session>> {
        let (cmd_parent, cmd_child) = seqpacket_pair()?;
        let (slot_parent, slot_child) = slot_pair()?;
        let child = launcher.spawn(
            &id,
            kind,
            source,
            cmd_child.as_raw_fd(),
            slot_child.as_raw_fd(),
        )?;
        let engine_pid = child.id();
        drop(cmd_child);
        drop(slot_child);
        // Keep our ends out of engines spawned for other sessions.
        let _ = set_cloexec(cmd_parent.as_raw_fd());
        let _ = set_cloexec(slot_parent.as_raw_fd());
        debug!("[{id}] engine spawned as pid {engine_pid}");

        let handshake = async {
            let command = AsyncEndpoint::new(cmd_parent)?;
            let slots = SlotReceiver::new(slot_parent)?;
            let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
            let n = match timeout(launcher.init_deadline, command.recv(&mut buf)).await {
                Err(_) => return Err(Error::InitTimeout),
                Ok(received) => received?,
            };
            if n == 0 {
                return Err(Error::EngineLost);
            }
            match Reply::decode(&buf[..n]).map_err(io::Error::from)? {
                Reply::InitSuccess {
                    frame_bytes,
                    skeleton,
                } => {
                    if frame_bytes < 64 {
                        return Err(Error::Io(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("engine advertised {frame_bytes} frame bytes"),
                        )));
                    }
                    skeleton.validate().map_err(|reason| {
                        Error::Io(io::Error::new(io::ErrorKind::InvalidData, reason))
                    })?;
                    Ok((command, slots, frame_bytes, skeleton))
                }
                Reply::InitFailure { reason } => Err(Error::InitFailure(reason)),
                Reply::Ack { .. } => Err(Error::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "unexpected ack during handshake",
                ))),
            }
        };
        let (command, slots, frame_bytes, skeleton) = match handshake.await {
            Ok(parts) => parts,
            Err(err) => {
                kill_and_reap(child).await;
                return Err(err);
            }
        };

        let ring = match create_ring(&id, frame_bytes) {
            Ok(ring) => ring,
            Err(err) => {
                kill_and_reap(child).await;
                return Err(err.into());
            }
        };
        let set_shm = Command::SetShm {
            name: shm_name(&id),
        };
        if let Err(err) = command.send(&set_shm.encode(MessageFlags::empty())).await {
            kill_and_reap(child).await;
            return Err(err.into());
        }

        *state.lock() = SessionState::Ready;
        let shared = Arc::new(Shared {
            id,
            state,
            subscribers: AsyncMutex::new(HashMap::new()),
            engine: Mutex::new(Some(child)),
            ring,
        });
        let (destroy_tx, destroy_rx) = oneshot::channel();
        let task = tokio::spawn(broadcast_loop(shared.clone(), slots, destroy_rx));

        Ok(Arc::new(Session {
            shared,
            kind: kind.to_owned(),
            source: source.to_owned(),
            skeleton,
            frame_bytes,
            engine_pid,
            command: AsyncMutex::new(command),
            broadcast: Mutex::new(Some(task)),
            destroy: Mutex::new(Some(destroy_tx)),
            next_subscription: AtomicU64::new(1),
        }))
    }

    /// The session's id.
    pub fn id(&self) -> &SessionId {
        &self.shared.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.shared.state.lock()
    }

    /// Animator kind the session was created with.
    pub fn animator_kind(&self) -> &str {
        &self.kind
    }

    /// Motion source reference the session was created with.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Pid of the engine process.
    pub fn engine_pid(&self) -> u32 {
        self.engine_pid
    }

    /// Cached handshake data: the skeleton and the frame byte size.
    pub fn describe(&self) -> (&SkeletonDescriptor, u32) {
        (&self.skeleton, self.frame_bytes)
    }

    /// Attach a subscriber. The first subscriber moves the session from
    /// `Ready` to `Streaming`.
    pub async fn subscribe(&self, sink: Box<dyn FrameSink>) -> Result<SubscriptionId> {
        {
            let mut state = self.shared.state.lock();
            match *state {
                SessionState::Ready | SessionState::Initializing => {
                    *state = SessionState::Streaming
                }
                SessionState::Streaming => {}
                SessionState::Closing | SessionState::Closed => return Err(Error::ClosedSession),
                SessionState::Failed => return Err(Error::EngineLost),
            }
        }
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.shared.subscribers.lock().await.insert(id, sink);
        debug!("[{}] subscriber {id} attached", self.shared.id);
        Ok(SubscriptionId(id))
    }

    /// Detach a subscriber. Idempotent; unknown handles are ignored.
    pub async fn unsubscribe(&self, subscription: SubscriptionId) {
        let removed = self
            .shared
            .subscribers
            .lock()
            .await
            .remove(&subscription.0);
        if removed.is_some() {
            debug!("[{}] subscriber {} detached", self.shared.id, subscription.0);
        }
    }

    /// Change playback speed. Fire and forget.
    pub async fn set_speed(&self, value: f32) -> Result<()> {
        self.send_command(Command::SetSpeed { value }).await
    }

    /// Pause playback; the engine keeps producing frames with a frozen
    /// cursor. Fire and forget.
    pub async fn pause(&self) -> Result<()> {
        self.send_command(Command::Pause).await
    }

    /// Resume playback at the pre-pause speed. Fire and forget.
    pub async fn resume(&self) -> Result<()> {
        self.send_command(Command::Resume).await
    }

    /// Move the playback cursor to `time` seconds. Fire and forget.
    pub async fn seek(&self, time: f32) -> Result<()> {
        self.send_command(Command::Seek { time }).await
    }

    async fn send_command(&self, command: Command) -> Result<()> {
        match self.state() {
            SessionState::Closing | SessionState::Closed => return Err(Error::ClosedSession),
            SessionState::Failed => return Err(Error::EngineLost),
            _ => {}
        }
        let endpoint = self.command.lock().await;
        endpoint.send(&command.encode(MessageFlags::empty())).await?;
        Ok(())
    }

    /// Tear the session down: ask the engine to stop, force-kill it after
    /// the grace period, cancel the broadcast task, close remaining
    /// subscribers, and unlink the shared memory. Idempotent.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            match *state {
                SessionState::Closing | SessionState::Closed => return Ok(()),
                _ => *state = SessionState::Closing,
            }
        }
        debug!("[{}] closing", self.shared.id);

        // Best effort; the engine may already be gone.
        {
            let endpoint = self.command.lock().await;
            let _ = endpoint
                .send(&Command::Shutdown.encode(MessageFlags::empty()))
                .await;
        }

        let destroy = self.destroy.lock().take();
        if let Some(tx) = destroy {
            let _ = tx.send(());
        }
        let task = self.broadcast.lock().take();
        if let Some(mut task) = task {
            // A subscriber stuck in a send could keep the task from seeing
            // the destroy signal; it does not get to hold up teardown.
            if timeout(CLOSE_GRACE, &mut task).await.is_err() {
                task.abort();
                let _ = task.await;
            }
        }

        let child = self.shared.engine.lock().take();
        if let Some(child) = child {
            reap_with_grace(child, CLOSE_GRACE).await;
        }

        let mut subscribers = self.shared.subscribers.lock().await;
        for (_, sink) in subscribers.drain() {
            sink.closed().await;
        }
        drop(subscribers);

        self.shared.ring.unlink();
        *self.shared.state.lock() = SessionState::Closed;
        debug!("[{}] closed", self.shared.id);
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let child = self.shared.engine.lock().take();
        if let Some(mut child) = child {
            warn!(
                "[{}] session dropped without close; killing engine {}",
                self.shared.id, self.engine_pid
            );
            let _ = child.kill();
            let _ = child.wait();
            self.shared.ring.unlink();
        }
    }
}

fn create_ring(id: &SessionId, frame_bytes: u32) -> io::Result<SharedRing> {
    let name = shm_name(id);
    match SharedRing::create(&name, frame_bytes) {
        Err(err) if err.raw_os_error() == Some(libc::EEXIST) => {
            // Leftover from a crashed run; the id was free in the registry,
            // so nothing live can be using the name.
            warn!("unlinking stale shm region {name}");
            unlink_name(&name);
            SharedRing::create(&name, frame_bytes)
        }
        other => other,
    }
}

/// SIGKILL the engine and reap it off the scheduler.
async fn kill_and_reap(mut child: Child) {
    let _ = child.kill();
    let _ = tokio::task::spawn_blocking(move || child.wait()).await;
}

/// Wait for the engine to exit on its own, force-killing it when the grace
/// period runs out.
async fn reap_with_grace(mut child: Child, grace: Duration) {
    let pid = child.id();
    let mut waiter = tokio::task::spawn_blocking(move || child.wait());
    match timeout(grace, &mut waiter).await {
        Ok(_) => {}
        Err(_) => {
            warn!("engine {pid} still running after {grace:?}; killing");
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
            let _ = waiter.await;
        }
    }
}

/// The broadcast task: convert published slot records into subscriber
/// sends. Runs until the session is closed or the engine goes away; drains
/// the slot channel even with zero subscribers so the producer never sees
/// backpressure.
async fn broadcast_loop(
    shared: Arc<Shared>,
    slots: SlotReceiver,
    mut destroy: oneshot::Receiver<()>,
) {
    let mut last_seq = 0u64;
    loop {
        let record = tokio::select! {
            _ = &mut destroy => break,
            received = slots.recv() => match received {
                Ok(Some(record)) => record,
                Ok(None) => {
                    engine_lost(&shared).await;
                    break;
                }
                Err(err) => {
                    warn!("[{}] slot channel failed: {err}", shared.id);
                    engine_lost(&shared).await;
                    break;
                }
            },
        };
        if record.slot >= SLOT_COUNT {
            warn!("[{}] ignoring out-of-range slot {}", shared.id, record.slot);
            continue;
        }
        // Frames may be skipped under lag but never reordered.
        if record.seq <= last_seq {
            continue;
        }
        last_seq = record.seq;
        fan_out(&shared, record).await;
    }
    debug!("[{}] broadcast task finished", shared.id);
}

/// Send one published slot to every subscriber. Returns `false` when the
/// view went stale part-way: the generation is checked before each send and
/// re-checked after it returns, so a rewrite that overlaps an in-flight send
/// is detected rather than silently passed over. Bytes already handed to a
/// sink cannot be recalled; the incident is logged, the view abandoned for
/// the remaining subscribers, and the next record carries fresh data.
async fn fan_out(shared: &Shared, record: SlotRecord) -> bool {
    let mut subscribers = shared.subscribers.lock().await;
    if subscribers.is_empty() {
        return true;
    }
    let mut failed: SmallVec<[u64; 4]> = SmallVec::new();
    let mut intact = true;
    for (&id, sink) in subscribers.iter() {
        // The engine came back around to this slot; the view is stale and
        // must not be sent half-overwritten.
        if shared.ring.generation(record.slot) != record.generation {
            debug!(
                "[{}] slot {} overwritten during fan-out; dropping view",
                shared.id, record.slot
            );
            intact = false;
            break;
        }
        let frame = shared.ring.frame(record.slot);
        let sent = sink.send_frame(frame.bytes()).await;
        // A subscriber slower than a few slot cycles can still be reading
        // while the engine wraps back onto this slot.
        if shared.ring.generation(record.slot) != record.generation {
            warn!(
                "[{}] slot {} rewritten during send to subscriber {id}; frame may be torn",
                shared.id, record.slot
            );
            if sent.is_err() {
                failed.push(id);
            }
            intact = false;
            break;
        }
        if let Err(err) = sent {
            debug!("[{}] dropping subscriber {id}: {err}", shared.id);
            failed.push(id);
        }
    }
    for id in failed {
        subscribers.remove(&id);
    }
    intact
}

/// Engine went away outside of `close()`: fail the session, close
/// subscribers cleanly, release the shared memory.
async fn engine_lost(shared: &Shared) {
    {
        let mut state = shared.state.lock();
        match *state {
            // Expected during teardown; close() owns the cleanup.
            SessionState::Closing | SessionState::Closed => return,
            _ => *state = SessionState::Failed,
        }
    }
    warn!("[{}] engine lost; failing session", shared.id);

    let child = shared.engine.lock().take();
    if let Some(child) = child {
        kill_and_reap(child).await;
    }
    let mut subscribers = shared.subscribers.lock().await;
    for (_, sink) in subscribers.drain() {
        sink.closed().await;
    }
    drop(subscribers);
    shared.ring.unlink();
}

#[cfg(test)]
mod test {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    /// Sink that takes `delay` to accept each frame, counting deliveries.
    struct StallingSink {
        delay: Duration,
        delivered: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl FrameSink for StallingSink {
        async fn send_frame(&self, _frame: &[u8]) -> io::Result<()> {
            sleep(self.delay).await;
            self.delivered.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    fn test_shared(tag: &str, frame_bytes: u32) -> Arc<Shared> {
        let state = new_state_cell();
        *state.lock() = SessionState::Streaming;
        let name = format!("/posed-test-{tag}-{}", std::process::id());
        Arc::new(Shared {
            id: SessionId::parse(tag).unwrap(),
            state,
            subscribers: AsyncMutex::new(HashMap::new()),
            engine: Mutex::new(None),
            ring: SharedRing::create(&name, frame_bytes).unwrap(),
        })
    }

    async fn attach_stalling_sinks(
        shared: &Shared,
        count: u64,
        delay: Duration,
    ) -> Arc<AtomicUsize> {
        let delivered = Arc::new(AtomicUsize::new(0));
        let mut subscribers = shared.subscribers.lock().await;
        for id in 1..=count {
            subscribers.insert(
                id,
                Box::new(StallingSink {
                    delay,
                    delivered: delivered.clone(),
                }),
            );
        }
        delivered
    }

    #[tokio::test]
    async fn fan_out_delivers_undisturbed_views_to_everyone() {
        let shared = test_shared("fanout-ok", 64);
        shared.ring.begin_write(0);
        let generation = shared.ring.end_write(0);
        let delivered =
            attach_stalling_sinks(&shared, 2, Duration::from_millis(5)).await;

        let record = SlotRecord {
            slot: 0,
            generation,
            seq: 1,
        };
        assert!(fan_out(&shared, record).await);
        assert_eq!(delivered.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn fan_out_abandons_a_view_rewritten_mid_send() {
        let shared = test_shared("fanout-torn", 64);
        shared.ring.begin_write(0);
        let generation = shared.ring.end_write(0);
        // Slow enough that the writer wraps back onto the slot while the
        // first send is still in flight.
        let delivered =
            attach_stalling_sinks(&shared, 2, Duration::from_millis(200)).await;

        let writer = {
            let shared = shared.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(50)).await;
                shared.ring.begin_write(0);
                shared.ring.end_write(0);
            })
        };

        let record = SlotRecord {
            slot: 0,
            generation,
            seq: 1,
        };
        let intact = fan_out(&shared, record).await;
        writer.await.unwrap();

        assert!(!intact, "rewrite during an in-flight send went undetected");
        // The send already under way completed (and was flagged); the view
        // was abandoned before reaching the second subscriber.
        assert_eq!(delivered.load(Ordering::Relaxed), 1);
        // Slow is not failed: nobody was unsubscribed.
        assert_eq!(shared.subscribers.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn failed_spawn_marks_the_lifecycle_failed() {
        let state = new_state_cell();
        assert_eq!(*state.lock(), SessionState::Initializing);

        let launcher = EngineLauncher::with_binary("/nonexistent/posed-engine");
        let err = Session::create(
            SessionId::parse("spawnfail").unwrap(),
            "clock",
            "24",
            &launcher,
            state.clone(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Io(_)), "got {err}");
        assert_eq!(*state.lock(), SessionState::Failed);
    }

    #[test]
    fn session_ids_are_validated() {
        assert!(SessionId::parse("s1").is_ok());
        assert!(SessionId::parse("session-with_everything-09").is_ok());
        assert!(SessionId::parse("").is_err());
        assert!(SessionId::parse("no spaces").is_err());
        assert!(SessionId::parse("no/slash").is_err());
        assert!(SessionId::parse("dots.neither").is_err());
        assert!(SessionId::parse(&"x".repeat(65)).is_err());
    }

    #[test]
    fn shm_names_derive_from_the_id() {
        let id = SessionId::parse("s1").unwrap();
        assert_eq!(shm_name(&id), "/posed-s1");
    }
}
