//! Engine process.
//!
//! One engine runs per session, spawned by the session as the
//! `posed-engine` binary. It owns exactly one animator and a single
//! fixed-rate loop: drain control commands, write the next frame into the
//! next ring slot, publish the slot index, sleep until the next tick.
//! Everything here is synchronous and single-threaded; the cooperative side
//! of the system lives in the parent process.

use std::io;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::animator::{self, Animator};
use crate::channel::{COMM_FD_ENV, SLOT_FD_ENV, SlotPublisher, SyncEndpoint};
use crate::proto::{Command, MessageFlags, Opcode, Reply, SlotRecord};
use crate::shm::{SLOT_COUNT, SharedRing};

/// Clean shutdown after a `shutdown` command.
pub const EXIT_OK: i32 = 0;
/// Animator initialization failed (reason was reported to the parent).
pub const EXIT_INIT_FAILURE: i32 = 1;
/// Unexpected error.
pub const EXIT_ERROR: i32 = 2;
/// The parent closed the command channel.
pub const EXIT_PARENT_LOST: i32 = 3;

/// How long the engine waits for its binding (`init` command) and for the
/// `set_shm` that follows a successful handshake. The parent enforces its
/// own, tighter deadline and kills us first; these bounds only make sure an
/// orphaned engine cannot linger forever.
const BIND_WAIT: Duration = Duration::from_secs(30);
const ATTACH_WAIT: Duration = Duration::from_secs(30);

/// Command receive buffer. Commands are small; the largest carries two
/// strings (kind and source reference).
const COMMAND_BUF: usize = 4096;

/// Launch-time configuration of the engine process.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Session id, for log context only.
    pub session_id: String,
    /// Animator kind; `None` means bind via the first command.
    pub kind: Option<String>,
    /// Motion source reference; `None` means bind via the first command.
    pub source: Option<String>,
    /// Target frame cadence.
    pub target_fps: u32,
}

/// Entry point of the `posed-engine` binary: pick up the inherited channel
/// fds and run until told to stop. Returns the process exit code.
pub fn run(config: EngineConfig) -> i32 {
    let channel = match SyncEndpoint::from_env(COMM_FD_ENV) {
        Ok(channel) => channel,
        Err(err) => {
            error!("command channel unavailable: {err}");
            return EXIT_ERROR;
        }
    };
    let slots = match SlotPublisher::from_env(SLOT_FD_ENV) {
        Ok(slots) => slots,
        Err(err) => {
            error!("slot channel unavailable: {err}");
            return EXIT_ERROR;
        }
    };
    run_with(channel, slots, config)
}

/// Like [`run`] but over caller-supplied endpoints. This is what the
/// in-process tests drive.
pub(crate) fn run_with(channel: SyncEndpoint, slots: SlotPublisher, config: EngineConfig) -> i32 {
    let session_id = config.session_id.clone();
    match engine_main(channel, slots, config) {
        Ok(code) => code,
        Err(err)
            if matches!(
                err.kind(),
                io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
            ) =>
        {
            warn!("[{session_id}] parent went away: {err}");
            EXIT_PARENT_LOST
        }
        Err(err) => {
            error!("[{session_id}] engine failed: {err}");
            EXIT_ERROR
        }
    }
}

enum Binding {
    Bound(String, String),
    ParentLost,
    EarlyShutdown,
}

/// Block (bounded) until the parent names an animator kind and source.
fn wait_for_binding(channel: &SyncEndpoint) -> io::Result<Binding> {
    let deadline = Instant::now() + BIND_WAIT;
    let mut buf = [0u8; COMMAND_BUF];
    loop {
        match channel.recv_deadline(&mut buf, deadline)? {
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "no init command within deadline",
                ));
            }
            Some(0) => return Ok(Binding::ParentLost),
            Some(n) => match Command::decode(&buf[..n]) {
                Ok((Command::Init { kind, source }, flags)) => {
                    if flags.contains(MessageFlags::REPLY_REQUIRED) {
                        channel.send(&Reply::Ack {
                            opcode: Opcode::Init,
                        }
                        .encode()?)?;
                    }
                    return Ok(Binding::Bound(kind, source));
                }
                Ok((Command::Shutdown, _)) => return Ok(Binding::EarlyShutdown),
                Ok((other, _)) => warn!("ignoring {:?} before init", other.opcode()),
                Err(err) => warn!("discarding malformed command: {err}"),
            },
        }
    }
}

fn send_init_failure(channel: &SyncEndpoint, reason: &str) -> io::Result<()> {
    channel.send(
        &Reply::InitFailure {
            reason: reason.to_owned(),
        }
        .encode()?,
    )
}

fn engine_main(
    channel: SyncEndpoint,
    slots: SlotPublisher,
    config: EngineConfig,
) -> io::Result<i32> {
    let (kind_name, source) = match (config.kind, config.source) {
        (Some(kind), Some(source)) => (kind, source),
        _ => {
            debug!("no launch-time binding; waiting for init command");
            match wait_for_binding(&channel)? {
                Binding::Bound(kind, source) => (kind, source),
                Binding::ParentLost => return Ok(EXIT_PARENT_LOST),
                Binding::EarlyShutdown => return Ok(EXIT_OK),
            }
        }
    };

    let Some(kind) = animator::lookup(&kind_name) else {
        send_init_failure(&channel, &format!("unknown animator kind '{kind_name}'"))?;
        return Ok(EXIT_INIT_FAILURE);
    };
    let mut animator = kind.construct();
    if let Err(err) = animator.initialize(&source) {
        send_init_failure(&channel, &err.to_string())?;
        return Ok(EXIT_INIT_FAILURE);
    }

    let frame_bytes = animator.frame_bytes();
    let skeleton = animator.skeleton();
    if frame_bytes < 64 {
        send_init_failure(
            &channel,
            &format!("animator advertised {frame_bytes} frame bytes, need at least 64"),
        )?;
        return Ok(EXIT_INIT_FAILURE);
    }
    if let Err(reason) = skeleton.validate() {
        send_init_failure(&channel, &reason)?;
        return Ok(EXIT_INIT_FAILURE);
    }
    info!(
        "[{}] {} animator ready: {} bones, {} bytes/frame",
        config.session_id,
        kind_name,
        skeleton.num_bones(),
        frame_bytes
    );
    channel.send(
        &Reply::InitSuccess {
            frame_bytes,
            skeleton,
        }
        .encode()?,
    )?;

    let mut engine = Engine {
        channel,
        slots,
        animator,
        frame_bytes,
        ring: None,
        speed: 1.0,
        paused: false,
        cursor: 0,
        seq: 0,
    };
    engine.run_loop(config.target_fps)
}

enum Drain {
    Continue,
    Shutdown,
    ParentLost,
}

struct Engine {
    channel: SyncEndpoint,
    slots: SlotPublisher,
    animator: Box<dyn Animator>,
    frame_bytes: u32,
    ring: Option<SharedRing>,
    speed: f32,
    paused: bool,
    cursor: u32,
    seq: u64,
}

impl Engine {
    fn run_loop(&mut self, target_fps: u32) -> io::Result<i32> {
        let target_dt = Duration::from_secs_f64(1.0 / f64::from(target_fps.max(1)));
        let max_dt = 4.0 * target_dt.as_secs_f32();
        let attach_deadline = Instant::now() + ATTACH_WAIT;
        let mut prev = Instant::now();
        let mut next_tick = Instant::now() + target_dt;

        loop {
            match self.drain_commands()? {
                Drain::Continue => {}
                Drain::Shutdown => {
                    info!("shutdown acknowledged after {} frames", self.seq);
                    return Ok(EXIT_OK);
                }
                Drain::ParentLost => {
                    warn!("command channel closed; exiting");
                    return Ok(EXIT_PARENT_LOST);
                }
            }

            let now = Instant::now();
            let mut dt = (now - prev).as_secs_f32().clamp(0.0, max_dt);
            prev = now;
            if self.paused {
                dt = 0.0;
            }

            if self.ring.is_some() {
                self.produce(dt);
            } else if now > attach_deadline {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "no set_shm command within deadline",
                ));
            }

            let now = Instant::now();
            if now < next_tick {
                std::thread::sleep(next_tick - now);
                next_tick += target_dt;
            } else {
                // Behind schedule; give the OS a chance and restart the
                // cadence from here instead of trying to catch up.
                std::thread::yield_now();
                next_tick = now + target_dt;
            }
        }
    }

    /// Apply every queued command without blocking. Replies, where
    /// requested, go out within the same iteration.
    fn drain_commands(&mut self) -> io::Result<Drain> {
        let mut buf = [0u8; COMMAND_BUF];
        loop {
            match self.channel.try_recv(&mut buf)? {
                None => return Ok(Drain::Continue),
                Some(0) => return Ok(Drain::ParentLost),
                Some(n) => {
                    let (command, flags) = match Command::decode(&buf[..n]) {
                        Ok(decoded) => decoded,
                        Err(err) => {
                            warn!("discarding malformed command: {err}");
                            continue;
                        }
                    };
                    let opcode = command.opcode();
                    let shutdown = matches!(command, Command::Shutdown);
                    self.apply(command)?;
                    if flags.contains(MessageFlags::REPLY_REQUIRED) {
                        self.channel.send(&Reply::Ack { opcode }.encode()?)?;
                    }
                    if shutdown {
                        return Ok(Drain::Shutdown);
                    }
                }
            }
        }
    }

    fn apply(&mut self, command: Command) -> io::Result<()> {
        match command {
            Command::Init { .. } => warn!("duplicate init ignored"),
            Command::SetShm { name } => {
                let ring = SharedRing::attach(&name, self.frame_bytes)?;
                debug!("attached to shm ring {name}");
                self.ring = Some(ring);
            }
            Command::SetSpeed { value } => {
                if value.is_finite() && value >= 0.0 {
                    self.speed = value;
                } else {
                    warn!("rejecting speed {value}");
                }
            }
            Command::Pause => self.paused = true,
            Command::Resume => self.paused = false,
            Command::Seek { time } => {
                if time.is_finite() {
                    self.animator.seek(time.max(0.0));
                } else {
                    warn!("rejecting seek to {time}");
                }
            }
            Command::Shutdown => {}
        }
        Ok(())
    }

    fn produce(&mut self, dt: f32) {
        let Some(ring) = self.ring.as_ref() else {
            return;
        };
        let slot = self.cursor;
        ring.begin_write(slot);
        let offset = ring.layout().slot_offset(slot);
        // Sole writer of the region by construction of the handshake.
        let region = unsafe { ring.slots_mut() };
        self.animator.write_frame(region, offset, dt, self.speed);
        let generation = ring.end_write(slot);

        self.seq += 1;
        let record = SlotRecord {
            slot,
            generation,
            seq: self.seq,
        };
        match self.slots.publish(&record) {
            Ok(true) => {}
            Ok(false) => debug!("slot channel full; dropping publication of seq {}", self.seq),
            Err(err) => debug!("slot publication failed: {err}"),
        }
        self.cursor = (slot + 1) % SLOT_COUNT;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::channel::{seqpacket_pair, slot_pair};
    use std::thread;
    use std::time::{Duration, Instant};
    use zerocopy::FromBytes;

    fn config(kind: Option<&str>, source: Option<&str>) -> EngineConfig {
        EngineConfig {
            session_id: "test".to_owned(),
            kind: kind.map(str::to_owned),
            source: source.map(str::to_owned),
            target_fps: 240,
        }
    }

    fn recv_reply(endpoint: &SyncEndpoint) -> Reply {
        let mut buf = [0u8; 65536];
        let n = endpoint
            .recv_deadline(&mut buf, Instant::now() + Duration::from_secs(5))
            .unwrap()
            .expect("engine reply");
        Reply::decode(&buf[..n]).unwrap()
    }

    #[test]
    fn init_by_command_then_stream_then_shutdown() {
        let (cmd_parent, cmd_child) = seqpacket_pair().unwrap();
        let (slot_rx, slot_tx) = slot_pair().unwrap();
        let engine = thread::spawn(move || {
            run_with(
                SyncEndpoint::new(cmd_child),
                SlotPublisher::new(slot_tx),
                config(None, None),
            )
        });
        let parent = SyncEndpoint::new(cmd_parent);
        let slot_rx = SyncEndpoint::new(slot_rx);

        let init = Command::Init {
            kind: "clock".to_owned(),
            source: "4".to_owned(),
        };
        parent
            .send(&init.encode(MessageFlags::REPLY_REQUIRED))
            .unwrap();

        match recv_reply(&parent) {
            Reply::Ack { opcode } => assert_eq!(opcode, Opcode::Init),
            other => panic!("expected ack, got {other:?}"),
        }
        let frame_bytes = match recv_reply(&parent) {
            Reply::InitSuccess {
                frame_bytes,
                skeleton,
            } => {
                assert_eq!(frame_bytes, 4 * 64);
                assert_eq!(skeleton.num_bones(), 4);
                frame_bytes
            }
            other => panic!("expected init success, got {other:?}"),
        };

        let shm_name = format!("/posed-test-engine-{}", std::process::id());
        let ring = SharedRing::create(&shm_name, frame_bytes).unwrap();
        parent
            .send(
                &Command::SetShm {
                    name: shm_name.clone(),
                }
                .encode(MessageFlags::empty()),
            )
            .unwrap();

        // Frames start flowing: published slots are valid and ordered.
        let mut last_seq = 0;
        let mut buf = [0u8; 16];
        for _ in 0..5 {
            let n = slot_rx
                .recv_deadline(&mut buf, Instant::now() + Duration::from_secs(5))
                .unwrap()
                .expect("slot record");
            let record = SlotRecord::read_from_bytes(&buf[..n]).unwrap();
            assert!(record.slot < SLOT_COUNT);
            assert_eq!(record.generation % 2, 0, "published generation is odd");
            assert!(record.seq > last_seq, "slot records out of order");
            last_seq = record.seq;
        }
        drop(ring);

        parent
            .send(&Command::Shutdown.encode(MessageFlags::empty()))
            .unwrap();
        assert_eq!(engine.join().unwrap(), EXIT_OK);
    }

    #[test]
    fn unknown_kind_reports_init_failure() {
        let (cmd_parent, cmd_child) = seqpacket_pair().unwrap();
        let (_slot_rx, slot_tx) = slot_pair().unwrap();
        let engine = thread::spawn(move || {
            run_with(
                SyncEndpoint::new(cmd_child),
                SlotPublisher::new(slot_tx),
                config(Some("vae"), Some("model.bin")),
            )
        });
        let parent = SyncEndpoint::new(cmd_parent);
        match recv_reply(&parent) {
            Reply::InitFailure { reason } => assert!(reason.contains("vae")),
            other => panic!("expected init failure, got {other:?}"),
        }
        assert_eq!(engine.join().unwrap(), EXIT_INIT_FAILURE);
    }

    #[test]
    fn failing_animator_reports_reason() {
        let (cmd_parent, cmd_child) = seqpacket_pair().unwrap();
        let (_slot_rx, slot_tx) = slot_pair().unwrap();
        let engine = thread::spawn(move || {
            run_with(
                SyncEndpoint::new(cmd_child),
                SlotPublisher::new(slot_tx),
                config(Some("failing"), Some("whatever")),
            )
        });
        let parent = SyncEndpoint::new(cmd_parent);
        match recv_reply(&parent) {
            Reply::InitFailure { reason } => assert!(reason.contains("refuses")),
            other => panic!("expected init failure, got {other:?}"),
        }
        assert_eq!(engine.join().unwrap(), EXIT_INIT_FAILURE);
    }

    #[test]
    fn dropped_parent_ends_the_engine() {
        let (cmd_parent, cmd_child) = seqpacket_pair().unwrap();
        let (slot_rx, slot_tx) = slot_pair().unwrap();
        let engine = thread::spawn(move || {
            run_with(
                SyncEndpoint::new(cmd_child),
                SlotPublisher::new(slot_tx),
                config(Some("clock"), Some("")),
            )
        });
        let parent = SyncEndpoint::new(cmd_parent);
        match recv_reply(&parent) {
            Reply::InitSuccess { .. } => {}
            other => panic!("expected init success, got {other:?}"),
        }
        drop(parent);
        drop(slot_rx);
        assert_eq!(engine.join().unwrap(), EXIT_PARENT_LOST);
    }
}
