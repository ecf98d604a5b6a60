//! Native worker thread running a blocking interpreter loop.
//!
//! The host spawns the thread, waits for `loaded`, allocates one channel per
//! direction and hands both over with `set_channel_buffers`. Every `run`
//! starts the interpreter again; it blocks on its inbox between messages.
//! [`WorkerHost::join`] closes the control channel and writes a shutdown
//! record so a parked interpreter returns.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver as ControlReceiver, RecvTimeoutError, Sender as ControlSender};
use parking_lot::Mutex;
use shared_channel::{Envelope, Frame, FrameReceiver, FrameSender, SharedChannel};
use tracing::{debug, error, info, info_span};

use crate::control::{ChannelBuffers, ControlMessage};
use crate::handshake::{HostHandshake, HostState, WorkerHandshake, WorkerStep};
use crate::{RuntimeError, RuntimeResult, WorkerConfig};

/// Tag reserved for the shutdown record.
pub const SHUTDOWN_TAG: u8 = 0xFF;
const SHUTDOWN: Envelope = Envelope::new(SHUTDOWN_TAG, 0);
const SHUTDOWN_RETRY: Duration = Duration::from_millis(1);

/// Lifecycle of the worker thread as seen by the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Thread started; handshake not finished.
    Booting,
    /// Waiting for a `run`.
    Idle,
    /// Interpreter loop is executing.
    Running {
        /// Number of runs started so far, this one included.
        runs: u32,
    },
    /// Thread left its control loop cleanly.
    Exited,
    /// Thread stopped with an error.
    Failed(String),
}

/// Worker-side ends of both data channels.
pub struct WorkerIo {
    inbox: FrameReceiver,
    outbox: FrameSender,
    closed: bool,
}

impl WorkerIo {
    fn attach(buffers: &ChannelBuffers) -> RuntimeResult<Self> {
        Ok(Self {
            inbox: FrameReceiver::new(buffers.to_worker.receiver()?),
            outbox: FrameSender::new(buffers.from_worker.sender()?),
            closed: false,
        })
    }

    /// Parks until the host sends a record.
    ///
    /// Returns `None` once the host shut the worker down; the interpreter
    /// should return at that point.
    pub fn recv(&mut self) -> RuntimeResult<Option<Frame>> {
        if self.closed {
            return Ok(None);
        }
        let frame = self.inbox.recv()?;
        if frame.envelope == SHUTDOWN {
            debug!("shutdown record received");
            self.closed = true;
            return Ok(None);
        }
        Ok(Some(frame))
    }

    /// Writes a record to the host, parking while the channel is full.
    pub fn send(&mut self, envelope: Envelope, payload: &[u8]) -> RuntimeResult<()> {
        self.outbox.send_blocking(envelope, payload)?;
        Ok(())
    }

    /// Raw producer towards the host.
    pub fn outbox(&mut self) -> &mut FrameSender {
        &mut self.outbox
    }

    /// True once the shutdown record was consumed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Blocking loop executed on the worker thread for every `run`.
pub trait Interpreter: Send + 'static {
    /// Runs until the script finishes or [`WorkerIo::recv`] returns `None`.
    fn run(&mut self, source: Option<&str>, io: &mut WorkerIo) -> RuntimeResult<()>;
}

impl<F> Interpreter for F
where
    F: FnMut(Option<&str>, &mut WorkerIo) -> RuntimeResult<()> + Send + 'static,
{
    fn run(&mut self, source: Option<&str>, io: &mut WorkerIo) -> RuntimeResult<()> {
        self(source, io)
    }
}

/// Interpreter that sends every record straight back.
///
/// A `source`, when given, is sent first as a text record with tag 0.
#[derive(Clone, Copy, Debug, Default)]
pub struct EchoInterpreter;

impl Interpreter for EchoInterpreter {
    fn run(&mut self, source: Option<&str>, io: &mut WorkerIo) -> RuntimeResult<()> {
        if let Some(source) = source {
            io.send(Envelope::new(0, 1), source.as_bytes())?;
        }
        while let Some(frame) = io.recv()? {
            io.send(frame.envelope, &frame.payload)?;
        }
        Ok(())
    }
}

/// Host-side handle to a running worker.
pub struct WorkerHost {
    name: String,
    control: Option<ControlSender<ControlMessage>>,
    handshake: HostHandshake,
    to_worker: FrameSender,
    from_worker: FrameReceiver,
    status: Arc<Mutex<WorkerStatus>>,
    thread: Option<JoinHandle<RuntimeResult<()>>>,
}

impl WorkerHost {
    /// Starts the worker thread and completes the bootstrap handshake.
    pub fn spawn<I: Interpreter>(config: WorkerConfig, interpreter: I) -> RuntimeResult<Self> {
        config.validate()?;

        let (control_tx, control_rx) = crossbeam_channel::unbounded();
        let (event_tx, event_rx) = crossbeam_channel::bounded(1);
        let status = Arc::new(Mutex::new(WorkerStatus::Booting));

        let thread = {
            let status = Arc::clone(&status);
            let name = config.name.clone();
            thread::Builder::new().name(config.name.clone()).spawn(move || {
                let _span = info_span!("worker", worker = %name).entered();
                let result = worker_main(interpreter, control_rx, event_tx, &status);
                *status.lock() = match &result {
                    Ok(()) => WorkerStatus::Exited,
                    Err(err) => {
                        error!(%err, "worker stopped");
                        WorkerStatus::Failed(err.to_string())
                    }
                };
                result
            })?
        };

        let mut handshake = HostHandshake::new();
        let loaded = event_rx
            .recv_timeout(config.handshake_timeout)
            .map_err(|err| match err {
                RecvTimeoutError::Timeout => RuntimeError::Timeout {
                    stage: "loaded",
                    after: config.handshake_timeout,
                },
                RecvTimeoutError::Disconnected => {
                    RuntimeError::Disconnected("worker exited before announcing itself")
                }
            })?;
        handshake.receive(&loaded)?;

        let buffers = ChannelBuffers {
            to_worker: SharedChannel::new(config.channel_capacity)?,
            from_worker: SharedChannel::new(config.channel_capacity)?,
        };
        let to_worker = FrameSender::new(buffers.to_worker.sender()?);
        let from_worker = FrameReceiver::new(buffers.from_worker.receiver()?);

        handshake.send_buffers()?;
        control_tx
            .send(ControlMessage::SetChannelBuffers { buffers })
            .map_err(|_| RuntimeError::Disconnected("worker dropped its control channel"))?;

        info!(
            worker = %config.name,
            capacity = config.channel_capacity,
            "worker bootstrapped"
        );
        Ok(Self {
            name: config.name,
            control: Some(control_tx),
            handshake,
            to_worker,
            from_worker,
            status,
            thread: Some(thread),
        })
    }

    /// Worker thread name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last status reported by the worker thread.
    pub fn status(&self) -> WorkerStatus {
        self.status.lock().clone()
    }

    /// Starts the interpreter loop, or queues a restart if one is running.
    pub fn run(&mut self, source: Option<&str>) -> RuntimeResult<()> {
        self.handshake.send_run()?;
        let control = self
            .control
            .as_ref()
            .ok_or(RuntimeError::Disconnected("worker already joined"))?;
        control
            .send(ControlMessage::Run {
                source: source.map(str::to_owned),
            })
            .map_err(|_| RuntimeError::Disconnected("worker dropped its control channel"))?;
        debug!(worker = %self.name, "run sent");
        Ok(())
    }

    /// Writes a record to the worker, parking while the channel is full.
    pub fn send(&mut self, envelope: Envelope, payload: &[u8]) -> RuntimeResult<()> {
        if envelope.tag == SHUTDOWN_TAG {
            return Err(RuntimeError::protocol(format!(
                "tag {SHUTDOWN_TAG:#x} is reserved for shutdown"
            )));
        }
        self.to_worker.send_blocking(envelope, payload)?;
        Ok(())
    }

    /// Parks until the worker sends a record.
    pub fn recv(&mut self) -> RuntimeResult<Frame> {
        Ok(self.from_worker.recv()?)
    }

    /// Returns a record from the worker if one is visible.
    pub fn try_recv(&mut self) -> RuntimeResult<Option<Frame>> {
        Ok(self.from_worker.try_recv()?)
    }

    /// Producer towards the worker.
    pub fn sender(&mut self) -> &mut FrameSender {
        &mut self.to_worker
    }

    /// Consumer of records coming from the worker.
    pub fn receiver(&mut self) -> &mut FrameReceiver {
        &mut self.from_worker
    }

    /// Stops the interpreter, closes the control channel and waits for the thread.
    ///
    /// The shutdown record is only written while the worker thread is alive;
    /// a full inbox is retried until the worker drains it or exits.
    pub fn join(mut self) -> RuntimeResult<()> {
        self.control.take();
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        if self.handshake.state() == HostState::Running {
            self.write_shutdown(&thread)?;
        }

        let result = thread.join().map_err(|_| RuntimeError::WorkerPanicked)?;
        info!(worker = %self.name, ok = result.is_ok(), "worker joined");
        result
    }

    fn write_shutdown(&mut self, handle: &JoinHandle<RuntimeResult<()>>) -> RuntimeResult<()> {
        loop {
            match self.to_worker.send(SHUTDOWN, &[]) {
                Ok(()) => return Ok(()),
                Err(err) if err.is_full() => {
                    if handle.is_finished() {
                        debug!(worker = %self.name, "worker exited with a full inbox");
                        return Ok(());
                    }
                    thread::sleep(SHUTDOWN_RETRY);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

fn worker_main<I: Interpreter>(
    mut interpreter: I,
    control: ControlReceiver<ControlMessage>,
    events: ControlSender<ControlMessage>,
    status: &Mutex<WorkerStatus>,
) -> RuntimeResult<()> {
    let mut handshake = WorkerHandshake::new();
    events
        .send(handshake.announce_loaded()?)
        .map_err(|_| RuntimeError::Disconnected("host went away before the worker loaded"))?;

    let mut io = None;
    let mut runs = 0u32;
    for message in control.iter() {
        match handshake.receive(message)? {
            WorkerStep::Attach(buffers) => {
                io = Some(WorkerIo::attach(&buffers)?);
                *status.lock() = WorkerStatus::Idle;
            }
            WorkerStep::Run(source) => {
                let io = io
                    .as_mut()
                    .ok_or_else(|| RuntimeError::protocol("run before channel buffers"))?;
                runs += 1;
                *status.lock() = WorkerStatus::Running { runs };
                info!(runs, has_source = source.is_some(), "interpreter started");
                interpreter.run(source.as_deref(), io)?;
                if io.is_closed() {
                    break;
                }
                *status.lock() = WorkerStatus::Idle;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> WorkerConfig {
        WorkerConfig::default()
            .with_name("test-worker")
            .with_channel_capacity(256)
    }

    #[test]
    fn echo_worker_round_trip() {
        let mut host = WorkerHost::spawn(config(), EchoInterpreter).expect("spawn");
        assert_eq!(host.name(), "test-worker");
        host.run(Some("hello")).expect("run");

        let greeting = host.recv().expect("source echo");
        assert_eq!(greeting.text().expect("utf-8"), "hello");

        host.send(Envelope::new(3, 1), &[0xDE, 0xAD, 0xBE, 0xEF])
            .expect("send");
        let frame = host.recv().expect("echo");
        assert_eq!(frame.envelope, Envelope::new(3, 1));
        assert_eq!(frame.payload, vec![0xDE, 0xAD, 0xBE, 0xEF]);

        host.join().expect("join");
    }

    #[test]
    fn join_without_run_closes_cleanly() {
        let host = WorkerHost::spawn(config(), EchoInterpreter).expect("spawn");
        let status = Arc::clone(&host.status);
        host.join().expect("join");
        assert_eq!(*status.lock(), WorkerStatus::Exited);
    }

    #[test]
    fn interpreter_restarts_on_second_run() {
        let interpreter = |source: Option<&str>, io: &mut WorkerIo| -> RuntimeResult<()> {
            io.send(Envelope::new(1, 1), source.unwrap_or_default().as_bytes())
        };
        let mut host = WorkerHost::spawn(config(), interpreter).expect("spawn");

        host.run(Some("first")).expect("first run");
        assert_eq!(host.recv().expect("first").payload, b"first");
        host.run(Some("second")).expect("second run");
        assert_eq!(host.recv().expect("second").payload, b"second");

        // Neither run reads its inbox, so the shutdown record is never seen and
        // the worker leaves when the control channel closes.
        host.join().expect("join");
    }

    #[test]
    fn interpreter_errors_surface_on_join() {
        let interpreter = |_: Option<&str>, _: &mut WorkerIo| -> RuntimeResult<()> {
            Err(RuntimeError::interpreter("syntax error"))
        };
        let mut host = WorkerHost::spawn(config(), interpreter).expect("spawn");
        host.run(None).expect("run");

        let err = host.join().unwrap_err();
        assert!(matches!(err, RuntimeError::Interpreter(msg) if msg == "syntax error"));
    }

    fn join_within_budget(host: WorkerHost) -> RuntimeResult<()> {
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        thread::spawn(move || {
            let _ = done_tx.send(host.join());
        });
        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("join returned within budget")
    }

    #[test]
    fn join_surfaces_failure_behind_a_full_inbox() {
        let interpreter = |_: Option<&str>, _: &mut WorkerIo| -> RuntimeResult<()> {
            Err(RuntimeError::interpreter("boom"))
        };
        let mut host =
            WorkerHost::spawn(config().with_channel_capacity(64), interpreter).expect("spawn");
        host.run(None).expect("run");
        for seq in 0..4u8 {
            host.send(Envelope::new(1, 1), &[seq; 8]).expect("fill inbox");
        }
        assert_eq!(host.sender().sender().free_space(), 0);

        let err = join_within_budget(host).unwrap_err();
        assert!(matches!(err, RuntimeError::Interpreter(msg) if msg == "boom"));
    }

    #[test]
    fn join_releases_idle_worker_with_a_full_inbox() {
        let interpreter = |_: Option<&str>, _: &mut WorkerIo| -> RuntimeResult<()> { Ok(()) };
        let mut host =
            WorkerHost::spawn(config().with_channel_capacity(64), interpreter).expect("spawn");
        host.run(None).expect("run");
        for seq in 0..4u8 {
            host.send(Envelope::new(1, 1), &[seq; 8]).expect("fill inbox");
        }

        join_within_budget(host).expect("clean exit");
    }

    #[test]
    fn shutdown_tag_is_reserved() {
        let mut host = WorkerHost::spawn(config(), EchoInterpreter).expect("spawn");
        assert!(matches!(
            host.send(Envelope::new(SHUTDOWN_TAG, 0), b"x"),
            Err(RuntimeError::Protocol(_))
        ));
        host.join().expect("join");
    }

    #[test]
    fn invalid_capacity_fails_before_spawning() {
        let err = WorkerHost::spawn(
            config()
                .with_channel_capacity(0)
                .with_handshake_timeout(Duration::from_millis(10)),
            EchoInterpreter,
        )
        .err()
        .expect("misconfigured");
        assert!(matches!(err, RuntimeError::Channel(_)));
    }
}
