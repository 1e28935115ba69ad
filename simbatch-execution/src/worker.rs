//! Worker client driving one environment for a coordinator

use async_trait::async_trait;
use futures::future::{self, Either};
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use simbatch_config::WorkerConfig;
use simbatch_ipc::{
    BlockingTransport, CommandContext, CommandHandler, Connection, Field, FieldMap, FrameLimits,
    FrameTransport, ReadInterrupt, TokioTransport, WireValue, INSTANCE_ID_LABEL,
};

use crate::environment::{Environment, StepContext};
use crate::error::{EnvironmentError, WorkerError};
use crate::store::SampleStore;

/// Name of the dictionary carrying environment parameters in the handshake
pub const PARAMETERS_DICT: &str = "parameters";

/// Name of the dictionary carrying visualization data in the handshake
pub const VISUALIZATION_DICT: &str = "visualization";

/// Text sent in place of an absent store location
pub const NO_STORE_LOCATION: &str = "None";

/// Lifecycle of a worker client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Connecting,
    Handshake,
    Ready,
    Stepping,
    Replying,
    Exiting,
    Closed,
}

/// Settings received from the coordinator during the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub allow_predictions: bool,
    pub simulations_per_step: u32,
    pub store_location: Option<String>,
    pub partition: Option<String>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            allow_predictions: false,
            simulations_per_step: 1,
            store_location: None,
            partition: None,
        }
    }
}

/// Command handler side of the worker: environment, store and sample state
struct WorkerCore<E> {
    instance_id: Option<u32>,
    env: E,
    store: Box<dyn SampleStore>,
    settings: WorkerSettings,
    update_line: Option<i64>,
    exit_requested: bool,
    state: WorkerState,
}

impl<E: Environment> WorkerCore<E> {
    /// Run one group of sub-steps, repeating the group until the
    /// environment accepts the sample
    async fn run_substeps<T: FrameTransport>(&mut self, conn: &mut Connection<T>) -> Result<(), WorkerError> {
        let substeps = self.settings.simulations_per_step;
        loop {
            for substep in 0..substeps {
                let mut ctx = StepContext::new(
                    conn,
                    self.instance_id,
                    self.settings.allow_predictions,
                    substep,
                    substeps,
                );
                self.env.step(&mut ctx).await?;
            }
            if self.env.check_sample() {
                return Ok(());
            }
            debug!("Sample rejected, repeating step group");
        }
    }

    /// Store the current sample and answer `done` with its line
    async fn persist_and_reply<T: FrameTransport>(&mut self, conn: &mut Connection<T>) -> Result<(), WorkerError> {
        self.state = WorkerState::Replying;
        let sample = self.env.sample();
        let line = match self.update_line.take() {
            Some(line) => {
                self.store.update(line, sample)?;
                line
            }
            None => self.store.add(sample)?,
        };
        self.env.reset_sample();
        conn.send_command_done().await?;
        conn.send(&WireValue::Int(line)).await?;
        debug!("Replied with line {}", line);
        self.state = WorkerState::Ready;
        Ok(())
    }
}

#[async_trait]
impl<T: FrameTransport, E: Environment> CommandHandler<T> for WorkerCore<E> {
    type Error = WorkerError;

    async fn on_exit(&mut self, _ctx: CommandContext<'_, T>) -> Result<(), WorkerError> {
        debug!("Exit requested by coordinator");
        self.exit_requested = true;
        Ok(())
    }

    async fn on_step(&mut self, ctx: CommandContext<'_, T>) -> Result<(), WorkerError> {
        self.state = WorkerState::Stepping;
        self.run_substeps(ctx.conn).await?;
        self.persist_and_reply(ctx.conn).await
    }

    async fn on_compute(&mut self, ctx: CommandContext<'_, T>) -> Result<(), WorkerError> {
        self.persist_and_reply(ctx.conn).await
    }

    async fn on_sample(&mut self, ctx: CommandContext<'_, T>) -> Result<(), WorkerError> {
        let line = ctx.conn.receive_int().await?;
        let sample = self.store.get(line)?;
        self.env.load_sample(sample)?;
        self.update_line = Some(line);
        debug!("Loaded sample {}", line);
        Ok(())
    }

    async fn on_prediction(&mut self, ctx: CommandContext<'_, T>) -> Result<(), WorkerError> {
        let prediction = ctx.conn.receive_value().await?;
        self.env.apply_prediction(prediction).await?;
        Ok(())
    }

    async fn on_visualisation(&mut self, ctx: CommandContext<'_, T>) -> Result<(), WorkerError> {
        let (_, state) = ctx.conn.receive_labeled().await?;
        self.env.update_visualization(state).await?;
        Ok(())
    }

    async fn on_change_db(&mut self, ctx: CommandContext<'_, T>) -> Result<(), WorkerError> {
        let partition = ctx.conn.receive_text().await?;
        self.store.synchronize(&partition)?;
        info!("Switched to partition '{}'", partition);
        self.settings.partition = Some(partition);
        Ok(())
    }
}

/// Stops a blocking worker from another thread. The worker finishes the
/// command it is serving, closes and reports exit to the coordinator.
#[derive(Debug, Clone)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
    reader: Arc<ReadInterrupt>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Err(err) = self.reader.interrupt() {
            warn!("Failed to interrupt worker read: {}", err);
        }
    }
}

/// Connection to a coordinator plus the environment it drives
pub struct WorkerClient<T, E> {
    conn: Connection<T>,
    core: WorkerCore<E>,
    data: FieldMap,
    stopped: Arc<AtomicBool>,
}

impl<E: Environment> WorkerClient<TokioTransport, E> {
    /// Connect over a cooperative socket and announce the instance id
    pub async fn connect(
        config: &WorkerConfig,
        limits: FrameLimits,
        env: E,
        store: Box<dyn SampleStore>,
    ) -> Result<Self, WorkerError> {
        let endpoint = config.coordinator_endpoint();
        info!("Connecting to coordinator at {}", endpoint);
        let transport = TokioTransport::connect(&endpoint)
            .await?
            .with_read_timeout(config.receive_timeout);
        Self::from_transport(transport, limits, config.instance_id, env, store).await
    }
}

impl<E: Environment> WorkerClient<BlockingTransport, E> {
    /// Connect over a blocking socket, for a worker on its own thread
    pub fn connect_blocking(
        config: &WorkerConfig,
        limits: FrameLimits,
        env: E,
        store: Box<dyn SampleStore>,
    ) -> Result<Self, WorkerError> {
        let endpoint = config.coordinator_endpoint();
        info!("Connecting to coordinator at {} (blocking)", endpoint);
        let transport = BlockingTransport::connect(endpoint.as_str(), config.receive_timeout)?;
        futures::executor::block_on(Self::from_transport(
            transport,
            limits,
            config.instance_id,
            env,
            store,
        ))
    }

    /// Handshake then serve until the coordinator says exit or a
    /// [`StopHandle`] fires
    pub fn run_blocking(&mut self) -> Result<(), WorkerError> {
        futures::executor::block_on(self.run())
    }

    pub fn stop_handle(&self) -> Result<StopHandle, WorkerError> {
        Ok(StopHandle {
            stopped: self.stopped.clone(),
            reader: Arc::new(self.conn.transport().read_interrupt()?),
        })
    }
}

impl<T: FrameTransport, E: Environment> WorkerClient<T, E> {
    /// Wrap an open transport and send the instance id
    pub async fn from_transport(
        transport: T,
        limits: FrameLimits,
        instance_id: Option<u32>,
        env: E,
        store: Box<dyn SampleStore>,
    ) -> Result<Self, WorkerError> {
        let mut client = Self {
            conn: Connection::new(transport).with_limits(limits),
            core: WorkerCore {
                instance_id,
                env,
                store,
                settings: WorkerSettings::default(),
                update_line: None,
                exit_requested: false,
                state: WorkerState::Connecting,
            },
            data: FieldMap::new(),
            stopped: Arc::new(AtomicBool::new(false)),
        };
        let id = instance_id.map_or(WireValue::None, WireValue::from);
        client.conn.send_labeled(INSTANCE_ID_LABEL, &id, false).await?;
        client.core.state = WorkerState::Handshake;
        Ok(client)
    }

    pub fn state(&self) -> WorkerState {
        self.core.state
    }

    pub fn instance_id(&self) -> Option<u32> {
        self.core.instance_id
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.core.settings
    }

    pub fn environment(&self) -> &E {
        &self.core.env
    }

    /// Labeled values and dictionaries received outside the handshake
    pub fn data(&self) -> &FieldMap {
        &self.data
    }

    /// Receive the coordinator's settings, initialise the environment and
    /// report its visualization data and parameters
    pub async fn initialize(&mut self) -> Result<(), WorkerError> {
        if self.core.state != WorkerState::Handshake {
            return Err(WorkerError::Handshake(format!(
                "cannot initialise in state {:?}",
                self.core.state
            )));
        }

        let mut received = FieldMap::new();
        self.conn.receive_dict(&mut received).await?;
        let parameters = match received.remove(PARAMETERS_DICT) {
            Some(Field::Map(parameters)) => parameters,
            Some(Field::Value(_)) => {
                return Err(WorkerError::Handshake("parameters must be a dictionary".into()))
            }
            None => FieldMap::new(),
        };

        let allow_predictions = self.conn.receive_bool().await?;
        let substeps = self.conn.receive_int().await?;
        let simulations_per_step = u32::try_from(substeps)
            .ok()
            .filter(|steps| *steps > 0)
            .ok_or_else(|| WorkerError::Handshake(format!("invalid sub-step count {}", substeps)))?;
        let location = self.conn.receive_text().await?;
        let store_location = (location != NO_STORE_LOCATION).then_some(location);

        debug!(
            "Handshake settings: predictions={}, substeps={}, store={:?}",
            allow_predictions, simulations_per_step, store_location
        );
        self.core.settings = WorkerSettings {
            allow_predictions,
            simulations_per_step,
            store_location,
            partition: None,
        };

        let core = &mut self.core;
        core.env.create(&parameters).await?;
        core.env.init().await?;
        core.store.open(core.settings.store_location.as_deref().map(Path::new))?;
        core.env.init_database(core.settings.store_location.as_deref()).await?;
        let visualization = core.env.init_visualization().await?;
        let reported = core.env.parameters();

        self.conn.send_dict(VISUALIZATION_DICT, visualization.as_ref()).await?;
        self.conn.send_dict(PARAMETERS_DICT, reported.as_ref()).await?;
        self.conn.send_command_done().await?;

        let partition = self.conn.receive_text().await?;
        self.core.store.synchronize(&partition)?;
        self.core.settings.partition = Some(partition);
        self.conn.send_command_done().await?;

        self.core.state = WorkerState::Ready;
        info!("Worker {:?} initialised", self.core.instance_id);
        Ok(())
    }

    /// Handshake then serve until the coordinator says exit
    pub async fn run(&mut self) -> Result<(), WorkerError> {
        self.initialize().await?;
        self.launch().await
    }

    /// Serve commands until the coordinator says exit, then close
    pub async fn launch(&mut self) -> Result<(), WorkerError> {
        self.launch_until(future::pending::<()>()).await
    }

    /// Serve commands until exit or until `interrupt` resolves. Either way
    /// the worker closes and reports exit to the coordinator.
    pub async fn launch_until<F>(&mut self, interrupt: F) -> Result<(), WorkerError>
    where
        F: Future<Output = ()> + Send,
    {
        let served = {
            let serve = self.serve();
            futures::pin_mut!(serve);
            futures::pin_mut!(interrupt);
            match future::select(serve, interrupt).await {
                Either::Left((result, _)) => result,
                Either::Right(((), _)) => {
                    info!("Worker interrupted, closing");
                    Ok(())
                }
            }
        };

        match served {
            Ok(()) => self.close().await,
            Err(err) => {
                warn!("Worker loop failed: {}", err);
                if let Err(close_err) = self.close().await {
                    debug!("Close after failure also failed: {}", close_err);
                }
                Err(err)
            }
        }
    }

    async fn serve(&mut self) -> Result<(), WorkerError> {
        if self.core.state != WorkerState::Ready {
            return Err(WorkerError::Handshake(format!(
                "cannot serve in state {:?}",
                self.core.state
            )));
        }
        let client_id = self.core.instance_id;
        while !self.core.exit_requested {
            if self.stopped.load(Ordering::SeqCst) {
                info!("Worker stopped, closing");
                return Ok(());
            }
            let listened = self
                .conn
                .listen_while_not_done(&mut self.core, &mut self.data, client_id)
                .await;
            match listened {
                Ok(()) => {}
                // The read was cut short by a stop request
                Err(_) if self.stopped.load(Ordering::SeqCst) => {
                    info!("Worker stopped, closing");
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Close the environment, send `exit` and shut the socket. Later calls
    /// do nothing.
    pub async fn close(&mut self) -> Result<(), WorkerError> {
        if self.core.state == WorkerState::Closed {
            return Ok(());
        }
        self.core.state = WorkerState::Exiting;
        match self.core.env.close().await {
            Ok(()) | Err(EnvironmentError::NotImplemented(_)) => {}
            Err(err) => warn!("Environment close failed: {}", err),
        }
        let sent = self.conn.send_command_exit().await;
        let closed = self.conn.close().await;
        self.core.state = WorkerState::Closed;
        info!("Worker {:?} closed", self.core.instance_id);
        sent?;
        closed?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use simbatch_ipc::{Command, DefaultHandler, StreamTransport};
    use std::cell::Cell;
    use tokio::io::DuplexStream;

    type TestConnection = Connection<StreamTransport<DuplexStream>>;

    /// Accumulates `gain` once per sub-step
    #[derive(Default)]
    struct GainEnv {
        gain: f64,
        value: f64,
        substeps_seen: Vec<(u32, bool)>,
        rejections_left: Cell<u32>,
        closed: bool,
    }

    #[async_trait]
    impl Environment for GainEnv {
        async fn create(&mut self, parameters: &FieldMap) -> Result<(), EnvironmentError> {
            self.gain = parameters
                .get("gain")
                .and_then(Field::as_value)
                .and_then(WireValue::as_float)
                .unwrap_or(1.0);
            Ok(())
        }

        async fn init_visualization(&mut self) -> Result<Option<FieldMap>, EnvironmentError> {
            let mut viz = FieldMap::new();
            viz.insert("color".into(), Field::Value(WireValue::Text("blue".into())));
            Ok(Some(viz))
        }

        async fn step(&mut self, ctx: &mut StepContext<'_>) -> Result<(), EnvironmentError> {
            self.value += self.gain;
            self.substeps_seen.push((ctx.substep(), ctx.is_sampling_step()));
            Ok(())
        }

        fn check_sample(&self) -> bool {
            let left = self.rejections_left.get();
            if left > 0 {
                self.rejections_left.set(left - 1);
                return false;
            }
            true
        }

        fn sample(&self) -> FieldMap {
            FieldMap::from([("value".to_string(), Field::Value(WireValue::Float(self.value)))])
        }

        fn load_sample(&mut self, sample: FieldMap) -> Result<(), EnvironmentError> {
            self.value = sample
                .get("value")
                .and_then(Field::as_value)
                .and_then(WireValue::as_float)
                .unwrap_or_default();
            Ok(())
        }

        fn reset_sample(&mut self) {
            self.value = 0.0;
        }

        async fn close(&mut self) -> Result<(), EnvironmentError> {
            self.closed = true;
            Ok(())
        }
    }

    fn pair() -> (TestConnection, StreamTransport<DuplexStream>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (Connection::new(StreamTransport::new(a)), StreamTransport::new(b))
    }

    async fn coordinator_handshake<T: FrameTransport>(coordinator: &mut Connection<T>, substeps: i64) -> FieldMap {
        let (label, id) = coordinator.receive_labeled().await.unwrap();
        assert_eq!(label, INSTANCE_ID_LABEL);
        assert_eq!(id, WireValue::Int(7));

        let parameters = FieldMap::from([("gain".to_string(), Field::Value(WireValue::Float(2.0)))]);
        coordinator.send_dict(PARAMETERS_DICT, Some(&parameters)).await.unwrap();
        coordinator.send(&WireValue::Bool(false)).await.unwrap();
        coordinator.send(&WireValue::Int(substeps)).await.unwrap();
        coordinator.send(&WireValue::Text(NO_STORE_LOCATION.into())).await.unwrap();

        let mut data = FieldMap::new();
        coordinator
            .listen_while_not_done(&mut DefaultHandler, &mut data, Some(7))
            .await
            .unwrap();
        coordinator.send(&WireValue::Text("training".into())).await.unwrap();
        coordinator.expect_command(Command::Done).await.unwrap();
        data
    }

    async fn coordinator_shutdown(coordinator: &mut TestConnection) {
        coordinator.send_command_exit().await.unwrap();
        coordinator.send_command_done().await.unwrap();
        coordinator.expect_command(Command::Exit).await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_step_replay_and_exit() {
        let (mut coordinator, transport) = pair();
        let store = MemoryStore::new();
        let worker_store = store.clone();

        let worker = tokio::spawn(async move {
            let mut client = WorkerClient::from_transport(
                transport,
                FrameLimits::default(),
                Some(7),
                GainEnv::default(),
                Box::new(worker_store),
            )
            .await
            .unwrap();
            client.run().await.unwrap();
            client
        });

        let data = coordinator_handshake(&mut coordinator, 3).await;
        assert_eq!(
            data[VISUALIZATION_DICT].as_map().unwrap()["color"],
            Field::Value(WireValue::Text("blue".into()))
        );
        // Parameters left unreported arrive as a bare `finished`
        assert!(!data.contains_key(PARAMETERS_DICT));

        // Fresh sample: three sub-steps of gain 2
        coordinator.send_command_step().await.unwrap();
        coordinator
            .listen_while_not_done(&mut DefaultHandler, &mut FieldMap::new(), Some(7))
            .await
            .unwrap();
        assert_eq!(coordinator.receive_int().await.unwrap(), 1);

        // Replay line 1: loaded, stepped again, written back in place
        coordinator.send_command_sample().await.unwrap();
        coordinator.send(&WireValue::Int(1)).await.unwrap();
        coordinator.send_command_step().await.unwrap();
        coordinator
            .listen_while_not_done(&mut DefaultHandler, &mut FieldMap::new(), Some(7))
            .await
            .unwrap();
        assert_eq!(coordinator.receive_int().await.unwrap(), 1);

        coordinator_shutdown(&mut coordinator).await;
        let client = worker.await.unwrap();

        assert_eq!(client.state(), WorkerState::Closed);
        assert!(client.environment().closed);
        assert_eq!(client.settings().simulations_per_step, 3);
        assert_eq!(client.settings().partition.as_deref(), Some("training"));
        assert_eq!(
            client.environment().substeps_seen[..3],
            [(0, false), (1, false), (2, true)]
        );
        assert_eq!(store.len("training").unwrap(), 1);
        assert_eq!(
            store.get(1).unwrap()["value"],
            Field::Value(WireValue::Float(12.0))
        );
    }

    #[tokio::test]
    async fn test_rejected_sample_change_db_and_compute() {
        let (mut coordinator, transport) = pair();
        let store = MemoryStore::new();
        let worker_store = store.clone();

        let worker = tokio::spawn(async move {
            let env = GainEnv {
                rejections_left: Cell::new(1),
                ..Default::default()
            };
            let mut client = WorkerClient::from_transport(
                transport,
                FrameLimits::default(),
                Some(7),
                env,
                Box::new(worker_store),
            )
            .await
            .unwrap();
            client.run().await.unwrap();
            client.environment().substeps_seen.len()
        });

        coordinator_handshake(&mut coordinator, 1).await;

        coordinator.send_command_change_db().await.unwrap();
        coordinator.send(&WireValue::Text("validation".into())).await.unwrap();

        // The first group is rejected, so the step runs twice
        coordinator.send_command_step().await.unwrap();
        coordinator
            .listen_while_not_done(&mut DefaultHandler, &mut FieldMap::new(), Some(7))
            .await
            .unwrap();
        assert_eq!(coordinator.receive_int().await.unwrap(), 1);

        // Compute stores the current (reset) state without stepping
        coordinator.send_command_compute().await.unwrap();
        coordinator
            .listen_while_not_done(&mut DefaultHandler, &mut FieldMap::new(), Some(7))
            .await
            .unwrap();
        assert_eq!(coordinator.receive_int().await.unwrap(), 2);

        coordinator_shutdown(&mut coordinator).await;
        assert_eq!(worker.await.unwrap(), 2);

        let mut reader = store.clone();
        reader.synchronize("validation").unwrap();
        assert_eq!(reader.get(1).unwrap()["value"], Field::Value(WireValue::Float(4.0)));
        assert_eq!(reader.get(2).unwrap()["value"], Field::Value(WireValue::Float(0.0)));
        assert_eq!(store.len("training").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_interrupt_sends_exit() {
        let (mut coordinator, transport) = pair();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        let worker = tokio::spawn(async move {
            let mut client = WorkerClient::from_transport(
                transport,
                FrameLimits::default(),
                Some(7),
                GainEnv::default(),
                Box::new(MemoryStore::new()),
            )
            .await
            .unwrap();
            client.initialize().await.unwrap();
            client
                .launch_until(async {
                    let _ = stop_rx.await;
                })
                .await
                .unwrap();
            client.state()
        });

        coordinator_handshake(&mut coordinator, 1).await;
        stop_tx.send(()).unwrap();
        coordinator.expect_command(Command::Exit).await.unwrap();
        assert_eq!(worker.await.unwrap(), WorkerState::Closed);
    }

    #[test]
    fn test_stop_handle_ends_blocking_worker() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (handle_tx, handle_rx) = std::sync::mpsc::channel();

        let worker = std::thread::spawn(move || {
            let transport = BlockingTransport::connect(addr, None).unwrap();
            let mut client = futures::executor::block_on(WorkerClient::from_transport(
                transport,
                FrameLimits::default(),
                Some(7),
                GainEnv::default(),
                Box::new(MemoryStore::new()),
            ))
            .unwrap();
            handle_tx.send(client.stop_handle().unwrap()).unwrap();
            let result = client.run_blocking();
            (client.state(), result)
        });

        let (stream, _) = listener.accept().unwrap();
        let mut coordinator = Connection::new(BlockingTransport::from_std(stream, None).unwrap());
        let stop = handle_rx.recv().unwrap();
        futures::executor::block_on(coordinator_handshake(&mut coordinator, 1));

        // The worker is now blocked waiting for a command
        stop.stop();
        futures::executor::block_on(coordinator.expect_command(Command::Exit)).unwrap();
        let (state, result) = worker.join().unwrap();
        result.unwrap();
        assert_eq!(state, WorkerState::Closed);
    }

    #[tokio::test]
    async fn test_handshake_frame_order() {
        use simbatch_ipc::{Message, DICT_NAME_LABEL};

        let (mut coordinator, transport) = pair();
        let worker = tokio::spawn(async move {
            let mut client = WorkerClient::from_transport(
                transport,
                FrameLimits::default(),
                Some(7),
                GainEnv::default(),
                Box::new(MemoryStore::new()),
            )
            .await
            .unwrap();
            client.initialize().await.unwrap();
            client.state()
        });

        let text = |s: &str| Message::Value(WireValue::Text(s.into()));

        // The id goes out bare, with no `read` in front of it
        assert_eq!(coordinator.receive().await.unwrap(), text(INSTANCE_ID_LABEL));
        assert_eq!(coordinator.receive().await.unwrap(), Message::Value(WireValue::Int(7)));

        coordinator.send_dict(PARAMETERS_DICT, None).await.unwrap();
        coordinator.send(&WireValue::Bool(false)).await.unwrap();
        coordinator.send(&WireValue::Int(1)).await.unwrap();
        coordinator.send(&WireValue::Text(NO_STORE_LOCATION.into())).await.unwrap();

        // Visualization dictionary, then the unreported parameters, then done
        let mut frames = Vec::new();
        loop {
            let frame = coordinator.receive().await.unwrap();
            let done = frame == Message::Command(Command::Done);
            frames.push(frame);
            if done {
                break;
            }
        }
        assert_eq!(
            frames,
            vec![
                Message::Command(Command::Read),
                Message::Command(Command::Read),
                text(DICT_NAME_LABEL),
                text(VISUALIZATION_DICT),
                Message::Command(Command::Read),
                text("color"),
                text("blue"),
                Message::Command(Command::Finished),
                Message::Command(Command::Finished),
                Message::Command(Command::Finished),
                Message::Command(Command::Done),
            ]
        );

        coordinator.send(&WireValue::Text("training".into())).await.unwrap();
        assert_eq!(coordinator.receive().await.unwrap(), Message::Command(Command::Done));
        assert_eq!(worker.await.unwrap(), WorkerState::Ready);
    }

    #[tokio::test]
    async fn test_invalid_substeps_rejected() {
        let (mut coordinator, transport) = pair();
        let worker = tokio::spawn(async move {
            let mut client = WorkerClient::from_transport(
                transport,
                FrameLimits::default(),
                Some(7),
                GainEnv::default(),
                Box::new(MemoryStore::new()),
            )
            .await
            .unwrap();
            client.initialize().await
        });

        coordinator.receive_labeled().await.unwrap();
        coordinator.send_dict(PARAMETERS_DICT, None).await.unwrap();
        coordinator.send(&WireValue::Bool(true)).await.unwrap();
        coordinator.send(&WireValue::Int(0)).await.unwrap();

        let err = worker.await.unwrap().unwrap_err();
        assert!(matches!(err, WorkerError::Handshake(_)));
    }
}
