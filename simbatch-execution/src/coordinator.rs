//! Batch coordinator
//!
//! The coordinator accepts a fixed number of workers, pushes the shared
//! settings to each, then assembles batches of sample lines in rounds. Each
//! round schedules up to one conversation per worker and runs them with the
//! configured [`RoundRunner`].

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};
use std::net::SocketAddr;
use tracing::{debug, error, info, warn};

use simbatch_config::{CoordinatorConfig, ProtocolConfig, RoundFailurePolicy};
use simbatch_ipc::{
    field_map_from_json, BlockingListener, Command, CommandContext, CommandHandler, Connection,
    FieldMap, FrameLimits, FrameListener, FrameTransport, IpcError, TokioListener, WireValue,
    INSTANCE_ID_LABEL, PREDICTION_INPUT_LABEL, PREDICTION_OUTPUT_LABEL,
};

use crate::environment::VISUALIZATION_STATE_LABEL;
use crate::error::CoordinatorError;
use crate::frame_limits;
use crate::runner::{Conversation, ConversationOutcome, RoundAction, RoundRunner, TaskRunner, ThreadRunner};
use crate::services::CoordinatorServices;
use crate::worker::{NO_STORE_LOCATION, PARAMETERS_DICT};

/// Coordinator over tokio tasks
pub type TaskCoordinator = Coordinator<TokioListener, TaskRunner>;

/// Coordinator with one OS thread per conversation. Drive it from a plain
/// thread, or use [`BlockingCoordinator`].
pub type ThreadCoordinator = Coordinator<BlockingListener, ThreadRunner>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Listening,
    Connected,
    Ready,
    Closed,
}

/// A connected worker
pub struct ClientSlot<T> {
    id: u32,
    pub(crate) conn: Connection<T>,
    pub(crate) data: FieldMap,
}

impl<T> ClientSlot<T> {
    pub(crate) fn new(id: u32, conn: Connection<T>) -> Self {
        Self {
            id,
            conn,
            data: FieldMap::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Labeled values and dictionaries the worker has sent
    pub fn data(&self) -> &FieldMap {
        &self.data
    }
}

impl<T: FrameTransport> ClientSlot<T> {
    async fn push_prediction(&mut self, prediction: &WireValue) -> Result<(), IpcError> {
        self.conn.send_command_prediction().await?;
        self.conn.send(prediction).await
    }

    async fn push_visualization(&mut self, state: &WireValue) -> Result<(), IpcError> {
        self.conn.send_command_visualisation().await?;
        self.conn.send_labeled(VISUALIZATION_STATE_LABEL, state, false).await
    }

    async fn push_partition(&mut self, partition: &str) -> Result<(), IpcError> {
        self.conn.send_command_change_db().await?;
        self.conn.send(&WireValue::Text(partition.to_string())).await
    }
}

/// Sample lines collected by one `get_batch` call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Batch {
    /// Lines in completion order
    pub lines: Vec<i64>,
    /// Worker that produced each line
    pub sample_to_client_id: Vec<u32>,
    pub rounds: usize,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// `(line, client_id)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (i64, u32)> + '_ {
        self.lines.iter().copied().zip(self.sample_to_client_id.iter().copied())
    }

    fn push(&mut self, line: i64, client_id: u32) {
        self.lines.push(line);
        self.sample_to_client_id.push(client_id);
    }
}

/// Coordinator reaction to requests a worker sends mid-conversation
#[derive(Debug, Clone, Default)]
pub struct CoordinatorHandler {
    services: CoordinatorServices,
}

impl CoordinatorHandler {
    pub fn new(services: CoordinatorServices) -> Self {
        Self { services }
    }
}

#[async_trait]
impl<T: FrameTransport> CommandHandler<T> for CoordinatorHandler {
    type Error = IpcError;

    /// A worker only says `exit` mid-conversation when it is going away
    async fn on_exit(&mut self, ctx: CommandContext<'_, T>) -> Result<(), IpcError> {
        warn!("Client {:?} exited mid-conversation", ctx.client_id);
        Err(IpcError::unexpected("'done'", "'exit'"))
    }

    async fn on_prediction(&mut self, ctx: CommandContext<'_, T>) -> Result<(), IpcError> {
        let client_id = ctx.client_id.unwrap_or_default();
        let (label, input) = ctx.conn.receive_labeled().await?;
        if label != PREDICTION_INPUT_LABEL {
            return Err(IpcError::unexpected(
                format!("label '{}'", PREDICTION_INPUT_LABEL),
                format!("label '{}'", label),
            ));
        }
        let service = self.services.prediction.as_ref().ok_or_else(|| {
            IpcError::External(anyhow::anyhow!(
                "client {} requested a prediction but no prediction service is configured",
                client_id
            ))
        })?;
        let prediction = service
            .compute_prediction(client_id, input)
            .await
            .map_err(IpcError::External)?;
        ctx.conn.send_labeled(PREDICTION_OUTPUT_LABEL, &prediction, false).await
    }

    async fn on_visualisation(&mut self, ctx: CommandContext<'_, T>) -> Result<(), IpcError> {
        let client_id = ctx.client_id.unwrap_or_default();
        let (_, instance) = ctx.conn.receive_labeled().await?;
        match &self.services.visualization {
            Some(sink) => sink
                .update_visualization(client_id, instance)
                .map_err(IpcError::External),
            None => {
                debug!("Client {} asked for a visualization update; no sink configured", client_id);
                Ok(())
            }
        }
    }
}

/// Settings pushed to every worker during initialisation
struct HandshakeSettings {
    parameters: FieldMap,
    allow_predictions: bool,
    substeps: i64,
    store_location: String,
    partition: String,
}

async fn handshake<T: FrameTransport>(
    slot: &mut ClientSlot<T>,
    handler: &mut CoordinatorHandler,
    settings: &HandshakeSettings,
) -> Result<(), IpcError> {
    slot.conn.send_dict(PARAMETERS_DICT, Some(&settings.parameters)).await?;
    slot.conn.send(&WireValue::Bool(settings.allow_predictions)).await?;
    slot.conn.send(&WireValue::Int(settings.substeps)).await?;
    slot.conn.send(&WireValue::Text(settings.store_location.clone())).await?;
    // Visualization data and parameters come back as dictionaries
    slot.conn
        .listen_while_not_done(handler, &mut slot.data, Some(slot.id))
        .await?;
    slot.conn.send(&WireValue::Text(settings.partition.clone())).await?;
    slot.conn.expect_command(Command::Done).await
}

async fn read_instance_id<T: FrameTransport>(
    conn: &mut Connection<T>,
) -> Result<Option<u32>, CoordinatorError> {
    let (label, value) = conn.receive_labeled().await?;
    if label != INSTANCE_ID_LABEL {
        return Err(CoordinatorError::Handshake(format!(
            "expected label '{}', got '{}'",
            INSTANCE_ID_LABEL, label
        )));
    }
    match value {
        WireValue::None | WireValue::Int(0) => Ok(None),
        WireValue::Int(id) => u32::try_from(id)
            .map(Some)
            .map_err(|_| CoordinatorError::Handshake(format!("invalid instance id {}", id))),
        other => Err(CoordinatorError::Handshake(format!(
            "instance id must be an int, got {}",
            other.kind_name()
        ))),
    }
}

/// Resolve requested ids. Unrequested ids get the lowest free id from 1, in
/// arrival order.
fn assign_ids(requested: &[Option<u32>]) -> Result<Vec<u32>, CoordinatorError> {
    let mut taken = BTreeSet::new();
    for id in requested.iter().flatten() {
        if !taken.insert(*id) {
            return Err(CoordinatorError::DuplicateClient(*id));
        }
    }

    let mut next = 1u32;
    Ok(requested
        .iter()
        .map(|requested| match requested {
            Some(id) => *id,
            None => {
                while taken.contains(&next) {
                    next += 1;
                }
                taken.insert(next);
                next
            }
        })
        .collect())
}

/// Accepts workers and assembles batches from them
pub struct Coordinator<L: FrameListener, R> {
    listener: L,
    runner: R,
    config: CoordinatorConfig,
    limits: FrameLimits,
    services: CoordinatorServices,
    clients: Vec<ClientSlot<L::Transport>>,
    replay: Option<VecDeque<i64>>,
    state: CoordinatorState,
}

impl TaskCoordinator {
    pub async fn bind(
        config: CoordinatorConfig,
        protocol: &ProtocolConfig,
        services: CoordinatorServices,
    ) -> Result<Self, CoordinatorError> {
        let listener = TokioListener::bind(&config.listen_address(), config.receive_timeout).await?;
        Ok(Coordinator::new(listener, TaskRunner, config, frame_limits(protocol), services))
    }
}

impl ThreadCoordinator {
    pub fn bind_blocking(
        config: CoordinatorConfig,
        protocol: &ProtocolConfig,
        services: CoordinatorServices,
    ) -> Result<Self, CoordinatorError> {
        let listener = BlockingListener::bind(config.listen_address(), config.receive_timeout)?;
        Ok(Coordinator::new(listener, ThreadRunner, config, frame_limits(protocol), services))
    }
}

impl<L, R> Coordinator<L, R>
where
    L: FrameListener,
    R: RoundRunner<L::Transport>,
{
    pub fn new(
        listener: L,
        runner: R,
        config: CoordinatorConfig,
        limits: FrameLimits,
        services: CoordinatorServices,
    ) -> Self {
        Self {
            listener,
            runner,
            config,
            limits,
            services,
            clients: Vec::new(),
            replay: None,
            state: CoordinatorState::Listening,
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn local_addr(&self) -> Result<SocketAddr, CoordinatorError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn is_listening(&self) -> bool {
        self.listener.is_open()
    }

    /// Connected worker ids, in dispatch order
    pub fn client_ids(&self) -> Vec<u32> {
        self.clients.iter().map(ClientSlot::id).collect()
    }

    pub fn client_data(&self, client_id: u32) -> Option<&FieldMap> {
        self.clients
            .iter()
            .find(|slot| slot.id == client_id)
            .map(ClientSlot::data)
    }

    /// Accept the configured number of workers and read their ids
    pub async fn connect(&mut self) -> Result<(), CoordinatorError> {
        self.expect_state(CoordinatorState::Listening, "connect")?;
        let expected = self.config.client_count();
        info!("Waiting for {} workers on {}", expected, self.config.listen_address());

        let mut requested = Vec::with_capacity(expected);
        let mut connections = Vec::with_capacity(expected);
        while connections.len() < expected {
            let transport = self.listener.accept().await?;
            let mut conn = Connection::new(transport).with_limits(self.limits);
            let id = read_instance_id(&mut conn).await?;
            debug!("Worker connected from {:?} requesting id {:?}", conn.peer(), id);
            requested.push(id);
            connections.push(conn);
        }

        let ids = assign_ids(&requested)?;
        let mut clients: Vec<_> = ids
            .into_iter()
            .zip(connections)
            .map(|(id, conn)| ClientSlot::new(id, conn))
            .collect();
        clients.sort_by_key(|slot| slot.id);
        self.clients = clients;
        self.state = CoordinatorState::Connected;
        info!("Connected workers {:?}", self.client_ids());
        Ok(())
    }

    /// Push the shared settings to every worker in turn
    pub async fn initialize(&mut self) -> Result<(), CoordinatorError> {
        self.expect_state(CoordinatorState::Connected, "initialize")?;
        let settings = HandshakeSettings {
            parameters: field_map_from_json(&self.config.environment_parameters),
            allow_predictions: self.config.allow_prediction_requests,
            substeps: i64::from(self.config.simulations_per_step),
            store_location: self
                .config
                .store_location
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| NO_STORE_LOCATION.to_string()),
            partition: self.config.store_partition.clone(),
        };

        for slot in &mut self.clients {
            let mut handler = CoordinatorHandler::new(self.services.clone());
            handshake(slot, &mut handler, &settings)
                .await
                .map_err(|source| CoordinatorError::Client {
                    client_id: slot.id,
                    source,
                })?;
            info!("Client {} initialisation done", slot.id);
        }
        self.state = CoordinatorState::Ready;
        Ok(())
    }

    /// `connect` then `initialize`
    pub async fn start(&mut self) -> Result<(), CoordinatorError> {
        self.connect().await?;
        self.initialize().await
    }

    /// Replay these stored lines, one per scheduled worker, before new
    /// samples are produced
    pub fn set_dataset_batch(&mut self, lines: impl IntoIterator<Item = i64>) {
        let queue: VecDeque<i64> = lines.into_iter().collect();
        debug!("Replay queue set with {} lines", queue.len());
        self.replay = Some(queue);
    }

    pub fn clear_dataset_batch(&mut self) {
        self.replay = None;
    }

    /// Lines still waiting to be replayed, if a replay batch is set
    pub fn pending_replay(&self) -> Option<usize> {
        self.replay.as_ref().map(VecDeque::len)
    }

    /// Collect `batch_size` lines. With `animate` false, workers only load
    /// replayed samples and no lines are returned.
    pub async fn get_batch(&mut self, animate: bool) -> Result<Batch, CoordinatorError> {
        let action = if animate {
            RoundAction::Step
        } else {
            RoundAction::LoadOnly
        };
        self.run_batch(action).await
    }

    /// Collect `batch_size` lines by storing each worker's current state
    /// without stepping
    pub async fn recompute_batch(&mut self) -> Result<Batch, CoordinatorError> {
        self.run_batch(RoundAction::Compute).await
    }

    async fn run_batch(&mut self, action: RoundAction) -> Result<Batch, CoordinatorError> {
        self.expect_state(CoordinatorState::Ready, "get a batch")?;
        let batch_size = self.config.batch_size;
        let policy = self.config.round_failure_policy;
        let mut batch = Batch::default();
        let mut scheduled_total = 0usize;

        while scheduled_total < batch_size {
            if self.clients.is_empty() {
                return Err(CoordinatorError::NoWorkers);
            }
            let wanted = self.clients.len().min(batch_size - scheduled_total);
            let rest = self.clients.split_off(wanted);
            let scheduled = std::mem::replace(&mut self.clients, rest);

            let mut conversations = Vec::with_capacity(scheduled.len());
            let mut idle = Vec::new();
            for slot in scheduled {
                let replay = match self.replay.as_mut() {
                    Some(queue) => match queue.pop_front() {
                        Some(line) => Some(line),
                        None => {
                            idle.push(slot);
                            continue;
                        }
                    },
                    None => None,
                };
                conversations.push(Conversation::round(
                    slot,
                    replay,
                    action,
                    CoordinatorHandler::new(self.services.clone()),
                ));
            }

            debug!(
                "Round {}: {} conversations, {} idle",
                batch.rounds + 1,
                conversations.len(),
                idle.len()
            );
            let outcomes = self.runner.run_all(conversations).await;
            batch.rounds += 1;
            scheduled_total += wanted;

            let mut failure = None;
            for outcome in outcomes {
                let err = match outcome {
                    ConversationOutcome::Finished { slot, result: Ok(line) } => {
                        if let Some(line) = line {
                            batch.push(line, slot.id);
                        }
                        self.clients.push(slot);
                        continue;
                    }
                    ConversationOutcome::Finished { slot, result: Err(source) } => {
                        CoordinatorError::Client {
                            client_id: slot.id,
                            source,
                        }
                    }
                    ConversationOutcome::Lost { client_id, reason } => {
                        CoordinatorError::Lost { client_id, reason }
                    }
                };
                match policy {
                    RoundFailurePolicy::Skip => warn!("Dropping worker: {}", err),
                    RoundFailurePolicy::Abort if failure.is_none() => {
                        error!("Round failed: {}", err);
                        failure = Some(err);
                    }
                    RoundFailurePolicy::Abort => error!("Round failed: {}", err),
                }
            }

            self.clients.extend(idle);
            self.clients.sort_by_key(|slot| slot.id);
            if let Some(err) = failure {
                self.finish_replay();
                return Err(err);
            }
        }

        self.finish_replay();
        info!("Batch of {} lines in {} rounds", batch.len(), batch.rounds);
        Ok(batch)
    }

    fn finish_replay(&mut self) {
        if self.replay.as_ref().is_some_and(VecDeque::is_empty) {
            debug!("Replay queue exhausted");
            self.replay = None;
        }
    }

    /// Push a prediction to one worker outside a round
    pub async fn send_prediction(&mut self, client_id: u32, prediction: &WireValue) -> Result<(), CoordinatorError> {
        let slot = self.ready_slot(client_id)?;
        slot.push_prediction(prediction)
            .await
            .map_err(|source| CoordinatorError::Client { client_id, source })
    }

    /// Push visualization state to one worker outside a round
    pub async fn refresh_visualization(&mut self, client_id: u32, state: &WireValue) -> Result<(), CoordinatorError> {
        let slot = self.ready_slot(client_id)?;
        slot.push_visualization(state)
            .await
            .map_err(|source| CoordinatorError::Client { client_id, source })
    }

    /// Switch every worker's store to `partition`
    pub async fn change_partition(&mut self, partition: &str) -> Result<(), CoordinatorError> {
        self.expect_state(CoordinatorState::Ready, "change partition")?;
        for slot in &mut self.clients {
            slot.push_partition(partition)
                .await
                .map_err(|source| CoordinatorError::Client {
                    client_id: slot.id,
                    source,
                })?;
        }
        info!("Workers switched to partition '{}'", partition);
        Ok(())
    }

    /// Shut every worker down concurrently and stop listening. Later calls
    /// do nothing.
    pub async fn close(&mut self) -> Result<(), CoordinatorError> {
        if self.state == CoordinatorState::Closed {
            return Ok(());
        }
        let slots = std::mem::take(&mut self.clients);
        info!("Shutting down {} workers", slots.len());
        let conversations = slots.into_iter().map(Conversation::shutdown).collect();
        let outcomes = self.runner.run_all(conversations).await;
        self.listener.close();
        self.state = CoordinatorState::Closed;

        let mut first_error = None;
        for outcome in outcomes {
            let err = match outcome {
                ConversationOutcome::Finished { slot, result: Ok(_) } => {
                    debug!("Client {} exited", slot.id);
                    continue;
                }
                ConversationOutcome::Finished {
                    slot,
                    result: Err(IpcError::UnexpectedMessage { received, .. }),
                } => CoordinatorError::ShutdownViolation {
                    client_id: slot.id,
                    received,
                },
                ConversationOutcome::Finished { slot, result: Err(source) } => CoordinatorError::Client {
                    client_id: slot.id,
                    source,
                },
                ConversationOutcome::Lost { client_id, reason } => CoordinatorError::Lost { client_id, reason },
            };
            error!("Shutdown failed: {}", err);
            first_error.get_or_insert(err);
        }

        match first_error {
            Some(err) => Err(err),
            None => {
                info!("Coordinator closed");
                Ok(())
            }
        }
    }

    fn expect_state(&self, expected: CoordinatorState, action: &str) -> Result<(), CoordinatorError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(CoordinatorError::InvalidState(format!(
                "cannot {} in state {:?}",
                action, self.state
            )))
        }
    }

    fn ready_slot(&mut self, client_id: u32) -> Result<&mut ClientSlot<L::Transport>, CoordinatorError> {
        self.expect_state(CoordinatorState::Ready, "push to a worker")?;
        self.clients
            .iter_mut()
            .find(|slot| slot.id == client_id)
            .ok_or(CoordinatorError::UnknownClient(client_id))
    }
}

/// Synchronous facade over [`ThreadCoordinator`]
pub struct BlockingCoordinator {
    inner: ThreadCoordinator,
}

impl BlockingCoordinator {
    pub fn bind(
        config: CoordinatorConfig,
        protocol: &ProtocolConfig,
        services: CoordinatorServices,
    ) -> Result<Self, CoordinatorError> {
        Ok(Self {
            inner: ThreadCoordinator::bind_blocking(config, protocol, services)?,
        })
    }

    pub fn inner(&self) -> &ThreadCoordinator {
        &self.inner
    }

    pub fn local_addr(&self) -> Result<SocketAddr, CoordinatorError> {
        self.inner.local_addr()
    }

    pub fn client_ids(&self) -> Vec<u32> {
        self.inner.client_ids()
    }

    pub fn connect(&mut self) -> Result<(), CoordinatorError> {
        futures::executor::block_on(self.inner.connect())
    }

    pub fn initialize(&mut self) -> Result<(), CoordinatorError> {
        futures::executor::block_on(self.inner.initialize())
    }

    pub fn start(&mut self) -> Result<(), CoordinatorError> {
        futures::executor::block_on(self.inner.start())
    }

    pub fn set_dataset_batch(&mut self, lines: impl IntoIterator<Item = i64>) {
        self.inner.set_dataset_batch(lines);
    }

    pub fn clear_dataset_batch(&mut self) {
        self.inner.clear_dataset_batch();
    }

    pub fn get_batch(&mut self, animate: bool) -> Result<Batch, CoordinatorError> {
        futures::executor::block_on(self.inner.get_batch(animate))
    }

    pub fn recompute_batch(&mut self) -> Result<Batch, CoordinatorError> {
        futures::executor::block_on(self.inner.recompute_batch())
    }

    pub fn send_prediction(&mut self, client_id: u32, prediction: &WireValue) -> Result<(), CoordinatorError> {
        futures::executor::block_on(self.inner.send_prediction(client_id, prediction))
    }

    pub fn refresh_visualization(&mut self, client_id: u32, state: &WireValue) -> Result<(), CoordinatorError> {
        futures::executor::block_on(self.inner.refresh_visualization(client_id, state))
    }

    pub fn change_partition(&mut self, partition: &str) -> Result<(), CoordinatorError> {
        futures::executor::block_on(self.inner.change_partition(partition))
    }

    pub fn close(&mut self) -> Result<(), CoordinatorError> {
        futures::executor::block_on(self.inner.close())
    }
}
