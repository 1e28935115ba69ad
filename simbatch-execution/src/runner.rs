//! Execution models for per-worker conversations
//!
//! A round hands every scheduled worker's [`Conversation`] to a
//! [`RoundRunner`], which runs them concurrently and returns their outcomes
//! in completion order. [`TaskRunner`] uses tokio tasks, [`ThreadRunner`]
//! one OS thread per conversation.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::task::JoinSet;
use tracing::{debug, error};

use simbatch_ipc::{Command, FrameTransport, IpcError, WireValue};

use crate::coordinator::{ClientSlot, CoordinatorHandler};

/// What a scheduled worker is asked to do after any replay load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundAction {
    /// Advance the simulation and return a new or updated line
    Step,
    /// Store the current state without stepping
    Compute,
    /// Only load the replayed sample; no line is returned
    LoadOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConversationKind {
    Round {
        replay: Option<i64>,
        action: RoundAction,
    },
    Shutdown,
}

/// One worker's part in a round or in shutdown
pub struct Conversation<T> {
    slot: ClientSlot<T>,
    kind: ConversationKind,
    handler: CoordinatorHandler,
}

/// Result of a conversation. `Lost` means the slot did not come back.
pub enum ConversationOutcome<T> {
    Finished {
        slot: ClientSlot<T>,
        result: Result<Option<i64>, IpcError>,
    },
    Lost {
        client_id: u32,
        reason: String,
    },
}

impl<T> ConversationOutcome<T> {
    pub fn client_id(&self) -> u32 {
        match self {
            ConversationOutcome::Finished { slot, .. } => slot.id(),
            ConversationOutcome::Lost { client_id, .. } => *client_id,
        }
    }
}

impl<T: FrameTransport> Conversation<T> {
    pub fn round(
        slot: ClientSlot<T>,
        replay: Option<i64>,
        action: RoundAction,
        handler: CoordinatorHandler,
    ) -> Self {
        Self {
            slot,
            kind: ConversationKind::Round { replay, action },
            handler,
        }
    }

    pub fn shutdown(slot: ClientSlot<T>) -> Self {
        Self {
            slot,
            kind: ConversationKind::Shutdown,
            handler: CoordinatorHandler::default(),
        }
    }

    pub fn client_id(&self) -> u32 {
        self.slot.id()
    }

    pub async fn run(mut self) -> ConversationOutcome<T> {
        let result = match self.kind {
            ConversationKind::Round { replay, action } => {
                run_round(&mut self.slot, replay, action, &mut self.handler).await
            }
            ConversationKind::Shutdown => run_shutdown(&mut self.slot).await.map(|()| None),
        };
        ConversationOutcome::Finished {
            slot: self.slot,
            result,
        }
    }
}

async fn run_round<T: FrameTransport>(
    slot: &mut ClientSlot<T>,
    replay: Option<i64>,
    action: RoundAction,
    handler: &mut CoordinatorHandler,
) -> Result<Option<i64>, IpcError> {
    let client_id = slot.id();
    if let Some(line) = replay {
        debug!("Client {} replays line {}", client_id, line);
        slot.conn.send_command_sample().await?;
        slot.conn.send(&WireValue::Int(line)).await?;
    }
    let command = match action {
        RoundAction::Step => Command::Step,
        RoundAction::Compute => Command::Compute,
        RoundAction::LoadOnly => return Ok(None),
    };
    slot.conn.send_command(command).await?;
    slot.conn
        .listen_while_not_done(handler, &mut slot.data, Some(client_id))
        .await?;
    let line = slot.conn.receive_int().await?;
    debug!("Client {} produced line {}", client_id, line);
    Ok(Some(line))
}

/// `exit`, `done`, then the worker must answer `exit`
async fn run_shutdown<T: FrameTransport>(slot: &mut ClientSlot<T>) -> Result<(), IpcError> {
    slot.conn.send_command_exit().await?;
    slot.conn.send_command_done().await?;
    slot.conn.expect_command(Command::Exit).await?;
    slot.conn.close().await
}

/// Runs a round's conversations concurrently
#[async_trait]
pub trait RoundRunner<T: FrameTransport>: Send {
    /// Outcomes come back in completion order, one per conversation
    async fn run_all(&self, conversations: Vec<Conversation<T>>) -> Vec<ConversationOutcome<T>>;
}

/// Cooperative model: one tokio task per conversation
#[derive(Debug, Default, Clone, Copy)]
pub struct TaskRunner;

#[async_trait]
impl<T: FrameTransport + 'static> RoundRunner<T> for TaskRunner {
    async fn run_all(&self, conversations: Vec<Conversation<T>>) -> Vec<ConversationOutcome<T>> {
        let mut tasks = JoinSet::new();
        let mut outcomes = Vec::with_capacity(conversations.len());
        let mut client_ids = HashMap::with_capacity(conversations.len());

        for conversation in conversations {
            let client_id = conversation.client_id();
            let handle = tasks.spawn(conversation.run());
            client_ids.insert(handle.id(), client_id);
        }

        while let Some(joined) = tasks.join_next().await {
            let join_error = match joined {
                Ok(outcome) => {
                    outcomes.push(outcome);
                    continue;
                }
                Err(join_error) => join_error,
            };
            let reason = if join_error.is_panic() {
                "conversation panicked"
            } else {
                "conversation cancelled"
            };
            match client_ids.get(&join_error.id()) {
                Some(&client_id) => {
                    error!("Conversation with client {} lost: {}", client_id, reason);
                    outcomes.push(ConversationOutcome::Lost {
                        client_id,
                        reason: reason.to_string(),
                    });
                }
                None => error!("Conversation task {} lost: {}", join_error.id(), reason),
            }
        }
        outcomes
    }
}

/// Thread-per-conversation model over blocking sockets. Each thread drives
/// its conversation to completion; `run_all` blocks the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRunner;

#[async_trait]
impl<T: FrameTransport + 'static> RoundRunner<T> for ThreadRunner {
    async fn run_all(&self, conversations: Vec<Conversation<T>>) -> Vec<ConversationOutcome<T>> {
        let tickets = AtomicUsize::new(0);

        let mut finished: Vec<(usize, ConversationOutcome<T>)> = std::thread::scope(|scope| {
            let handles: Vec<_> = conversations
                .into_iter()
                .map(|conversation| {
                    let client_id = conversation.client_id();
                    let tickets = &tickets;
                    let handle = std::thread::Builder::new()
                        .name(format!("simbatch-client-{}", client_id))
                        .spawn_scoped(scope, move || {
                            let outcome = futures::executor::block_on(conversation.run());
                            (tickets.fetch_add(1, Ordering::SeqCst), outcome)
                        });
                    (client_id, handle)
                })
                .collect();

            handles
                .into_iter()
                .map(|(client_id, handle)| {
                    let joined = match handle {
                        Ok(handle) => handle.join().map_err(|_| "conversation panicked".to_string()),
                        Err(e) => Err(format!("thread spawn failed: {}", e)),
                    };
                    joined.unwrap_or_else(|reason| {
                        error!("Conversation with client {} lost: {}", client_id, reason);
                        (usize::MAX, ConversationOutcome::Lost { client_id, reason })
                    })
                })
                .collect()
        });

        finished.sort_by_key(|(ticket, _)| *ticket);
        finished.into_iter().map(|(_, outcome)| outcome).collect()
    }
}
