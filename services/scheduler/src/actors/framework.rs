//! Core actor framework types and traits.
//!
//! Provides the fundamental building blocks for the actor system:
//! - `Actor` trait for defining actor behavior
//! - `ActorHandle` for sending messages to actors
//! - `Supervisor` for spawning, looking up and stopping keyed actors

use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Core Traits
// =============================================================================

/// Marker trait for actor messages.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

/// The Actor trait defines behavior for an actor.
///
/// Actors:
/// - Process messages one at a time (no internal concurrency)
/// - Own mutable state not shared with other actors
/// - Communicate only via message passing
#[async_trait]
pub trait Actor: Send + 'static {
    /// The message type this actor handles.
    type Message: Message;

    /// Actor name for logging.
    fn name(&self) -> &str;

    /// Handle a single message.
    ///
    /// Returns `Ok(true)` to continue, `Ok(false)` to stop, or `Err` on failure.
    async fn handle(
        &mut self,
        msg: Self::Message,
        ctx: &mut ActorContext,
    ) -> Result<bool, ActorError>;

    /// Called when the actor starts.
    async fn on_start(&mut self, _ctx: &mut ActorContext) -> Result<(), ActorError> {
        Ok(())
    }

    /// Called when the actor is about to stop.
    async fn on_stop(&mut self, _ctx: &mut ActorContext) {}

    /// Called for each message still in the mailbox when the actor stops.
    fn on_discard(&mut self, _msg: Self::Message, _ctx: &mut ActorContext) {}
}

/// Context provided to actors during message handling.
pub struct ActorContext {
    /// Actor's unique ID.
    pub actor_id: String,

    /// Cancelled when the actor is stopped or its supervisor shuts down.
    pub cancel: CancellationToken,

    pub messages_processed: u64,

    pub last_message_at: Option<Instant>,

    /// Current actor state (for introspection).
    pub state: ActorState,
}

impl ActorContext {
    pub fn new(actor_id: String, cancel: CancellationToken) -> Self {
        Self {
            actor_id,
            cancel,
            messages_processed: 0,
            last_message_at: None,
            state: ActorState::Starting,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Actor lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorState {
    Starting,
    Running,
    /// Stopped after sitting idle; respawned on demand.
    Passivated,
    Stopping,
    Stopped,
    Failed,
}

// =============================================================================
// Errors
// =============================================================================

/// Errors that can occur in actors.
#[derive(Debug, Error)]
pub enum ActorError {
    /// Transient error; the actor keeps running.
    #[error("transient error: {0}")]
    Transient(String),

    /// Permanent error; the actor stops.
    #[error("permanent error: {0}")]
    Permanent(String),

    #[error("mailbox full")]
    MailboxFull,

    #[error("actor stopped")]
    ActorStopped,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

// =============================================================================
// Actor Handle
// =============================================================================

/// Handle for sending messages to an actor.
pub struct ActorHandle<M: Message> {
    tx: mpsc::Sender<M>,
    actor_id: String,
}

impl<M: Message> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            actor_id: self.actor_id.clone(),
        }
    }
}

impl<M: Message> ActorHandle<M> {
    /// Send a message, waiting for mailbox space.
    pub async fn send(&self, msg: M) -> Result<(), ActorError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| ActorError::ActorStopped)
    }

    /// Try to send a message without blocking.
    pub fn try_send(&self, msg: M) -> Result<(), ActorError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ActorError::MailboxFull,
            mpsc::error::TrySendError::Closed(_) => ActorError::ActorStopped,
        })
    }

    /// True once the actor stopped receiving.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }
}

// =============================================================================
// Supervisor
// =============================================================================

struct Child<M: Message> {
    handle: ActorHandle<M>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    /// Token of a draining predecessor this actor waits for.
    predecessor: Option<CancellationToken>,
}

impl<M: Message> Child<M> {
    fn is_running(&self) -> bool {
        !self.task.is_finished() && !self.handle.is_closed()
    }

    /// Mailbox closed but still finishing messages it already took.
    fn is_draining(&self) -> bool {
        !self.task.is_finished() && self.handle.is_closed()
    }

    fn cancel(&self) {
        self.cancel.cancel();
        if let Some(predecessor) = &self.predecessor {
            predecessor.cancel();
        }
    }
}

/// Supervisor for a family of actors addressed by key.
///
/// At most one live actor exists per key. Actors that passivated or stopped
/// are replaced transparently by [`Supervisor::get_or_spawn`]. A replacement
/// for an actor that is still draining its mailbox starts only once the
/// predecessor has finished, so two actors never handle the same key at once.
pub struct Supervisor<K, M: Message> {
    name: String,
    children: HashMap<K, Child<M>>,
    mailbox_size: usize,
    idle_timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl<K, M> Supervisor<K, M>
where
    K: Eq + Hash + Clone + Display,
    M: Message,
{
    /// Actors spawned by this supervisor run under children of `cancel`.
    pub fn new(
        name: impl Into<String>,
        mailbox_size: usize,
        idle_timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            name: name.into(),
            children: HashMap::new(),
            mailbox_size: mailbox_size.max(1),
            idle_timeout,
            cancel,
        }
    }

    /// Handle to the live actor for `key`, spawning one with `make` if there
    /// is none.
    pub fn get_or_spawn<A, F>(&mut self, key: &K, make: F) -> ActorHandle<M>
    where
        A: Actor<Message = M>,
        F: FnOnce() -> A,
    {
        if let Some(child) = self.children.get(key) {
            if child.is_running() {
                return child.handle.clone();
            }
        }
        self.spawn(key.clone(), make())
    }

    /// Spawn `actor` under `key`, replacing any previous actor for the key.
    ///
    /// A running predecessor is cancelled. A draining one is left to finish
    /// and the new actor waits for it before handling messages.
    pub fn spawn<A>(&mut self, key: K, actor: A) -> ActorHandle<M>
    where
        A: Actor<Message = M>,
    {
        let mut waits_for = None;
        if let Some(previous) = self.children.remove(&key) {
            if previous.is_draining() {
                debug!(supervisor = %self.name, key = %key, "Queueing behind draining actor");
                waits_for = Some((previous.task, previous.cancel));
            } else {
                previous.cancel();
            }
        }
        let (predecessor_task, predecessor) = waits_for.unzip();

        let actor_id = format!("{}/{}", self.name, key);
        let (tx, rx) = mpsc::channel(self.mailbox_size);
        let cancel = self.cancel.child_token();

        let task = tokio::spawn(run_actor_loop(
            actor,
            rx,
            cancel.clone(),
            actor_id.clone(),
            self.idle_timeout,
            predecessor_task,
        ));

        let handle = ActorHandle {
            tx,
            actor_id: actor_id.clone(),
        };
        self.children.insert(
            key,
            Child {
                handle: handle.clone(),
                cancel,
                task,
                predecessor,
            },
        );

        debug!(actor_id = %actor_id, "Spawned actor");
        handle
    }

    /// Cancel and forget the actor for `key`. Returns whether one existed.
    pub fn stop(&mut self, key: &K) -> bool {
        match self.children.remove(key) {
            Some(child) => {
                child.cancel();
                true
            }
            None => false,
        }
    }

    /// Stop every actor whose key fails `keep`. Returns the stopped keys.
    pub fn retain<F>(&mut self, mut keep: F) -> Vec<K>
    where
        F: FnMut(&K) -> bool,
    {
        let doomed: Vec<K> = self
            .children
            .keys()
            .filter(|key| !keep(key))
            .cloned()
            .collect();
        for key in &doomed {
            self.stop(key);
        }
        doomed
    }

    /// Forget actors that already stopped on their own. Draining actors are
    /// kept so they can still be stopped.
    pub fn prune(&mut self) -> usize {
        let before = self.children.len();
        self.children.retain(|_, child| !child.task.is_finished());
        before - self.children.len()
    }

    /// Get count of running actors.
    pub fn running_count(&self) -> usize {
        self.children.values().filter(|c| c.is_running()).count()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.children.get(key).is_some_and(|c| c.is_running())
    }

    /// Cancel every actor and wait up to `grace` for them to finish.
    /// Actors still running after that are aborted.
    pub async fn shutdown(&mut self, grace: Duration) {
        info!(supervisor = %self.name, count = self.children.len(), "Stopping all actors");
        self.cancel.cancel();

        let deadline = tokio::time::Instant::now() + grace;
        for (key, mut child) in self.children.drain() {
            match tokio::time::timeout_at(deadline, &mut child.task).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(supervisor = %self.name, key = %key, "Force aborting actor");
                    child.task.abort();
                }
            }
        }
    }
}

// =============================================================================
// Actor Loop
// =============================================================================

async fn run_actor_loop<A: Actor>(
    mut actor: A,
    mut rx: mpsc::Receiver<A::Message>,
    cancel: CancellationToken,
    actor_id: String,
    idle_timeout: Option<Duration>,
    predecessor: Option<JoinHandle<()>>,
) {
    let mut ctx = ActorContext::new(actor_id.clone(), cancel.clone());

    if let Some(predecessor) = predecessor {
        if let Err(e) = predecessor.await {
            warn!(actor_id = %actor_id, error = %e, "Predecessor actor did not finish cleanly");
        }
    }

    if let Err(e) = actor.on_start(&mut ctx).await {
        error!(actor_id = %actor_id, error = %e, "Actor failed to start");
        return;
    }

    ctx.state = ActorState::Running;
    debug!(actor_id = %actor_id, "Actor started");

    loop {
        let idle = async {
            match idle_timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!(actor_id = %actor_id, "Actor cancelled");
                break;
            }

            msg = rx.recv() => {
                let Some(msg) = msg else {
                    debug!(actor_id = %actor_id, "Actor mailbox closed");
                    break;
                };
                if !dispatch(&mut actor, msg, &mut ctx).await {
                    break;
                }
            }

            _ = idle => {
                // Refuse new messages, then finish whatever raced in.
                rx.close();
                while let Ok(msg) = rx.try_recv() {
                    if !dispatch(&mut actor, msg, &mut ctx).await {
                        break;
                    }
                }
                ctx.state = ActorState::Passivated;
                debug!(actor_id = %actor_id, "Actor passivated after idle timeout");
                break;
            }
        }
    }

    rx.close();
    while let Ok(msg) = rx.try_recv() {
        actor.on_discard(msg, &mut ctx);
    }

    let final_state = match ctx.state {
        ActorState::Passivated | ActorState::Failed => ctx.state,
        _ => ActorState::Stopped,
    };
    ctx.state = ActorState::Stopping;
    actor.on_stop(&mut ctx).await;
    ctx.state = final_state;

    debug!(
        actor_id = %actor_id,
        messages_processed = ctx.messages_processed,
        state = ?ctx.state,
        "Actor stopped"
    );
}

/// Handle one message. Returns false when the actor should stop.
async fn dispatch<A: Actor>(actor: &mut A, msg: A::Message, ctx: &mut ActorContext) -> bool {
    ctx.messages_processed += 1;
    ctx.last_message_at = Some(Instant::now());

    match actor.handle(msg, ctx).await {
        Ok(true) => true,
        Ok(false) => {
            debug!(actor_id = %ctx.actor_id, "Actor requested stop");
            false
        }
        Err(ActorError::Permanent(reason)) => {
            error!(actor_id = %ctx.actor_id, error = %reason, "Actor failed permanently");
            ctx.state = ActorState::Failed;
            false
        }
        Err(e) => {
            warn!(actor_id = %ctx.actor_id, error = %e, "Actor error");
            true
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
