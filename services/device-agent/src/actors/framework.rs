//! Core actor framework types and traits.
//!
//! - `Actor` trait for defining actor behavior
//! - `ActorHandle` for sending messages and awaiting replies
//! - `Mailbox` + [`spawn`] for running an actor on its own task
//!
//! The mailbox is created before the actor so an actor can keep a handle to
//! itself and post follow-up messages (timers, child-process exits).

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Marker trait for actor messages.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

/// The Actor trait defines behavior for an actor.
///
/// Actors process messages one at a time and own their state exclusively.
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

    /// Called before the first message.
    async fn on_start(&mut self, _ctx: &mut ActorContext) -> Result<(), ActorError> {
        Ok(())
    }

    /// Called when the loop exits for any reason.
    async fn on_stop(&mut self, _ctx: &mut ActorContext) {}
}

/// Context provided to actors during message handling.
pub struct ActorContext {
    pub actor_id: String,

    /// Shutdown signal receiver.
    pub shutdown: watch::Receiver<bool>,

    pub messages_processed: u64,
}

impl ActorContext {
    pub fn new(actor_id: String, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            actor_id,
            shutdown,
            messages_processed: 0,
        }
    }
}

/// Errors that can occur in actors.
#[derive(Debug, Error)]
pub enum ActorError {
    /// Error that stops the actor.
    #[error("permanent error: {0}")]
    Permanent(String),

    #[error("actor stopped")]
    ActorStopped,
}

/// Handle for sending messages to an actor.
pub struct ActorHandle<M: Message> {
    tx: mpsc::Sender<M>,
}

// Derived Clone would require `M: Clone`.
impl<M: Message> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<M: Message> ActorHandle<M> {
    /// Send a message to the actor.
    pub async fn send(&self, msg: M) -> Result<(), ActorError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| ActorError::ActorStopped)
    }

    /// Send a message carrying a reply channel and wait for the reply.
    pub async fn call<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> M) -> Result<R, ActorError>
    where
        R: Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply)).await?;
        rx.await.map_err(|_| ActorError::ActorStopped)
    }
}

/// Receiving side of an actor's mailbox.
pub struct Mailbox<M: Message> {
    rx: mpsc::Receiver<M>,
    actor_id: String,
}

/// Create a mailbox and the matching handle.
pub fn mailbox<M: Message>(name: &str, size: usize) -> (ActorHandle<M>, Mailbox<M>) {
    let actor_id = format!("{}_{}", name, generate_actor_id());
    let (tx, rx) = mpsc::channel(size);
    (ActorHandle { tx }, Mailbox { rx, actor_id })
}

/// Run `actor` on its own task until shutdown, a stop request, or a
/// permanent error.
pub fn spawn<A: Actor>(
    actor: A,
    mailbox: Mailbox<A::Message>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    info!(actor_id = %mailbox.actor_id, actor_type = %actor.name(), "Spawned actor");
    tokio::spawn(run_actor_loop(actor, mailbox, shutdown))
}

async fn run_actor_loop<A: Actor>(
    mut actor: A,
    mailbox: Mailbox<A::Message>,
    mut shutdown: watch::Receiver<bool>,
) {
    let Mailbox { mut rx, actor_id } = mailbox;
    let mut ctx = ActorContext::new(actor_id.clone(), shutdown.clone());

    if let Err(e) = actor.on_start(&mut ctx).await {
        error!(actor_id = %actor_id, error = %e, "Actor failed to start");
        return;
    }
    debug!(actor_id = %actor_id, "Actor started");

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(actor_id = %actor_id, "Actor received shutdown signal");
                    break;
                }
            }

            msg = rx.recv() => {
                let Some(msg) = msg else {
                    debug!(actor_id = %actor_id, "Actor mailbox closed");
                    break;
                };
                ctx.messages_processed += 1;

                match actor.handle(msg, &mut ctx).await {
                    Ok(true) => {}
                    Ok(false) => {
                        info!(actor_id = %actor_id, "Actor requested stop");
                        break;
                    }
                    Err(ActorError::Permanent(reason)) => {
                        error!(actor_id = %actor_id, error = %reason, "Actor failed");
                        break;
                    }
                    Err(e) => {
                        error!(actor_id = %actor_id, error = %e, "Actor error");
                    }
                }
            }
        }
    }

    actor.on_stop(&mut ctx).await;
    info!(
        actor_id = %actor_id,
        messages_processed = ctx.messages_processed,
        "Actor stopped"
    );
}

static ACTOR_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn generate_actor_id() -> u64 {
    ACTOR_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    enum CounterMessage {
        Add(u64),
        Get(oneshot::Sender<u64>),
        Fail,
        Stop,
    }

    struct Counter {
        total: u64,
        stopped: Option<oneshot::Sender<u64>>,
    }

    #[async_trait]
    impl Actor for Counter {
        type Message = CounterMessage;

        fn name(&self) -> &str {
            "counter"
        }

        async fn handle(
            &mut self,
            msg: CounterMessage,
            _ctx: &mut ActorContext,
        ) -> Result<bool, ActorError> {
            match msg {
                CounterMessage::Add(n) => self.total += n,
                CounterMessage::Get(reply) => {
                    let _ = reply.send(self.total);
                }
                CounterMessage::Fail => return Err(ActorError::Permanent("boom".to_string())),
                CounterMessage::Stop => return Ok(false),
            }
            Ok(true)
        }

        async fn on_stop(&mut self, _ctx: &mut ActorContext) {
            if let Some(tx) = self.stopped.take() {
                let _ = tx.send(self.total);
            }
        }
    }

    #[tokio::test]
    async fn test_messages_are_processed_in_order() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, mailbox) = mailbox("counter", 8);
        let task = spawn(
            Counter {
                total: 0,
                stopped: None,
            },
            mailbox,
            shutdown_rx,
        );

        handle.send(CounterMessage::Add(2)).await.unwrap();
        handle.send(CounterMessage::Add(3)).await.unwrap();
        let total = handle.call(CounterMessage::Get).await.unwrap();
        assert_eq!(total, 5);

        handle.send(CounterMessage::Stop).await.unwrap();
        task.await.unwrap();
        assert!(matches!(
            handle.send(CounterMessage::Add(1)).await,
            Err(ActorError::ActorStopped)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_runs_on_stop() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, mailbox) = mailbox("counter", 8);
        let (stopped_tx, stopped_rx) = oneshot::channel();
        let task = spawn(
            Counter {
                total: 0,
                stopped: Some(stopped_tx),
            },
            mailbox,
            shutdown_rx,
        );

        handle.send(CounterMessage::Add(7)).await.unwrap();
        assert_eq!(handle.call(CounterMessage::Get).await.unwrap(), 7);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(stopped_rx.await.unwrap(), 7);
        assert!(matches!(
            handle.call(CounterMessage::Get).await,
            Err(ActorError::ActorStopped)
        ));
    }

    #[tokio::test]
    async fn test_permanent_error_stops_actor() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, mailbox) = mailbox("counter", 8);
        let (stopped_tx, stopped_rx) = oneshot::channel();
        let task = spawn(
            Counter {
                total: 0,
                stopped: Some(stopped_tx),
            },
            mailbox,
            shutdown_rx,
        );

        handle.send(CounterMessage::Add(4)).await.unwrap();
        handle.send(CounterMessage::Fail).await.unwrap();
        task.await.unwrap();
        assert_eq!(stopped_rx.await.unwrap(), 4);
    }
}
