//! Message routing into the history store.
//!
//! Detectors hand messages to a [`MessageSender`] and move on; the router task
//! applies each message on its own task so a slow store write never holds up
//! the sender. Ordering between messages comes from the store's write lock.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::constants::constants;
use crate::protocol::{Ack, Message, dispatch};
use crate::store::{HistoryStore, StoreError, StoreResult};

#[derive(Debug, Error)]
pub enum RouterError {
  #[error("router is not running")]
  Closed,

  #[error("router queue is full")]
  Full,

  #[error(transparent)]
  Store(#[from] StoreError),
}

struct Envelope {
  message: Message,
  reply: Option<oneshot::Sender<StoreResult<Ack>>>,
}

/// Cheap, clonable entry point for submitting messages.
#[derive(Clone)]
pub struct MessageSender {
  tx: mpsc::Sender<Envelope>,
}

impl MessageSender {
  /// Fire-and-forget. Never waits: a full queue or stopped router drops the message.
  pub fn send(&self, message: Message) -> Result<(), RouterError> {
    let kind = message.kind();
    self.tx.try_send(Envelope { message, reply: None }).map_err(|e| {
      let err = match e {
        mpsc::error::TrySendError::Full(_) => RouterError::Full,
        mpsc::error::TrySendError::Closed(_) => RouterError::Closed,
      };
      warn!(kind, err = %err, "router: message dropped");
      err
    })
  }

  /// Submit a message and wait for the store's acknowledgement.
  pub async fn request(&self, message: Message) -> Result<Ack, RouterError> {
    let (reply, rx) = oneshot::channel();
    self.tx.send(Envelope { message, reply: Some(reply) }).await.map_err(|_| RouterError::Closed)?;
    let result = rx.await.map_err(|_| RouterError::Closed)?;
    Ok(result?)
  }
}

pub struct RouterHandle {
  sender: MessageSender,
  task: JoinHandle<()>,
}

impl RouterHandle {
  /// Start the router task. Must be called from within a Tokio runtime.
  pub fn spawn(store: Arc<HistoryStore>) -> Self {
    let (tx, mut rx) = mpsc::channel::<Envelope>(constants().router_queue_size);

    let task = tokio::spawn(async move {
      let mut inflight = JoinSet::new();
      while let Some(Envelope { message, reply }) = rx.recv().await {
        let store = store.clone();
        inflight.spawn(async move {
          let kind = message.kind();
          let result = dispatch(&store, message).await;
          match &result {
            Ok(ack) => debug!(kind, ?ack, "router: message applied"),
            Err(e) => warn!(kind, err = %e, "router: message failed"),
          }
          if let Some(reply) = reply {
            let _ = reply.send(result);
          }
        });
        while inflight.try_join_next().is_some() {}
      }
      while inflight.join_next().await.is_some() {}
      info!("router: stopped");
    });

    Self { sender: MessageSender { tx }, task }
  }

  pub fn sender(&self) -> MessageSender {
    self.sender.clone()
  }

  pub fn send(&self, message: Message) -> Result<(), RouterError> {
    self.sender.send(message)
  }

  pub async fn request(&self, message: Message) -> Result<Ack, RouterError> {
    self.sender.request(message).await
  }

  /// Stop accepting messages and wait for in-flight ones to finish.
  ///
  /// Messages sent through clones obtained from [`RouterHandle::sender`] keep
  /// the router alive until those clones are dropped too.
  pub async fn shutdown(self) {
    drop(self.sender);
    let _ = self.task.await;
  }
}
