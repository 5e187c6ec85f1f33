//! Asynchronous status updates.
//!
//! Updates are queued on a bounded channel and a dispatcher task applies each one in
//! its own task, so writes for different messages run concurrently and may complete
//! in any order. Every write goes through [`Store::advance_status`]; an update that
//! arrives late never moves a message backward.

use std::time::Duration;

use tokio::{
    sync::{mpsc, Mutex},
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, error, warn};

use crate::{error::Error, message::MessageStatus, store::Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusUpdate {
    pub message_id: i64,
    pub status: MessageStatus,
}

pub struct StatusUpdater {
    tx: Mutex<Option<mpsc::Sender<StatusUpdate>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl StatusUpdater {
    pub fn new(store: Store, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let dispatcher = tokio::spawn(dispatch(store, rx));

        Self {
            tx: Mutex::new(Some(tx)),
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    /// Queues an update. Waits while the channel is full.
    pub async fn update(&self, message_id: i64, status: MessageStatus) -> Result<(), Error> {
        let tx = self
            .tx
            .lock()
            .await
            .clone()
            .ok_or(Error::UpdaterClosed)?;

        tx.send(StatusUpdate { message_id, status })
            .await
            .map_err(|_| Error::UpdaterClosed)
    }

    /// Stops accepting updates and waits until every queued update was applied.
    pub async fn close(&self, timeout: Duration) {
        self.tx.lock().await.take();

        let Some(mut dispatcher) = self.dispatcher.lock().await.take() else {
            return;
        };

        match tokio::time::timeout(timeout, &mut dispatcher).await {
            Ok(Ok(())) => debug!("status updater closed"),
            Ok(Err(e)) => error!(error = %e, "status updater task failed"),
            Err(_) => {
                warn!(?timeout, "status updater timed out, abandoning pending updates");
                dispatcher.abort();
            }
        }
    }
}

async fn dispatch(store: Store, mut rx: mpsc::Receiver<StatusUpdate>) {
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            update = rx.recv() => match update {
                Some(update) => {
                    in_flight.spawn(apply(store.clone(), update));
                }
                None => break,
            },
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "status update task failed");
                }
            }
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "status update task failed");
        }
    }
}

async fn apply(store: Store, update: StatusUpdate) {
    let StatusUpdate { message_id, status } = update;

    match store.advance_status(message_id, status).await {
        Ok(true) => debug!(message_id, %status, "status updated"),
        Ok(false) => debug!(message_id, %status, "status already at or past target"),
        Err(e) => error!(message_id, %status, error = %e, "failed to update status"),
    }
}
