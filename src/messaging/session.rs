// src/messaging/session.rs
// The one transacted session a messenger owns. Every use goes through the
// session lock and covers the whole "operate, then commit or roll back"
// sequence, so transaction boundaries never interleave.

use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::errors::{MessengerError, Result};
use crate::properties::{CommitMode, DestinationOptions};
use crate::transport::{EndpointId, Frame, TransportSession};

/// Longest stretch a waiting receive holds the session lock.
pub const RECEIVE_SLICE: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Work may be pending; nothing has been resolved since the last boundary.
    Open,
    Committed,
    RolledBack,
}

struct SessionInner {
    transport: Box<dyn TransportSession>,
    transaction: TransactionState,
    /// Operations since the last commit or rollback.
    pending: usize,
    /// Set while an operation is in flight. Still set when the lock is next
    /// taken means that operation was cancelled half way.
    interrupted: bool,
    closed: bool,
}

pub struct TransactedSession {
    inner: Mutex<SessionInner>,
    commit_mode: CommitMode,
}

impl TransactedSession {
    pub fn new(transport: Box<dyn TransportSession>, commit_mode: CommitMode) -> Self {
        Self {
            inner: Mutex::new(SessionInner {
                transport,
                transaction: TransactionState::Open,
                pending: 0,
                interrupted: false,
                closed: false,
            }),
            commit_mode,
        }
    }

    pub fn commit_mode(&self) -> CommitMode {
        self.commit_mode
    }

    pub async fn transaction_state(&self) -> TransactionState {
        self.inner.lock().await.transaction
    }

    pub async fn create_producer(
        &self,
        destination: &str,
        options: &DestinationOptions,
    ) -> Result<EndpointId> {
        let mut session = self.acquire().await?;
        session
            .transport
            .create_producer(destination, options)
            .await
            .map_err(MessengerError::from_attach)
    }

    pub async fn create_consumer(
        &self,
        destination: &str,
        options: &DestinationOptions,
    ) -> Result<EndpointId> {
        let mut session = self.acquire().await?;
        session
            .transport
            .create_consumer(destination, options)
            .await
            .map_err(MessengerError::from_attach)
    }

    pub async fn send(&self, producer: EndpointId, frame: Frame) -> Result<()> {
        let mut session = self.acquire().await?;
        session.interrupted = true;

        if let Err(fault) = session.transport.send(producer, frame).await {
            self.abandon(&mut session).await;
            return Err(fault.into());
        }
        self.complete(&mut session).await
    }

    /// Waits for the next frame on `consumer`, at most `timeout` when given.
    ///
    /// The wait is split into slices of [`RECEIVE_SLICE`]; the session lock is
    /// released between slices so other callers are not starved by an idle
    /// receive. The deadline covers waiting for the lock as well.
    pub async fn receive(&self, consumer: EndpointId, timeout: Option<Duration>) -> Result<Frame> {
        let deadline = timeout.map(|limit| (Instant::now() + limit, limit));

        loop {
            let mut session = match deadline {
                Some((at, limit)) => tokio::time::timeout_at(at, self.acquire())
                    .await
                    .map_err(|_| MessengerError::Timeout(limit))??,
                None => self.acquire().await?,
            };

            // The transport receive is cancel-safe, so an expired slice consumes
            // nothing; the window that needs protection starts once a frame
            // has been handed over.
            let slice_end = Instant::now() + RECEIVE_SLICE;
            let wait_until = deadline.map_or(slice_end, |(at, _)| at.min(slice_end));
            match tokio::time::timeout_at(wait_until, session.transport.receive(consumer)).await {
                Ok(Ok(frame)) => {
                    self.complete(&mut session).await?;
                    return Ok(frame);
                }
                Ok(Err(fault)) => {
                    self.abandon(&mut session).await;
                    return Err(fault.into());
                }
                Err(_) => {
                    if let Some((at, limit)) = deadline {
                        if Instant::now() >= at {
                            return Err(MessengerError::Timeout(limit));
                        }
                    }
                    // The lock is fair, so queued callers get their turn here
                    drop(session);
                }
            }
        }
    }

    pub async fn commit(&self) -> Result<()> {
        let mut session = self.acquire().await?;
        if session.pending == 0 {
            return Ok(());
        }
        session.transport.commit().await?;
        session.pending = 0;
        session.transaction = TransactionState::Committed;
        debug!("Transaction committed");
        Ok(())
    }

    pub async fn rollback(&self) -> Result<()> {
        let mut session = self.acquire().await?;
        if session.pending == 0 {
            return Ok(());
        }
        session.transport.rollback().await?;
        session.pending = 0;
        session.transaction = TransactionState::RolledBack;
        debug!("Transaction rolled back");
        Ok(())
    }

    pub async fn close_producer(&self, producer: EndpointId) -> Result<()> {
        let mut session = self.acquire().await?;
        Ok(session.transport.close_producer(producer).await?)
    }

    pub async fn close_consumer(&self, consumer: EndpointId) -> Result<()> {
        let mut session = self.acquire().await?;
        Ok(session.transport.close_consumer(consumer).await?)
    }

    /// Commits or rolls back whatever the transaction still holds. Work left
    /// by a cancelled operation is always rolled back.
    pub async fn resolve(&self, commit_pending: bool) -> Result<()> {
        let mut session = self.inner.lock().await;
        if session.closed || (session.pending == 0 && !session.interrupted) {
            return Ok(());
        }

        let resolved = if commit_pending && !session.interrupted {
            session.transport.commit().await.map(|_| TransactionState::Committed)
        } else {
            session.transport.rollback().await.map(|_| TransactionState::RolledBack)
        };
        session.pending = 0;
        session.interrupted = false;

        let state = resolved.map_err(|fault| {
            error!(error = %fault, "Failed to resolve pending transaction");
            MessengerError::from(fault)
        })?;
        debug!(?state, "Resolved pending transaction");
        session.transaction = state;
        Ok(())
    }

    /// Closes the transport session. Later operations fail with `NotConnected`.
    pub async fn close(&self) -> Result<()> {
        let mut session = self.inner.lock().await;
        if session.closed {
            return Ok(());
        }
        session.closed = true;
        Ok(session.transport.close().await?)
    }

    async fn acquire(&self) -> Result<MutexGuard<'_, SessionInner>> {
        let mut session = self.inner.lock().await;
        if session.closed {
            return Err(MessengerError::NotConnected);
        }
        if session.interrupted {
            warn!(pending = session.pending, "Rolling back transaction left by a cancelled operation");
            session.transport.rollback().await?;
            session.pending = 0;
            session.interrupted = false;
            session.transaction = TransactionState::RolledBack;
        }
        Ok(session)
    }

    /// Ends a successful operation according to the commit mode.
    async fn complete(&self, session: &mut SessionInner) -> Result<()> {
        session.interrupted = true;
        session.pending += 1;
        session.transaction = TransactionState::Open;

        if self.commit_mode == CommitMode::Auto {
            if let Err(fault) = session.transport.commit().await {
                self.abandon(session).await;
                return Err(fault.into());
            }
            session.pending = 0;
            session.transaction = TransactionState::Committed;
        }
        session.interrupted = false;
        Ok(())
    }

    /// Ends a failed operation. In auto mode the failed unit of work is rolled
    /// back; in manual mode the caller's transaction is left as it was.
    async fn abandon(&self, session: &mut SessionInner) {
        if self.commit_mode == CommitMode::Auto {
            match session.transport.rollback().await {
                Ok(()) => session.transaction = TransactionState::RolledBack,
                Err(fault) => warn!(error = %fault, "Rollback after failed operation also failed"),
            }
            session.pending = 0;
        }
        session.interrupted = false;
    }
}
