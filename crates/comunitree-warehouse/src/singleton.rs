//! Single long-lived session for interactive credentials
//!
//! Browser SSO needs a human for every login, so at most one session exists
//! and every concurrent caller shares the same in-flight attempt.

use crate::driver::{Connection, Driver};
use crate::error::{Result, WarehouseError};
use comunitree_core::config::DEFAULT_BROWSER_TIMEOUT;
use comunitree_core::{ConnectionConfig, CredentialVariant};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

type ConnectFuture = Shared<BoxFuture<'static, Result<Arc<dyn Connection>>>>;

enum Slot {
    Absent,
    Connecting {
        attempt: u64,
        future: ConnectFuture,
    },
    Ready {
        attempt: u64,
        connection: Arc<dyn Connection>,
    },
}

/// Observable state of the slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Absent,
    Connecting,
    Ready,
}

pub struct SingletonConnection {
    config: Arc<ConnectionConfig>,
    driver: Arc<dyn Driver>,
    slot: Mutex<Slot>,
    next_attempt: AtomicU64,
    connect_attempts: AtomicUsize,
    timeout: Duration,
}

impl SingletonConnection {
    pub fn new(config: Arc<ConnectionConfig>, driver: Arc<dyn Driver>) -> Self {
        let timeout = match &config.credential {
            CredentialVariant::InteractiveBrowser { timeout } => *timeout,
            _ => DEFAULT_BROWSER_TIMEOUT,
        };
        Self {
            config,
            driver,
            slot: Mutex::new(Slot::Absent),
            next_attempt: AtomicU64::new(0),
            connect_attempts: AtomicUsize::new(0),
            timeout,
        }
    }

    pub fn config(&self) -> &Arc<ConnectionConfig> {
        &self.config
    }

    /// Number of logins started so far
    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SlotState {
        match &*self.slot.lock() {
            Slot::Absent => SlotState::Absent,
            Slot::Connecting { .. } => SlotState::Connecting,
            Slot::Ready { .. } => SlotState::Ready,
        }
    }

    /// Return the live session, joining or starting a login as needed
    pub async fn get_connection(&self) -> Result<Arc<dyn Connection>> {
        let (attempt, future, stale) = {
            let mut slot = self.slot.lock();
            match &*slot {
                Slot::Ready { connection, .. } if !connection.is_closed() => {
                    return Ok(Arc::clone(connection));
                }
                Slot::Connecting { attempt, future } => (*attempt, future.clone(), None),
                Slot::Ready {
                    attempt,
                    connection,
                } => {
                    tracing::warn!(attempt, "interactive session was closed, logging in again");
                    let stale = Arc::clone(connection);
                    let (attempt, future) = self.begin(&mut slot);
                    (attempt, future, Some(stale))
                }
                Slot::Absent => {
                    let (attempt, future) = self.begin(&mut slot);
                    (attempt, future, None)
                }
            }
        };

        if let Some(stale) = stale {
            stale.close().await;
        }

        let result = future.await;

        let mut slot = self.slot.lock();
        let current = matches!(&*slot, Slot::Connecting { attempt: a, .. } if *a == attempt);
        if current {
            *slot = match &result {
                Ok(connection) => {
                    tracing::info!(attempt, "interactive session established");
                    Slot::Ready {
                        attempt,
                        connection: Arc::clone(connection),
                    }
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "interactive login failed");
                    Slot::Absent
                }
            };
        }

        result
    }

    fn begin(&self, slot: &mut Slot) -> (u64, ConnectFuture) {
        let attempt = self.next_attempt.fetch_add(1, Ordering::SeqCst) + 1;
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let driver = Arc::clone(&self.driver);
        let config = Arc::clone(&self.config);
        let timeout = self.timeout;

        tracing::info!(
            attempt,
            driver = driver.name(),
            timeout_secs = timeout.as_secs(),
            "starting interactive login"
        );

        let future = async move {
            match tokio::time::timeout(timeout, driver.connect(&config)).await {
                Ok(result) => result,
                Err(_) => Err(WarehouseError::Timeout(format!(
                    "interactive login did not complete within {}s",
                    timeout.as_secs()
                ))),
            }
        }
        .boxed()
        .shared();

        *slot = Slot::Connecting {
            attempt,
            future: future.clone(),
        };
        (attempt, future)
    }

    /// Run `f` on the session. If `f` fails the session is discarded so the
    /// next call logs in again; the error is passed through unchanged.
    pub async fn use_connection<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn Connection>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let connection = self.get_connection().await?;
        match f(Arc::clone(&connection)).await {
            Ok(value) => Ok(value),
            Err(e) => {
                self.invalidate_if_current(&connection).await;
                Err(e)
            }
        }
    }

    /// Discard `connection` if it is still the cached session. A newer
    /// session is left alone.
    pub async fn invalidate_if_current(&self, connection: &Arc<dyn Connection>) {
        let discarded = {
            let mut slot = self.slot.lock();
            match &*slot {
                Slot::Ready {
                    connection: cached,
                    attempt,
                } if Arc::ptr_eq(cached, connection) => {
                    tracing::warn!(attempt, "discarding interactive session after failure");
                    std::mem::replace(&mut *slot, Slot::Absent)
                }
                _ => Slot::Absent,
            }
        };

        if let Slot::Ready { connection, .. } = discarded {
            connection.close().await;
        }
    }

    /// Drop whatever the slot holds. An in-flight login is abandoned.
    pub async fn invalidate(&self) {
        let previous = std::mem::replace(&mut *self.slot.lock(), Slot::Absent);
        if let Slot::Ready { connection, .. } = previous {
            connection.close().await;
        }
    }
}
