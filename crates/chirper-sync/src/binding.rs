use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use chirper_gateway::Subscription;
use chirper_types::{Snapshot, SubscriptionError};

use crate::store::{Handle, RemoteStore};

/// Values a binding can mirror.
pub trait Model: Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static {}

impl<T> Model for T where T: Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static {}

/// Health of a binding's subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingState {
    Live,
    Reconnecting { attempt: u32 },
    /// Gave up; local state is frozen at the last applied snapshot.
    Degraded(SubscriptionError),
    Closed,
}

/// Exponential backoff used when a subscription drops.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Subscribe and wait for the initial snapshot.
pub(crate) async fn open(
    store: &dyn RemoteStore,
    handle: &Handle,
) -> Result<(Subscription, Snapshot), SubscriptionError> {
    let mut sub = store.subscribe(handle)?;
    match sub.next().await {
        Some(Ok(snapshot)) => Ok((sub, snapshot)),
        Some(Err(e)) => Err(e),
        None => Err(SubscriptionError::ConnectionLost),
    }
}

/// Feed snapshots into `apply` until the subscription fails for good.
pub(crate) async fn drive<F>(
    store: Arc<dyn RemoteStore>,
    handle: Handle,
    mut sub: Subscription,
    policy: ReconnectPolicy,
    state: Arc<watch::Sender<BindingState>>,
    mut apply: F,
) where
    F: FnMut(Snapshot) + Send,
{
    loop {
        match sub.next().await {
            Some(Ok(snapshot)) => apply(snapshot),
            Some(Err(SubscriptionError::ConnectionLost)) | None => {
                warn!("Subscription on {} lost, reconnecting", handle);
                match reconnect(store.as_ref(), &handle, &policy, &state).await {
                    Ok(fresh) => {
                        info!("Subscription on {} restored", handle);
                        sub = fresh;
                        state.send_replace(BindingState::Live);
                    }
                    Err(e) => {
                        warn!("Binding on {} degraded: {}", handle, e);
                        state.send_replace(BindingState::Degraded(e));
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                warn!("Binding on {} degraded: {}", handle, e);
                state.send_replace(BindingState::Degraded(e));
                return;
            }
        }
    }
}

async fn reconnect(
    store: &dyn RemoteStore,
    handle: &Handle,
    policy: &ReconnectPolicy,
    state: &watch::Sender<BindingState>,
) -> Result<Subscription, SubscriptionError> {
    let mut last = SubscriptionError::ConnectionLost;
    for attempt in 1..=policy.max_attempts {
        state.send_replace(BindingState::Reconnecting { attempt });
        tokio::time::sleep(policy.delay(attempt)).await;

        match store.subscribe(handle) {
            Ok(sub) => return Ok(sub),
            Err(e @ SubscriptionError::PermissionDenied { .. }) => return Err(e),
            Err(e) => {
                debug!("Reconnect attempt {} on {} failed: {}", attempt, handle, e);
                last = e;
            }
        }
    }
    Err(last)
}
