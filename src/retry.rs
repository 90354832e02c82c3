//! Bounded retries for optimistic-concurrency writes.

use crate::errors::*;
use crate::store::ObjectStore;
use kube::{Resource, ResourceExt};
use log::debug;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub struct Backoff {
    /// Attempts before giving up.
    pub steps: u32,
    /// Delay after the first failed attempt.
    pub duration: Duration,
    /// Growth of the delay per attempt.
    pub factor: f64,
    /// Up to this fraction of the delay is added at random.
    pub jitter: f64,
    pub cap: Option<Duration>,
}

/// Used for conflicting writes of Units and UnitSet status.
pub const DEFAULT_RETRY: Backoff = Backoff {
    steps: 5,
    duration: Duration::from_millis(10),
    factor: 1.0,
    jitter: 0.1,
    cap: None,
};

/// Used when waiting on another actor, e.g. a revision being adopted.
pub const DEFAULT_BACKOFF: Backoff = Backoff {
    steps: 4,
    duration: Duration::from_millis(10),
    factor: 5.0,
    jitter: 0.1,
    cap: None,
};

impl Backoff {
    pub fn with_steps(self, steps: u32) -> Self {
        Backoff { steps, ..self }
    }

    /// Delay to wait after `attempt` failures, counting from 0.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(64) as i32;
        let scaled = self.duration.as_secs_f64() * self.factor.powi(exp);
        let base = match self.cap {
            Some(cap) if scaled >= cap.as_secs_f64() => cap,
            _ => Duration::from_secs_f64(scaled.min(f64::from(u32::MAX))),
        };
        if self.jitter > 0.0 {
            base + base.mul_f64(rand::thread_rng().gen_range(0.0..self.jitter))
        } else {
            base
        }
    }
}

/// Drives a read-modify-write cycle. `modify` derives the object to write
/// from the latest copy, or `None` when nothing needs writing. On conflict the
/// object is read again and `modify` re-applied, up to `backoff.steps` times.
pub async fn read_modify_write<S, K, M, W, Fut>(
    store: &S,
    backoff: &Backoff,
    mut current: K,
    mut modify: M,
    mut write: W,
) -> Result<Option<K>>
where
    S: ObjectStore<K> + ?Sized,
    K: Resource<DynamicType = ()>,
    M: FnMut(&K) -> Result<Option<K>>,
    W: FnMut(K) -> Fut,
    Fut: Future<Output = Result<K>>,
{
    let namespace = current.namespace().unwrap_or_default();
    let name = current.name_any();
    for attempt in 0..backoff.steps {
        let desired = match modify(&current)? {
            Some(desired) => desired,
            None => return Ok(None),
        };
        match write(desired).await {
            Ok(written) => return Ok(Some(written)),
            Err(e) if e.is_conflict() => {
                debug!(
                    "conflict writing {}/{} on attempt {}, re-reading",
                    namespace,
                    name,
                    attempt + 1
                );
                let delay = backoff.delay(attempt);
                tokio::time::sleep(delay).await;
                current = store.get(&namespace, &name).await?;
            }
            Err(e) => return Err(e),
        }
    }
    bail!(ErrorKind::RetriesExhausted(K::kind(&()).into_owned(), name, backoff.steps))
}
