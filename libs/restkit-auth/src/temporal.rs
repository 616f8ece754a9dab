//! Expiry-aware, single-flight cache for one externally acquired value.
//!
//! A [`TemporalResource`] holds at most one value (typically an access token).
//! Reads of a fresh value take a read lock and nothing else. When the value is
//! missing or due for refresh, the first caller starts the acquisition and
//! every concurrent caller awaits the same in-flight future, so the acquisition
//! function runs once no matter how many requests authenticate at the same
//! time. No lock is held while the acquisition runs.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::RwLock;
use restkit_http::BoxError;
use thiserror::Error;
use time::OffsetDateTime;

/// Values are refreshed this long before they expire
pub const DEFAULT_REFRESH_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Acquisition failure, shared by every caller that waited on it
#[derive(Debug, Clone, Error)]
#[error(transparent)]
pub struct AcquireError(Arc<dyn std::error::Error + Send + Sync>);

impl From<BoxError> for AcquireError {
    fn from(err: BoxError) -> Self {
        Self(Arc::from(err))
    }
}

/// Value produced by an acquisition, with its lifetime
#[derive(Debug, Clone)]
pub struct Acquired<V> {
    pub value: V,
    pub expires_on: OffsetDateTime,
    /// Explicit refresh point; defaults to `expires_on` minus the refresh window
    pub refresh_on: Option<OffsetDateTime>,
}

impl<V> Acquired<V> {
    #[must_use]
    pub fn new(value: V, expires_on: OffsetDateTime) -> Self {
        Self {
            value,
            expires_on,
            refresh_on: None,
        }
    }

    #[must_use]
    pub fn with_refresh_on(mut self, refresh_on: Option<OffsetDateTime>) -> Self {
        self.refresh_on = refresh_on;
        self
    }
}

type AcquireFn<V, A> =
    Arc<dyn Fn(A) -> BoxFuture<'static, Result<Acquired<V>, BoxError>> + Send + Sync>;

type InFlight<V> = Shared<BoxFuture<'static, Result<V, AcquireError>>>;

struct Cached<V> {
    value: V,
    expires_on: OffsetDateTime,
    refresh_at: OffsetDateTime,
}

struct Flight<V> {
    id: u64,
    future: InFlight<V>,
}

struct State<V> {
    current: Option<Cached<V>>,
    in_flight: Option<Flight<V>>,
    // Bumped by `expire`; results of acquisitions started before are dropped
    epoch: u64,
    next_flight: u64,
}

/// Single-flight cache around an acquisition function taking `A`
pub struct TemporalResource<V, A> {
    state: Arc<RwLock<State<V>>>,
    acquire: AcquireFn<V, A>,
    refresh_window: Duration,
}

impl<V, A> TemporalResource<V, A>
where
    V: Clone + Send + Sync + 'static,
    A: Send + 'static,
{
    #[must_use]
    pub fn new<F, Fut>(acquire: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Acquired<V>, BoxError>> + Send + 'static,
    {
        Self {
            state: Arc::new(RwLock::new(State {
                current: None,
                in_flight: None,
                epoch: 0,
                next_flight: 0,
            })),
            acquire: Arc::new(move |input| acquire(input).boxed()),
            refresh_window: DEFAULT_REFRESH_WINDOW,
        }
    }

    #[must_use]
    pub fn with_refresh_window(mut self, window: Duration) -> Self {
        self.refresh_window = window;
        self
    }

    /// Return the cached value or acquire a new one with `input`.
    ///
    /// Only the caller that starts an acquisition uses its `input`; callers
    /// joining an in-flight acquisition get that acquisition's result. While a
    /// refresh is in flight, callers that find an unexpired value return it
    /// without waiting.
    ///
    /// # Errors
    /// Returns the acquisition's error to every caller that waited on it.
    pub async fn get(&self, input: A) -> Result<V, AcquireError> {
        let now = OffsetDateTime::now_utc();
        {
            let state = self.state.read();
            if let Some(cached) = state.current.as_ref().filter(|c| now < c.refresh_at) {
                return Ok(cached.value.clone());
            }
        }

        let flight = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            if let Some(cached) = state.current.as_ref().filter(|c| now < c.refresh_at) {
                return Ok(cached.value.clone());
            }
            if let Some(flight) = &state.in_flight {
                if let Some(cached) = state.current.as_ref().filter(|c| now < c.expires_on) {
                    return Ok(cached.value.clone());
                }
                flight.future.clone()
            } else {
                let id = state.next_flight;
                state.next_flight += 1;
                let future = self.start(input, id, state.epoch);
                state.in_flight = Some(Flight {
                    id,
                    future: future.clone(),
                });
                future
            }
        };

        flight.await
    }

    /// Drop the cached value; the next [`get`](Self::get) always acquires.
    ///
    /// An acquisition already in flight still completes for its waiters, but its
    /// result is not cached.
    pub fn expire(&self) {
        let mut state = self.state.write();
        state.current = None;
        state.in_flight = None;
        state.epoch += 1;
    }

    /// Whether a value is cached and not yet due for refresh
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        let now = OffsetDateTime::now_utc();
        self.state
            .read()
            .current
            .as_ref()
            .is_some_and(|c| now < c.refresh_at)
    }

    fn start(&self, input: A, id: u64, epoch: u64) -> InFlight<V> {
        let acquire = Arc::clone(&self.acquire);
        let state = Arc::clone(&self.state);
        let window = time::Duration::try_from(self.refresh_window).unwrap_or(time::Duration::ZERO);

        async move {
            let outcome = acquire(input).await;
            let mut state = state.write();
            if state.in_flight.as_ref().is_some_and(|f| f.id == id) {
                state.in_flight = None;
            }
            match outcome {
                Ok(acquired) => {
                    if state.epoch == epoch {
                        let refresh_at = acquired
                            .refresh_on
                            .or_else(|| acquired.expires_on.checked_sub(window))
                            .unwrap_or(acquired.expires_on)
                            .min(acquired.expires_on);
                        state.current = Some(Cached {
                            value: acquired.value.clone(),
                            expires_on: acquired.expires_on,
                            refresh_at,
                        });
                    }
                    Ok(acquired.value)
                }
                Err(err) => Err(AcquireError::from(err)),
            }
        }
        .boxed()
        .shared()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    fn counting(
        lifetime: time::Duration,
    ) -> (TemporalResource<String, String>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let resource = TemporalResource::new(move |input: String| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                Ok(Acquired::new(
                    format!("{input}-{n}"),
                    OffsetDateTime::now_utc() + lifetime,
                ))
            }
        });
        (resource, calls)
    }

    #[tokio::test]
    async fn test_concurrent_gets_acquire_once() {
        let (resource, calls) = counting(time::Duration::hours(1));
        let resource = Arc::new(resource);

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let r = Arc::clone(&resource);
                tokio::spawn(async move { r.get("token".to_owned()).await })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "token-1");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fresh_value_is_reused() {
        let (resource, calls) = counting(time::Duration::hours(1));
        assert_eq!(resource.get("a".to_owned()).await.unwrap(), "a-1");
        assert_eq!(resource.get("b".to_owned()).await.unwrap(), "a-1");
        assert!(resource.is_fresh());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_value_inside_refresh_window_is_reacquired() {
        let (resource, calls) = counting(time::Duration::minutes(2));
        assert_eq!(resource.get("a".to_owned()).await.unwrap(), "a-1");
        assert!(!resource.is_fresh());
        assert_eq!(resource.get("a".to_owned()).await.unwrap(), "a-2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_expire_forces_reacquisition() {
        let (resource, calls) = counting(time::Duration::hours(1));
        resource.get("a".to_owned()).await.unwrap();
        resource.expire();
        assert_eq!(resource.get("b".to_owned()).await.unwrap(), "b-2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_explicit_refresh_on_wins() {
        let resource = TemporalResource::new(|(): ()| async {
            let now = OffsetDateTime::now_utc();
            Ok(Acquired::new(7, now + time::Duration::hours(1))
                .with_refresh_on(now.checked_sub(time::Duration::seconds(1))))
        });
        resource.get(()).await.unwrap();
        assert!(!resource.is_fresh());
    }

    #[tokio::test]
    async fn test_error_reaches_every_waiter_and_is_not_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let resource = Arc::new(TemporalResource::new(move |(): ()| {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                Err::<Acquired<u32>, BoxError>("identity endpoint unreachable".into())
            }
        }));

        let (a, b) = tokio::join!(resource.get(()), resource.get(()));
        assert_eq!(a.unwrap_err().to_string(), "identity endpoint unreachable");
        assert!(b.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(resource.get(()).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unexpired_value_served_during_refresh() {
        let gate = Arc::new(Notify::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let (gate_in, counter) = (Arc::clone(&gate), Arc::clone(&calls));
        let resource = Arc::new(TemporalResource::new(move |(): ()| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let gate = Arc::clone(&gate_in);
            async move {
                if n > 0 {
                    gate.notified().await;
                }
                Ok(Acquired::new(
                    n,
                    OffsetDateTime::now_utc() + time::Duration::minutes(2),
                ))
            }
        }));

        assert_eq!(resource.get(()).await.unwrap(), 0);

        let leader = {
            let r = Arc::clone(&resource);
            tokio::spawn(async move { r.get(()).await })
        };
        while calls.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }
        assert_eq!(resource.get(()).await.unwrap(), 0);

        gate.notify_one();
        assert_eq!(leader.await.unwrap().unwrap(), 1);
    }
}
