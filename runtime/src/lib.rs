//! # Slotwise Runtime
//!
//! Executes the effect descriptions returned by reducers.
//!
//! Reducers in Slotwise decide; services persist; the runtime then carries out
//! whatever side effects the reducer described (metrics increments, follow-up
//! work). Effects are fire-and-forget: a failing effect is logged and counted,
//! never propagated to the caller that produced it.
//!
//! ## Example
//!
//! ```ignore
//! use slotwise_runtime::EffectRunner;
//!
//! let runner = EffectRunner::new();
//! let effects = reducer.reduce(&mut state, action, &env);
//!
//! // ... persist the state change ...
//!
//! let mut handle = runner.run(effects);
//! handle.wait().await; // optional: tests wait, production callers don't
//! ```

use slotwise_core::effect::Effect;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Prometheus exporter installation and runtime metric descriptions
pub mod metrics;

/// Handle for tracking effect completion
///
/// Returned by [`EffectRunner::run()`] to allow waiting for effects to complete.
/// Every spawned effect increments a shared counter and decrements it when it
/// finishes (even if it panics); the handle resolves once the counter is zero.
///
/// # Example
///
/// ```ignore
/// let mut handle = runner.run(effects);
/// handle.wait_with_timeout(Duration::from_secs(5)).await?;
/// // All effects are now complete
/// ```
#[derive(Clone)]
pub struct EffectHandle {
    effects: Arc<AtomicUsize>,
    completion: watch::Receiver<()>,
}

impl EffectHandle {
    fn new() -> (Self, EffectTracking) {
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = watch::channel(());

        let handle = Self {
            effects: Arc::clone(&counter),
            completion: rx,
        };

        let tracking = EffectTracking {
            counter,
            notifier: Arc::new(tx),
        };

        (handle, tracking)
    }

    /// Create a handle that's already complete
    #[must_use]
    pub fn completed() -> Self {
        let (tx, rx) = watch::channel(());
        let _ = tx.send(());

        Self {
            effects: Arc::new(AtomicUsize::new(0)),
            completion: rx,
        }
    }

    /// Number of effects still running
    #[must_use]
    pub fn pending(&self) -> usize {
        self.effects.load(Ordering::SeqCst)
    }

    /// Wait for all effects to complete
    pub async fn wait(&mut self) {
        while self.effects.load(Ordering::SeqCst) > 0 {
            if self.completion.changed().await.is_err() {
                // Every tracker is gone, so nothing can still be running.
                break;
            }
        }
    }

    /// Wait for all effects to complete with a timeout
    ///
    /// # Errors
    ///
    /// Returns `Err(())` if the timeout expires before all effects complete.
    pub async fn wait_with_timeout(&mut self, timeout: Duration) -> Result<(), ()> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| ())
    }
}

impl std::fmt::Debug for EffectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectHandle")
            .field("pending_effects", &self.effects.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Internal: completion tracking passed through effect execution
#[derive(Clone)]
struct EffectTracking {
    counter: Arc<AtomicUsize>,
    notifier: Arc<watch::Sender<()>>,
}

impl EffectTracking {
    fn increment(&self) {
        self.counter.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement(&self) {
        if self.counter.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _ = self.notifier.send(());
        }
    }
}

/// Internal: RAII guard that decrements the effect counter on drop
///
/// Ensures the effect counter is always decremented, even if the effect panics.
struct DecrementGuard(EffectTracking);

impl Drop for DecrementGuard {
    fn drop(&mut self) {
        self.0.decrement();
    }
}

/// Executes effects on the ambient tokio runtime.
///
/// Actions produced by `Effect::Future`s are traced, then dropped.
pub struct EffectRunner<A> {
    _action: PhantomData<fn() -> A>,
}

impl<A> Clone for EffectRunner<A> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<A> Default for EffectRunner<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> EffectRunner<A> {
    /// Create a runner
    #[must_use]
    pub const fn new() -> Self {
        Self {
            _action: PhantomData,
        }
    }
}

impl<A> EffectRunner<A>
where
    A: Send + std::fmt::Debug + 'static,
{

    /// Execute a batch of effects.
    ///
    /// Returns immediately; the returned handle resolves when every spawned
    /// effect has finished.
    pub fn run<I>(&self, effects: I) -> EffectHandle
    where
        I: IntoIterator<Item = Effect<A>>,
    {
        let (handle, tracking) = EffectHandle::new();
        for effect in effects {
            self.execute_effect(effect, &tracking);
        }
        handle
    }

    /// Execute a single effect with tracking
    ///
    /// # Effect Types
    ///
    /// - `None`: No-op
    /// - `Future`: Executes async computation, traces the resulting action if `Some`
    /// - `Parallel`: Executes effects concurrently
    /// - `Sequential`: Executes effects in order, waiting for each to complete
    #[tracing::instrument(skip(self, effect, tracking), name = "execute_effect")]
    fn execute_effect(&self, effect: Effect<A>, tracking: &EffectTracking) {
        match effect {
            Effect::None => {
                tracing::trace!("Executing Effect::None (no-op)");
                ::metrics::counter!("effects_executed_total", "type" => "none").increment(1);
            },
            Effect::Future(fut) => {
                tracing::trace!("Executing Effect::Future");
                ::metrics::counter!("effects_executed_total", "type" => "future").increment(1);
                tracking.increment();

                let guard = DecrementGuard(tracking.clone());

                tokio::spawn(async move {
                    let _guard = guard;
                    let started = Instant::now();
                    let produced = fut.await;
                    ::metrics::histogram!("effect_duration_seconds")
                        .record(started.elapsed().as_secs_f64());

                    if let Some(action) = produced {
                        tracing::trace!(?action, "Effect::Future produced an action");
                    } else {
                        tracing::trace!("Effect::Future completed with no action");
                    }
                });
            },
            Effect::Parallel(effects) => {
                tracing::trace!("Executing Effect::Parallel with {} effects", effects.len());
                ::metrics::counter!("effects_executed_total", "type" => "parallel").increment(1);

                for effect in effects {
                    self.execute_effect(effect, tracking);
                }
            },
            Effect::Sequential(effects) => {
                let effect_count = effects.len();
                tracing::trace!("Executing Effect::Sequential with {} effects", effect_count);
                ::metrics::counter!("effects_executed_total", "type" => "sequential").increment(1);

                tracking.increment();
                let guard = DecrementGuard(tracking.clone());
                let runner = self.clone();

                tokio::spawn(async move {
                    let _guard = guard;

                    for (idx, effect) in effects.into_iter().enumerate() {
                        tracing::trace!(
                            "Executing sequential effect {} of {}",
                            idx + 1,
                            effect_count
                        );

                        let (mut sub_handle, sub_tracking) = EffectHandle::new();
                        runner.execute_effect(effect, &sub_tracking);
                        drop(sub_tracking);
                        sub_handle.wait().await;
                    }
                    tracing::trace!("Effect::Sequential completed");
                });
            },
        }
    }
}
