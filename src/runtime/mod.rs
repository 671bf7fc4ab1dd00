//! Long-running components and their supervisor.
//!
//! Every long-running piece of the control plane implements `Component`:
//! run until the stop token fires, release resources on the way out. The
//! `ResilientComponent` wrapper is a supervisor, restarting a failed
//! component with exponential backoff (reset after a healthy minute).

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::errors::Result;

#[async_trait]
pub trait Component: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Run until `stop` is cancelled. Returning `Ok` after a stop is a clean
    /// exit; returning `Err` while the token is live asks the supervisor for
    /// a restart.
    async fn run(&self, stop: CancellationToken) -> Result<()>;
}

const RESTART_BACKOFF_BASE: Duration = Duration::from_millis(100);
const RESTART_BACKOFF_CAP: Duration = Duration::from_secs(60);
const HEALTHY_RESET: Duration = Duration::from_secs(60);

/// Restart-on-error wrapper around a component.
pub struct ResilientComponent {
    inner: Arc<dyn Component>,
}

impl ResilientComponent {
    pub fn new(inner: Arc<dyn Component>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Component for ResilientComponent {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn run(&self, stop: CancellationToken) -> Result<()> {
        let mut backoff = RESTART_BACKOFF_BASE;
        loop {
            let started = Instant::now();
            let result = self.inner.run(stop.child_token()).await;
            if stop.is_cancelled() {
                return Ok(());
            }
            match result {
                Ok(()) => {
                    info!(component = self.inner.name(), "Component exited, restarting");
                }
                Err(err) => {
                    error!(component = self.inner.name(), error = %err, "Component failed, restarting");
                }
            }
            // A component that stayed up for a minute earned a fresh ladder.
            if started.elapsed() >= HEALTHY_RESET {
                backoff = RESTART_BACKOFF_BASE;
            }
            tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(RESTART_BACKOFF_CAP);
        }
    }
}

/// Owns a set of components: spawns each under one stop token and waits for
/// all of them on shutdown.
pub struct ComponentManager {
    components: Vec<Arc<dyn Component>>,
}

impl ComponentManager {
    pub fn new() -> Self {
        Self { components: Vec::new() }
    }

    pub fn add(&mut self, component: Arc<dyn Component>) {
        self.components.push(component);
    }

    pub async fn run(self, stop: CancellationToken) {
        let mut handles = Vec::with_capacity(self.components.len());
        for component in self.components {
            let stop = stop.clone();
            let name = component.name().to_string();
            handles.push(tokio::spawn(async move {
                if let Err(err) = component.run(stop).await {
                    error!(component = %name, error = %err, "Component terminated with error");
                }
            }));
        }
        stop.cancelled().await;
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl Default for ComponentManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyComponent {
        attempts: AtomicU32,
        succeed_after: u32,
        done: CancellationToken,
    }

    #[async_trait]
    impl Component for FlakyComponent {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn run(&self, stop: CancellationToken) -> Result<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt < self.succeed_after {
                return Err(crate::errors::Error::transport("connection refused"));
            }
            self.done.cancel();
            stop.cancelled().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn resilient_component_restarts_until_healthy() {
        let done = CancellationToken::new();
        let inner = Arc::new(FlakyComponent {
            attempts: AtomicU32::new(0),
            succeed_after: 3,
            done: done.clone(),
        });
        let resilient = ResilientComponent::new(inner.clone());

        let stop = CancellationToken::new();
        let runner = tokio::spawn({
            let stop = stop.clone();
            async move { resilient.run(stop).await }
        });

        // Wait for the component to reach its healthy run, then stop.
        done.cancelled().await;
        assert_eq!(inner.attempts.load(Ordering::SeqCst), 3);
        stop.cancel();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stop_during_backoff_exits_cleanly() {
        struct AlwaysFailing;
        #[async_trait]
        impl Component for AlwaysFailing {
            fn name(&self) -> &str {
                "always-failing"
            }
            async fn run(&self, _stop: CancellationToken) -> Result<()> {
                Err(crate::errors::Error::transport("boom"))
            }
        }

        let resilient = ResilientComponent::new(Arc::new(AlwaysFailing));
        let stop = CancellationToken::new();
        let runner = tokio::spawn({
            let stop = stop.clone();
            async move { resilient.run(stop).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.cancel();
        runner.await.unwrap().unwrap();
    }
}
