//! Scheduler module for running probe rounds and publishing their results.

mod round;

pub use round::RoundOutcome;

use round::{run_round, RoundContext};

use crate::config::{ConfigError, MonitorConfig};
use crate::endpoint::Field;
use crate::probe::{NetProber, ProbeEngine};
use crate::registry::Registry;
use crate::resolver::{DnsResolver, Resolve};
use crate::signal::{StopSignal, StopToken};

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::{JoinHandle, JoinSet};

/// Capacity of the update channel; slow subscribers see `Lagged`.
const UPDATE_CAPACITY: usize = 1024;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Scheduler is already running")]
    AlreadyRunning,
    #[error("Scheduler is not running")]
    NotRunning,
    #[error("No endpoint with index {0}")]
    UnknownEndpoint(u32),
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Running,
}

/// Fields of one endpoint that changed in a single commit.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointUpdate {
    pub index: u32,
    pub fields: Vec<Field>,
}

struct Inner {
    /// Fired by the next `stop`; every round, scheduled or not, observes it.
    signal: StopSignal,
    driver: Option<JoinHandle<()>>,
    config: Arc<MonitorConfig>,
    /// Interval of the most recent run, if any.
    last_interval: Option<Duration>,
}

/// Drives repeated probe rounds over every endpoint in a [`Registry`].
pub struct Scheduler {
    registry: Arc<Registry>,
    engine: Arc<dyn ProbeEngine>,
    resolver: Arc<dyn Resolve>,
    updates: broadcast::Sender<EndpointUpdate>,
    inner: Mutex<Inner>,
}

impl Scheduler {
    pub fn new(
        registry: Arc<Registry>,
        engine: Arc<dyn ProbeEngine>,
        resolver: Arc<dyn Resolve>,
    ) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        Self {
            registry,
            engine,
            resolver,
            updates,
            inner: Mutex::new(Inner {
                signal: StopSignal::new(),
                driver: None,
                config: Arc::new(MonitorConfig::default()),
                last_interval: None,
            }),
        }
    }

    /// Scheduler using real sockets and the system DNS configuration.
    pub fn with_system_network(registry: Arc<Registry>) -> Self {
        Self::new(
            registry,
            Arc::new(NetProber),
            Arc::new(DnsResolver::from_system_conf()),
        )
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Receive every change committed from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EndpointUpdate> {
        self.updates.subscribe()
    }

    pub async fn state(&self) -> SchedulerState {
        match self.inner.lock().await.driver {
            Some(_) => SchedulerState::Running,
            None => SchedulerState::Stopped,
        }
    }

    fn context(&self, config: Arc<MonitorConfig>, stop: StopToken) -> RoundContext {
        RoundContext {
            engine: self.engine.clone(),
            resolver: self.resolver.clone(),
            config,
            updates: self.updates.clone(),
            stop,
        }
    }

    /// Start probing every endpoint at `config.interval`. The first round
    /// fires immediately.
    ///
    /// Statistics survive a stop/start cycle unless the interval changed, in
    /// which case every endpoint is reset first.
    pub async fn start(&self, config: MonitorConfig) -> Result<(), SchedulerError> {
        config.validate()?;

        let mut inner = self.inner.lock().await;
        if inner.driver.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }

        let interval = config.interval();
        if inner.last_interval.is_some_and(|last| last != interval) {
            tracing::info!(
                "Scheduler: Interval changed to {:?}, resetting statistics",
                interval
            );
            let ctx = self.context(inner.config.clone(), StopToken::never());
            for slot in self.registry.snapshot().await {
                let fields = slot.lock().await.reset();
                ctx.publish(slot.index(), fields);
            }
        }

        let config = Arc::new(config);
        let ctx = Arc::new(self.context(config.clone(), inner.signal.token()));
        let driver = tokio::spawn(drive(ctx, self.registry.clone(), interval));

        tracing::info!(
            "Starting scheduler with {} endpoints every {:?}",
            self.registry.len().await,
            interval
        );

        inner.config = config;
        inner.last_interval = Some(interval);
        inner.driver = Some(driver);
        Ok(())
    }

    /// Cancel all in-flight rounds, including ones started by
    /// [`probe_once`](Self::probe_once), and wait for the scheduled ones to
    /// finish. Partial results are discarded.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        let (signal, driver) = {
            let mut inner = self.inner.lock().await;
            let driver = inner.driver.take().ok_or(SchedulerError::NotRunning)?;
            (std::mem::take(&mut inner.signal), driver)
        };

        signal.stop();
        if let Err(e) = driver.await {
            tracing::error!("Scheduler: Driver task failed: {}", e);
        }
        tracing::info!("Scheduler: Stopped");
        Ok(())
    }

    /// Run one round for a single endpoint now, outside the tick cadence.
    ///
    /// Uses the configuration of the current (or most recent) run. The next
    /// [`stop`](Self::stop) cancels it, even if the scheduler was stopped
    /// when the round began.
    pub async fn probe_once(&self, index: u32) -> Result<RoundOutcome, SchedulerError> {
        let slot = self
            .registry
            .get(index)
            .await
            .ok_or(SchedulerError::UnknownEndpoint(index))?;

        let ctx = {
            let inner = self.inner.lock().await;
            self.context(inner.config.clone(), inner.signal.token())
        };

        match slot.try_claim() {
            Some(claim) => Ok(run_round(&ctx, claim).await),
            None => Ok(RoundOutcome::Busy),
        }
    }

    /// Clear one endpoint's statistics and history.
    pub async fn reset(&self, index: u32) -> Result<(), SchedulerError> {
        let slot = self
            .registry
            .get(index)
            .await
            .ok_or(SchedulerError::UnknownEndpoint(index))?;

        let fields = slot.lock().await.reset();
        let _ = self.updates.send(EndpointUpdate { index, fields });
        Ok(())
    }
}

/// Tick at `interval`, spawning one round per idle endpoint, until stopped.
async fn drive(ctx: Arc<RoundContext>, registry: Arc<Registry>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut rounds = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = ctx.stop.stopped() => {
                break;
            }
            Some(joined) = rounds.join_next(), if !rounds.is_empty() => {
                log_round(joined);
            }
            _ = ticker.tick() => {
                for slot in registry.snapshot().await {
                    let Some(claim) = slot.try_claim() else {
                        tracing::debug!(
                            "Scheduler: Endpoint {} still in flight, skipping",
                            slot.index()
                        );
                        continue;
                    };
                    let ctx = ctx.clone();
                    let index = slot.index();
                    rounds.spawn(async move { (index, run_round(&ctx, claim).await) });
                }
            }
        }
    }

    // rounds observe the same stop signal and return promptly
    while let Some(joined) = rounds.join_next().await {
        log_round(joined);
    }
}

fn log_round(joined: Result<(u32, RoundOutcome), tokio::task::JoinError>) {
    match joined {
        Ok((index, outcome)) => {
            tracing::debug!("Scheduler: Endpoint {} round finished: {:?}", index, outcome)
        }
        Err(e) => tracing::error!("Scheduler: Round task failed: {}", e),
    }
}
