//! Owns the lifecycle of a fanout run.
//!
//! ```text
//! Idle -> Provisioning -> Running -> Terminating -> Stopped
//!   \________________________________________________/
//!                   (disabled by settings)
//! ```
//!
//! A run ends either on a termination signal or when the source goes away.
//! Either way every worker is stopped within a bounded time before we report [`LifecycleState::Stopped`].

use std::{
    fmt::Display,
    future::Future,
    path::{Path, PathBuf},
    time::Duration,
};

use tokio::{io::AsyncRead, sync::watch};
use tracing::{debug, error, info, warn};

use crate::{
    broadcast::{self, EngineOptions, ShutdownReport, SinkFactory},
    config::Config,
    endpoint::{self, Numbering},
    error::Error,
    provision::{self, ProvisionPolicy},
    settings::Resolution,
};

/// Where a run is at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Nothing has happened yet.
    Idle,

    /// Clearing the endpoint paths, opening the source, bringing up endpoints.
    Provisioning,

    /// Replicating the source.
    Running,

    /// Stopping workers.
    Terminating,

    /// Done.
    Stopped,
}

impl LifecycleState {
    /// Is going from `self` to `next` allowed?
    pub fn can_become(self, next: LifecycleState) -> bool {
        use LifecycleState::*;

        matches!(
            (self, next),
            (Idle, Provisioning)
                | (Idle, Stopped)
                | (Provisioning, Running)
                | (Provisioning, Stopped)
                | (Running, Terminating)
                | (Terminating, Stopped)
        )
    }
}

impl Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Why a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The settings said not to run. Not an error.
    Disabled,

    /// We got a termination signal.
    Signal,

    /// The source closed or failed.
    SourceLost(String),
}

/// The result of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// Why we stopped.
    pub reason: StopReason,

    /// How teardown went, if there was anything to tear down.
    pub report: Option<ShutdownReport>,
}

impl Outcome {
    /// Did the run end in a way that should be reported as a failure?
    pub fn is_failure(&self) -> bool {
        matches!(self.reason, StopReason::SourceLost(_))
    }
}

/// The parts of [`Config`] the supervisor needs.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Endpoint path prefix.
    pub prefix: PathBuf,

    /// Endpoint numbering.
    pub numbering: Numbering,

    /// What to do about endpoints which fail to come up.
    pub policy: ProvisionPolicy,

    /// Chunks an endpoint may fall behind.
    pub queue_depth: usize,

    /// Sweep `<prefix><digits>` leftovers at the start of every run, enabled or not.
    pub sweep_stale: bool,

    /// How long workers get to stop.
    pub grace: Duration,
}

impl From<&Config> for Plan {
    fn from(config: &Config) -> Self {
        Self {
            prefix: config.endpoints.prefix.clone(),
            numbering: config.endpoints.numbering,
            policy: config.endpoints.policy,
            queue_depth: config.endpoints.queue_depth,
            sweep_stale: config.endpoints.sweep_stale,
            grace: Duration::from_millis(config.shutdown_timeout_ms),
        }
    }
}

/// Waits for a termination signal.
///
/// Returns `Ok(())` when any signal is received, or `Err` if signal registration fails.
#[cfg(unix)]
pub async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;
    let mut hangup = signal(SignalKind::hangup())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Ctrl-C, quitting"),
        _ = sigterm.recv() => info!("Terminated, quitting"),
        _ = sigquit.recv() => info!("Told to quit, quitting"),
        _ = hangup.recv() => info!("Told to hang up, quitting"),
    }

    Ok(())
}

fn warn_if_unprivileged(prefix: &Path) {
    if prefix.starts_with("/dev") && !nix::unistd::Uid::effective().is_root() {
        warn!(
            ?prefix,
            "Not running as root, creating endpoints under /dev will likely fail"
        );
    }
}

/// Drives one run from settings to teardown.
#[derive(Debug)]
pub struct Supervisor {
    state: watch::Sender<LifecycleState>,
    plan: Plan,
}

impl Supervisor {
    /// A supervisor which will carry out the given plan.
    pub fn new(plan: Plan) -> Self {
        let (state, _) = watch::channel(LifecycleState::Idle);

        Self { state, plan }
    }

    /// The current state.
    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Follow state changes.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    fn transition(&self, next: LifecycleState) {
        let previous = self.state();

        if !previous.can_become(next) {
            warn!(%previous, %next, "Unexpected lifecycle transition");
        }

        debug!(%previous, %next, "Lifecycle");
        self.state.send_replace(next);
    }

    /// Carry out a run.
    ///
    /// Leftover endpoints are swept first (if the plan says so), whether or not the settings enable the fanout.
    /// `open_source` is only awaited if the settings enable the fanout.
    /// The run lasts until `shutdown` resolves or the source is lost.
    /// If `shutdown` resolves while provisioning, the run stops without starting anything.
    ///
    /// A disabled run is `Ok` with [`StopReason::Disabled`].
    /// Failing to provision, or to open the source, is an `Err`.
    pub async fn run<R, S, F, Q>(
        &self,
        resolution: &Resolution,
        open_source: S,
        factory: &F,
        shutdown: Q,
    ) -> Result<Outcome, Error>
    where
        R: AsyncRead + Send + Unpin + 'static,
        S: Future<Output = Result<R, Error>>,
        F: SinkFactory,
        Q: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        resolution.log();

        if self.plan.sweep_stale {
            if let Err(e) = provision::sweep_stale(&self.plan.prefix) {
                warn!(?e, "Could not sweep stale endpoints");
            }
        }

        let count = match resolution.endpoint_count() {
            Some(count) => count,
            None => {
                info!("Nothing to do");
                self.transition(LifecycleState::Stopped);

                return Ok(Outcome {
                    reason: StopReason::Disabled,
                    report: None,
                });
            }
        };

        self.transition(LifecycleState::Provisioning);

        // Bringing up is polled first, so a signal only wins while it waits on something.
        let brought_up = tokio::select! {
            biased;
            brought_up = self.bring_up(count, open_source, factory) => Some(brought_up),
            _ = &mut shutdown => None,
        };

        let mut topology = match brought_up {
            Some(Ok(topology)) => topology,
            Some(Err(e)) => {
                error!(%e, "Could not bring up fanout");
                self.transition(LifecycleState::Stopped);
                return Err(e);
            }
            None => {
                info!("Stopped while provisioning");
                self.transition(LifecycleState::Stopped);

                return Ok(Outcome {
                    reason: StopReason::Signal,
                    report: None,
                });
            }
        };

        self.transition(LifecycleState::Running);

        let reason = tokio::select! {
            _ = &mut shutdown => StopReason::Signal,
            lost = topology.source_lost() => {
                error!(%lost, "Source gone, tearing down");
                match lost {
                    Error::SourceLost(why) => StopReason::SourceLost(why),
                    other => StopReason::SourceLost(other.to_string()),
                }
            }
        };

        self.transition(LifecycleState::Terminating);

        let report = match reason {
            StopReason::SourceLost(_) => topology.drain(self.plan.grace).await,
            _ => topology.shutdown(self.plan.grace).await,
        };

        self.transition(LifecycleState::Stopped);

        Ok(Outcome {
            reason,
            report: Some(report),
        })
    }

    async fn bring_up<R, S, F>(
        &self,
        count: u32,
        open_source: S,
        factory: &F,
    ) -> Result<broadcast::FanoutTopology, Error>
    where
        R: AsyncRead + Send + Unpin + 'static,
        S: Future<Output = Result<R, Error>>,
        F: SinkFactory,
    {
        let plan = &self.plan;

        warn_if_unprivileged(&plan.prefix);

        let endpoints = endpoint::describe(&plan.prefix, plan.numbering, count);
        let endpoints = provision::provision(endpoints, plan.policy)?;

        let source = open_source.await?;

        broadcast::start(
            source,
            endpoints,
            factory,
            EngineOptions {
                queue_depth: plan.queue_depth,
                policy: plan.policy,
            },
        )
    }
}
