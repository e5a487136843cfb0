//! Bounded worker pool: one coordinator task per opportunity, at most
//! `engine.max_concurrent` running at once.

use dashmap::DashSet;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::coordinator::{ExecutionCoordinator, ExecutionOutcome, Resolution};
use super::ExecutionServices;
use crate::types::Opportunity;

/// Tally of everything the dispatcher handled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub received: usize,
    /// Dropped because the same fingerprint was already executing.
    pub duplicates: usize,
    /// Served from an existing record without touching the chain.
    pub replayed: usize,
    pub confirmed: usize,
    pub failed: usize,
    pub abandoned: usize,
    pub monitoring_abandoned: usize,
    pub panicked: usize,
}

impl DispatchReport {
    fn record(&mut self, outcome: &ExecutionOutcome) {
        if outcome.replayed {
            self.replayed += 1;
        }
        match outcome.resolution {
            Resolution::Confirmed => self.confirmed += 1,
            Resolution::Failed => self.failed += 1,
            Resolution::Abandoned => self.abandoned += 1,
            Resolution::MonitoringAbandoned => self.monitoring_abandoned += 1,
        }
    }

    pub fn completed(&self) -> usize {
        self.confirmed + self.failed + self.abandoned + self.monitoring_abandoned
    }
}

pub struct Dispatcher {
    services: Arc<ExecutionServices>,
    coordinator: Arc<ExecutionCoordinator>,
    permits: Arc<Semaphore>,
    in_flight: Arc<DashSet<String>>,
}

impl Dispatcher {
    pub fn new(services: Arc<ExecutionServices>) -> Self {
        let coordinator = ExecutionCoordinator::new(services.clone());
        Self::with_coordinator(services, coordinator)
    }

    pub fn with_coordinator(services: Arc<ExecutionServices>, coordinator: ExecutionCoordinator) -> Self {
        let max_concurrent = services.config.engine.max_concurrent.max(1);
        Self {
            services,
            coordinator: Arc::new(coordinator),
            permits: Arc::new(Semaphore::new(max_concurrent)),
            in_flight: Arc::new(DashSet::new()),
        }
    }

    /// Fingerprints currently executing.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Execute opportunities from `rx` until the channel closes or `shutdown`
    /// fires, then wait for running coordinators to finish.
    ///
    /// Running coordinators see the same shutdown token and stop at their
    /// next cancellation point.
    pub async fn run(
        &self,
        mut rx: mpsc::Receiver<Opportunity>,
        shutdown: CancellationToken,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();
        let mut tasks: JoinSet<ExecutionOutcome> = JoinSet::new();

        info!(
            max_concurrent = self.services.config.engine.max_concurrent,
            "Dispatcher started"
        );

        loop {
            while let Some(joined) = tasks.try_join_next() {
                Self::collect(&mut report, joined);
            }

            let opp = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = rx.recv() => match next {
                    Some(opp) => opp,
                    None => break,
                },
            };
            report.received += 1;

            if !self.in_flight.insert(opp.fingerprint.clone()) {
                warn!(fingerprint = %opp.fingerprint, "Opportunity already executing, dropped");
                report.duplicates += 1;
                continue;
            }

            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    self.in_flight.remove(&opp.fingerprint);
                    break;
                }
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        self.in_flight.remove(&opp.fingerprint);
                        break;
                    }
                },
            };

            let ctx = self.services.context(&shutdown);
            let coordinator = self.coordinator.clone();
            let in_flight = self.in_flight.clone();
            debug!(fingerprint = %opp.fingerprint, lane = %opp.lane, "Dispatching");
            tasks.spawn(async move {
                let outcome = coordinator.execute(&opp, &ctx).await;
                in_flight.remove(&opp.fingerprint);
                drop(permit);
                outcome
            });
        }

        let draining = tasks.len();
        if draining > 0 {
            info!(running = draining, "Waiting for running executions");
        }
        while let Some(joined) = tasks.join_next().await {
            Self::collect(&mut report, joined);
        }

        info!(
            received = report.received,
            confirmed = report.confirmed,
            failed = report.failed,
            abandoned = report.abandoned,
            monitoring_abandoned = report.monitoring_abandoned,
            duplicates = report.duplicates,
            "Dispatcher stopped"
        );
        report
    }

    fn collect(report: &mut DispatchReport, joined: Result<ExecutionOutcome, tokio::task::JoinError>) {
        match joined {
            Ok(outcome) => report.record(&outcome),
            Err(e) => {
                error!(error = %e, "Execution task panicked");
                report.panicked += 1;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
