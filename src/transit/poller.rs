// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Outbox Poller
//!
//! Background task that sweeps every hosted identity's outbox so failed
//! deliveries are retried without a caller present.
//!
//! ## Strategy
//!
//! Every `poll_interval` (default 30 s) the poller, per tenant:
//! 1. Calls `process_outbox`, attempting each due item once.
//! 2. Evicts upload packages older than their TTL and deletes their temp
//!    parts.
//!
//! One tenant's failure is logged and does not stop the sweep of the others.
//!
//! ## Shutdown
//!
//! Uses `tokio_util::sync::CancellationToken` for graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::tenant::TenantRegistry;

/// Default interval between sweeps.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

pub struct OutboxPoller {
    tenants: Arc<TenantRegistry>,
    poll_interval: Duration,
}

impl OutboxPoller {
    pub fn new(tenants: Arc<TenantRegistry>, poll_interval: Duration) -> Self {
        Self { tenants, poll_interval }
    }

    /// Run the poller loop until the cancellation token is triggered.
    ///
    /// Should be spawned as a background task:
    /// ```rust,ignore
    /// tokio::spawn(poller.run(shutdown.clone()));
    /// ```
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.poll_interval.as_secs(),
            tenants = self.tenants.len(),
            "Outbox poller starting"
        );

        loop {
            if shutdown.is_cancelled() {
                info!("Outbox poller shutting down");
                return;
            }

            self.poll_step().await;

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {},
                _ = shutdown.cancelled() => {
                    info!("Outbox poller shutting down");
                    return;
                }
            }
        }
    }

    /// One sweep over every tenant.
    pub async fn poll_step(&self) {
        for tenant in self.tenants.iter() {
            match tenant.process_outbox().await {
                Ok(report) if report != Default::default() => {
                    info!(
                        tenant = %tenant.identity,
                        delivered = report.delivered,
                        rescheduled = report.rescheduled,
                        dropped = report.dropped,
                        failed = report.failed,
                        "Outbox poller: swept tenant"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(tenant = %tenant.identity, error = %e, "Outbox poller: sweep failed");
                }
            }

            match tenant.uploads.reclaim_expired_packages().await {
                Ok(0) => {}
                Ok(reclaimed) => info!(tenant = %tenant.identity, reclaimed, "Outbox poller: reclaimed abandoned uploads"),
                Err(e) => warn!(tenant = %tenant.identity, error = %e, "Outbox poller: upload reclaim failed"),
            }
        }
    }
}
