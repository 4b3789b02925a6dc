//! Periodic enrichment fan-out
//!
//! The parent loop lists members due for enrichment and spawns one
//! detached child per member. Cancelling the parent stops scheduling; a
//! child already running finishes or exhausts its retries.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cdp_common::time::now;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::service::EnrichmentService;
use crate::config::EnrichmentConfig;
use crate::db::members;
use crate::error::SinkResult;
use crate::tasks::{spawn_task, RetryPolicy, TaskOptions};

pub struct EnrichmentScheduler {
    service: Arc<EnrichmentService>,
    interval: Duration,
    batch_size: i64,
    member_timeout: Duration,
    retry: RetryPolicy,
    /// Members with a child still running
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
}

impl EnrichmentScheduler {
    pub fn new(service: Arc<EnrichmentService>, config: &EnrichmentConfig) -> Self {
        Self {
            service,
            interval: Duration::from_secs(config.interval_secs.max(1)),
            batch_size: config.batch_size,
            member_timeout: Duration::from_secs(config.member_timeout_secs),
            retry: config.retry.clone(),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn claim(&self, member_id: Uuid) -> bool {
        match self.in_flight.lock() {
            Ok(mut set) => set.insert(member_id),
            Err(poisoned) => poisoned.into_inner().insert(member_id),
        }
    }

    /// One scheduling pass; returns how many children were spawned
    pub async fn tick(&self, parent: &CancellationToken) -> SinkResult<usize> {
        let tried_before = now() - chrono::Duration::seconds(self.interval.as_secs() as i64);
        let due = members::list_members_for_enrichment(self.service.pool(), tried_before, self.batch_size).await?;

        let mut spawned = 0;
        for member in due {
            let member_id = member.id;
            if !self.claim(member_id) {
                continue;
            }

            let options = TaskOptions {
                name: format!("enrich-member-{}", member_id),
                timeout: self.member_timeout,
                retry: self.retry.clone(),
                detach: true,
            };
            let service = Arc::clone(&self.service);
            let handle: JoinHandle<SinkResult<bool>> = spawn_task(options, parent, move || {
                let service = Arc::clone(&service);
                async move { service.enrich_member(member_id).await }
            });

            let in_flight = Arc::clone(&self.in_flight);
            let service = Arc::clone(&self.service);
            tokio::spawn(async move {
                let failed = match handle.await {
                    Ok(Ok(_)) => false,
                    Ok(Err(e)) => {
                        tracing::error!(member_id = %member_id, error = %e, "Member enrichment failed");
                        true
                    }
                    Err(e) => {
                        tracing::error!(member_id = %member_id, error = %e, "Member enrichment task panicked");
                        true
                    }
                };
                if failed {
                    if let Err(e) = service.record_failed_attempt(member_id).await {
                        tracing::warn!(member_id = %member_id, error = %e, "Could not record failed enrichment attempt");
                    }
                }
                match in_flight.lock() {
                    Ok(mut set) => set.remove(&member_id),
                    Err(poisoned) => poisoned.into_inner().remove(&member_id),
                };
            });
            spawned += 1;
        }

        if spawned > 0 {
            tracing::info!(count = spawned, "Scheduled member enrichments");
        }
        Ok(spawned)
    }

    /// Run `tick` every interval until `cancel` fires
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(interval_secs = self.interval.as_secs(), "Enrichment scheduler started");
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.tick(&cancel).await {
                            tracing::error!(error = %e, "Enrichment scheduling pass failed");
                        }
                    }
                }
            }
            tracing::info!("Enrichment scheduler stopped");
        })
    }
}
