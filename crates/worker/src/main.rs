//! Semo Billing Worker
//!
//! Handles scheduled jobs including:
//! - Webhook retry sweep over due pending/failed events (every minute)
//! - Completed webhook event cleanup (daily at 3:00 AM UTC)
//! - Ledger invariant checks (daily at 4:00 AM UTC)
//! - Health check heartbeat (every 5 minutes)
//!
//! Retry timing lives entirely in persisted `next_retry_at` state, so a
//! worker restart loses nothing: the next sweep picks up exactly where the
//! previous process stopped.

use std::sync::Arc;

use semo_billing::BillingService;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

/// How many due events one sweep pass will claim.
const SWEEP_BATCH_SIZE: i64 = 100;
/// Completed events older than this many days are dropped.
const EVENT_RETENTION_DAYS: i32 = 30;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Semo Billing Worker");

    let database_url =
        std::env::var("DATABASE_URL").map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

    let migration_pool = semo_shared::create_migration_pool(&database_url).await?;
    semo_shared::run_migrations(&migration_pool).await?;
    migration_pool.close().await;

    let pool = semo_shared::create_pool(&database_url).await?;

    let billing = Arc::new(BillingService::from_env(pool));

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Sweep due webhook events (every minute)
    // Re-delivers events still in pending/failed whose retry time elapsed.
    let sweep_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let billing = sweep_billing.clone();
            Box::pin(async move {
                match billing.processor.process_pending(SWEEP_BATCH_SIZE).await {
                    Ok(summary) => {
                        if summary.processed + summary.failed + summary.skipped == 0 {
                            tracing::debug!("No webhook events due");
                        }
                    }
                    Err(e) => error!(error = %e, "Webhook retry sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Webhook retry sweep (every minute)");

    // Job 2: Cleanup completed webhook events (daily at 3:00 AM UTC)
    let cleanup_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let billing = cleanup_billing.clone();
            Box::pin(async move {
                info!("Running webhook event cleanup");
                match billing
                    .event_store
                    .delete_completed_older_than_days(EVENT_RETENTION_DAYS)
                    .await
                {
                    Ok(deleted) => info!(deleted = deleted, "Webhook event cleanup complete"),
                    Err(e) => error!(error = %e, "Webhook event cleanup failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Webhook event cleanup (daily at 3:00 AM UTC)");

    // Job 3: Ledger invariant checks (daily at 4:00 AM UTC)
    let invariant_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 4 * * *", move |_uuid, _l| {
            let billing = invariant_billing.clone();
            Box::pin(async move {
                info!("Running ledger invariant checks");
                match billing.invariants.check_all().await {
                    Ok(summary) if summary.healthy => {
                        info!(checks_run = summary.checks_run, "All ledger invariants hold");
                    }
                    Ok(summary) => {
                        for violation in &summary.violations {
                            error!(
                                invariant = %violation.invariant,
                                severity = %violation.severity,
                                description = %violation.description,
                                "Ledger invariant violated"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Invariant check run failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Ledger invariant checks (daily at 4:00 AM UTC)");

    // Job 4: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Semo Billing Worker started successfully with 4 scheduled jobs");

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
    }
}
