//! Flock Background Worker
//!
//! Drives the scheduled half of the billing engine:
//! - Daily billing cycle run (00:10 UTC)
//! - Renewal warning sweep (06:30 UTC)
//! - Daily invariant check (05:00 UTC)
//! - Health check heartbeat (every 5 minutes)
//!
//! The scheduler is external to the engine: every job here is safe to fire
//! more than once in the same window.

use std::sync::Arc;
use std::time::Duration;

use flock_billing::BillingService;
use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

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

    info!("Starting Flock Worker");

    let pool = create_db_pool().await?;
    flock_billing::run_migrations(&pool).await?;

    let billing = Arc::new(BillingService::from_env(pool)?);

    let scheduler = JobScheduler::new().await?;

    // Job 1: Daily billing cycle run
    // Cron: 00:10 UTC, shortly after the billing-date boundary
    let cycle_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 10 0 * * *", move |_uuid, _l| {
            let billing = cycle_billing.clone();
            Box::pin(async move {
                info!("Running daily billing cycle");
                let summary = billing.cycle.run_daily_billing_job().await;
                info!(
                    scanned = summary.scanned,
                    free_months = summary.free_months,
                    charged = summary.charged,
                    skipped = summary.skipped,
                    errors = summary.errors,
                    "Daily billing cycle complete"
                );
            })
        })?)
        .await?;
    info!("Scheduled: Daily billing cycle (00:10 UTC)");

    // Job 2: Renewal warning sweep
    // Flags subscriptions approaching their billing date whose one-shot
    // warning latch is unset; notification delivery happens downstream.
    let warning_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 30 6 * * *", move |_uuid, _l| {
            let billing = warning_billing.clone();
            Box::pin(async move {
                info!("Running renewal warning sweep");
                match billing
                    .subscriptions
                    .sweep_expiry_warnings(time::OffsetDateTime::now_utc())
                    .await
                {
                    Ok(flagged) => info!(flagged = flagged, "Renewal warning sweep complete"),
                    Err(e) => error!(error = %e, "Renewal warning sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Renewal warning sweep (06:30 UTC)");

    // Job 3: Daily invariant check
    let invariant_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 5 * * *", move |_uuid, _l| {
            let billing = invariant_billing.clone();
            Box::pin(async move {
                info!("Running billing invariant checks");
                match billing.invariants.run_all_checks().await {
                    Ok(summary) if summary.healthy => {
                        info!(checks_run = summary.checks_run, "All billing invariants hold");
                    }
                    Ok(summary) => {
                        for violation in &summary.violations {
                            error!(
                                invariant = %violation.invariant,
                                severity = %violation.severity,
                                description = %violation.description,
                                "Billing invariant violated"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Invariant check failed to run"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Daily invariant check (05:00 UTC)");

    // Job 4: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Flock Worker started successfully with {} scheduled jobs", 4);

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
