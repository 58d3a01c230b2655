use std::{sync::Arc, time::Duration};

use chrono::Utc;
use sqlx::SqlitePool;
use tokio::{sync::Semaphore, task::JoinHandle};
use tracing::{error, info};

use crate::{
    config::AppConfig,
    models::{Asset, PortFinding, Scan, ScanResultRecord, ScanStatus},
    scanner::{validate_target, Probe, TargetError},
};

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("asset {0} not found")]
    AssetNotFound(i64),
    #[error("scan {0} not found")]
    ScanNotFound(i64),
    #[error("invalid target: {0}")]
    InvalidTarget(#[from] TargetError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// The pending scan record plus a handle on the task driving it. Dropping
/// the handle detaches the task; it keeps running to a terminal state.
#[derive(Debug)]
pub struct StartedScan {
    pub scan: Scan,
    pub task: JoinHandle<()>,
}

/// Owns the scan lifecycle: creates scan rows, supervises one probe
/// invocation per scan, and ingests results. Only the task spawned by
/// `start_scan` ever advances a given scan's state, so no two tasks touch
/// the same scan row.
pub struct ScanManager {
    pool: SqlitePool,
    probe: Arc<dyn Probe>,
    scan_timeout: Duration,
    permits: Arc<Semaphore>,
}

impl ScanManager {
    pub fn new(pool: SqlitePool, probe: Arc<dyn Probe>, config: &AppConfig) -> Self {
        Self {
            pool,
            probe,
            scan_timeout: config.scan_timeout(),
            permits: Arc::new(Semaphore::new(config.max_concurrent_scans)),
        }
    }

    /// Creates a `pending` scan for the asset and launches the probe task.
    /// Returns immediately; callers poll `get_scan` for progress.
    pub async fn start_scan(&self, asset_id: i64) -> Result<StartedScan, ManagerError> {
        let asset = self.get_asset(asset_id).await?;
        validate_target(&asset.target)?;

        let now = Utc::now();
        let inserted =
            sqlx::query("INSERT INTO scans(asset_id, status, created_at, updated_at) VALUES(?, ?, ?, ?)")
                .bind(asset_id)
                .bind(ScanStatus::Pending)
                .bind(now)
                .bind(now)
                .execute(&self.pool)
                .await?;

        let scan = Scan {
            id: inserted.last_insert_rowid(),
            asset_id,
            status: ScanStatus::Pending,
            created_at: now,
            updated_at: now,
            error_message: None,
        };

        let task = tokio::spawn(process_scan(
            self.pool.clone(),
            self.probe.clone(),
            self.permits.clone(),
            scan.id,
            asset.target,
            self.scan_timeout,
        ));

        Ok(StartedScan { scan, task })
    }

    pub async fn get_scan(&self, scan_id: i64) -> Result<Scan, ManagerError> {
        sqlx::query_as::<_, Scan>(
            "SELECT id, asset_id, status, created_at, updated_at, error_message FROM scans WHERE id = ?",
        )
        .bind(scan_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(ManagerError::ScanNotFound(scan_id))
    }

    pub async fn scans_for_asset(&self, asset_id: i64) -> Result<Vec<Scan>, ManagerError> {
        Ok(sqlx::query_as::<_, Scan>(
            "SELECT id, asset_id, status, created_at, updated_at, error_message FROM scans \
             WHERE asset_id = ? ORDER BY created_at DESC, id DESC",
        )
        .bind(asset_id)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn results_for_scan(
        &self,
        scan_id: i64,
    ) -> Result<Vec<ScanResultRecord>, ManagerError> {
        self.get_scan(scan_id).await?;
        Ok(sqlx::query_as::<_, ScanResultRecord>(
            "SELECT id, scan_id, port, protocol, state, service, version, banner, created_at \
             FROM scan_results WHERE scan_id = ? ORDER BY port ASC",
        )
        .bind(scan_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn get_asset(&self, asset_id: i64) -> Result<Asset, ManagerError> {
        sqlx::query_as::<_, Asset>(
            "SELECT id, user_id, name, target, asset_type, created_at, last_scanned_at \
             FROM assets WHERE id = ?",
        )
        .bind(asset_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(ManagerError::AssetNotFound(asset_id))
    }
}

/// Drives one scan to a terminal state. Probe and persistence errors end in
/// `failed` with the cause recorded; they never propagate to the caller of
/// `start_scan`, who already holds the `pending` record.
async fn process_scan(
    pool: SqlitePool,
    probe: Arc<dyn Probe>,
    permits: Arc<Semaphore>,
    scan_id: i64,
    target: String,
    budget: Duration,
) {
    let _permit = match permits.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return,
    };

    info!(scan_id, %target, "starting scan");
    if let Err(e) = update_status(&pool, scan_id, ScanStatus::Running, None).await {
        error!(error = %e, scan_id, "failed to mark scan running");
        return;
    }

    let findings = match probe.scan(&target, budget).await {
        Ok(findings) => findings,
        Err(e) => {
            error!(error = %e, scan_id, "scan failed");
            fail_scan(&pool, scan_id, e.to_string()).await;
            return;
        }
    };

    if let Err(e) = insert_results(&pool, scan_id, &findings).await {
        error!(error = %e, scan_id, "failed to save scan results");
        fail_scan(&pool, scan_id, format!("failed to save results: {e}")).await;
        return;
    }

    if let Err(e) = update_status(&pool, scan_id, ScanStatus::Completed, None).await {
        error!(error = %e, scan_id, "failed to mark scan completed");
        return;
    }

    // Not transactional with the status flip: a crash between the two writes
    // leaves a completed scan with a stale last_scanned_at.
    if let Err(e) = touch_asset_last_scanned(&pool, scan_id).await {
        error!(error = %e, scan_id, "failed to update asset last_scanned_at");
    }

    info!(scan_id, findings = findings.len(), "scan completed");
}

async fn update_status(
    pool: &SqlitePool,
    scan_id: i64,
    status: ScanStatus,
    error_message: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE scans SET status = ?, updated_at = ?, error_message = ? WHERE id = ?")
        .bind(status)
        .bind(Utc::now())
        .bind(error_message)
        .bind(scan_id)
        .execute(pool)
        .await?;
    Ok(())
}

async fn fail_scan(pool: &SqlitePool, scan_id: i64, message: String) {
    if let Err(e) = update_status(pool, scan_id, ScanStatus::Failed, Some(&message)).await {
        error!(error = %e, scan_id, "failed to mark scan failed");
    }
}

/// Writes the whole finding batch in one transaction; any failure before
/// commit discards every row, so a scan never exposes a partial result set.
async fn insert_results(
    pool: &SqlitePool,
    scan_id: i64,
    findings: &[PortFinding],
) -> Result<(), sqlx::Error> {
    if findings.is_empty() {
        return Ok(());
    }

    let mut tx = pool.begin().await?;
    let now = Utc::now();
    for finding in findings {
        sqlx::query(
            "INSERT INTO scan_results(scan_id, port, protocol, state, service, version, banner, created_at) \
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(scan_id)
        .bind(i64::from(finding.port))
        .bind(&finding.protocol)
        .bind(&finding.state)
        .bind(finding.service.as_deref())
        .bind(finding.version.as_deref())
        .bind(finding.banner.as_deref())
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

async fn touch_asset_last_scanned(pool: &SqlitePool, scan_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE assets SET last_scanned_at = ? \
         WHERE id = (SELECT asset_id FROM scans WHERE id = ?)",
    )
    .bind(Utc::now())
    .bind(scan_id)
    .execute(pool)
    .await?;
    Ok(())
}
