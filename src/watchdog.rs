// Relaypool — background watchdog
//
// Periodically checks gateway health and refreshes the live registry:
// - DB connectivity ping (SELECT 1)
// - Redis PING (rotation cache tier)
// - Instance health sweep: GET {base_url}/health per registered
//   instance, updating the connection registry

use std::time::Duration;

use crate::instances;
use crate::registry::ConnectionState;
use crate::state::AppState;

const CHECK_INTERVAL: Duration = Duration::from_secs(60);
const DB_PING_TIMEOUT: Duration = Duration::from_secs(5);
const INSTANCE_PING_TIMEOUT: Duration = Duration::from_secs(5);

pub fn spawn(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("watchdog: started (interval={}s)", CHECK_INTERVAL.as_secs());

        loop {
            tokio::time::sleep(CHECK_INTERVAL).await;

            let db_ok = check_db(&state).await;
            let cache_ok = state.rotation.ping().await;
            let (open, total) = sweep_instances(&state).await;

            if db_ok && cache_ok {
                tracing::debug!("watchdog: db=ok cache=ok instances={}/{} open", open, total);
            } else {
                tracing::warn!(
                    "watchdog: db={} cache={} instances={}/{} open",
                    if db_ok { "ok" } else { "FAIL" },
                    if cache_ok { "ok" } else { "UNREACHABLE" },
                    open,
                    total,
                );
            }
        }
    })
}

async fn check_db(state: &AppState) -> bool {
    let result = tokio::time::timeout(
        DB_PING_TIMEOUT,
        sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(&state.db),
    )
    .await;

    match result {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            tracing::error!("watchdog: DB ping failed: {}", e);
            false
        }
        Err(_) => {
            tracing::error!(
                "watchdog: DB ping timed out after {}s",
                DB_PING_TIMEOUT.as_secs()
            );
            false
        }
    }
}

/// Probe every registered instance's health endpoint and refresh the
/// connection registry. Any HTTP response below 500 counts as open; a
/// disabled instance reports `close` without being probed.
pub async fn sweep_instances(state: &AppState) -> (usize, usize) {
    let rows = match instances::list_all(&state.db).await {
        Ok(rows) => rows,
        Err(e) => {
            tracing::error!("watchdog: failed to list instances: {}", e);
            return (0, 0);
        }
    };

    let total = rows.len();
    let mut open = 0;

    for row in rows {
        if !row.enabled {
            state.registry.set_state(&row.name, ConnectionState::Close);
            continue;
        }

        let url = format!("{}/health", row.base_url.trim_end_matches('/'));
        let result = tokio::time::timeout(
            INSTANCE_PING_TIMEOUT,
            state.http_client.get(&url).send(),
        )
        .await;

        let next = match result {
            Ok(Ok(resp)) if resp.status().as_u16() < 500 => ConnectionState::Open,
            Ok(Ok(resp)) => {
                tracing::warn!(
                    "watchdog: instance {} health returned {}",
                    row.name,
                    resp.status().as_u16()
                );
                ConnectionState::Close
            }
            Ok(Err(e)) => {
                tracing::debug!("watchdog: instance {} unreachable: {}", row.name, e);
                ConnectionState::Close
            }
            Err(_) => {
                tracing::debug!(
                    "watchdog: instance {} health check timed out after {}s",
                    row.name,
                    INSTANCE_PING_TIMEOUT.as_secs()
                );
                ConnectionState::Close
            }
        };

        if next == ConnectionState::Open {
            open += 1;
        }
        state.registry.set_state(&row.name, next);
    }

    (open, total)
}
