//! Samples the store's read version against wall-clock time.
//!
//! Backup and restore map timestamps onto versions through this table; the
//! keeper bounds its size by trimming entries older than the retention
//! window on every write.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use helmsman_core::error::Result;

use crate::controller::Controller;
use crate::store::{self, Mutation};

fn epoch_secs() -> i64 {
    Utc::now().timestamp()
}

/// Stamps the schema version, then periodically records read-version
/// samples until the controller shuts down.
pub async fn time_keeper(controller: Arc<Controller>) -> Result<()> {
    let store = controller.store.clone();
    let retry_delay = controller.knobs.store_retry_delay;

    info!("Time keeper started");

    store::retry(retry_delay, || {
        let store = store.clone();
        async move {
            store
                .apply(vec![Mutation::Set(
                    store::TIME_KEEPER_VERSION_KEY.to_string(),
                    b"1".to_vec(),
                )])
                .await
        }
    })
    .await;

    loop {
        store::retry(retry_delay, || {
            let store = store.clone();
            let knobs = controller.knobs.clone();
            async move {
                if store.get(store::TIME_KEEPER_DISABLE_KEY).await?.is_some() {
                    return Ok(());
                }

                let version = store.read_version().await?;
                let now = epoch_secs();
                let mut mutations = vec![Mutation::Set(
                    store::time_keeper_key(now),
                    serde_json::to_vec(&version).unwrap_or_default(),
                )];

                let ttl = now - (knobs.time_keeper_delay * knobs.time_keeper_max_entries as f64) as i64;
                if ttl > 0 {
                    mutations.push(Mutation::ClearRange(
                        store::time_keeper_key(0),
                        store::time_keeper_key(ttl),
                    ));
                }

                debug!(version, "Time keeper sample");
                store.apply(mutations).await
            }
        })
        .await;

        tokio::time::sleep(std::time::Duration::from_secs_f64(controller.knobs.time_keeper_delay))
            .await;
    }
}
