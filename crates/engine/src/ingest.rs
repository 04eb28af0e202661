//! Redis event source: collaborators push JSON-encoded events onto a list and
//! this consumer feeds them into the pipeline with `BLPOP`.

use std::time::Duration;

use redis::aio::MultiplexedConnection;

use herald_common::types::Event;

use crate::processor::PipelineHandle;

/// Seconds `BLPOP` blocks before returning empty-handed.
const BLPOP_TIMEOUT_SECS: f64 = 5.0;

/// Pause after a Redis error before the next attempt.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Decode one list entry. Malformed entries are logged and skipped.
pub fn decode_event(raw: &str) -> Option<Event> {
    match serde_json::from_str::<Event>(raw) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!(error = %e, bytes = raw.len(), "Discarding malformed event");
            None
        }
    }
}

/// Consume `key` until the pipeline shuts down. Needs a dedicated connection
/// since `BLPOP` blocks it.
pub async fn run_redis_source(
    mut conn: MultiplexedConnection,
    key: String,
    pipeline: PipelineHandle,
) -> anyhow::Result<()> {
    tracing::info!(key = %key, "Redis event source started");

    loop {
        let popped: redis::RedisResult<Option<(String, String)>> = redis::cmd("BLPOP")
            .arg(&key)
            .arg(BLPOP_TIMEOUT_SECS)
            .query_async(&mut conn)
            .await;

        let raw = match popped {
            Ok(Some((_, raw))) => raw,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "BLPOP failed, backing off");
                tokio::time::sleep(ERROR_BACKOFF).await;
                continue;
            }
        };

        let Some(event) = decode_event(&raw) else {
            continue;
        };

        tracing::debug!(event_id = %event.id, kind = %event.kind, "Event received from Redis");

        if pipeline.submit(event).await.is_err() {
            tracing::info!("Pipeline closed, Redis event source stopping");
            return Ok(());
        }
    }
}
