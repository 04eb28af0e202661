//! Scheduler clock: emits one `time` event per minute so time-triggered rules
//! (daily summaries, market open/close reminders) can fire.

use std::time::Duration;

use chrono::{DateTime, Datelike, FixedOffset, Timelike, Utc};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use herald_common::types::{Event, EventKind};

use crate::processor::PipelineHandle;

/// Build the `time` event for instant `at`, expressed in local time.
///
/// Payload fields: `time_of_day` ("HH:MM"), `hour`, `minute`, `weekday`
/// ("Mon".."Sun") and `date` ("YYYY-MM-DD").
pub fn time_event(at: DateTime<Utc>, offset: FixedOffset) -> Event {
    let local = at.with_timezone(&offset);
    Event::new(
        EventKind::Time,
        json!({
            "time_of_day": local.format("%H:%M").to_string(),
            "hour": local.hour(),
            "minute": local.minute(),
            "weekday": local.weekday().to_string(),
            "date": local.date_naive().to_string(),
        }),
    )
    .at(at)
}

/// Time until the next whole minute after `now`.
fn until_next_minute(now: DateTime<Utc>) -> Duration {
    let into_minute = Duration::from_secs(u64::from(now.second()))
        + Duration::from_nanos(u64::from(now.nanosecond() % 1_000_000_000));
    Duration::from_secs(60).saturating_sub(into_minute)
}

/// Spawn the clock task. It stops when the pipeline shuts down.
pub fn spawn_clock(pipeline: PipelineHandle, offset: FixedOffset) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = Instant::now() + until_next_minute(Utc::now());
        let mut ticker = tokio::time::interval_at(start, Duration::from_secs(60));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(utc_offset_secs = offset.local_minus_utc(), "Scheduler clock started");

        loop {
            ticker.tick().await;
            // truncate to the minute so every tick carries an exact HH:MM
            let now = Utc::now();
            let at = now
                .with_second(0)
                .and_then(|t| t.with_nanosecond(0))
                .unwrap_or(now);
            let event = time_event(at, offset);
            tracing::trace!(event_id = %event.id, at = %at, "Clock tick");
            if pipeline.submit(event).await.is_err() {
                tracing::info!("Pipeline closed, scheduler clock stopping");
                return;
            }
        }
    })
}
