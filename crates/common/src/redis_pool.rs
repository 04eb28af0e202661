use redis::Client;
use redis::aio::MultiplexedConnection;

/// Open the event consumer's connection and report the queued backlog on `event_key`.
///
/// `BLPOP` blocks the connection it runs on, so the consumer never shares it.
/// The `LLEN` round trip also proves the server is reachable before the
/// consumer task starts.
pub async fn create_consumer_connection(
    redis_url: &str,
    event_key: &str,
) -> anyhow::Result<MultiplexedConnection> {
    let client = Client::open(redis_url)?;
    let mut connection = client.get_multiplexed_async_connection().await?;

    let backlog: u64 = redis::cmd("LLEN")
        .arg(event_key)
        .query_async(&mut connection)
        .await?;
    if backlog > 0 {
        tracing::warn!(key = event_key, backlog, "Events queued before startup will be replayed");
    }

    tracing::info!(key = event_key, "Opened Redis consumer connection");
    Ok(connection)
}
