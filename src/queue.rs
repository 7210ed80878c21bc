//! Low-latency wake channel over Postgres `LISTEN`/`NOTIFY`.
//!
//! Each [`Lane`] maps to its own notification channel so workers can wake as
//! soon as a job lands instead of waiting out a poll interval. Delivery is
//! fire-and-forget: a dropped notification only delays a job until the next
//! poll of the store, because the store row is the source of truth, never the
//! channel.

use std::sync::OnceLock;

use sqlx::{
    postgres::{PgListener, PgNotification},
    PgExecutor, PgPool,
};
use tracing::instrument;
use uuid::Uuid;

use crate::job::{Lane, RetryPolicy};

type Result<T = ()> = std::result::Result<T, Error>;

/// Queue client errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error returned by the `sqlx` crate during database operations.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Publishes and subscribes to per-lane wake notifications.
#[derive(Debug, Clone)]
pub struct QueueClient {
    pool: PgPool,
}

impl QueueClient {
    /// Creates a new client over the given pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Notifies listeners that a job was enqueued on the given lane.
    ///
    /// Publishing failures are logged and swallowed; workers fall back to
    /// polling the store.
    #[instrument(name = "queue.wake", skip(self))]
    pub async fn wake(&self, lane: Lane) {
        if let Err(err) = sqlx::query("select pg_notify($1, $2)")
            .bind(lane.channel())
            .bind("")
            .execute(&self.pool)
            .await
        {
            tracing::warn!(%err, channel = lane.channel(), "Failed to publish wake notification");
        }
    }

    /// Connects a listener subscribed to every lane plus the shutdown
    /// channel, retrying with backoff while the database is unreachable.
    pub async fn listen(&self) -> Result<QueueListener> {
        let channels: Vec<&str> = Lane::ALL
            .iter()
            .map(|lane| lane.channel())
            .chain(std::iter::once(shutdown_channel()))
            .collect();

        let retry_policy = RetryPolicy::default();
        let mut attempt = 0;
        loop {
            match Self::try_connect(&self.pool, &channels).await {
                Ok(listener) => return Ok(QueueListener { listener }),
                Err(err) => {
                    attempt += 1;
                    let delay = retry_policy.calculate_delay(attempt);
                    tracing::warn!(
                        %err,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Failed to connect queue listener, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn try_connect(pool: &PgPool, channels: &[&str]) -> Result<PgListener> {
        let mut listener = PgListener::connect_with(pool).await?;
        listener.listen_all(channels.iter().copied()).await?;
        Ok(listener)
    }
}

/// A connected subscription over the lane channels.
///
/// Errors from `recv` indicate a lost connection; callers should drop the
/// listener, drain the store once, and reconnect.
pub struct QueueListener {
    listener: PgListener,
}

/// What a received notification means to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// A job landed on some lane; drain the store.
    NewWork,

    /// A graceful shutdown was requested.
    Shutdown,
}

impl QueueListener {
    /// Waits for the next notification.
    pub async fn recv(&mut self) -> Result<Wake> {
        let notification: PgNotification = self.listener.recv().await?;

        if notification.channel() == shutdown_channel() {
            Ok(Wake::Shutdown)
        } else {
            Ok(Wake::NewWork)
        }
    }
}

static SHUTDOWN_CHANNEL: OnceLock<String> = OnceLock::new();

pub(crate) fn shutdown_channel() -> &'static str {
    SHUTDOWN_CHANNEL.get_or_init(|| format!("courseloom_shutdown_{}", Uuid::new_v4()))
}

/// Initiates a graceful shutdown by sending a `NOTIFY` to the shutdown
/// channel via the `pg_notify` function.
///
/// Workers listen on this channel and when a message is received will stop
/// claiming further jobs and wait for in-progress jobs to finish.
///
/// This can be useful when combined with [`tokio::signal`] to ensure workers
/// are stopped cleanly when stopping your application.
pub async fn graceful_shutdown<'a, E>(executor: E) -> Result
where
    E: PgExecutor<'a>,
{
    sqlx::query("select pg_notify($1, $2)")
        .bind(shutdown_channel())
        .bind("")
        .execute(executor)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use sqlx::PgPool;

    use super::*;

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    async fn wake_is_delivered(pool: PgPool) -> Result {
        let client = QueueClient::new(pool);
        let mut listener = client.listen().await?;

        client.wake(Lane::Default).await;

        let wake = listener.recv().await?;
        assert_eq!(wake, Wake::NewWork);

        Ok(())
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    async fn shutdown_is_distinguished(pool: PgPool) -> Result {
        let client = QueueClient::new(pool.clone());
        let mut listener = client.listen().await?;

        graceful_shutdown(&pool).await?;

        let wake = listener.recv().await?;
        assert_eq!(wake, Wake::Shutdown);

        Ok(())
    }
}
