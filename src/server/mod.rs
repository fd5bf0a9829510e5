//! Basegate server
//!
//! Listeners, per-connection tasks, the live peer directory and the relay.

mod base;
mod client;
mod config;
mod directory;
mod router;
#[allow(clippy::module_inception)]
mod server;
mod session;

pub use base::serve_base;
pub use client::serve_client;
pub use config::*;
pub use directory::*;
pub use router::*;
pub use server::*;
pub use session::*;

use std::time::{Duration, Instant};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::{self, Interval, MissedTickBehavior, Sleep};

use crate::core::GatewayError;

/// Periodic timer whose first tick is one `period` from now.
pub(crate) fn ticker(period: Duration) -> Interval {
    let mut interval = time::interval_at(time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Sleep until a backoff deadline; immediate when there is none.
pub(crate) fn backoff_sleep(deadline: Option<Instant>) -> Sleep {
    let at = deadline.map_or_else(time::Instant::now, time::Instant::from_std);
    time::sleep_until(at)
}

/// Write all of `bytes`, giving up once `limit` elapses.
pub(crate) async fn write_within<W>(
    writer: &mut W,
    bytes: &[u8],
    limit: Duration,
) -> Result<(), GatewayError>
where
    W: AsyncWrite + Unpin,
{
    match time::timeout(limit, writer.write_all(bytes)).await {
        Ok(written) => Ok(written?),
        Err(_) => Err(GatewayError::WriteTimeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stalled_write_times_out() {
        let (mut near, _far) = tokio::io::duplex(8);
        let limit = Duration::from_millis(50);

        write_within(&mut near, b"12345678", limit).await.unwrap();
        let err = write_within(&mut near, b"more", limit).await.unwrap_err();
        assert!(matches!(err, GatewayError::WriteTimeout(d) if d == limit));
    }
}
