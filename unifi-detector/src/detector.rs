use chrono::{DateTime, Duration, Utc};
use crate::cache_manager::CacheHandle;
use crate::config::LifespanBoundary;
use crate::error::RecordError;
use crate::notify::Notifier;
use crate::unifi::Observation;

/// Freshness rules applied to every snapshot
#[derive(Debug, Clone, Copy)]
pub struct Policy {
    pub lifespan: Duration,
    pub boundary: LifespanBoundary,
}

impl Policy {
    pub fn is_fresh(&self, staleness: Duration) -> bool {
        match self.boundary {
            LifespanBoundary::Inclusive => staleness <= self.lifespan,
            LifespanBoundary::Exclusive => staleness < self.lifespan,
        }
    }
}

/// What one evaluation did to the cache
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Fresh and not cached before
    pub discovered: usize,
    /// Fresh and already cached
    pub refreshed: usize,
    /// Stale and removed from the cache
    pub evicted: usize,
    /// Stale and never cached
    pub ignored: usize,
    /// Failed validation
    pub invalid: usize,
    /// Retired by the expiry pass
    pub expired: usize,
}

/// Classify every station in `snapshot` against the cache and apply the result.
///
/// Stations are handled independently: a station that fails decoding or
/// validation, or a cache command that fails, only skips that station.
/// Discovery events go out through the notifier unless `seeding` is set.
/// An empty snapshot leaves the cache untouched, expiry included.
pub async fn evaluate(
    snapshot: &[Observation],
    now: DateTime<Utc>,
    cache: &CacheHandle,
    policy: Policy,
    seeding: bool,
    notifier: &Notifier,
) -> CycleReport {
    let mut report = CycleReport::default();

    for observation in snapshot {
        let record = observation
            .as_ref()
            .map_err(RecordError::clone)
            .and_then(|station| station.to_record());
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("Skipping station: {}", e);
                report.invalid += 1;
                continue;
            }
        };

        let staleness = now - record.last_seen;
        let was_known = match cache.lookup(record.mac).await {
            Ok(entry) => entry.is_some(),
            Err(e) => {
                tracing::error!("Failed to look up client {}: {}", record.mac, e);
                continue;
            }
        };

        if policy.is_fresh(staleness) {
            if let Err(e) = cache.upsert(record.clone(), policy.lifespan).await {
                tracing::error!("Failed to cache client {}: {}", record.mac, e);
                continue;
            }

            if was_known {
                report.refreshed += 1;
            } else if !seeding {
                tracing::info!(
                    mac = %record.mac,
                    hostname = %record.hostname,
                    ip = ?record.ip,
                    "New client discovered"
                );
                notifier.discovery(&record);
                report.discovered += 1;
            }
        } else {
            if was_known {
                match cache.evict(record.mac).await {
                    Ok(_) => report.evicted += 1,
                    Err(e) => tracing::error!("Failed to evict client {}: {}", record.mac, e),
                }
            } else {
                report.ignored += 1;
            }

            if !seeding {
                tracing::info!(
                    mac = %record.mac,
                    hostname = %record.hostname,
                    ip = ?record.ip,
                    staleness_secs = staleness.num_seconds(),
                    "Ignoring client; older than the lifespan"
                );
            }
        }
    }

    if snapshot.is_empty() {
        return report;
    }

    match cache.expire(now).await {
        Ok(expired) => {
            for entry in &expired {
                tracing::info!(
                    mac = %entry.record.mac,
                    hostname = %entry.record.hostname,
                    expires_at = %entry.expires_at,
                    "Client expired from cache"
                );
            }
            report.expired = expired.len();
        }
        Err(e) => tracing::error!("Failed to expire cache entries: {}", e),
    }

    report
}
