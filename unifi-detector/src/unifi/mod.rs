pub mod client;
pub mod station;

use async_trait::async_trait;
use crate::error::{FetchError, RecordError};
use self::station::Station;

/// One element of a snapshot. Elements that could not be decoded are kept
/// as errors so the rest of the snapshot is still evaluated.
pub type Observation = Result<Station, RecordError>;

/// Anything that can list the stations currently associated with a site.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_snapshot(&self) -> Result<Vec<Observation>, FetchError>;
}
