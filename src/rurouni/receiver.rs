//! Interfaces for the collaborators this system treats as external: the
//! TCP line/pickle receivers and the cache query service. Their wire
//! protocols are out of scope; only the shape they need from
//! [`MetricCache`] is named here, so a real receiver can be written against
//! this crate without the engine or cache knowing anything about sockets.

use crate::rurouni::cache::MetricCache;
use crate::rurouni::error::Result;

/// What a line/pickle receiver needs: turn one parsed `(metric, ts, value)`
/// sample into a cache write. Parse failures are the receiver's problem —
/// logged and dropped, never propagated here.
pub trait MetricReceiver {
    fn receive(&self, cache: &MetricCache, metric: &str, ts: u32, value: f64) -> Result<()>;
}

/// What the read-side query service (e.g. a Graphite `render` backend)
/// needs from the cache: a peek at a metric's buffered, not-yet-flushed
/// points, to merge with what's already on disk.
pub trait CacheQueryService {
    fn query(&self, cache: &MetricCache, metric: &str) -> Result<Vec<(u32, f64)>>;
}

/// Default implementation of both traits in terms of `MetricCache`'s own
/// `put`/`get` — a real line receiver only needs to parse bytes into
/// `(metric, ts, value)` and hand them here.
pub struct DirectCacheReceiver;

impl MetricReceiver for DirectCacheReceiver {
    fn receive(&self, cache: &MetricCache, metric: &str, ts: u32, value: f64) -> Result<()> {
        cache.put(metric, ts, value)
    }
}

impl CacheQueryService for DirectCacheReceiver {
    fn query(&self, cache: &MetricCache, metric: &str) -> Result<Vec<(u32, f64)>> {
        cache.get(metric)
    }
}
