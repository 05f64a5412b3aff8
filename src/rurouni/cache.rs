//! The bundled ring cache: `FileCache` (one per bundle file), `SchemaCache`
//! (ordered list of `FileCache`s per schema), and `MetricCache` (the
//! top-level metric → position map and flush coordinator).
//!
//! Grounded on `rurouni/cache.py`'s `MetricData`/`MetricCache` for the
//! ring-buffer read/write/wrap logic and the lock-around-a-plain-struct
//! shape, generalized to the `FileCache`/`SchemaCache`/`MetricCache`
//! three-tier split and bitmap-based position allocation this system's
//! storage spec calls for (the retained Python revision predates that
//! split).

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::warn;

use crate::kenshin::consts::NULL_VALUE;
use crate::kenshin::engine;
use crate::kenshin::schema::{now_unix, Schema};
use crate::rurouni::error::{Result, RurouniError};
use crate::rurouni::schema_registry::SchemaRegistry;

/// One bundle file's in-memory write-behind ring: `width` rows (one per
/// bundled series) by `cache_size` columns (one per retained sample slot).
pub struct FileCache {
    pub path: PathBuf,
    width: usize,
    resolution: u32,
    retention: u32,
    cache_size: usize,
    inner: Mutex<FileCacheInner>,
}

struct FileCacheInner {
    bitmap: u64,
    start_ts: Option<i64>,
    start_offset: usize,
    max_ts: i64,
    points: Vec<f64>,
}

impl FileCache {
    pub fn new(path: PathBuf, schema: &Schema) -> FileCache {
        let width = schema.metrics_max_num;
        let cache_size = schema.cache_size();
        FileCache {
            path,
            width,
            resolution: schema.resolution(),
            retention: schema.cache_retention,
            cache_size,
            inner: Mutex::new(FileCacheInner {
                bitmap: 0,
                start_ts: None,
                start_offset: 0,
                max_ts: 0,
                points: vec![NULL_VALUE; width * cache_size],
            }),
        }
    }

    fn full_mask(&self) -> u64 {
        if self.width >= 64 {
            u64::MAX
        } else {
            (1u64 << self.width) - 1
        }
    }

    /// Whether every position slot is occupied.
    pub fn metric_full(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.bitmap == self.full_mask()
    }

    /// Allocate the next free position by scanning the bitmap bit by bit.
    pub fn get_pos_idx(&self) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        for i in 0..self.width {
            if inner.bitmap & (1 << i) == 0 {
                inner.bitmap |= 1 << i;
                return Ok(i);
            }
        }
        Err(RurouniError::FileCacheFull {
            path: self.path.clone(),
        })
    }

    /// Mark `pos_idx` occupied without scanning for it — used to replay the
    /// metric index on startup.
    pub fn add(&self, pos_idx: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.bitmap |= 1 << pos_idx;
    }

    /// Write one point into the ring at `pos_idx`. Late points (older than
    /// the ring's current window) overwrite whatever slot they land on;
    /// see the storage spec's note on this.
    pub fn put(&self, pos_idx: usize, ts: u32, value: f64) {
        let mut inner = self.inner.lock().unwrap();
        let ts = ts as i64;
        let ring_offset = if let Some(start_ts) = inner.start_ts {
            let steps = (ts - start_ts).div_euclid(self.resolution as i64);
            (inner.start_offset as i64 + steps).rem_euclid(self.cache_size as i64) as usize
        } else {
            inner.start_ts = Some(ts - ts.rem_euclid(self.resolution as i64));
            inner.start_offset = 0;
            0
        };
        let idx = pos_idx * self.cache_size + ring_offset;
        inner.points[idx] = value;
        if ts > inner.max_ts {
            inner.max_ts = ts;
        }
    }

    /// `now − start_ts − retention ≥ DEFAULT_WAIT_TIME`: the ring is only
    /// flushable once its oldest data has aged past retention by a grace
    /// period, so a just-started bundle never gets drained early.
    pub fn can_write(&self, now: i64) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.start_ts {
            Some(start_ts) => {
                now - start_ts - self.retention as i64
                    >= crate::kenshin::consts::DEFAULT_WAIT_TIME
            }
            None => false,
        }
    }

    /// Map a timestamp to a ring offset, clamped to `cache_size - 1` if it
    /// would otherwise land beyond the ring's current window.
    fn get_offset(&self, inner: &FileCacheInner, ts: i64) -> usize {
        match inner.start_ts {
            None => 0,
            Some(start_ts) => {
                let steps = (ts - start_ts) / self.resolution as i64;
                let steps = steps.clamp(0, self.cache_size as i64 - 1);
                (inner.start_offset + steps as usize) % self.cache_size
            }
        }
    }

    /// Read-only peek of one position's column, values up to `now`, with
    /// `NULL_VALUE` slots filtered out.
    pub fn get(&self, pos_idx: usize, now: i64) -> Vec<(u32, f64)> {
        let inner = self.inner.lock().unwrap();
        let start_ts = match inner.start_ts {
            Some(t) => t,
            None => return Vec::new(),
        };
        let begin_offset = inner.start_offset;
        let end_offset = self.get_offset(&inner, now);
        let length = ring_span(begin_offset, end_offset, self.cache_size);

        let mut out = Vec::new();
        for j in 0..length {
            let offset = (begin_offset + j) % self.cache_size;
            let value = inner.points[pos_idx * self.cache_size + offset];
            if value != NULL_VALUE {
                out.push((start_ts as u32 + j as u32 * self.resolution, value));
            }
        }
        out
    }

    /// Drain the ring into full-width rows (one `Vec<f64>` per timestamp,
    /// `NULL_VALUE` for unwritten cells), ready to hand to
    /// [`crate::kenshin::engine::update`]. When `clear` is set, advances
    /// `start_ts`/`start_offset` past the drained span and blanks it.
    pub fn pop(&self, end_ts: Option<i64>, clear: bool) -> Vec<(u32, Vec<f64>)> {
        let mut inner = self.inner.lock().unwrap();
        let start_ts = match inner.start_ts {
            Some(t) => t,
            None => return Vec::new(),
        };
        let begin_offset = inner.start_offset;
        // `length` is computed directly rather than derived from a
        // `begin`/`end` offset pair: when `points_num() == cache_size` (a
        // `cache_ratio` of exactly 1.0), `begin + points_num() mod cache_size`
        // collapses back to `begin`, which would read as an empty span
        // instead of draining the whole window.
        let length = match end_ts {
            Some(ts) => {
                let end_offset = self.get_offset(&inner, ts);
                ring_span(begin_offset, end_offset, self.cache_size)
            }
            None => self.points_num().min(self.cache_size),
        };
        let end_offset = (begin_offset + length) % self.cache_size;

        let mut rows = Vec::with_capacity(length);
        for j in 0..length {
            let offset = (begin_offset + j) % self.cache_size;
            let mut values = Vec::with_capacity(self.width);
            for pos in 0..self.width {
                values.push(inner.points[pos * self.cache_size + offset]);
            }
            rows.push((start_ts as u32 + j as u32 * self.resolution, values));
            if clear {
                for pos in 0..self.width {
                    inner.points[pos * self.cache_size + offset] = NULL_VALUE;
                }
            }
        }

        if clear {
            inner.start_offset = end_offset;
            inner.start_ts = Some(start_ts + self.resolution as i64 * length as i64);
        }

        rows
    }

    fn points_num(&self) -> usize {
        (self.retention / self.resolution) as usize + 1
    }
}

fn ring_span(begin: usize, end: usize, capacity: usize) -> usize {
    if begin <= end {
        end - begin
    } else {
        capacity - begin + end
    }
}

/// An ordered, append-only list of `FileCache`s for one schema; `curr_idx`
/// tracks the newest bundle that might still have free positions.
pub struct SchemaCache {
    schema: Schema,
    files: Vec<Arc<FileCache>>,
    curr_idx: usize,
}

impl SchemaCache {
    pub fn new(schema: Schema) -> SchemaCache {
        SchemaCache {
            schema,
            files: Vec::new(),
            curr_idx: 0,
        }
    }

    /// Index of a `FileCache` with a free position, creating one at
    /// `bundle_path` if every existing bundle is full.
    pub fn get_file_cache_idx(&mut self, bundle_path: impl Fn(usize) -> PathBuf) -> usize {
        while self.curr_idx < self.files.len() && self.files[self.curr_idx].metric_full() {
            self.curr_idx += 1;
        }
        if self.curr_idx == self.files.len() {
            let path = bundle_path(self.files.len());
            self.files
                .push(Arc::new(FileCache::new(path, &self.schema)));
        }
        self.curr_idx
    }

    /// Extend the list (creating placeholder `FileCache`s as needed) up to
    /// `file_idx` and mark `file_pos` occupied — used to replay the index
    /// file at startup.
    pub fn add(&mut self, file_idx: usize, file_pos: usize, bundle_path: impl Fn(usize) -> PathBuf) {
        while self.files.len() <= file_idx {
            let idx = self.files.len();
            self.files
                .push(Arc::new(FileCache::new(bundle_path(idx), &self.schema)));
        }
        self.files[file_idx].add(file_pos);
    }

    pub fn file(&self, file_idx: usize) -> Option<&Arc<FileCache>> {
        self.files.get(file_idx)
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }
}

struct MetricLocation {
    schema_name: String,
    file_idx: usize,
    pos_idx: usize,
}

/// Top-level write cache: resolves each metric to a schema/bundle/position,
/// persists that mapping to an append-only index file, and reports which
/// bundles are ready to flush.
pub struct MetricCache {
    data_dir: PathBuf,
    instance: String,
    registry: SchemaRegistry,
    metric_idxs: Mutex<HashMap<String, MetricLocation>>,
    schema_caches: Mutex<HashMap<String, SchemaCache>>,
    index_file: Mutex<Option<File>>,
    metrics_file: PathBuf,
    link_manager: Arc<dyn crate::rurouni::index::LinkManager>,
}

impl MetricCache {
    pub fn new(
        data_dir: PathBuf,
        instance: String,
        metrics_file: PathBuf,
        registry: SchemaRegistry,
        link_manager: Arc<dyn crate::rurouni::index::LinkManager>,
    ) -> MetricCache {
        MetricCache {
            data_dir,
            instance,
            registry,
            metric_idxs: Mutex::new(HashMap::new()),
            schema_caches: Mutex::new(HashMap::new()),
            index_file: Mutex::new(None),
            metrics_file,
            link_manager,
        }
    }

    fn bundle_path(&self, schema_name: &str, file_idx: usize) -> PathBuf {
        crate::kenshin::codec::bundle_path(&self.data_dir, &self.instance, schema_name, file_idx as u32)
    }

    /// Replay the on-disk metric index (`metric schema_name file_idx
    /// file_pos` per line), reconstructing each schema's `FileCache`
    /// positions, then reopen the index for append. Tolerates at most one
    /// malformed line.
    pub fn init_cache(&self) -> Result<()> {
        let mut index_file = self.index_file.lock().unwrap();
        if index_file.is_some() {
            return Ok(());
        }

        let mut bad_lines = 0;
        if self.metrics_file.exists() {
            let file = File::open(&self.metrics_file)?;
            let mut metric_idxs = self.metric_idxs.lock().unwrap();
            let mut schema_caches = self.schema_caches.lock().unwrap();
            for line in BufReader::new(file).lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let parts: Vec<&str> = line.split('\t').collect();
                let (metric, schema_name, file_idx, file_pos) = match parts.as_slice() {
                    [metric, schema_name, file_idx, file_pos] => {
                        match (file_idx.parse::<usize>(), file_pos.parse::<usize>()) {
                            (Ok(fi), Ok(fp)) => (*metric, *schema_name, fi, fp),
                            _ => {
                                bad_lines += 1;
                                if bad_lines > 1 {
                                    return Err(RurouniError::TooManyMalformedIndexLines);
                                }
                                warn!("skipping malformed metric index line: {:?}", line);
                                continue;
                            }
                        }
                    }
                    _ => {
                        bad_lines += 1;
                        if bad_lines > 1 {
                            return Err(RurouniError::TooManyMalformedIndexLines);
                        }
                        warn!("skipping malformed metric index line: {:?}", line);
                        continue;
                    }
                };

                // Replay rehydrates by the schema name recorded in the index
                // line, not by re-matching the metric's pattern: the schema
                // that created this bundle determines its geometry, and a
                // rule change since the line was written could otherwise
                // match a different schema for the same metric name.
                let schema = match self.registry.schema_by_name(schema_name) {
                    Some(schema) => schema.clone(),
                    None => {
                        bad_lines += 1;
                        if bad_lines > 1 {
                            return Err(RurouniError::TooManyMalformedIndexLines);
                        }
                        warn!(
                            "skipping metric index line with unknown schema {:?}: {:?}",
                            schema_name, line
                        );
                        continue;
                    }
                };
                let cache = schema_caches
                    .entry(schema_name.to_string())
                    .or_insert_with(|| SchemaCache::new(schema));
                cache.add(file_idx, file_pos, |idx| self.bundle_path(schema_name, idx));

                metric_idxs.insert(
                    metric.to_string(),
                    MetricLocation {
                        schema_name: schema_name.to_string(),
                        file_idx,
                        pos_idx: file_pos,
                    },
                );
            }
        }

        *index_file = Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.metrics_file)?,
        );
        Ok(())
    }

    /// Resolve (allocating if new) `metric`'s `(schema, file_idx, pos_idx)`
    /// and write one point into its bundle's ring.
    pub fn put(&self, metric: &str, ts: u32, value: f64) -> Result<()> {
        let file_cache = self.file_cache_for(metric)?;
        let pos_idx = {
            let metric_idxs = self.metric_idxs.lock().unwrap();
            metric_idxs.get(metric).unwrap().pos_idx
        };
        file_cache.put(pos_idx, ts, value);
        Ok(())
    }

    fn file_cache_for(&self, metric: &str) -> Result<Arc<FileCache>> {
        {
            let metric_idxs = self.metric_idxs.lock().unwrap();
            if let Some(loc) = metric_idxs.get(metric) {
                let schema_caches = self.schema_caches.lock().unwrap();
                let cache = schema_caches.get(&loc.schema_name).unwrap();
                return Ok(cache.file(loc.file_idx).unwrap().clone());
            }
        }
        self.allocate(metric)
    }

    fn allocate(&self, metric: &str) -> Result<Arc<FileCache>> {
        let schema = self.registry.schema_for_metric(metric).clone();
        let schema_name = schema.name.clone();

        let mut schema_caches = self.schema_caches.lock().unwrap();
        let cache = schema_caches
            .entry(schema_name.clone())
            .or_insert_with(|| SchemaCache::new(schema.clone()));

        let file_idx = cache.get_file_cache_idx(|idx| self.bundle_path(&schema_name, idx));
        let file_cache = cache.file(file_idx).unwrap().clone();

        if !file_cache.path.exists() {
            engine::create(
                &file_cache.path,
                &vec![String::new(); schema.metrics_max_num],
                &schema.archives,
                schema.xff,
                schema.agg,
            )?;
        }
        let pos_idx = file_cache.get_pos_idx()?;
        engine::add_tag(metric, &file_cache.path, pos_idx)?;

        let mut index_file = self.index_file.lock().unwrap();
        if let Some(fh) = index_file.as_mut() {
            writeln!(fh, "{}\t{}\t{}\t{}", metric, schema_name, file_idx, pos_idx)?;
            fh.flush()?;
        }
        drop(index_file);

        self.link_manager
            .link(&self.instance, metric, &file_cache.path)?;

        self.metric_idxs.lock().unwrap().insert(
            metric.to_string(),
            MetricLocation {
                schema_name,
                file_idx,
                pos_idx,
            },
        );

        Ok(file_cache)
    }

    /// Read-only peek of `metric`'s recent points, up to `now`.
    pub fn get(&self, metric: &str) -> Result<Vec<(u32, f64)>> {
        let file_cache = self.file_cache_for(metric)?;
        let metric_idxs = self.metric_idxs.lock().unwrap();
        let pos_idx = metric_idxs.get(metric).unwrap().pos_idx;
        Ok(file_cache.get(pos_idx, now_unix()))
    }

    /// Drain `(schema_name, file_idx)`'s ring.
    pub fn pop(&self, schema_name: &str, file_idx: usize, end_ts: Option<i64>, clear: bool) -> Vec<(u32, Vec<f64>)> {
        let schema_caches = self.schema_caches.lock().unwrap();
        match schema_caches.get(schema_name).and_then(|c| c.file(file_idx)) {
            Some(file_cache) => file_cache.pop(end_ts, clear),
            None => Vec::new(),
        }
    }

    /// Snapshot of every `(schema_name, file_idx)` whose ring is old enough
    /// to flush.
    pub fn writable_file_caches(&self) -> Vec<(String, usize, PathBuf)> {
        let now = now_unix();
        let schema_caches = self.schema_caches.lock().unwrap();
        let mut out = Vec::new();
        for (schema_name, cache) in schema_caches.iter() {
            for file_idx in 0..cache.file_count() {
                let file_cache = cache.file(file_idx).unwrap();
                if file_cache.can_write(now) {
                    out.push((schema_name.clone(), file_idx, file_cache.path.clone()));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kenshin::agg::Agg;
    use crate::kenshin::schema::ArchiveSpec;

    fn schema() -> Schema {
        Schema::new(
            "test",
            None,
            0.5,
            Agg::Average,
            vec![ArchiveSpec {
                sec_per_point: 60,
                count: 20,
            }],
            600,
            4,
            1.0,
        )
        .unwrap()
    }

    #[test]
    fn pop_with_no_end_ts_drains_the_full_window_even_at_cache_ratio_one() {
        // `schema()`'s cache_ratio is 1.0, so cache_size == points_num —
        // exactly the configuration where `pop(None)` must not collapse to
        // an empty span.
        let file_cache = FileCache::new(PathBuf::from("unused.hs"), &schema());
        let pos = file_cache.get_pos_idx().unwrap();
        file_cache.put(pos, 0, 1.0);
        file_cache.put(pos, 60, 2.0);
        file_cache.put(pos, 120, 3.0);

        let rows = file_cache.pop(None, true);
        assert_eq!(rows.len(), schema().points_num());
        assert_eq!(rows[0].1[pos], 1.0);
        assert_eq!(rows[1].1[pos], 2.0);
        assert_eq!(rows[2].1[pos], 3.0);
        assert_eq!(rows[3].1[pos], NULL_VALUE);
    }

    #[test]
    fn put_and_pop_round_trips_aligned_rows() {
        let file_cache = FileCache::new(PathBuf::from("unused.hs"), &schema());
        let pos = file_cache.get_pos_idx().unwrap();
        assert_eq!(pos, 0);

        file_cache.put(pos, 1_000_000_000, 1.0);
        file_cache.put(pos, 1_000_000_060, 2.0);
        file_cache.put(pos, 1_000_000_120, 3.0);

        let rows = file_cache.pop(Some(1_000_000_180), true);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].1[pos], 1.0);
        assert_eq!(rows[1].1[pos], 2.0);
        assert_eq!(rows[2].1[pos], 3.0);
        // positions never written stay NULL_VALUE.
        assert_eq!(rows[0].1[pos + 1], NULL_VALUE);
    }

    #[test]
    fn metric_full_once_every_position_allocated() {
        let file_cache = FileCache::new(PathBuf::from("unused.hs"), &schema());
        for _ in 0..4 {
            file_cache.get_pos_idx().unwrap();
        }
        assert!(file_cache.metric_full());
        assert!(file_cache.get_pos_idx().is_err());
    }

    #[test]
    fn can_write_only_after_retention_plus_grace() {
        let file_cache = FileCache::new(PathBuf::from("unused.hs"), &schema());
        let pos = file_cache.get_pos_idx().unwrap();
        file_cache.put(pos, 0, 1.0);
        assert!(!file_cache.can_write(100));
        let retention = 600;
        let grace = crate::kenshin::consts::DEFAULT_WAIT_TIME;
        assert!(file_cache.can_write(retention + grace));
    }

    fn wide_schema() -> Schema {
        Schema::new(
            "wide",
            None,
            0.5,
            Agg::Average,
            vec![ArchiveSpec {
                sec_per_point: 60,
                count: 20,
            }],
            600,
            4,
            1.0,
        )
        .unwrap()
    }

    fn metric_cache(dir: &Path) -> MetricCache {
        let registry = crate::rurouni::schema_registry::SchemaRegistry::new(vec![wide_schema()]);
        MetricCache::new(
            dir.to_path_buf(),
            "a".to_string(),
            dir.join("metrics_index"),
            registry,
            Arc::new(crate::rurouni::index::NullLinkManager),
        )
    }

    #[test]
    fn restart_recovery_replays_index_and_next_allocation_fills_gap() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("metrics_index"),
            "metric.a\twide\t0\t0\nmetric.b\twide\t0\t2\nmetric.c\twide\t0\t3\n",
        )
        .unwrap();

        let cache = metric_cache(dir.path());
        cache.init_cache().unwrap();

        // Position 1 is the only gap left by the replayed index; the bundle
        // file itself doesn't need to exist on disk for this to work since
        // init_cache only reconstructs in-memory position bookkeeping.
        std::fs::create_dir_all(dir.path().join("a/wide")).unwrap();
        engine::create(
            &dir.path().join("a/wide/0.hs"),
            &vec![String::new(); 4],
            &wide_schema().archives,
            wide_schema().xff,
            wide_schema().agg,
        )
        .unwrap();

        cache.put("metric.d", 1_000_000_000, 42.0).unwrap();
        let rows = cache.pop("wide", 0, Some(1_000_000_060), true);
        assert_eq!(rows.len(), 1);
        // metric.d must have landed in the one free slot, position 1.
        assert_eq!(rows[0].1[1], 42.0);
        assert_eq!(rows[0].1[0], NULL_VALUE);
    }

    #[test]
    fn init_cache_tolerates_a_single_malformed_line() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("metrics_index"),
            "metric.a\twide\t0\t0\nthis line is garbage\nmetric.b\twide\t0\t1\n",
        )
        .unwrap();

        let cache = metric_cache(dir.path());
        cache.init_cache().unwrap();
    }

    #[test]
    fn init_cache_fails_after_two_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("metrics_index"),
            "garbage one\ngarbage two\nmetric.a\twide\t0\t0\n",
        )
        .unwrap();

        let cache = metric_cache(dir.path());
        assert!(cache.init_cache().is_err());
    }

    #[test]
    fn put_allocates_a_bundle_and_pop_drains_it() {
        let dir = tempfile::tempdir().unwrap();
        let cache = metric_cache(dir.path());
        cache.init_cache().unwrap();

        cache.put("some.metric", 1_000_000_000, 7.0).unwrap();
        let bundle_path = dir.path().join("a/wide/0.hs");
        assert!(bundle_path.exists());

        let peek = cache.get("some.metric").unwrap();
        assert_eq!(peek, vec![(1_000_000_000, 7.0)]);
    }
}
