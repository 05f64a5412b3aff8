//! Constants shared across the bundle codec and engine.

/// Sentinel marking a single series' value as absent within an otherwise
/// present row.
///
/// A legitimate data point whose value is exactly this number is
/// indistinguishable from "absent" on read-back. This is a known limitation
/// inherited from the source format, not a bug to be fixed here.
pub const NULL_VALUE: f64 = -4294967296.0;

/// Fixed size, in bytes, of the metadata block at the start of every bundle
/// file: `agg_id, max_retention, xff, archive_count, tag_bytes, point_size`,
/// each a 4-byte big-endian field (xff is `f32`).
pub const METADATA_SIZE: usize = 4 * 6;

/// Size, in bytes, of one archive-table entry: `offset, sec_per_point, count`.
pub const ARCHIVE_INFO_SIZE: usize = 4 * 3;

/// Chunk size used when zero-filling newly created bundle files and when
/// copying archive data during a growing `add_tag` rewrite.
pub const IO_CHUNK_SIZE: usize = 16 * 1024;

/// Grace period (seconds) a [`crate::rurouni::cache::FileCache`] must age
/// past its retention window before it becomes flushable. Matches the
/// Python original's `DEFAULT_WAIT_TIME` setting.
pub const DEFAULT_WAIT_TIME: i64 = 10;

/// Hard cap on metrics per bundle: positions are tracked in a `u64` bitmap.
pub const MAX_METRICS_PER_FILE: usize = 64;
