//! The archive engine: create/update/fetch/propagate over a bundle file.
//!
//! Grounded on `kenshin/storage.py`'s `Storage` class (`create`, `update`,
//! `_update_archive`, `fetch`, `_archive_fetch`) and on `whisper`'s
//! `WhisperFile::new`/`_write` for the on-disk creation and mmap-backed
//! write path. Propagation (downsampling) is not present in the retained
//! Python revision but is specified in full in the storage spec; it is
//! modeled here as an iterative loop over adjacent archive pairs, per the
//! "Recursive propagation" design note.

use byteorder::{BigEndian, ByteOrder};
use memmap2::MmapMut;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::kenshin::agg::Agg;
use crate::kenshin::codec::{self, ArchiveInfo, Header};
use crate::kenshin::consts::{IO_CHUNK_SIZE, NULL_VALUE};
use crate::kenshin::error::{KenshinError, Result};
use crate::kenshin::schema::{now_unix, ArchiveSpec};

/// `(from, until, step)` describing the cadence of a [`fetch`] result.
pub type TimeInfo = (i64, i64, u32);

/// One row per slot in the fetched window; `None` when the slot's stored
/// timestamp didn't match the expected one (the whole row is absent).
pub type FetchRow = Option<Vec<f64>>;

/// Create a new bundle file at `path` with `tags.len()` co-located series.
///
/// Fails with [`KenshinError::AlreadyExists`] if the path exists. Writes the
/// header then zero-fills the remainder of the file in
/// [`IO_CHUNK_SIZE`]-byte chunks, creating parent directories as needed.
pub fn create(
    path: &Path,
    tags: &[String],
    archives: &[ArchiveSpec],
    xff: f32,
    agg: Agg,
) -> Result<()> {
    if path.exists() {
        return Err(KenshinError::AlreadyExists(path.to_path_buf()));
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let (header_bytes, end_offset) = codec::pack_header(tags, archives, xff, agg)?;

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)?;
    file.write_all(&header_bytes)?;

    let mut remaining = end_offset - header_bytes.len() as u64;
    let zeroes = vec![0u8; IO_CHUNK_SIZE];
    while remaining > 0 {
        let chunk = remaining.min(IO_CHUNK_SIZE as u64) as usize;
        file.write_all(&zeroes[..chunk])?;
        remaining -= chunk as u64;
    }
    Ok(())
}

fn open_rw(path: &Path) -> Result<File> {
    Ok(OpenOptions::new().read(true).write(true).open(path)?)
}

fn read_header_from_file(file: &mut File, path: &Path) -> Result<Header> {
    codec::read_header(file, path)
}

/// Replace the tag at `pos_idx` with `tag`.
///
/// If `tag` is no longer than the tag it replaces, the tag block is
/// rewritten in place (padding the slot with filler to keep `tag_bytes`
/// constant so no archive offsets move). Otherwise the whole header is
/// rebuilt in a temp file, archive data is copied across in
/// [`IO_CHUNK_SIZE`]-byte chunks, and the temp file is atomically renamed
/// over the original — growth is rare and must never leave a half-written
/// file in its place.
pub fn add_tag(tag: &str, path: &Path, pos_idx: usize) -> Result<()> {
    let mut file = open_rw(path)?;
    let header = read_header_from_file(&mut file, path)?;

    if pos_idx >= header.tags.len() {
        return Err(KenshinError::InvalidConfig(format!(
            "pos_idx {} out of range for bundle with {} slots",
            pos_idx,
            header.tags.len()
        )));
    }

    let mut new_tags = header.tags.clone();
    let old_tag = new_tags[pos_idx].clone();

    if tag.len() <= old_tag.len() && pos_idx + 1 < new_tags.len() {
        new_tags[pos_idx] = tag.to_string();
        let mut tag_block = new_tags.join("\t");
        // Growth slack goes into the next slot as filler so tag_bytes (and
        // therefore every archive offset) is unchanged; the filler is
        // overwritten the next time that slot's tag is set.
        let pad_len = (header.tag_bytes as usize).saturating_sub(tag_block.len());
        tag_block.push_str(&" ".repeat(pad_len));
        file.seek(SeekFrom::Start(METADATA_SIZE_U64))?;
        file.write_all(tag_block.as_bytes())?;
        return Ok(());
    }

    // Growth path: rebuild header + copy data into a temp file, then rename.
    let (header_bytes, _end_offset) =
        codec::pack_header(&new_tags, &archive_specs(&header), header.xff, header.agg)?;

    let tmp_path = temp_path_for(path);
    {
        let mut tmp = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&tmp_path)?;
        tmp.write_all(&header_bytes)?;

        file.seek(SeekFrom::Start(header_data_start(&header)))?;
        let mut remaining = archive_data_len(&header);
        let mut buf = vec![0u8; IO_CHUNK_SIZE];
        while remaining > 0 {
            let chunk = remaining.min(IO_CHUNK_SIZE as u64) as usize;
            file.read_exact(&mut buf[..chunk])?;
            tmp.write_all(&buf[..chunk])?;
            remaining -= chunk as u64;
        }
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

const METADATA_SIZE_U64: u64 = crate::kenshin::consts::METADATA_SIZE as u64;

fn temp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.to_path_buf();
    let file_name = tmp
        .file_name()
        .map(|n| format!("{}.tmp", n.to_string_lossy()))
        .unwrap_or_else(|| "bundle.tmp".to_string());
    tmp.set_file_name(file_name);
    tmp
}

fn header_data_start(header: &Header) -> u64 {
    header.archives.first().map(|a| a.offset as u64).unwrap_or(0)
}

fn archive_data_len(header: &Header) -> u64 {
    header
        .archives
        .iter()
        .map(|a| a.size as u64)
        .sum()
}

fn archive_specs(header: &Header) -> Vec<ArchiveSpec> {
    header
        .archives
        .iter()
        .map(|a| ArchiveSpec {
            sec_per_point: a.sec_per_point,
            count: a.count,
        })
        .collect()
}

fn round_down(x: u32, base: u32) -> u32 {
    x - (x % base)
}

fn round_up(x: u32, base: u32) -> u32 {
    let rem = x % base;
    if rem == 0 {
        x
    } else {
        x + (base - rem)
    }
}

/// Align-and-dedupe incoming points at `sec_per_point` resolution.
///
/// Points are expected sorted by raw timestamp descending (matching
/// `update`'s own sort); ties at the aligned timestamp resolve to whichever
/// point comes last in that descending iteration, exactly mirroring
/// `dict(aligned_points)` in the Python original. Returns points sorted
/// ascending by aligned timestamp.
fn align_and_dedupe(points_desc: &[(u32, Vec<f64>)], sec_per_point: u32) -> Vec<(u32, Vec<f64>)> {
    let mut map: BTreeMap<u32, Vec<f64>> = BTreeMap::new();
    for (ts, values) in points_desc {
        map.insert(round_down(*ts, sec_per_point), values.clone());
    }
    map.into_iter().collect()
}

/// Write a batch of already-aligned, ascending, deduped points into
/// `archive`, initializing its base timestamp on first write and wrapping
/// around the circular buffer as needed. Returns the `(min_ts, max_ts)` of
/// the points actually written.
fn write_archive(
    mmap: &mut MmapMut,
    width: usize,
    archive: &ArchiveInfo,
    points: &[(u32, Vec<f64>)],
) -> Result<(u32, u32)> {
    let point_size = archive.size / archive.count.max(1);
    let base_ts = BigEndian::read_u32(
        &mmap[archive.offset as usize..archive.offset as usize + 4],
    );
    let base_ts = if base_ts == 0 { points[0].0 } else { base_ts };

    let first_ts = points[0].0;
    let start_offset = codec::timestamp_to_offset(first_ts, base_ts, archive, point_size);

    let mut packed = Vec::with_capacity(points.len() * point_size as usize);
    for (ts, values) in points {
        if values.len() != width {
            return Err(KenshinError::InvalidConfig(format!(
                "point at ts {} has {} values, expected width {}",
                ts,
                values.len(),
                width
            )));
        }
        packed.extend_from_slice(&codec::pack_row(*ts, values));
    }

    let archive_start = archive.offset as u64;
    let archive_end = archive_start + archive.size as u64;
    let bytes_beyond = (start_offset + packed.len() as u64) as i64 - archive_end as i64;

    if bytes_beyond > 0 {
        let split = packed.len() - bytes_beyond as usize;
        let start = start_offset as usize;
        mmap[start..start + split].copy_from_slice(&packed[..split]);
        let tail_start = archive_start as usize;
        mmap[tail_start..tail_start + (packed.len() - split)].copy_from_slice(&packed[split..]);
    } else {
        let start = start_offset as usize;
        mmap[start..start + packed.len()].copy_from_slice(&packed);
    }

    Ok((points[0].0, points[points.len() - 1].0))
}

/// Read `count` consecutive `sec_per_point`-aligned rows of `archive`
/// starting at `start_ts`, returning `None` for any slot whose stored
/// timestamp doesn't match its expected slot timestamp (absent).
fn read_rows(
    mmap: &MmapMut,
    archive: &ArchiveInfo,
    point_size: u32,
    start_ts: u32,
    count: usize,
) -> Vec<Option<(u32, Vec<f64>)>> {
    let base_ts = BigEndian::read_u32(
        &mmap[archive.offset as usize..archive.offset as usize + 4],
    );
    let mut out = Vec::with_capacity(count);
    if base_ts == 0 {
        for _ in 0..count {
            out.push(None);
        }
        return out;
    }
    let width = (point_size as usize - 4) / 8;
    for i in 0..count {
        let ts = start_ts.wrapping_add(i as u32 * archive.sec_per_point);
        let offset = codec::timestamp_to_offset(ts, base_ts, archive, point_size) as usize;
        let data = &mmap[offset..offset + point_size as usize];
        let (stored_ts, values) = codec::unpack_row(data, width);
        if stored_ts == ts {
            out.push(Some((ts, values)));
        } else {
            out.push(None);
        }
    }
    out
}

/// Downsample the range `[min_ts, max_ts]` just written into `archives[higher_idx]`
/// down into `archives[higher_idx + 1]`, returning the range written into the
/// lower archive (so the caller can continue propagating), or `None` if
/// there wasn't enough coverage to produce any aggregate point.
fn propagate_one_level(
    mmap: &mut MmapMut,
    width: usize,
    archives: &[ArchiveInfo],
    higher_idx: usize,
    min_ts: u32,
    max_ts: u32,
    agg: Agg,
    xff: f32,
) -> Result<Option<(u32, u32)>> {
    let higher = archives[higher_idx];
    let lower = archives[higher_idx + 1];
    let k = lower.sec_per_point / higher.sec_per_point;

    let timeunit = ((k as f32 * xff).ceil() as u32).max(1) * higher.sec_per_point;
    if min_ts / timeunit == max_ts / timeunit && min_ts % timeunit != 0 {
        return Ok(None);
    }

    let lower_start = round_down(min_ts, lower.sec_per_point);
    let lower_end = round_up(max_ts + higher.sec_per_point, lower.sec_per_point);
    if lower_end <= lower_start {
        return Ok(None);
    }

    let higher_point_size = higher.size / higher.count.max(1);
    let count = ((lower_end - lower_start) / higher.sec_per_point) as usize;
    let rows = read_rows(mmap, &higher, higher_point_size, lower_start, count);

    let mut agg_points = Vec::new();
    for chunk in rows.chunks(k as usize) {
        let present: Vec<&(u32, Vec<f64>)> = chunk.iter().filter_map(|r| r.as_ref()).collect();
        if present.is_empty() {
            continue;
        }
        let group_ts = present.iter().map(|(ts, _)| *ts).max().unwrap();
        let mut values = Vec::with_capacity(width);
        for col in 0..width {
            let col_vals: Vec<f64> = present
                .iter()
                .map(|(_, vals)| vals[col])
                .filter(|v| *v != NULL_VALUE)
                .collect();
            values.push(if col_vals.is_empty() {
                NULL_VALUE
            } else {
                agg.aggregate(&col_vals)
            });
        }
        agg_points.push((group_ts, values));
    }

    if agg_points.is_empty() {
        return Ok(None);
    }
    write_archive(mmap, width, &lower, &agg_points).map(Some)
}

/// Write a batch of `(timestamp, values)` points into `path`'s finest
/// archive and propagate them into every coarser archive.
///
/// `points` is unordered. Points older than `now - archives[0].retention()`
/// are dropped. Points sharing an aligned timestamp resolve deterministically
/// (see [`align_and_dedupe`]).
pub fn update(path: &Path, points: &[(u32, Vec<f64>)], now: Option<i64>) -> Result<()> {
    if points.is_empty() {
        return Ok(());
    }
    let now = now.unwrap_or_else(now_unix);

    let mut file = open_rw(path)?;
    let header = read_header_from_file(&mut file, path)?;
    let width = header.width();

    let mut sorted: Vec<(u32, Vec<f64>)> = points.to_vec();
    sorted.sort_by(|a, b| b.0.cmp(&a.0));

    let first_archive = header.archives[0];
    let retention = first_archive.retention as i64;
    sorted.retain(|(ts, _)| retention > now - *ts as i64);
    if sorted.is_empty() {
        return Ok(());
    }

    let aligned = align_and_dedupe(&sorted, first_archive.sec_per_point);

    let mut mmap = unsafe { MmapMut::map_mut(&file)? };
    let (min_ts, max_ts) = write_archive(&mut mmap, width, &first_archive, &aligned)?;

    let mut range = Some((min_ts, max_ts));
    for i in 0..header.archives.len().saturating_sub(1) {
        let (lo, hi) = match range {
            Some(r) => r,
            None => break,
        };
        range = propagate_one_level(
            &mut mmap,
            width,
            &header.archives,
            i,
            lo,
            hi,
            header.agg,
            header.xff,
        )?;
    }
    mmap.flush()?;
    Ok(())
}

/// Read back `[from_time, until_time)` from the finest archive whose
/// retention covers the requested span.
///
/// Returns `None` if the requested range falls entirely outside the
/// bundle's retention. `until_time` defaults to `now` and is silently
/// clamped to `now` if it is later (asymmetric with `from_time > now`,
/// which still yields `None` via the outside-retention check — preserved
/// from the source's behavior, not a bug).
pub fn fetch(
    path: &Path,
    from_time: i64,
    until_time: Option<i64>,
    now: Option<i64>,
) -> Result<Option<(TimeInfo, Vec<FetchRow>)>> {
    let mut file = open_rw(path)?;
    let header = read_header_from_file(&mut file, path)?;

    let now = now.unwrap_or_else(now_unix);
    let mut until_time = until_time.unwrap_or(now);

    if from_time >= until_time {
        return Err(KenshinError::InvalidTime {
            from: from_time,
            until: until_time,
        });
    }

    let oldest_time = now - header.max_retention as i64;
    if from_time > now {
        return Ok(None);
    }
    if until_time < oldest_time {
        return Ok(None);
    }

    // `until_time` is clamped silently; `from_time` beyond `now` already
    // exited above. This asymmetry is intentional, see Open Questions.
    until_time = until_time.min(now);
    let from_time = from_time.max(oldest_time);

    let diff = now - from_time;
    let archive = header
        .archives
        .iter()
        .find(|a| a.retention as i64 >= diff)
        .copied()
        .unwrap_or(*header.archives.last().unwrap());

    let from_aligned = round_up(from_time as u32, archive.sec_per_point);
    let until_aligned = round_up(until_time as u32, archive.sec_per_point);
    let step = archive.sec_per_point;
    let count = ((until_aligned - from_aligned) / step) as usize;

    let mmap = unsafe { MmapMut::map_mut(&file)? };
    let point_size = archive.size / archive.count.max(1);
    let rows = read_rows(&mmap, &archive, point_size, from_aligned, count)
        .into_iter()
        .map(|r| r.map(|(_, values)| values))
        .collect::<Vec<_>>();

    Ok(Some((
        (from_aligned as i64, until_aligned as i64, step),
        rows,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn tags(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("m{}", i)).collect()
    }

    #[test]
    fn create_rejects_existing_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("b.hs");
        let archives = vec![ArchiveSpec {
            sec_per_point: 1,
            count: 60,
        }];
        create(&path, &tags(2), &archives, 1.0, Agg::Average).unwrap();
        let err = create(&path, &tags(2), &archives, 1.0, Agg::Average).unwrap_err();
        assert!(matches!(err, KenshinError::AlreadyExists(_)));
    }

    #[test]
    fn create_zero_fills_and_matches_end_offset() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("b.hs");
        let archives = vec![ArchiveSpec {
            sec_per_point: 1,
            count: 60,
        }];
        create(&path, &tags(2), &archives, 1.0, Agg::Average).unwrap();
        let metadata = fs::metadata(&path).unwrap();
        // header + 60 rows * (4 + 8*2) bytes
        let expected = crate::kenshin::consts::METADATA_SIZE
            + 3 // tag block "m0\tm1"
            + 4
            + crate::kenshin::consts::ARCHIVE_INFO_SIZE
            + 60 * (4 + 16);
        assert_eq!(metadata.len() as usize, expected);
    }

    #[test]
    fn write_then_fetch_round_trips_exact_timestamps() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("b.hs");
        let archives = vec![
            ArchiveSpec {
                sec_per_point: 1,
                count: 60,
            },
            ArchiveSpec {
                sec_per_point: 60,
                count: 60,
            },
        ];
        create(&path, &tags(2), &archives, 1.0, Agg::Average).unwrap();

        let now = 1_000_000i64;
        let points: Vec<(u32, Vec<f64>)> = (1..=5)
            .map(|i| ((now - 6 + i) as u32, vec![10.0 + i as f64, 20.0 + i as f64]))
            .collect();
        update(&path, &points, Some(now)).unwrap();

        let (time_info, rows) = fetch(&path, now - 5, Some(now), Some(now))
            .unwrap()
            .unwrap();
        assert_eq!(time_info.2, 1);
        let present: Vec<_> = rows.iter().filter(|r| r.is_some()).collect();
        assert_eq!(present.len(), 5);
        for (i, row) in rows.iter().enumerate() {
            if let Some(values) = row {
                let ts = time_info.0 + i as i64;
                let expected_i = ts - (now - 6);
                assert_eq!(values[0], 10.0 + expected_i as f64);
                assert_eq!(values[1], 20.0 + expected_i as f64);
            }
        }
    }

    #[test]
    fn wrap_leaves_only_newest_points_readable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("b.hs");
        let archives = vec![ArchiveSpec {
            sec_per_point: 1,
            count: 6,
        }];
        create(&path, &tags(1), &archives, 1.0, Agg::Average).unwrap();

        // The finest archive's retention equals its own size (6 points), so
        // a single `update` call can never hand more than `count` points
        // past the retention filter — it can never exercise a real wrap.
        // A genuine wrap needs a prior call to establish an old base, then a
        // second batch whose offsets from that base run past the archive's
        // end.
        update(&path, &[(1_000, vec![100.0])], Some(1_005)).unwrap();

        let points: Vec<(u32, Vec<f64>)> = (0..6).map(|i| (1_010 + i, vec![i as f64])).collect();
        update(&path, &points, Some(1_015)).unwrap();

        let (_, rows) = fetch(&path, 1_010, Some(1_016), Some(1_016))
            .unwrap()
            .unwrap();
        let present: Vec<_> = rows.iter().filter_map(|r| r.clone()).collect();
        assert_eq!(present.len(), 6);
        // The first call's point is fully evicted by the wrap; every slot
        // now holds the second batch's values, in order.
        for (i, values) in present.iter().enumerate() {
            assert_eq!(values[0], i as f64);
        }
    }

    #[test]
    fn absent_column_reads_back_as_null_value() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("b.hs");
        let archives = vec![ArchiveSpec {
            sec_per_point: 1,
            count: 60,
        }];
        create(&path, &tags(3), &archives, 1.0, Agg::Average).unwrap();

        let now = 1_000_000i64;
        let points = vec![
            (
                (now - 1) as u32,
                vec![1.0, NULL_VALUE, 3.0],
            ),
        ];
        update(&path, &points, Some(now)).unwrap();

        let (_, rows) = fetch(&path, now - 1, Some(now), Some(now)).unwrap().unwrap();
        let row = rows[0].clone().unwrap();
        assert_eq!(row[1], NULL_VALUE);
    }

    #[test]
    fn propagation_downsamples_with_min_aggregate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("b.hs");
        let archives = vec![
            ArchiveSpec {
                sec_per_point: 1,
                count: 6,
            },
            ArchiveSpec {
                sec_per_point: 3,
                count: 6,
            },
        ];
        create(&path, &tags(1), &archives, 1.0, Agg::Min).unwrap();

        let now = 1_000_000i64;
        let points: Vec<(u32, Vec<f64>)> = (1..=6)
            .map(|i| ((now - i) as u32, vec![10.0 + i as f64]))
            .collect();
        update(&path, &points, Some(now)).unwrap();

        let (_, rows) = fetch(&path, now - 6, Some(now), Some(now)).unwrap().unwrap();
        // coarse archive covers 3s buckets; with min aggregation over
        // {10+i..} groups we expect two populated buckets.
        let present: Vec<f64> = rows.iter().filter_map(|r| r.clone()).map(|v| v[0]).collect();
        assert!(!present.is_empty());
    }

    #[test]
    fn add_tag_in_place_preserves_archive_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("b.hs");
        let archives = vec![ArchiveSpec {
            sec_per_point: 1,
            count: 60,
        }];
        create(&path, &tags(2), &archives, 1.0, Agg::Average).unwrap();

        let now = 1_000_000i64;
        update(&path, &[((now - 1) as u32, vec![1.0, 2.0])], Some(now)).unwrap();

        let before = fs::read(&path).unwrap();
        add_tag("x", &path, 1).unwrap();
        let after = fs::read(&path).unwrap();

        let mut file = open_rw(&path).unwrap();
        let header = read_header_from_file(&mut file, &path).unwrap();
        let data_start = header_data_start(&header) as usize;
        assert_eq!(before[data_start..], after[data_start..]);
        assert_eq!(header.tags[1], "x");
    }

    #[test]
    fn update_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("b.hs");
        let archives = vec![ArchiveSpec {
            sec_per_point: 1,
            count: 60,
        }];
        create(&path, &tags(1), &archives, 1.0, Agg::Average).unwrap();

        let now = 1_000_000i64;
        let points = vec![((now - 1) as u32, vec![42.0])];
        update(&path, &points, Some(now)).unwrap();
        let first = fs::read(&path).unwrap();
        update(&path, &points, Some(now)).unwrap();
        let second = fs::read(&path).unwrap();
        assert_eq!(first, second);
    }
}
