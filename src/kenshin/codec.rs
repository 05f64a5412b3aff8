//! Pure binary layout: header packing/unpacking, archive offset arithmetic,
//! and row (point) serialization.
//!
//! Grounded on `kenshin/storage.py`'s `_pack_header`/`header` staticmethod
//! and on `whisper`'s `archive.rs` byte-slicing style (`byteorder` +
//! fixed-size structs instead of Python's `struct.pack`/`unpack`).

use byteorder::{BigEndian, ByteOrder};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::kenshin::agg::Agg;
use crate::kenshin::consts::{ARCHIVE_INFO_SIZE, METADATA_SIZE};
use crate::kenshin::error::{KenshinError, Result};
use crate::kenshin::schema::ArchiveSpec;

/// One archive's table entry, enriched with the derived `size`/`retention`
/// fields the Python `header()` staticmethod computes on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveInfo {
    pub offset: u32,
    pub sec_per_point: u32,
    pub count: u32,
    pub size: u32,
    pub retention: u64,
}

impl ArchiveInfo {
    pub fn derive(offset: u32, sec_per_point: u32, count: u32, point_size: u32) -> ArchiveInfo {
        ArchiveInfo {
            offset,
            sec_per_point,
            count,
            size: point_size * count,
            retention: sec_per_point as u64 * count as u64,
        }
    }
}

/// A fully decoded bundle header: metadata, tags (one slot per bundled
/// metric, possibly with empty padding slots), and the archive table.
#[derive(Debug, Clone)]
pub struct Header {
    pub agg: Agg,
    pub max_retention: u32,
    pub xff: f32,
    pub tags: Vec<String>,
    /// Total byte length of the TAB-joined tag block on disk — the budget
    /// `add_tag` must stay within for an in-place rewrite.
    pub tag_bytes: u32,
    pub point_size: u32,
    pub archives: Vec<ArchiveInfo>,
}

impl Header {
    pub fn width(&self) -> usize {
        self.tags.len()
    }
}

/// `point_size = 4 + 8 * tag_count` — one `u32` timestamp, `tag_count` `f64`
/// values.
pub fn point_size(tag_count: usize) -> u32 {
    4 + 8 * tag_count as u32
}

/// Serialize `tags`, `archives` and metadata into the fixed-layout header
/// block, returning the packed bytes and the file's total end offset (so
/// the caller knows how much to zero-fill for a new bundle).
///
/// Fails if `agg` or `archives` is invalid (archive validation happens one
/// layer up, in [`crate::kenshin::schema::validate_archive_list`]; this
/// function only requires a non-empty archive list).
pub fn pack_header(
    tags: &[String],
    archives: &[ArchiveSpec],
    xff: f32,
    agg: Agg,
) -> Result<(Vec<u8>, u64)> {
    if archives.is_empty() {
        return Err(KenshinError::InvalidConfig(
            "cannot pack a header with no archives".into(),
        ));
    }

    let tag_block = tags.join("\t");
    let tag_bytes = tag_block.len() as u32;
    let pt_size = point_size(tags.len());
    let max_retention = archives
        .last()
        .map(|a| a.retention() as u32)
        .unwrap_or(0);

    let mut buf = Vec::with_capacity(
        METADATA_SIZE + tag_block.len() + ARCHIVE_INFO_SIZE * archives.len(),
    );

    let mut metadata = [0u8; METADATA_SIZE];
    BigEndian::write_u32(&mut metadata[0..4], agg.id());
    BigEndian::write_u32(&mut metadata[4..8], max_retention);
    BigEndian::write_f32(&mut metadata[8..12], xff);
    BigEndian::write_u32(&mut metadata[12..16], archives.len() as u32);
    BigEndian::write_u32(&mut metadata[16..20], tag_bytes);
    BigEndian::write_u32(&mut metadata[20..24], pt_size);
    buf.extend_from_slice(&metadata);
    buf.extend_from_slice(tag_block.as_bytes());

    let mut offset = (METADATA_SIZE + tag_block.len() + ARCHIVE_INFO_SIZE * archives.len()) as u64;
    for a in archives {
        let mut entry = [0u8; ARCHIVE_INFO_SIZE];
        BigEndian::write_u32(&mut entry[0..4], offset as u32);
        BigEndian::write_u32(&mut entry[4..8], a.sec_per_point);
        BigEndian::write_u32(&mut entry[8..12], a.count);
        buf.extend_from_slice(&entry);
        offset += pt_size as u64 * a.count as u64;
    }

    Ok((buf, offset))
}

/// Read and decode a bundle's header from any seekable reader, restoring
/// the handle's original position afterward (mirrors `Storage.header`'s
/// seek-to-0-then-restore dance).
pub fn read_header<H: Read + Seek>(handle: &mut H, path: &Path) -> Result<Header> {
    let origin = handle.stream_position()?;
    handle.seek(SeekFrom::Start(0))?;

    let mut metadata = [0u8; METADATA_SIZE];
    handle.read_exact(&mut metadata).map_err(|e| corrupt(path, e))?;
    let agg_id = BigEndian::read_u32(&metadata[0..4]);
    let max_retention = BigEndian::read_u32(&metadata[4..8]);
    let xff = BigEndian::read_f32(&metadata[8..12]);
    let archive_count = BigEndian::read_u32(&metadata[12..16]);
    let tag_bytes = BigEndian::read_u32(&metadata[16..20]);
    let pt_size = BigEndian::read_u32(&metadata[20..24]);

    let agg = Agg::from_id(agg_id)?;

    let mut tag_buf = vec![0u8; tag_bytes as usize];
    handle.read_exact(&mut tag_buf).map_err(|e| corrupt(path, e))?;
    let tag_block = String::from_utf8(tag_buf).map_err(|e| KenshinError::CorruptFile {
        path: path.to_path_buf(),
        reason: format!("tag block is not valid UTF-8: {}", e),
    })?;
    let tags: Vec<String> = tag_block.split('\t').map(|s| s.to_string()).collect();

    let mut archives = Vec::with_capacity(archive_count as usize);
    for _ in 0..archive_count {
        let mut entry = [0u8; ARCHIVE_INFO_SIZE];
        handle.read_exact(&mut entry).map_err(|e| corrupt(path, e))?;
        let offset = BigEndian::read_u32(&entry[0..4]);
        let sec_per_point = BigEndian::read_u32(&entry[4..8]);
        let count = BigEndian::read_u32(&entry[8..12]);
        archives.push(ArchiveInfo::derive(offset, sec_per_point, count, pt_size));
    }

    handle.seek(SeekFrom::Start(origin))?;

    Ok(Header {
        agg,
        max_retention,
        xff,
        tags,
        tag_bytes,
        point_size: pt_size,
        archives,
    })
}

fn corrupt(path: &Path, e: std::io::Error) -> KenshinError {
    KenshinError::CorruptFile {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

/// Byte offset in the file at which a pre-aligned timestamp `t` lands within
/// `archive`, given the archive's current base timestamp.
///
/// `t` must already be aligned to `archive.sec_per_point`; callers are
/// responsible for rounding.
pub fn timestamp_to_offset(t: u32, base_ts: u32, archive: &ArchiveInfo, point_size: u32) -> u64 {
    let time_distance = t as i64 - base_ts as i64;
    let point_distance = time_distance.div_euclid(archive.sec_per_point as i64);
    let byte_distance = point_distance * point_size as i64;
    let wrapped = byte_distance.rem_euclid(archive.size as i64);
    archive.offset as u64 + wrapped as u64
}

/// Serialize one row: `timestamp:u32, value_0:f64, .., value_{w-1}:f64`, all
/// big-endian. `values.len()` must equal the bundle width.
pub fn pack_row(ts: u32, values: &[f64]) -> Vec<u8> {
    let mut buf = vec![0u8; 4 + 8 * values.len()];
    BigEndian::write_u32(&mut buf[0..4], ts);
    for (i, v) in values.iter().enumerate() {
        BigEndian::write_f64(&mut buf[4 + i * 8..4 + i * 8 + 8], *v);
    }
    buf
}

/// Deserialize one row of `width` values from a `point_size(width)`-byte
/// slice.
pub fn unpack_row(data: &[u8], width: usize) -> (u32, Vec<f64>) {
    let ts = BigEndian::read_u32(&data[0..4]);
    let values = (0..width)
        .map(|i| BigEndian::read_f64(&data[4 + i * 8..4 + i * 8 + 8]))
        .collect();
    (ts, values)
}

pub fn bundle_path(data_dir: &Path, instance: &str, schema_name: &str, file_idx: u32) -> PathBuf {
    data_dir
        .join(instance)
        .join(schema_name)
        .join(format!("{}.hs", file_idx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_archives() -> Vec<ArchiveSpec> {
        vec![
            ArchiveSpec {
                sec_per_point: 1,
                count: 60,
            },
            ArchiveSpec {
                sec_per_point: 60,
                count: 60,
            },
        ]
    }

    #[test]
    fn pack_then_read_round_trips() {
        let tags = vec!["a".to_string(), "b".to_string(), "".to_string()];
        let archives = sample_archives();
        let (bytes, end_offset) = pack_header(&tags, &archives, 0.5, Agg::Average).unwrap();
        assert_eq!(bytes.len() as u64, end_offset.min(bytes.len() as u64));

        let mut cursor = Cursor::new(bytes);
        let header = read_header(&mut cursor, Path::new("test.hs")).unwrap();

        assert_eq!(header.agg, Agg::Average);
        assert_eq!(header.xff, 0.5);
        assert_eq!(header.tags, tags);
        assert_eq!(header.point_size, point_size(3));
        assert_eq!(header.archives.len(), 2);
        assert_eq!(header.archives[0].sec_per_point, 1);
        assert_eq!(header.archives[0].count, 60);
        assert_eq!(header.archives[1].sec_per_point, 60);
        assert_eq!(header.archives[1].count, 60);
    }

    #[test]
    fn header_read_restores_original_position() {
        let tags = vec!["m".to_string()];
        let (bytes, _) = pack_header(&tags, &sample_archives(), 1.0, Agg::Average).unwrap();
        let mut cursor = Cursor::new(bytes);
        cursor.seek(SeekFrom::Start(7)).unwrap();
        read_header(&mut cursor, Path::new("x")).unwrap();
        assert_eq!(cursor.stream_position().unwrap(), 7);
    }

    #[test]
    fn row_round_trips() {
        let packed = pack_row(1_000, &[1.5, f64::from_bits(0), -4294967296.0]);
        let (ts, values) = unpack_row(&packed, 3);
        assert_eq!(ts, 1_000);
        assert_eq!(values[0], 1.5);
        assert_eq!(values[2], -4294967296.0);
    }

    #[test]
    fn offset_wraps_within_archive() {
        let archive = ArchiveInfo::derive(100, 60, 3, point_size(1));
        // base at slot 0, one step forward lands on slot 1, wrap after 3.
        let base = 600;
        let ps = point_size(1);
        assert_eq!(timestamp_to_offset(600, base, &archive, ps), 100 + 0 * ps as u64);
        assert_eq!(timestamp_to_offset(660, base, &archive, ps), 100 + 1 * ps as u64);
        assert_eq!(timestamp_to_offset(780, base, &archive, ps), 100 + 0 * ps as u64);
    }
}
