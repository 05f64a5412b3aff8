//! `whisper2kenshin` — migration tool that merges a batch of single-metric
//! whisper files into a shared kenshin bundle.
//!
//! A thin, single-process stand-in for `whisper2kenshin.py`'s
//! multiprocess worker pool: groups metrics from a metrics list by storage
//! schema (`metrics_max_num` per bundle), reads each whisper file's raw
//! points, and writes one kenshin bundle per group via the archive engine.
//! Out of scope per the storage spec's Non-goals (one-off migration
//! tooling); kept minimal rather than reproducing the original's
//! multiprocessing and symlink bookkeeping in full.

use byteorder::{BigEndian, ByteOrder};
use docopt::Docopt;
use rustc_serialize::Decodable;
use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process;

use kenshin_rurouni::kenshin::consts::NULL_VALUE;
use kenshin_rurouni::kenshin::engine;
use kenshin_rurouni::kenshin::schema::now_unix;
use kenshin_rurouni::rurouni::schema_registry::SchemaRegistry;

const USAGE: &str = "
whisper2kenshin: merge whisper files into kenshin bundles.

Usage:
  whisper2kenshin --whisper-dir=<dir> --kenshin-dir=<dir> --schemas=<conf> --metrics=<file>
  whisper2kenshin (-h | --help)

Options:
  -h --help              Show this screen.
  --whisper-dir=<dir>    Directory of <metric>.wsp files (dotted path -> slashes).
  --kenshin-dir=<dir>    Output directory for merged bundles.
  --schemas=<conf>       storage-schemas.conf path.
  --metrics=<file>       Newline-separated list of metric names to migrate.
";

#[derive(Debug, RustcDecodable)]
struct Args {
    flag_whisper_dir: String,
    flag_kenshin_dir: String,
    flag_schemas: String,
    flag_metrics: String,
}

/// One point read out of a whisper archive: `(timestamp, value)`, `ts == 0`
/// marks an unwritten slot (whisper's own absent-point convention).
#[derive(Debug, Clone, Copy)]
struct WhisperPoint {
    ts: u32,
    value: f64,
}

/// Minimal reader for the legacy single-metric whisper format: the same
/// `agg_id, max_retention, xff, archive_count` header kenshin's own codec
/// descends from, but one series per file and no tag block.
fn read_whisper_archive(path: &Path) -> Result<Vec<Vec<WhisperPoint>>, String> {
    let bytes = fs::read(path).map_err(|e| format!("{}: {}", path.display(), e))?;
    if bytes.len() < 16 {
        return Err(format!("{}: truncated header", path.display()));
    }
    let archive_count = BigEndian::read_u32(&bytes[12..16]) as usize;

    let mut archives = Vec::with_capacity(archive_count);
    let mut table_offset = 16;
    for _ in 0..archive_count {
        let offset = BigEndian::read_u32(&bytes[table_offset..table_offset + 4]) as usize;
        let seconds_per_point = BigEndian::read_u32(&bytes[table_offset + 4..table_offset + 8]);
        let points = BigEndian::read_u32(&bytes[table_offset + 8..table_offset + 12]) as usize;
        table_offset += 12;

        let mut values = Vec::with_capacity(points);
        for i in 0..points {
            let point_offset = offset + i * 12;
            if point_offset + 12 > bytes.len() {
                break;
            }
            let ts = BigEndian::read_u32(&bytes[point_offset..point_offset + 4]);
            let value = BigEndian::read_f64(&bytes[point_offset + 4..point_offset + 12]);
            values.push(WhisperPoint { ts, value });
        }
        let _ = seconds_per_point;
        archives.push(values);
    }
    Ok(archives)
}

fn metric_to_whisper_path(whisper_dir: &Path, metric: &str) -> PathBuf {
    let mut path = whisper_dir.to_path_buf();
    for part in metric.split('.') {
        path.push(part);
    }
    path.set_extension("wsp");
    path
}

/// Merge the finest-archive points of each member whisper file into one
/// `(timestamp, values)` row list, `NULL_VALUE` for members with no point
/// at that timestamp.
fn merge_finest_archive(files: &[Vec<Vec<WhisperPoint>>]) -> Vec<(u32, Vec<f64>)> {
    let width = files.len();
    let mut by_ts: HashMap<u32, Vec<f64>> = HashMap::new();
    for (i, archives) in files.iter().enumerate() {
        let finest = match archives.first() {
            Some(a) => a,
            None => continue,
        };
        for point in finest {
            if point.ts == 0 {
                continue;
            }
            by_ts
                .entry(point.ts)
                .or_insert_with(|| vec![NULL_VALUE; width])[i] = point.value;
        }
    }
    let mut rows: Vec<(u32, Vec<f64>)> = by_ts.into_iter().collect();
    rows.sort_by_key(|(ts, _)| *ts);
    rows
}

fn main() {
    env_logger::init();

    let args: Args = Docopt::new(USAGE)
        .and_then(|d| d.decode())
        .unwrap_or_else(|e| e.exit());

    if let Err(e) = run(&args) {
        eprintln!("whisper2kenshin: {}", e);
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), String> {
    let whisper_dir = Path::new(&args.flag_whisper_dir);
    let kenshin_dir = Path::new(&args.flag_kenshin_dir);

    let registry = SchemaRegistry::load(Path::new(&args.flag_schemas))
        .map_err(|e| format!("loading schemas: {}", e))?;

    let metrics_file = fs::File::open(&args.flag_metrics).map_err(|e| e.to_string())?;
    let metrics: Vec<String> = BufReader::new(metrics_file)
        .lines()
        .collect::<Result<_, _>>()
        .map_err(|e| e.to_string())?;

    // Group metrics by schema name, in metrics-file order, batching up to
    // metrics_max_num per bundle — mirrors the source tool's grouping, minus
    // its instance-hash sharding and worker pool.
    let mut groups: HashMap<String, Vec<Vec<String>>> = HashMap::new();
    for metric in metrics {
        let metric = metric.trim();
        if metric.is_empty() {
            continue;
        }
        let schema = registry.schema_for_metric(metric);
        let batches = groups.entry(schema.name.clone()).or_insert_with(|| vec![Vec::new()]);
        if batches.last().unwrap().len() == schema.metrics_max_num {
            batches.push(Vec::new());
        }
        batches.last_mut().unwrap().push(metric.to_string());
    }

    let mut index_lines = Vec::new();
    for (schema_name, batches) in &groups {
        let schema = registry
            .schema_by_name(schema_name)
            .expect("schema present in registry by construction");
        for (file_idx, metrics) in batches.iter().enumerate() {
            let bundle_path =
                kenshin_rurouni::kenshin::codec::bundle_path(kenshin_dir, "a", schema_name, file_idx as u32);

            let archives: Vec<Vec<Vec<WhisperPoint>>> = metrics
                .iter()
                .map(|m| read_whisper_archive(&metric_to_whisper_path(whisper_dir, m)))
                .collect::<Result<_, _>>()?;
            let merged = merge_finest_archive(&archives);

            let mut tags: Vec<String> = metrics.clone();
            tags.resize(schema.metrics_max_num, String::new());

            if !bundle_path.exists() {
                engine::create(&bundle_path, &tags, &schema.archives, schema.xff, schema.agg)
                    .map_err(|e| e.to_string())?;
            }
            if !merged.is_empty() {
                engine::update(&bundle_path, &merged, Some(now_unix())).map_err(|e| e.to_string())?;
            }

            for (pos, metric) in metrics.iter().enumerate() {
                index_lines.push(format!("{}\t{}\t{}\t{}", metric, schema_name, file_idx, pos));
            }
        }
    }

    let index_path = kenshin_dir.join("a.idx");
    let mut index_file = fs::File::create(&index_path).map_err(|e| e.to_string())?;
    for line in index_lines {
        writeln!(index_file, "{}", line).map_err(|e| e.to_string())?;
    }

    Ok(())
}
