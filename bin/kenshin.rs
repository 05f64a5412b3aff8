//! `kenshin` — thin CLI over the archive engine: `fetch`, `info`, `resize`,
//! `rebuild-index`, `get-metrics`. Mirrors the informational CLI surface
//! named in the storage spec; not itself part of the core engine.
//!
//! Argument parsing follows the reference crate's own choice of `docopt` +
//! `rustc-serialize`'s `Decodable` derive.

use docopt::Docopt;
use rustc_serialize::Decodable;
use std::path::Path;
use std::process;

use kenshin_rurouni::kenshin::engine;

const USAGE: &str = "
kenshin: inspect and query bundled-series archive files.

Usage:
  kenshin fetch <path> <from> [<until>]
  kenshin info <path>
  kenshin get-metrics <path>
  kenshin rebuild-index <data-dir> <index-path>
  kenshin (-h | --help)

Options:
  -h --help     Show this screen.
";

#[derive(Debug, RustcDecodable)]
struct Args {
    cmd_fetch: bool,
    cmd_info: bool,
    cmd_get_metrics: bool,
    cmd_rebuild_index: bool,
    arg_path: String,
    arg_from: String,
    arg_until: String,
    arg_data_dir: String,
    arg_index_path: String,
}

fn main() {
    env_logger::init();

    let args: Args = Docopt::new(USAGE)
        .and_then(|d| d.decode())
        .unwrap_or_else(|e| e.exit());

    let result = run(&args);
    if let Err(e) = result {
        eprintln!("kenshin: {}", e);
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), String> {
    if args.cmd_fetch {
        return cmd_fetch(args);
    }
    if args.cmd_info {
        return cmd_info(args);
    }
    if args.cmd_get_metrics {
        return cmd_get_metrics(args);
    }
    if args.cmd_rebuild_index {
        return cmd_rebuild_index(args);
    }
    Ok(())
}

fn cmd_fetch(args: &Args) -> Result<(), String> {
    let path = Path::new(&args.arg_path);
    let from: i64 = args.arg_from.parse().map_err(|_| "invalid <from>".to_string())?;
    let until: Option<i64> = if args.arg_until.is_empty() {
        None
    } else {
        Some(args.arg_until.parse().map_err(|_| "invalid <until>".to_string())?)
    };

    match engine::fetch(path, from, until, None).map_err(|e| e.to_string())? {
        None => {
            println!("no data in range");
        }
        Some(((start, _end, step), rows)) => {
            for (i, row) in rows.iter().enumerate() {
                let ts = start + i as i64 * step as i64;
                match row {
                    Some(values) => println!("{}\t{:?}", ts, values),
                    None => println!("{}\tNone", ts),
                }
            }
        }
    }
    Ok(())
}

fn cmd_info(args: &Args) -> Result<(), String> {
    let path = Path::new(&args.arg_path);
    let mut file = std::fs::File::open(path).map_err(|e| e.to_string())?;
    let header =
        kenshin_rurouni::kenshin::codec::read_header(&mut file, path).map_err(|e| e.to_string())?;
    println!("agg: {}", header.agg.name());
    println!("max_retention: {}", header.max_retention);
    println!("xff: {}", header.xff);
    println!("width: {}", header.width());
    for (i, archive) in header.archives.iter().enumerate() {
        println!(
            "archive[{}]: sec_per_point={} count={} retention={}",
            i, archive.sec_per_point, archive.count, archive.retention
        );
    }
    Ok(())
}

fn cmd_get_metrics(args: &Args) -> Result<(), String> {
    let path = Path::new(&args.arg_path);
    let mut file = std::fs::File::open(path).map_err(|e| e.to_string())?;
    let header =
        kenshin_rurouni::kenshin::codec::read_header(&mut file, path).map_err(|e| e.to_string())?;
    for tag in &header.tags {
        if !tag.is_empty() {
            println!("{}", tag);
        }
    }
    Ok(())
}

fn cmd_rebuild_index(args: &Args) -> Result<(), String> {
    // Walks every `*.hs` bundle under `data-dir`, reading each header's tag
    // block and re-emitting `metric schema_name file_idx file_pos` lines —
    // the recovery path for a lost or corrupted metric index (see the
    // storage spec's restart-recovery scenario), driven directly from the
    // bundles themselves rather than a prior index snapshot.
    let data_dir = Path::new(&args.arg_data_dir);
    let mut out = std::fs::File::create(&args.arg_index_path).map_err(|e| e.to_string())?;
    use std::io::Write;

    for entry in walk_bundles(data_dir) {
        let mut file = std::fs::File::open(&entry).map_err(|e| e.to_string())?;
        let header = kenshin_rurouni::kenshin::codec::read_header(&mut file, &entry)
            .map_err(|e| e.to_string())?;
        let schema_name = entry
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let file_idx = entry
            .file_stem()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        for (pos, tag) in header.tags.iter().enumerate() {
            if !tag.is_empty() {
                writeln!(out, "{}\t{}\t{}\t{}", tag, schema_name, file_idx, pos)
                    .map_err(|e| e.to_string())?;
            }
        }
    }
    Ok(())
}

fn walk_bundles(dir: &Path) -> Vec<std::path::PathBuf> {
    let mut out = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return out,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            out.extend(walk_bundles(&path));
        } else if path.extension().and_then(|e| e.to_str()) == Some("hs") {
            out.push(path);
        }
    }
    out
}
