//! Storage schemas: retention lists, aggregation method, xff, and bundle
//! width, matched against metric names.
//!
//! Grounded on `rurouni/storage.py`'s `PatternSchema`/`DefaultSchema` and
//! `Archive.fromString`, and on `whisper2kenshin.py`'s retention-string
//! parsing.

use regex::Regex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::kenshin::agg::Agg;
use crate::kenshin::consts::MAX_METRICS_PER_FILE;
use crate::kenshin::error::{KenshinError, Result};

/// One retention level: `sec_per_point` seconds between samples, `count`
/// samples retained (so this level covers `sec_per_point * count` seconds).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveSpec {
    pub sec_per_point: u32,
    pub count: u32,
}

impl ArchiveSpec {
    pub fn retention(&self) -> u64 {
        self.sec_per_point as u64 * self.count as u64
    }
}

/// Parse a single retention definition like `"60s:7d"` into
/// `(sec_per_point, count)`, mirroring `Archive.fromString` /
/// `whisper2kenshin.py`'s unit handling.
pub fn parse_retention_def(def: &str) -> Result<ArchiveSpec> {
    let (precision_str, points_str) = def.split_once(':').ok_or_else(|| {
        KenshinError::InvalidConfig(format!("malformed retention definition '{}'", def))
    })?;

    let sec_per_point = parse_time_str(precision_str)?;
    // The second field may be a bare point count or a duration; if it parses
    // as a plain integer, treat it as a point count (as the original parser
    // does for defs like "60:1440"), otherwise as a duration to convert to a
    // point count at this precision.
    let count = if let Ok(n) = points_str.parse::<u32>() {
        n
    } else {
        let points_duration = parse_time_str(points_str)?;
        if sec_per_point == 0 {
            return Err(KenshinError::InvalidConfig(format!(
                "retention definition '{}' has zero precision",
                def
            )));
        }
        points_duration / sec_per_point
    };

    Ok(ArchiveSpec {
        sec_per_point,
        count,
    })
}

/// Parse a duration like `"7d"`, `"10m"`, `"1y"` into seconds. Unit
/// suffixes: `s,m,h,d,w,y`; a bare number is seconds.
pub fn parse_time_str(s: &str) -> Result<u32> {
    let s = s.trim();
    if s.is_empty() {
        return Err(KenshinError::InvalidConfig("empty time string".into()));
    }
    let (digits, unit) = match s.chars().last() {
        Some(c) if c.is_ascii_digit() => (s, 's'),
        Some(c) => (&s[..s.len() - 1], c),
        None => unreachable!(),
    };
    let n: u32 = digits
        .parse()
        .map_err(|_| KenshinError::InvalidConfig(format!("invalid time string '{}'", s)))?;
    let multiplier: u32 = match unit {
        's' => 1,
        'm' => 60,
        'h' => 3600,
        'd' => 86400,
        'w' => 86400 * 7,
        'y' => 86400 * 365,
        other => {
            return Err(KenshinError::InvalidConfig(format!(
                "unknown time unit '{}'",
                other
            )))
        }
    };
    Ok(n * multiplier)
}

/// Validate an archive list against the invariants in §3/§8 of the spec:
/// strictly increasing `sec_per_point`, each step divides the next, each
/// archive's retention exceeds the previous, and enough points exist at
/// each level to form one aggregate at the next given `xff`.
pub fn validate_archive_list(archives: &[ArchiveSpec], xff: f32) -> Result<()> {
    if archives.is_empty() {
        return Err(KenshinError::InvalidConfig(
            "at least one archive is required".into(),
        ));
    }
    if !(0.0..=1.0).contains(&xff) {
        return Err(KenshinError::InvalidConfig(format!(
            "xff {} is outside [0.0, 1.0]",
            xff
        )));
    }
    for a in archives {
        if a.sec_per_point == 0 || a.count == 0 {
            return Err(KenshinError::InvalidConfig(
                "archive sec_per_point and count must be non-zero".into(),
            ));
        }
    }
    for pair in archives.windows(2) {
        let (prev, next) = (pair[0], pair[1]);
        if next.sec_per_point <= prev.sec_per_point {
            return Err(KenshinError::InvalidConfig(format!(
                "archives must have increasing precision: {} then {}",
                prev.sec_per_point, next.sec_per_point
            )));
        }
        if next.sec_per_point % prev.sec_per_point != 0 {
            return Err(KenshinError::InvalidConfig(format!(
                "archive precision {} is not a divisor of {}",
                prev.sec_per_point, next.sec_per_point
            )));
        }
        if next.retention() <= prev.retention() {
            return Err(KenshinError::InvalidConfig(format!(
                "each archive must cover a longer retention than the previous: {} then {}",
                prev.retention(),
                next.retention()
            )));
        }
        let points_per_consolidation = next.sec_per_point / prev.sec_per_point;
        let min_points_needed = points_per_consolidation as f32 / xff.max(f32::EPSILON);
        if (prev.count as f32) < min_points_needed {
            return Err(KenshinError::InvalidConfig(format!(
                "archive {}:{} does not have enough points ({}) to satisfy xff {} for the next archive",
                prev.sec_per_point, prev.count, prev.count, xff
            )));
        }
    }
    Ok(())
}

/// A storage schema: how metrics matching `pattern` (or the trailing
/// default schema) are retained, aggregated, and bundled together.
#[derive(Debug, Clone)]
pub struct Schema {
    pub name: String,
    pattern: Option<Regex>,
    pub xff: f32,
    pub agg: Agg,
    pub archives: Vec<ArchiveSpec>,
    pub cache_retention: u32,
    pub metrics_max_num: usize,
    pub cache_ratio: f64,
}

impl Schema {
    pub fn new(
        name: impl Into<String>,
        pattern: Option<&str>,
        xff: f32,
        agg: Agg,
        archives: Vec<ArchiveSpec>,
        cache_retention: u32,
        metrics_max_num: usize,
        cache_ratio: f64,
    ) -> Result<Schema> {
        validate_archive_list(&archives, xff)?;
        if metrics_max_num == 0 || metrics_max_num > MAX_METRICS_PER_FILE {
            return Err(KenshinError::InvalidConfig(format!(
                "metrics_max_num must be in 1..={}, got {}",
                MAX_METRICS_PER_FILE, metrics_max_num
            )));
        }
        if cache_ratio < 1.0 {
            return Err(KenshinError::InvalidConfig(
                "cache_ratio must be >= 1.0".into(),
            ));
        }
        let pattern = pattern
            .map(Regex::new)
            .transpose()
            .map_err(|e| KenshinError::InvalidConfig(e.to_string()))?;
        Ok(Schema {
            name: name.into(),
            pattern,
            xff,
            agg,
            archives,
            cache_retention,
            metrics_max_num,
            cache_ratio,
        })
    }

    /// The trailing default schema: 7 days of minutely data, bundle width
    /// 40, `avg`, `xff = 1.0`, matches every metric name.
    pub fn default_schema() -> Schema {
        Schema {
            name: "default".to_string(),
            pattern: None,
            xff: 1.0,
            agg: Agg::Average,
            archives: vec![ArchiveSpec {
                sec_per_point: 60,
                count: 60 * 24 * 7,
            }],
            cache_retention: 600,
            metrics_max_num: 40,
            cache_ratio: 1.0,
        }
    }

    pub fn matches(&self, metric: &str) -> bool {
        match &self.pattern {
            Some(re) => re.is_match(metric),
            None => true,
        }
    }

    /// Whether this schema has no pattern, or an unconditional one, and so
    /// can serve as the registry's trailing catch-all.
    pub fn matches_everything(&self) -> bool {
        self.pattern.is_none()
    }

    pub fn max_retention(&self) -> u64 {
        self.archives.last().map(|a| a.retention()).unwrap_or(0)
    }

    pub fn resolution(&self) -> u32 {
        self.archives[0].sec_per_point
    }

    /// `cache_size` per §3/§4.4: `ceil((cache_retention/resolution + 1) *
    /// cache_ratio)`.
    pub fn cache_size(&self) -> usize {
        let points_num = self.points_num();
        (points_num as f64 * self.cache_ratio).ceil() as usize
    }

    /// `points_num = cache_retention / resolution + 1`.
    pub fn points_num(&self) -> usize {
        (self.cache_retention / self.resolution()) as usize + 1
    }
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_retention_with_unit_suffixes() {
        assert_eq!(
            parse_retention_def("60s:7d").unwrap(),
            ArchiveSpec {
                sec_per_point: 60,
                count: 10080
            }
        );
        assert_eq!(
            parse_retention_def("1m:1y").unwrap(),
            ArchiveSpec {
                sec_per_point: 60,
                count: 525600
            }
        );
    }

    #[test]
    fn parses_bare_point_count() {
        assert_eq!(
            parse_retention_def("60:1440").unwrap(),
            ArchiveSpec {
                sec_per_point: 60,
                count: 1440
            }
        );
    }

    #[test]
    fn rejects_malformed_retention() {
        assert!(parse_retention_def("60s").is_err());
    }

    #[test]
    fn validates_increasing_precision_and_coverage() {
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
        assert!(validate_archive_list(&archives, 0.5).is_ok());
    }

    #[test]
    fn rejects_non_divisor_precision() {
        let archives = vec![
            ArchiveSpec {
                sec_per_point: 7,
                count: 100,
            },
            ArchiveSpec {
                sec_per_point: 10,
                count: 100,
            },
        ];
        assert!(validate_archive_list(&archives, 1.0).is_err());
    }

    #[test]
    fn rejects_insufficient_points_for_xff() {
        // 1 point per second, xff=1.0, next archive is 10s/point: need >= 10
        // finest-archive points to form one aggregate, but only 5 retained.
        let archives = vec![
            ArchiveSpec {
                sec_per_point: 1,
                count: 5,
            },
            ArchiveSpec {
                sec_per_point: 10,
                count: 100,
            },
        ];
        assert!(validate_archive_list(&archives, 1.0).is_err());
    }

    #[test]
    fn default_schema_matches_everything() {
        let schema = Schema::default_schema();
        assert!(schema.matches("anything.at.all"));
    }

    #[test]
    fn pattern_schema_matches_prefix() {
        let schema = Schema::new(
            "stats",
            Some("^stats\\."),
            1.0,
            Agg::Average,
            vec![ArchiveSpec {
                sec_per_point: 1,
                count: 60,
            }],
            60,
            8,
            1.0,
        )
        .unwrap();
        assert!(schema.matches("stats.cpu"));
        assert!(!schema.matches("other.cpu"));
    }

    #[test]
    fn rejects_bundle_width_over_bitmap_size() {
        let result = Schema::new(
            "wide",
            None,
            1.0,
            Agg::Average,
            vec![ArchiveSpec {
                sec_per_point: 1,
                count: 60,
            }],
            60,
            65,
            1.0,
        );
        assert!(result.is_err());
    }
}
