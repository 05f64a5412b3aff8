//! Loads `storage-schemas.conf` into an ordered list of
//! [`Schema`](crate::kenshin::schema::Schema)s and matches metric names
//! against it.
//!
//! Grounded on `rurouni/storage.py`'s `loadStorageSchemas`: each `[section]`
//! is one schema, sections are tried in file order, and the list must end
//! with a catch-all (`pattern = .*`, or no pattern at all) so every metric
//! resolves to some schema.

use crate::kenshin::agg::Agg;
use crate::kenshin::schema::{parse_retention_def, ArchiveSpec, Schema};
use crate::rurouni::config::parse_ini;
use crate::rurouni::error::{Result, RurouniError};
use std::path::Path;

/// An ordered, file-order list of schemas, with the default (or last
/// catch-all) schema appended if the file doesn't already end in one.
pub struct SchemaRegistry {
    schemas: Vec<Schema>,
}

impl SchemaRegistry {
    /// Build a registry from a list already-parsed into schemas, appending
    /// the built-in default if none of them is unconditional.
    pub fn new(mut schemas: Vec<Schema>) -> SchemaRegistry {
        if !schemas.iter().any(|s| s.matches_everything()) {
            schemas.push(Schema::default_schema());
        }
        SchemaRegistry { schemas }
    }

    /// Parse `storage-schemas.conf` at `path`, the way `loadStorageSchemas`
    /// does: one schema per `[section]`, tried in file order.
    pub fn load(path: &Path) -> Result<SchemaRegistry> {
        let doc = parse_ini(path)?;
        let mut schemas = Vec::with_capacity(doc.sections.len());
        for section in &doc.sections {
            let pattern = section.get("pattern");
            let retentions = section.get("retentions").ok_or_else(|| {
                RurouniError::InvalidConfig(format!(
                    "schema '{}' is missing a retentions= line",
                    section.name
                ))
            })?;
            let archives: std::result::Result<Vec<ArchiveSpec>, _> = retentions
                .split(',')
                .map(|def| parse_retention_def(def.trim()))
                .collect();
            let archives = archives.map_err(RurouniError::Kenshin)?;

            let xff: f32 = section
                .get("xfilesfactor")
                .map(|v| v.parse())
                .transpose()
                .map_err(|_| {
                    RurouniError::InvalidConfig(format!(
                        "schema '{}' has a non-numeric xfilesfactor",
                        section.name
                    ))
                })?
                .unwrap_or(0.5);
            let agg = match section.get("aggregationmethod") {
                Some(name) => Agg::from_name(name).map_err(RurouniError::Kenshin)?,
                None => Agg::Average,
            };
            let cache_retention: u32 = section
                .get("cacheretention")
                .map(|v| v.parse())
                .transpose()
                .map_err(|_| {
                    RurouniError::InvalidConfig(format!(
                        "schema '{}' has a non-numeric cacheretention",
                        section.name
                    ))
                })?
                .unwrap_or(600);
            let metrics_max_num: usize = section
                .get("metricsmaxnum")
                .map(|v| v.parse())
                .transpose()
                .map_err(|_| {
                    RurouniError::InvalidConfig(format!(
                        "schema '{}' has a non-numeric metricsmaxnum",
                        section.name
                    ))
                })?
                .unwrap_or(8);
            let cache_ratio: f64 = section
                .get("cacheratio")
                .map(|v| v.parse())
                .transpose()
                .map_err(|_| {
                    RurouniError::InvalidConfig(format!(
                        "schema '{}' has a non-numeric cacheratio",
                        section.name
                    ))
                })?
                .unwrap_or(1.0);

            let schema = Schema::new(
                section.name.clone(),
                pattern,
                xff,
                agg,
                archives,
                cache_retention,
                metrics_max_num,
                cache_ratio,
            )
            .map_err(RurouniError::Kenshin)?;
            schemas.push(schema);
        }
        Ok(SchemaRegistry::new(schemas))
    }

    /// The first schema whose pattern matches `metric`, falling back to the
    /// trailing default/catch-all.
    pub fn schema_for_metric(&self, metric: &str) -> &Schema {
        self.schemas
            .iter()
            .find(|s| s.matches(metric))
            .unwrap_or_else(|| self.schemas.last().expect("registry is never empty"))
    }

    pub fn schema_by_name(&self, name: &str) -> Option<&Schema> {
        self.schemas.iter().find(|s| s.name == name)
    }

    pub fn schemas(&self) -> &[Schema] {
        &self.schemas
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;

    #[test]
    fn first_matching_pattern_wins_in_file_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage-schemas.conf");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "[stats]").unwrap();
        writeln!(f, "pattern = ^stats\\.").unwrap();
        writeln!(f, "retentions = 1s:1d").unwrap();
        writeln!(f).unwrap();
        writeln!(f, "[catchall]").unwrap();
        writeln!(f, "pattern = .*").unwrap();
        writeln!(f, "retentions = 60s:30d").unwrap();
        drop(f);

        let registry = SchemaRegistry::load(&path).unwrap();
        assert_eq!(registry.schema_for_metric("stats.cpu").name, "stats");
        assert_eq!(registry.schema_for_metric("other.cpu").name, "catchall");
    }

    #[test]
    fn appends_default_schema_when_file_has_no_catchall() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage-schemas.conf");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "[stats]").unwrap();
        writeln!(f, "pattern = ^stats\\.").unwrap();
        writeln!(f, "retentions = 1s:1d").unwrap();
        drop(f);

        let registry = SchemaRegistry::load(&path).unwrap();
        assert_eq!(registry.schema_for_metric("other.cpu").name, "default");
    }
}
