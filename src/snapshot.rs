// 📂 Snapshot Loader - reads one staged snapshot directory from CSV
//
// Layout:
//   sources/<entity>__<system>.csv        source_key, last_modified, <typed columns>
//   xref/<entity>.csv                     canonical_id, resolution_confidence,
//                                         last_modified, <system>_key ...
//   associations/<type>__<system>.csv     source_key, entity_key, counterpart,
//                                         allocation_percentage, is_primary,
//                                         last_modified, <typed columns>
//   fx_rates.csv                          from_currency, to_currency, rate, as_of_date
//
// Staging has already cleaned the data; a cell that still fails to parse is
// logged and treated as null rather than failing the load.

use crate::engine::InputSnapshot;
use crate::fx::{FxRate, FxRateTable};
use crate::registry::StrategyRegistry;
use crate::source::{AssociationSourceRecord, AssociationType, EntityType, SourceRecord, SourceSystem, ALLOCATION_FIELD};
use crate::value::{FieldKind, FieldValue};
use crate::xref::CrossReferenceEntry;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const SOURCE_KEY: &str = "source_key";
const LAST_MODIFIED: &str = "last_modified";

/// What a load produced, plus counters for the run log
#[derive(Debug, Default)]
pub struct LoadedSnapshot {
    pub input: InputSnapshot,
    pub fx: FxRateTable,
    pub files_read: usize,
    /// Cells that failed to parse and were treated as null
    pub bad_cells: usize,
}

/// Load a snapshot directory
pub fn load_snapshot(dir: &Path, registry: &StrategyRegistry) -> Result<LoadedSnapshot> {
    if !dir.is_dir() {
        anyhow::bail!("Snapshot directory not found: {}", dir.display());
    }

    let mut loaded = LoadedSnapshot::default();

    for path in csv_files(&dir.join("sources"))? {
        let Some((entity_type, system)) = parse_source_name(&path) else {
            warn!(file = %path.display(), "unrecognized source file name, skipped");
            continue;
        };
        let kinds = |column: &str| {
            registry
                .entity(entity_type)
                .map(|p| p.field_kind(column))
                .unwrap_or_default()
        };
        let records = load_source_file(&path, entity_type, system, &kinds, &mut loaded.bad_cells)?;
        loaded.input.records.extend(records);
        loaded.files_read += 1;
    }

    for path in csv_files(&dir.join("xref"))? {
        let Some(entity_type) = file_stem(&path).and_then(|s| EntityType::parse(&s)) else {
            warn!(file = %path.display(), "unrecognized cross-reference file name, skipped");
            continue;
        };
        let entries = load_xref_file(&path, entity_type, &mut loaded.bad_cells)?;
        loaded.input.cross_references.extend(entries);
        loaded.files_read += 1;
    }

    for path in csv_files(&dir.join("associations"))? {
        let Some((association_type, system)) = parse_association_name(&path) else {
            warn!(file = %path.display(), "unrecognized association file name, skipped");
            continue;
        };
        let kinds = |column: &str| {
            registry
                .association(association_type)
                .map(|p| p.field_kind(column))
                .unwrap_or(if column == ALLOCATION_FIELD {
                    FieldKind::Number
                } else {
                    FieldKind::Text
                })
        };
        let rows = load_association_file(&path, association_type, system, &kinds, &mut loaded.bad_cells)?;
        loaded.input.associations.extend(rows);
        loaded.files_read += 1;
    }

    let fx_path = dir.join("fx_rates.csv");
    if fx_path.is_file() {
        loaded.fx = FxRateTable::from_rates(load_fx_rates(&fx_path)?);
        loaded.files_read += 1;
    }

    info!(
        dir = %dir.display(),
        files = loaded.files_read,
        records = loaded.input.records.len(),
        cross_references = loaded.input.cross_references.len(),
        associations = loaded.input.associations.len(),
        fx_rates = loaded.fx.len(),
        bad_cells = loaded.bad_cells,
        "snapshot loaded"
    );
    Ok(loaded)
}

// ============================================================================
// FILE READERS
// ============================================================================

pub fn load_source_file(
    path: &Path,
    entity_type: EntityType,
    system: SourceSystem,
    kinds: &dyn Fn(&str) -> FieldKind,
    bad_cells: &mut usize,
) -> Result<Vec<SourceRecord>> {
    let mut rdr = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open source file {}", path.display()))?;
    let headers = rdr.headers().context("Failed to read CSV headers")?.clone();

    let mut records = Vec::new();
    for (line, result) in rdr.records().enumerate() {
        let row = result.with_context(|| format!("Failed to read row {} of {}", line + 2, path.display()))?;
        let mut record = SourceRecord::new(entity_type, system, "");

        for (column, raw) in headers.iter().zip(row.iter()) {
            match column {
                SOURCE_KEY => record.source_key = raw.trim().to_string(),
                LAST_MODIFIED => record.last_modified = timestamp_cell(raw, path, column, bad_cells),
                _ => {
                    if let Some(value) = typed_cell(raw, kinds(column), path, column, bad_cells) {
                        record.fields.insert(column.to_string(), value);
                    }
                }
            }
        }
        records.push(record);
    }
    Ok(records)
}

pub fn load_xref_file(path: &Path, entity_type: EntityType, bad_cells: &mut usize) -> Result<Vec<CrossReferenceEntry>> {
    let mut rdr = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open cross-reference file {}", path.display()))?;
    let headers = rdr.headers().context("Failed to read CSV headers")?.clone();

    let mut entries = Vec::new();
    for result in rdr.records() {
        let row = result.with_context(|| format!("Failed to read {}", path.display()))?;
        let mut entry = CrossReferenceEntry::new(entity_type, "", "");

        for (column, raw) in headers.iter().zip(row.iter()) {
            match column {
                "canonical_id" => entry.canonical_id = raw.trim().to_string(),
                "resolution_confidence" => entry.resolution_confidence = raw.trim().to_string(),
                LAST_MODIFIED => entry.last_modified = timestamp_cell(raw, path, column, bad_cells),
                other => {
                    let system = other.strip_suffix("_key").and_then(SourceSystem::parse);
                    match system {
                        Some(system) if !raw.trim().is_empty() => {
                            entry.keys.insert(system, raw.trim().to_string());
                        }
                        Some(_) => {}
                        None => warn!(file = %path.display(), column = other, "unknown cross-reference column ignored"),
                    }
                }
            }
        }
        entries.push(entry);
    }
    Ok(entries)
}

pub fn load_association_file(
    path: &Path,
    association_type: AssociationType,
    system: SourceSystem,
    kinds: &dyn Fn(&str) -> FieldKind,
    bad_cells: &mut usize,
) -> Result<Vec<AssociationSourceRecord>> {
    let mut rdr = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open association file {}", path.display()))?;
    let headers = rdr.headers().context("Failed to read CSV headers")?.clone();

    let mut rows = Vec::new();
    for result in rdr.records() {
        let row = result.with_context(|| format!("Failed to read {}", path.display()))?;
        let mut record = AssociationSourceRecord::new(association_type, system, "", "", "");

        for (column, raw) in headers.iter().zip(row.iter()) {
            match column {
                SOURCE_KEY => record.source_key = raw.trim().to_string(),
                "entity_key" => record.entity_key = raw.trim().to_string(),
                "counterpart" => record.counterpart = raw.trim().to_string(),
                "is_primary" => {
                    record.is_primary = typed_cell(raw, FieldKind::Bool, path, column, bad_cells)
                        .and_then(|v| v.as_bool())
                }
                LAST_MODIFIED => record.last_modified = timestamp_cell(raw, path, column, bad_cells),
                _ => {
                    if let Some(value) = typed_cell(raw, kinds(column), path, column, bad_cells) {
                        record.fields.insert(column.to_string(), value);
                    }
                }
            }
        }
        rows.push(record);
    }
    Ok(rows)
}

pub fn load_fx_rates(path: &Path) -> Result<Vec<FxRate>> {
    let mut rdr = csv::Reader::from_path(path).context("Failed to open FX rate file")?;
    let mut rates = Vec::new();
    for result in rdr.deserialize() {
        let rate: FxRate = result.context("Failed to deserialize FX rate")?;
        rates.push(rate);
    }
    Ok(rates)
}

// ============================================================================
// CELLS
// ============================================================================

fn typed_cell(raw: &str, kind: FieldKind, path: &Path, column: &str, bad_cells: &mut usize) -> Option<FieldValue> {
    match FieldValue::parse(raw, kind) {
        Ok(value) => value,
        Err(reason) => {
            warn!(file = %path.display(), column = column, reason = %reason, "unparseable cell treated as null");
            *bad_cells += 1;
            None
        }
    }
}

fn timestamp_cell(raw: &str, path: &Path, column: &str, bad_cells: &mut usize) -> Option<DateTime<Utc>> {
    match parse_timestamp(raw) {
        Ok(ts) => ts,
        Err(reason) => {
            warn!(file = %path.display(), column = column, reason = %reason, "unparseable timestamp treated as null");
            *bad_cells += 1;
            None
        }
    }
}

/// RFC 3339, "YYYY-MM-DD HH:MM:SS" (UTC) or a bare date (midnight UTC)
pub fn parse_timestamp(raw: &str) -> Result<Option<DateTime<Utc>>, String> {
    let s = raw.trim();
    if s.is_empty() {
        return Ok(None);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(Some(ts.with_timezone(&Utc)));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(Some(naive.and_utc()));
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(Some(naive.and_utc()));
        }
    }
    Err(format!("not a timestamp: {}", s))
}

// ============================================================================
// FILE NAMES
// ============================================================================

/// All *.csv files of a directory, sorted; a missing directory is empty
fn csv_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to list {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().map_or(false, |ext| ext.eq_ignore_ascii_case("csv")))
        .collect();
    files.sort();
    Ok(files)
}

fn file_stem(path: &Path) -> Option<String> {
    path.file_stem().and_then(|s| s.to_str()).map(|s| s.to_string())
}

fn split_stem(path: &Path) -> Option<(String, String)> {
    let stem = file_stem(path)?;
    let (left, right) = stem.split_once("__")?;
    Some((left.to_string(), right.to_string()))
}

fn parse_source_name(path: &Path) -> Option<(EntityType, SourceSystem)> {
    let (entity, system) = split_stem(path)?;
    Some((EntityType::parse(&entity)?, SourceSystem::parse(&system)?))
}

fn parse_association_name(path: &Path) -> Option<(AssociationType, SourceSystem)> {
    let (kind, system) = split_stem(path)?;
    Some((AssociationType::parse(&kind)?, SourceSystem::parse(&system)?))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::fs;

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 10, 30, 0).unwrap();
        assert_eq!(parse_timestamp("2024-03-01T10:30:00Z").unwrap(), Some(expected));
        assert_eq!(parse_timestamp("2024-03-01 10:30:00").unwrap(), Some(expected));
        assert_eq!(
            parse_timestamp("2024-03-01").unwrap(),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(parse_timestamp("").unwrap(), None);
        assert!(parse_timestamp("03/01/2024").is_err());
    }

    #[test]
    fn test_load_snapshot_directory() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "sources/company__crm.csv",
            "source_key,last_modified,name,founded_date,country\n\
             C-1,2024-01-01,Acme Inc,2010-05-01,US\n\
             C-2,2024-01-02,Bad Date Co,not-a-date,GB\n",
        );
        write(
            dir.path(),
            "sources/company__pm.csv",
            "source_key,last_modified,name,revenue,reporting_date\nP-1,2024-02-01,Acme Incorporated,5000000,2023-12-31\n",
        );
        write(
            dir.path(),
            "xref/company.csv",
            "canonical_id,resolution_confidence,last_modified,crm_key,pm_key\nCOMP-CANON-0001,HIGH,2024-01-01,C-1,P-1\n",
        );
        write(
            dir.path(),
            "associations/company_industry__crm.csv",
            "source_key,entity_key,counterpart,allocation_percentage,is_primary,last_modified\nA-1,C-1,Software,100,yes,2024-01-01\n",
        );
        write(
            dir.path(),
            "fx_rates.csv",
            "from_currency,to_currency,rate,as_of_date\nEUR,USD,1.1,2024-01-01\n",
        );
        write(dir.path(), "sources/readme.csv", "x\n1\n");

        let registry = StrategyRegistry::with_defaults();
        let loaded = load_snapshot(dir.path(), &registry).unwrap();

        assert_eq!(loaded.files_read, 5);
        assert_eq!(loaded.input.records.len(), 3);
        assert_eq!(loaded.bad_cells, 1);

        let pm = loaded
            .input
            .records
            .iter()
            .find(|r| r.source_system == SourceSystem::PortfolioManagement)
            .unwrap();
        assert_eq!(pm.fields.get("revenue"), Some(&FieldValue::Number(5_000_000.0)));
        assert!(pm.fields.get("reporting_date").and_then(|v| v.as_date()).is_some());

        let xref = &loaded.input.cross_references[0];
        assert_eq!(xref.keys.len(), 2);
        assert_eq!(xref.keys.get(&SourceSystem::Crm).map(String::as_str), Some("C-1"));

        let assoc = &loaded.input.associations[0];
        assert_eq!(assoc.is_primary, Some(true));
        assert_eq!(assoc.fields.get(ALLOCATION_FIELD), Some(&FieldValue::Number(100.0)));

        assert_eq!(loaded.fx.len(), 1);
    }

    #[test]
    fn test_missing_directory_is_error() {
        let registry = StrategyRegistry::with_defaults();
        assert!(load_snapshot(Path::new("/definitely/not/here"), &registry).is_err());
    }
}
