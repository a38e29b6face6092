// 🗄️ Snapshot Store - SQLite persistence, change detection and audit events
//
// Each run replaces the stored snapshot. Before the replace, every entity's
// new content_hash is compared with the stored one; the differences become
// a ChangeSummary and entity_* events. Full records are kept as JSON next to
// the columns the review tools filter on.

use crate::engine::{CanonicalEntity, ConsolidationOutput, RunSummary};
use crate::relationships::AssociationRecord;
use crate::source::EntityType;
use crate::xref::ResolvedReference;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

const ACTOR: &str = "consolidation-engine";

/// Event for the audit trail
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

/// Entity-level differences between the stored snapshot and a new one
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub new: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub removed: usize,
}

impl ChangeSummary {
    pub fn has_changes(&self) -> bool {
        self.new + self.changed + self.removed > 0
    }
}

/// One row of consolidation_runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub as_of: NaiveDate,
    /// Wall-clock time the snapshot was written
    pub processed_at: DateTime<Utc>,
    pub summary: RunSummary,
    pub changes: ChangeSummary,
}

/// Items waiting for a human decision
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReviewQueue {
    /// Cross-references that are not recommended or carry flags
    pub references: Vec<ResolvedReference>,
    /// Canonical entities carrying at least one flag
    pub entities: Vec<CanonicalEntity>,
}

impl ReviewQueue {
    pub fn len(&self) -> usize {
        self.references.len() + self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

/// Open (or create) a store file and make sure the schema exists
pub fn open_database(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open database {}", path.display()))?;
    setup_database(&conn)?;
    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS canonical_entities (
            entity_type TEXT NOT NULL,
            id TEXT NOT NULL,
            name TEXT,
            content_hash TEXT NOT NULL,
            data_quality_flag TEXT,
            quality_rating TEXT NOT NULL,
            completeness_score REAL NOT NULL,
            source_coverage TEXT NOT NULL,
            resolution_confidence TEXT NOT NULL,
            record TEXT NOT NULL,
            run_id TEXT NOT NULL,
            PRIMARY KEY (entity_type, id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS association_records (
            association_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            counterpart_id TEXT NOT NULL,
            allocation_percentage REAL NOT NULL,
            is_primary INTEGER NOT NULL,
            risk_category TEXT NOT NULL,
            significance_category TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            data_quality_flag TEXT,
            record TEXT NOT NULL,
            run_id TEXT NOT NULL,
            PRIMARY KEY (association_type, entity_id, counterpart_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS cross_references (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            canonical_id TEXT NOT NULL,
            confidence TEXT NOT NULL,
            validation TEXT NOT NULL,
            recommended INTEGER NOT NULL,
            needs_review INTEGER NOT NULL,
            record TEXT NOT NULL,
            run_id TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS consolidation_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT UNIQUE NOT NULL,
            as_of TEXT NOT NULL,
            processed_at TEXT NOT NULL,
            summary TEXT NOT NULL,
            changes TEXT NOT NULL
        )",
        [],
    )?;

    // Events Table (audit trail)
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assoc_entity ON association_records(entity_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assoc_counterpart ON association_records(counterpart_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// WRITE
// ============================================================================

/// Replace the stored snapshot with `output`, inside one transaction
pub fn write_snapshot(
    conn: &mut Connection,
    output: &ConsolidationOutput,
    run_id: &str,
    as_of: NaiveDate,
) -> Result<ChangeSummary> {
    let tx = conn.transaction().context("Failed to begin snapshot transaction")?;

    let mut previous = stored_hashes(&tx)?;
    let mut changes = ChangeSummary::default();

    for entity in &output.entities {
        let key = (entity.entity_type.as_str().to_string(), entity.id.clone());
        match previous.remove(&key) {
            None => {
                changes.new += 1;
                insert_event(
                    &tx,
                    &Event::new(
                        "entity_created",
                        &key.0,
                        &entity.id,
                        serde_json::json!({ "run_id": run_id, "content_hash": entity.content_hash }),
                        ACTOR,
                    ),
                )?;
            }
            Some(old_hash) if old_hash != entity.content_hash => {
                changes.changed += 1;
                insert_event(
                    &tx,
                    &Event::new(
                        "entity_changed",
                        &key.0,
                        &entity.id,
                        serde_json::json!({
                            "run_id": run_id,
                            "previous_hash": old_hash,
                            "content_hash": entity.content_hash,
                        }),
                        ACTOR,
                    ),
                )?;
            }
            Some(_) => changes.unchanged += 1,
        }
    }

    for ((entity_type, id), old_hash) in &previous {
        changes.removed += 1;
        insert_event(
            &tx,
            &Event::new(
                "entity_removed",
                entity_type,
                id,
                serde_json::json!({ "run_id": run_id, "previous_hash": old_hash }),
                ACTOR,
            ),
        )?;
    }

    tx.execute("DELETE FROM canonical_entities", [])?;
    tx.execute("DELETE FROM association_records", [])?;
    tx.execute("DELETE FROM cross_references", [])?;

    for entity in &output.entities {
        insert_entity(&tx, entity, run_id)?;
    }
    for record in &output.associations {
        insert_association(&tx, record, run_id)?;
    }
    for reference in &output.references {
        insert_reference(&tx, reference, run_id)?;
    }

    tx.execute(
        "INSERT INTO consolidation_runs (run_id, as_of, processed_at, summary, changes)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            run_id,
            as_of.format("%Y-%m-%d").to_string(),
            Utc::now().to_rfc3339(),
            serde_json::to_string(&output.summary)?,
            serde_json::to_string(&changes)?,
        ],
    )
    .context("Failed to record consolidation run")?;

    tx.commit().context("Failed to commit snapshot")?;

    info!(
        run_id = run_id,
        new = changes.new,
        changed = changes.changed,
        unchanged = changes.unchanged,
        removed = changes.removed,
        "snapshot written"
    );
    Ok(changes)
}

fn stored_hashes(conn: &Connection) -> Result<BTreeMap<(String, String), String>> {
    let mut stmt = conn.prepare("SELECT entity_type, id, content_hash FROM canonical_entities")?;
    let rows: BTreeMap<(String, String), String> = stmt
        .query_map([], |row| Ok(((row.get(0)?, row.get(1)?), row.get(2)?)))?
        .collect::<Result<_, _>>()?;
    Ok(rows)
}

fn insert_entity(conn: &Connection, entity: &CanonicalEntity, run_id: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO canonical_entities (
            entity_type, id, name, content_hash, data_quality_flag, quality_rating,
            completeness_score, source_coverage, resolution_confidence, record, run_id
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            entity.entity_type.as_str(),
            entity.id,
            entity.name(),
            entity.content_hash,
            entity.data_quality_flag,
            entity.quality_rating.as_str(),
            entity.completeness_score,
            entity.source_coverage.as_str(),
            entity.resolution_confidence.as_str(),
            serde_json::to_string(entity)?,
            run_id,
        ],
    )
    .with_context(|| format!("Failed to store entity {}", entity.id))?;
    Ok(())
}

fn insert_association(conn: &Connection, record: &AssociationRecord, run_id: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO association_records (
            association_type, entity_id, counterpart_id, allocation_percentage, is_primary,
            risk_category, significance_category, content_hash, data_quality_flag, record, run_id
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            record.association_type.as_str(),
            record.entity_id,
            record.counterpart_id,
            record.allocation_percentage,
            record.is_primary,
            record.risk_category,
            record.significance_category,
            record.content_hash,
            record.data_quality_flag,
            serde_json::to_string(record)?,
            run_id,
        ],
    )
    .with_context(|| format!("Failed to store association {}", record.edge_key()))?;
    Ok(())
}

fn insert_reference(conn: &Connection, reference: &ResolvedReference, run_id: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO cross_references (
            entity_type, canonical_id, confidence, validation, recommended, needs_review, record, run_id
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            reference.entity_type.as_str(),
            reference.canonical_id,
            reference.confidence.as_str(),
            reference.validation.as_str(),
            reference.recommended_for_resolution,
            reference.needs_review(),
            serde_json::to_string(reference)?,
            run_id,
        ],
    )?;
    Ok(())
}

pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

// ============================================================================
// QUERIES
// ============================================================================

fn decode_all<T: serde::de::DeserializeOwned>(json_rows: Vec<String>) -> Result<Vec<T>> {
    json_rows
        .iter()
        .map(|json| serde_json::from_str(json).context("Failed to decode stored record"))
        .collect()
}

/// Canonical entities, optionally of one type, ordered by type then id
pub fn get_entities(conn: &Connection, entity_type: Option<EntityType>) -> Result<Vec<CanonicalEntity>> {
    let mut stmt = conn.prepare(
        "SELECT record FROM canonical_entities
         WHERE ?1 IS NULL OR entity_type = ?1
         ORDER BY entity_type, id",
    )?;
    let rows = stmt
        .query_map(params![entity_type.map(|t| t.as_str())], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    decode_all(rows)
}

pub fn get_entity(conn: &Connection, id: &str) -> Result<Option<CanonicalEntity>> {
    let json: Option<String> = conn
        .query_row(
            "SELECT record FROM canonical_entities WHERE id = ?1 ORDER BY entity_type LIMIT 1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;

    match json {
        Some(json) => Ok(Some(serde_json::from_str(&json).context("Failed to decode stored entity")?)),
        None => Ok(None),
    }
}

/// Association records touching an entity on either side
pub fn get_associations_for(conn: &Connection, entity_id: &str) -> Result<Vec<AssociationRecord>> {
    let mut stmt = conn.prepare(
        "SELECT record FROM association_records
         WHERE entity_id = ?1 OR counterpart_id = ?1
         ORDER BY association_type, entity_id, counterpart_id",
    )?;
    let rows = stmt
        .query_map(params![entity_id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    decode_all(rows)
}

pub fn get_all_associations(conn: &Connection) -> Result<Vec<AssociationRecord>> {
    let mut stmt = conn.prepare(
        "SELECT record FROM association_records ORDER BY association_type, entity_id, counterpart_id",
    )?;
    let rows = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    decode_all(rows)
}

pub fn get_review_queue(conn: &Connection) -> Result<ReviewQueue> {
    let mut stmt = conn.prepare(
        "SELECT record FROM cross_references
         WHERE needs_review = 1
         ORDER BY entity_type, canonical_id",
    )?;
    let reference_rows = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT record FROM canonical_entities
         WHERE data_quality_flag IS NOT NULL
         ORDER BY entity_type, id",
    )?;
    let entity_rows = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;

    Ok(ReviewQueue {
        references: decode_all(reference_rows)?,
        entities: decode_all(entity_rows)?,
    })
}

pub fn get_latest_run(conn: &Connection) -> Result<Option<RunManifest>> {
    let row: Option<(String, String, String, String, String)> = conn
        .query_row(
            "SELECT run_id, as_of, processed_at, summary, changes
             FROM consolidation_runs ORDER BY id DESC LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )
        .optional()?;

    let Some((run_id, as_of, processed_at, summary, changes)) = row else {
        return Ok(None);
    };

    Ok(Some(RunManifest {
        run_id,
        as_of: NaiveDate::parse_from_str(&as_of, "%Y-%m-%d").context("Invalid stored as_of date")?,
        processed_at: DateTime::parse_from_rfc3339(&processed_at)
            .context("Invalid stored processed_at timestamp")?
            .with_timezone(&Utc),
        summary: serde_json::from_str(&summary).context("Failed to decode run summary")?,
        changes: serde_json::from_str(&changes).context("Failed to decode change summary")?,
    }))
}

/// Get events for a specific entity, newest first
pub fn get_events_for_entity(conn: &Connection, entity_type: &str, entity_id: &str) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY id DESC",
    )?;

    let rows = stmt
        .query_map(params![entity_type, entity_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(event_id, timestamp, event_type, entity_type, entity_id, data, actor)| {
            Ok(Event {
                event_id,
                timestamp: DateTime::parse_from_rfc3339(&timestamp)
                    .context("Invalid event timestamp")?
                    .with_timezone(&Utc),
                event_type,
                entity_type,
                entity_id,
                data: serde_json::from_str(&data).context("Invalid event data")?,
                actor,
            })
        })
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ConsolidationEngine, InputSnapshot, RunContext};
    use crate::fx::FxRateTable;
    use crate::source::{SourceRecord, SourceSystem};
    use crate::xref::CrossReferenceEntry;

    fn as_of() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 30).unwrap()
    }

    fn input(company_name: &str) -> InputSnapshot {
        InputSnapshot {
            records: vec![
                SourceRecord::new(EntityType::Company, SourceSystem::Crm, "C-1")
                    .with("name", company_name)
                    .with("country", "US"),
                SourceRecord::new(EntityType::Company, SourceSystem::Crm, "C-2").with("name", "Beta Ltd"),
            ],
            cross_references: vec![CrossReferenceEntry::new(EntityType::Company, "COMP-CANON-0001", "HIGH")
                .key(SourceSystem::Crm, "C-1")],
            associations: vec![],
        }
    }

    fn run(input: &InputSnapshot) -> ConsolidationOutput {
        let engine = ConsolidationEngine::with_defaults(FxRateTable::new()).unwrap();
        engine.run(input, &RunContext::new(as_of()))
    }

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    #[test]
    fn test_setup_is_idempotent() {
        let conn = setup();
        setup_database(&conn).unwrap();
        assert!(get_latest_run(&conn).unwrap().is_none());
    }

    #[test]
    fn test_first_write_reports_everything_new() {
        let mut conn = setup();
        let output = run(&input("Acme Inc"));

        let changes = write_snapshot(&mut conn, &output, "run-1", as_of()).unwrap();
        assert_eq!(changes.new, output.entities.len());
        assert_eq!(changes.changed + changes.unchanged + changes.removed, 0);

        let stored = get_entities(&conn, Some(EntityType::Company)).unwrap();
        assert_eq!(stored.len(), output.entities.len());
        assert_eq!(get_entity(&conn, "COMP-CANON-0001").unwrap().unwrap().name(), Some("Acme Inc"));

        let events = get_events_for_entity(&conn, "company", "COMP-CANON-0001").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "entity_created");
    }

    #[test]
    fn test_rewrite_identical_output_is_unchanged() {
        let mut conn = setup();
        let output = run(&input("Acme Inc"));
        write_snapshot(&mut conn, &output, "run-1", as_of()).unwrap();

        let changes = write_snapshot(&mut conn, &run(&input("Acme Inc")), "run-2", as_of()).unwrap();
        assert_eq!(changes.unchanged, output.entities.len());
        assert!(!changes.has_changes());
    }

    #[test]
    fn test_change_and_removal_detection() {
        let mut conn = setup();
        write_snapshot(&mut conn, &run(&input("Acme Inc")), "run-1", as_of()).unwrap();

        let mut next = input("Acme Corporation");
        next.records.retain(|r| r.source_key != "C-2");
        let changes = write_snapshot(&mut conn, &run(&next), "run-2", as_of()).unwrap();

        assert_eq!(changes.changed, 1);
        assert_eq!(changes.removed, 1);
        assert_eq!(changes.new, 0);

        let events = get_events_for_entity(&conn, "company", "COMP-CANON-0001").unwrap();
        assert_eq!(events[0].event_type, "entity_changed");

        let latest = get_latest_run(&conn).unwrap().unwrap();
        assert_eq!(latest.run_id, "run-2");
        assert_eq!(latest.changes, changes);
        assert_eq!(latest.as_of, as_of());
    }

    #[test]
    fn test_review_queue_lists_flagged_entities() {
        let mut conn = setup();
        let output = run(&input("Acme Inc"));
        write_snapshot(&mut conn, &output, "run-1", as_of()).unwrap();

        let queue = get_review_queue(&conn).unwrap();
        let flagged = output.entities.iter().filter(|e| e.data_quality_flag.is_some()).count();
        assert_eq!(queue.entities.len(), flagged);
        // C-2 has no cross-reference, so it is an orphan and flagged
        assert!(queue.entities.iter().any(|e| e.is_orphan()));
    }
}
