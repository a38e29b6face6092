// 🔗 Cross-Reference Resolver
// Normalizes externally maintained canonical-id mappings, grades them, and
// builds the (source system, source key) → canonical id index.
//
// Invalid entries are never dropped: they stay visible with LOW_QUALITY so a
// human can fix the mapping.

use crate::quality::DataQualityFlag;
use crate::source::{EntityType, SourceSystem};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

// ============================================================================
// CONFIDENCE
// ============================================================================

/// Normalized trust in a mapping. Declaration order is best → worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Confidence {
    High,
    Medium,
    Low,
    Unknown,
}

impl Confidence {
    pub const ALL: [Confidence; 4] = [
        Confidence::High,
        Confidence::Medium,
        Confidence::Low,
        Confidence::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::High => "HIGH",
            Confidence::Medium => "MEDIUM",
            Confidence::Low => "LOW",
            Confidence::Unknown => "UNKNOWN",
        }
    }

    /// HIGH and MEDIUM are trusted enough to merge on their own
    pub fn is_trusted(&self) -> bool {
        matches!(self, Confidence::High | Confidence::Medium)
    }
}

/// Free-text labels accepted for each confidence level.
/// Anything not listed (blank included) maps to UNKNOWN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceSynonyms {
    pub high: Vec<String>,
    pub medium: Vec<String>,
    pub low: Vec<String>,
}

impl Default for ConfidenceSynonyms {
    fn default() -> Self {
        let list = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        ConfidenceSynonyms {
            high: list(&["HIGH", "STRONG", "EXACT", "CONFIRMED", "VERIFIED", "H"]),
            medium: list(&["MEDIUM", "MED", "MODERATE", "PROBABLE", "LIKELY", "M"]),
            low: list(&["LOW", "WEAK", "POSSIBLE", "TENTATIVE", "L"]),
        }
    }
}

impl ConfidenceSynonyms {
    pub fn normalize(&self, raw: &str) -> Confidence {
        let label = raw.trim();
        let hit = |list: &[String]| list.iter().any(|s| s.trim().eq_ignore_ascii_case(label));

        if label.is_empty() {
            Confidence::Unknown
        } else if hit(&self.high) {
            Confidence::High
        } else if hit(&self.medium) {
            Confidence::Medium
        } else if hit(&self.low) {
            Confidence::Low
        } else {
            Confidence::Unknown
        }
    }
}

// ============================================================================
// ENTRIES
// ============================================================================

/// One row of the externally maintained cross-reference table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossReferenceEntry {
    pub entity_type: EntityType,
    pub canonical_id: String,
    /// Local key per source system; blank keys are ignored
    #[serde(default)]
    pub keys: BTreeMap<SourceSystem, String>,
    #[serde(default)]
    pub resolution_confidence: String,
    pub last_modified: Option<DateTime<Utc>>,
}

impl CrossReferenceEntry {
    pub fn new(entity_type: EntityType, canonical_id: impl Into<String>, confidence: &str) -> Self {
        CrossReferenceEntry {
            entity_type,
            canonical_id: canonical_id.into(),
            keys: BTreeMap::new(),
            resolution_confidence: confidence.to_string(),
            last_modified: None,
        }
    }

    /// Builder: link a source key
    pub fn key(mut self, system: SourceSystem, key: &str) -> Self {
        self.keys.insert(system, key.to_string());
        self
    }

    /// Builder: set last-modified timestamp
    pub fn modified_at(mut self, ts: DateTime<Utc>) -> Self {
        self.last_modified = Some(ts);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdValidation {
    ValidFormat,
    InvalidFormat,
    Missing,
}

impl IdValidation {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdValidation::ValidFormat => "VALID_FORMAT",
            IdValidation::InvalidFormat => "INVALID_FORMAT",
            IdValidation::Missing => "MISSING",
        }
    }
}

/// Resolver output for one canonical id (duplicate entries already merged)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedReference {
    pub entity_type: EntityType,
    pub canonical_id: String,
    pub confidence: Confidence,
    /// Label as it appeared in the newest entry
    pub raw_confidence: String,
    pub source_systems_count: usize,
    pub validation: IdValidation,
    pub recommended_for_resolution: bool,
    pub keys: BTreeMap<SourceSystem, String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub flags: Vec<DataQualityFlag>,
}

impl ResolvedReference {
    /// Zero linked keys: reported, but never produces an entity
    pub fn has_keys(&self) -> bool {
        !self.keys.is_empty()
    }

    pub fn needs_review(&self) -> bool {
        !self.recommended_for_resolution || !self.flags.is_empty()
    }
}

// ============================================================================
// KEY INDEX
// ============================================================================

/// (source system, source key) → canonical id
#[derive(Debug, Clone, Default)]
pub struct KeyIndex {
    keys: BTreeMap<(SourceSystem, String), String>,
    /// Unmapped keys seen in more than one system
    shared_unmapped: BTreeSet<String>,
}

impl KeyIndex {
    pub fn resolve(&self, system: SourceSystem, key: &str) -> Option<&str> {
        self.keys
            .get(&(system, key.trim().to_string()))
            .map(|id| id.as_str())
    }

    /// Record every (system, key) that refers to this entity type, so that an
    /// unmapped key used by two systems gets two placeholders instead of one.
    pub fn register_unmapped<'k>(&mut self, refs: impl IntoIterator<Item = (SourceSystem, &'k str)>) {
        let mut systems: BTreeMap<&str, BTreeSet<SourceSystem>> = BTreeMap::new();
        for (system, key) in refs {
            let key = key.trim();
            if key.is_empty() || self.resolve(system, key).is_some() {
                continue;
            }
            systems.entry(key).or_default().insert(system);
        }
        for (key, seen_in) in systems {
            if seen_in.len() > 1 {
                debug!(key = %key, systems = seen_in.len(), "unmapped key shared by several systems");
                self.shared_unmapped.insert(key.to_string());
            }
        }
    }

    /// Canonical id of a key, or its placeholder when it has no mapping.
    /// The flag is true for placeholders.
    pub fn canonical_or_placeholder(&self, entity_type: EntityType, system: SourceSystem, key: &str) -> (String, bool) {
        if let Some(id) = self.resolve(system, key) {
            return (id.to_string(), false);
        }
        let id = if self.shared_unmapped.contains(key.trim()) {
            entity_type.system_placeholder_id(system, key)
        } else {
            entity_type.placeholder_id(key)
        };
        (id, true)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Everything the resolver learned about one entity type
#[derive(Debug, Clone, Default)]
pub struct XrefResolution {
    /// Sorted by canonical id; entries with a missing id come first
    pub references: Vec<ResolvedReference>,
    pub index: KeyIndex,
    /// Source keys claimed by more than one canonical id
    pub ambiguous_keys: usize,
}

impl XrefResolution {
    pub fn reference(&self, canonical_id: &str) -> Option<&ResolvedReference> {
        self.references
            .binary_search_by(|r| r.canonical_id.as_str().cmp(canonical_id))
            .ok()
            .map(|i| &self.references[i])
    }
}

// ============================================================================
// RESOLVER
// ============================================================================

pub struct CrossReferenceResolver<'a> {
    synonyms: &'a ConfidenceSynonyms,
    id_pattern: &'a Regex,
}

impl<'a> CrossReferenceResolver<'a> {
    pub fn new(synonyms: &'a ConfidenceSynonyms, id_pattern: &'a Regex) -> Self {
        CrossReferenceResolver {
            synonyms,
            id_pattern,
        }
    }

    pub fn validate_id(&self, canonical_id: &str) -> IdValidation {
        let id = canonical_id.trim();
        if id.is_empty() {
            IdValidation::Missing
        } else if self.id_pattern.is_match(id) {
            IdValidation::ValidFormat
        } else {
            IdValidation::InvalidFormat
        }
    }

    /// Resolve all entries of one entity type
    pub fn resolve(&self, entity_type: EntityType, entries: &[CrossReferenceEntry]) -> XrefResolution {
        let mut grouped: BTreeMap<String, Vec<&CrossReferenceEntry>> = BTreeMap::new();
        let mut missing: Vec<&CrossReferenceEntry> = Vec::new();

        for entry in entries.iter().filter(|e| e.entity_type == entity_type) {
            let id = entry.canonical_id.trim();
            if id.is_empty() {
                missing.push(entry);
            } else {
                grouped.entry(id.to_string()).or_default().push(entry);
            }
        }

        let mut references: Vec<ResolvedReference> = Vec::new();

        // Missing ids can't receive records; keep them for review only
        let mut missing_refs: Vec<ResolvedReference> = missing
            .into_iter()
            .map(|entry| self.merge(entity_type, String::new(), vec![entry]))
            .collect();
        missing_refs.sort_by(|a, b| a.keys.cmp(&b.keys));
        references.extend(missing_refs);

        for (canonical_id, group) in grouped {
            references.push(self.merge(entity_type, canonical_id, group));
        }

        let (index, ambiguous_keys) = build_index(entity_type, &references);

        XrefResolution {
            references,
            index,
            ambiguous_keys,
        }
    }

    /// Fold duplicate entries for one canonical id, oldest first so newer keys win
    fn merge(
        &self,
        entity_type: EntityType,
        canonical_id: String,
        mut entries: Vec<&CrossReferenceEntry>,
    ) -> ResolvedReference {
        entries.sort_by(|a, b| {
            a.last_modified
                .cmp(&b.last_modified)
                // same timestamp: lower confidence first, so the higher one lands last
                .then_with(|| {
                    self.normalize(b)
                        .cmp(&self.normalize(a))
                })
        });

        let mut keys = BTreeMap::new();
        for entry in &entries {
            for (system, key) in &entry.keys {
                let key = key.trim();
                if !key.is_empty() {
                    keys.insert(*system, key.to_string());
                }
            }
        }

        let newest = entries.last().copied();
        let raw_confidence = newest
            .map(|e| e.resolution_confidence.trim().to_string())
            .unwrap_or_default();
        let confidence = self.synonyms.normalize(&raw_confidence);
        let last_modified = entries.iter().filter_map(|e| e.last_modified).max();

        let validation = self.validate_id(&canonical_id);
        let source_systems_count = keys.len();
        let recommended_for_resolution = validation == IdValidation::ValidFormat
            && (confidence.is_trusted() || source_systems_count >= 2);

        let mut flags = Vec::new();
        match validation {
            IdValidation::ValidFormat => {}
            IdValidation::InvalidFormat => {
                flags.push(DataQualityFlag::InvalidFormat("canonical_id".to_string()));
                flags.push(DataQualityFlag::LowQuality);
            }
            IdValidation::Missing => flags.push(DataQualityFlag::LowQuality),
        }
        flags.sort();

        ResolvedReference {
            entity_type,
            canonical_id,
            confidence,
            raw_confidence,
            source_systems_count,
            validation,
            recommended_for_resolution,
            keys,
            last_modified,
            flags,
        }
    }

    fn normalize(&self, entry: &CrossReferenceEntry) -> Confidence {
        self.synonyms.normalize(&entry.resolution_confidence)
    }
}

/// Index keys of every reference that can receive records.
///
/// A key claimed by several canonical ids goes to the recommended one, then
/// the most recently modified, then the smallest id.
fn build_index(entity_type: EntityType, references: &[ResolvedReference]) -> (KeyIndex, usize) {
    let mut claims: BTreeMap<(SourceSystem, String), Vec<&ResolvedReference>> = BTreeMap::new();

    for reference in references
        .iter()
        .filter(|r| r.validation != IdValidation::Missing)
    {
        for (system, key) in &reference.keys {
            claims
                .entry((*system, key.clone()))
                .or_default()
                .push(reference);
        }
    }

    let mut index = KeyIndex::default();
    let mut ambiguous = 0;

    for ((system, key), mut candidates) in claims {
        if candidates.len() > 1 {
            ambiguous += 1;
            candidates.sort_by(|a, b| {
                (!a.recommended_for_resolution, Reverse(a.last_modified), &a.canonical_id).cmp(&(
                    !b.recommended_for_resolution,
                    Reverse(b.last_modified),
                    &b.canonical_id,
                ))
            });
            warn!(
                entity_type = %entity_type,
                system = %system,
                key = %key,
                claimed_by = candidates.len(),
                chosen = %candidates[0].canonical_id,
                "source key mapped to several canonical ids"
            );
        }
        if let Some(winner) = candidates.first() {
            debug!(system = %system, key = %key, canonical_id = %winner.canonical_id, "indexed key");
            index.keys.insert((system, key), winner.canonical_id.clone());
        }
    }

    (index, ambiguous)
}

// ============================================================================
// TESTS
// ============================================================================
