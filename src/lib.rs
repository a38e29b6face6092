// Entity Consolidation - Core Library
// Exposes all modules for use in the CLI, the API server, and tests

pub mod value;          // Typed field values
pub mod source;         // Source records and systems
pub mod error;          // Configuration errors
pub mod rules;          // Threshold tables and scorecards
pub mod fx;             // FX rate table
pub mod xref;           // Cross-reference resolver
pub mod consolidation;  // Field consolidation strategies
pub mod quality;        // Data quality flags, rating, content hash
pub mod registry;       // Strategy registry
pub mod entities;       // Built-in profiles
pub mod relationships;  // Association consolidation
pub mod engine;         // Run orchestration
pub mod snapshot;       // CSV snapshot loader
pub mod db;             // SQLite snapshot store

// Re-export commonly used types
pub use value::{FieldKind, FieldValue};
pub use source::{
    AssociationSourceRecord, AssociationType, Contribution, EntityType, SourceRecord, SourceSystem,
};
pub use error::ConfigError;
pub use rules::{CategoryTable, Condition, RuleTable, Scorecard};
pub use fx::{FxRate, FxRateTable};
pub use xref::{
    Confidence, ConfidenceSynonyms, CrossReferenceEntry, CrossReferenceResolver, IdValidation,
    KeyIndex, ResolvedReference,
};
pub use consolidation::{Derivation, FieldRule, Reducer, Strategy};
pub use quality::{content_hash, DataQualityFlag, QualityGrid, QualityRating};
pub use registry::{AssociationProfile, CounterpartKind, EntityProfile, StrategyRegistry};
pub use relationships::AssociationRecord;
pub use engine::{
    CanonicalEntity, ConsolidationEngine, ConsolidationOutput, InputSnapshot, RunContext,
    RunSummary, SourceCoverage,
};
pub use snapshot::{load_snapshot, LoadedSnapshot};
pub use db::{
    get_associations_for, get_entities, get_entity, get_latest_run, get_review_queue,
    open_database, setup_database, write_snapshot, ChangeSummary, Event, ReviewQueue, RunManifest,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
