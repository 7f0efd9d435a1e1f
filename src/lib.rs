//! Resumable, checksum-verified mirroring of bulk chemical-structure archives
//! (ZINC tranches, PubChem SDF bundles, ChEMBL dumps).

pub mod checksum;
pub mod config;
pub mod credentials;
pub mod dedup;
pub mod engine;
pub mod env;
pub mod error;
pub mod manifest;
pub mod networking;
pub mod storage;
pub mod util;

pub use config::{JobConfig, SourceConfig, load_config};
pub use engine::IngestionOrchestrator;
pub use engine::summary::{JobSummary, SourceSummary};
pub use error::{Error, Result};
