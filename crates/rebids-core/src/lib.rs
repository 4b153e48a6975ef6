//! ReBIDS Core
//!
//! Core engine for reorganizing source neuroimaging data into a
//! BIDS-compliant dataset. This crate provides the bidsmap rule model,
//! run matching, dynamic field resolution and the session/participant
//! bookkeeping the workflows are built on.

pub mod attributes;
pub mod bidsmap;
pub mod engine;
pub mod error;
pub mod formats;
pub mod naming;
pub mod participants;
pub mod pattern;
pub mod recording;
pub mod result;
pub mod run;
pub mod session;
pub mod template;

// Re-export commonly used types
pub use attributes::{AttrValue, AttributeStore, KEY_SEPARATOR};
pub use bidsmap::{Bidsmap, Options, Plugins, RunCounts, SanityReport, MAP_VERSION};
pub use engine::{match_run, AmbiguityPolicy, MatchPolicy, RunMatch};
pub use error::{BidsError, ErrorKind};
pub use formats::{detect_format, open_recording, AttrDumpRecording};
pub use naming::{bids_name, example_name, resolve_json, resolve_labels, BidsName};
pub use participants::{normalize_tsv, FieldDefinition, ParticipantFields};
pub use pattern::{MatchSpec, SpecValue};
pub use recording::Recording;
pub use result::{Result, ResultExt};
pub use run::{JsonTemplate, Run, RunDump, RunEdit, IGNORE_MODALITY, UNKNOWN_MODALITY};
pub use session::{BidsSession, ParticipantRegistry, ResolveContext};
pub use template::{cleanup_value, DeferredLookup, Query, Template};

/// Initialize the tracing subscriber for logging
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rebids=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_file(true)
                .with_line_number(true),
        )
        .init();
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
