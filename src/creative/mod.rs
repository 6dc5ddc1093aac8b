//! Ad creative generation: per-stage generators, the attempt ledger they
//! record into, and the pipeline that chains them.

pub mod artifacts;
pub mod compose;
pub mod error;
pub mod image;
pub mod keyed_lock;
pub mod ledger;
pub mod mux;
pub mod pipeline;
pub mod providers;
pub mod quota;
pub mod rate_limit;
pub mod record;
pub mod segment;
pub mod stage;
pub mod voice;

pub use artifacts::{ArtifactRef, ArtifactStore};
pub use compose::{ComposeRequest, Composer, Composition};
pub use error::{ErrorKind, StageError};
pub use image::{ImageGenerator, ImageRequest};
pub use ledger::{AssetPage, AssetQuery, AttemptLedger, FinalizeOutcome, LedgerError};
pub use mux::{FfmpegMuxer, MuxExit, Muxer};
pub use pipeline::{
    CompositeAd, CompositeRequest, FailureReport, FinalizeReport, Pipeline, PipelineFailure,
    PipelineStage,
};
pub use quota::QuotaConfig;
pub use record::{AssetRecord, AttemptRecord, CreativeKey, CreativeKind, Stage, StageCounts};
pub use segment::Segment;
pub use stage::{GeneratedArtifact, StageDeps};
pub use voice::{VoiceGenerator, VoiceRequest};
