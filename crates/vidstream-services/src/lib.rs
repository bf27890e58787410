//! Reassembly engine for the vidstream client: chunk store, frame dispatch,
//! statistics and the session controller that drives them.

pub mod chunk_store;
pub mod dispatch;
pub mod session;
pub mod stats;

pub use chunk_store::{AddOutcome, BeginOutcome, ChunkStore, ChunkStoreConfig, CompletedFrame};
pub use dispatch::{FrameDispatcher, FrameHandler};
pub use session::{
    RunningSession, Session, SessionConfig, SessionEnd, SessionError, SessionState, SessionSummary,
    StopHandle,
};
pub use stats::{StatsSnapshot, StatsTracker};
