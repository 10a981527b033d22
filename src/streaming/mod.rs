//! Frame distribution core
//!
//! One producer publishes into a latest-wins [`FrameSlot`]; every connected
//! client runs its own [`ClientSession`] that pulls the newest frame it has
//! not seen yet. A [`StatusBroadcaster`] fans a small JSON status out to all
//! registered sessions once per interval.

pub mod context;
pub mod fps;
pub mod frame_slot;
pub mod producer;
pub mod registry;
pub mod session;
pub mod status;

pub use context::{Connectivity, RelayContext, RelayTiming};
pub use fps::FpsEstimator;
pub use frame_slot::{Frame, FrameSlot};
pub use producer::{
    EncodeError, EncodedImage, FrameEncoder, ProducerAdapter, ProducerStats, RawImage, Sample,
    SourceEvent,
};
pub use registry::{ClientRegistry, SessionHandle, SessionId};
pub use session::{ClientSession, CloseReason, SessionState, SessionSummary};
pub use status::{BroadcastReport, StatusBroadcaster};
