pub mod config;
pub mod error;
pub mod mirror;
pub mod patch;
pub mod peer;
pub mod status;
pub mod view;

pub use error::{FoldError, PeerFailure};
pub use mirror::StateMirror;
pub use patch::{PatchError, PatchOp, Segment};
pub use peer::PeerAddress;
