pub mod aggregate;
pub mod dispatch;
pub mod session;
pub mod wire;

pub use aggregate::Aggregator;
pub use dispatch::RunIntent;
pub use session::{PeerEvent, PeerSession, SessionOptions, SessionState};
