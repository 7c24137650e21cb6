pub mod calls;
pub mod link;

pub use calls::{PendingCall, PendingCalls};
pub use link::LinkState;
