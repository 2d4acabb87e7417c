mod pending;
mod status;

pub use pending::{PendingCall, PendingCalls, ReplySender};
pub use status::RelayStatus;
