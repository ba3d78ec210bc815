pub mod bridge;
pub mod bus;
pub mod envelope;
pub mod event_log;
pub mod ledger;
pub mod publisher;
pub mod versioning;

pub use bridge::*;
pub use bus::*;
pub use envelope::*;
pub use event_log::*;
pub use ledger::*;
pub use publisher::*;
pub use versioning::*;
