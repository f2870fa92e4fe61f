mod channel;
mod master;

pub use channel::{BackChannel, BackInbound, InboundRoute};
pub use master::BackMasterChannel;
