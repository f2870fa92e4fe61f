mod channel;
mod master;

pub use channel::FrontChannel;
pub use master::FrontMasterChannel;
