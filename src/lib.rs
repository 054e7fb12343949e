//! Message routing between a drone relay station and its ground-station
//! backend: length-prefixed JSON envelopes, strictly alternating
//! request/reply channels and acknowledged notifications, each channel
//! owned by one worker thread.

pub mod channel;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod logging;
pub mod queue;
pub mod roles;
pub mod shutdown;
pub mod store;
pub mod wire;
pub mod worker;
