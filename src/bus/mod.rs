//! Internal publish/pull message bus: envelopes and TCP transport.

pub mod channel;
pub mod envelope;

pub use channel::{PubServer, PullServer, PushClient, SubClient};
pub use envelope::{now, rtopic, topic, Bcast, Rept, Resp};
