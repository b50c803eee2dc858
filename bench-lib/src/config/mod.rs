mod client;
mod error;
mod server;

pub use self::{
    client::LoopKind,
    error::ConfigError,
    server::{FailureRates, LatencyProfile, ServerKind, ServerTuning, Strategy},
};
