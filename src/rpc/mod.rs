pub mod client;
pub mod codec;
pub mod contract;

pub use client::{with_retry, RpcClient};
pub use contract::{PredictionContract, RawRound};
