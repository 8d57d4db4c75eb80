//! Exchange clients: the live Upbit REST client, an in-memory paper exchange,
//! and the guarded wrapper used by the engine.

mod exchange;
mod guarded;
mod paper;
mod types;
mod upbit_client;

pub use exchange::ExchangeClient;
pub use guarded::GuardedExchange;
pub use paper::{PaperConfig, PaperExchange};
pub use types::*;
pub use upbit_client::{UpbitClient, UPBIT_URL};
