//! Per-user session context: credentials plus the session's trading state.
//!
//! An engine is constructed with exactly one session; nothing in the crate
//! keeps trading state in a global.

use std::sync::Arc;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use tokio::sync::RwLock;

use crate::trading::{RiskConfig, TradingState};

/// Exchange API key pair. Never persisted by this crate.
#[derive(Clone)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

impl Credentials {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
        }
    }

    /// Load from `UPBIT_ACCESS_KEY` / `UPBIT_SECRET_KEY`.
    pub fn from_env() -> Result<Self> {
        let access_key =
            std::env::var("UPBIT_ACCESS_KEY").context("UPBIT_ACCESS_KEY not set")?;
        let secret_key =
            std::env::var("UPBIT_SECRET_KEY").context("UPBIT_SECRET_KEY not set")?;
        Ok(Self::new(access_key, secret_key))
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shown: String = self.access_key.chars().take(4).collect();
        f.debug_struct("Credentials")
            .field("access_key", &format!("{}…", shown))
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Shared handle to a session's trading state. All mutation goes through the write lock.
pub type SharedState = Arc<RwLock<TradingState>>;

/// One user's trading session.
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: String,
    pub credentials: Option<Credentials>,
    pub state: SharedState,
}

impl Session {
    pub fn new(
        user_id: impl Into<String>,
        credentials: Option<Credentials>,
        budget: Decimal,
        risk: RiskConfig,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            credentials,
            state: Arc::new(RwLock::new(TradingState::new(budget, risk))),
        }
    }

    /// Risk limits currently applied to this session.
    pub async fn risk_config(&self) -> RiskConfig {
        self.state.read().await.risk().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_debug_redacts_secret() {
        let creds = Credentials::new("abcdefgh", "top-secret");
        let shown = format!("{:?}", creds);
        assert!(!shown.contains("top-secret"));
        assert!(!shown.contains("abcdefgh"));
        assert!(shown.contains("abcd"));
    }

    #[tokio::test]
    async fn test_session_owns_its_state() {
        let a = Session::new("a", None, dec!(1000000), RiskConfig::default());
        let b = Session::new("b", None, dec!(500000), RiskConfig::default());
        assert_eq!(a.state.read().await.available_budget(), dec!(1000000));
        assert_eq!(b.state.read().await.available_budget(), dec!(500000));
        assert_eq!(a.risk_config().await.max_positions, 5);
    }
}
