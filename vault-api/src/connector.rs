//! External collaborator interface. Per-exchange REST/WebSocket connectors
//! are out of scope here; this module exists so the scheduler has
//! something to compile against and test with — no real exchange
//! connector lives here, only the trait contract and a mock test double.
//!
//! Capability detection is a base trait with optional capability methods
//! returning `Option<&dyn Trait>`, so the scheduler dispatches on
//! `is_some()` rather than reflection or duck typing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use zeroize::{Zeroize, Zeroizing};

/// Decrypted credentials handed to a connector for the duration of one
/// call. Produced by `CredentialVault::with_decrypted` and dropped (hence
/// zeroized) as soon as the connector call returns.
#[derive(Clone)]
pub struct ConnectorCredentials {
    pub api_key: Zeroizing<String>,
    pub api_secret: Zeroizing<String>,
    pub passphrase: Option<Zeroizing<String>>,
}

impl Drop for ConnectorCredentials {
    fn drop(&mut self) {
        self.api_key.zeroize();
        self.api_secret.zeroize();
        if let Some(p) = self.passphrase.as_mut() {
            p.zeroize();
        }
    }
}

/// The global-balance shape every connector must be able to produce — the
/// snapshot fields, minus identity and breakdown.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GlobalBalance {
    pub total_equity: f64,
    pub realized_balance: f64,
    pub unrealized_pnl: f64,
    pub deposits: f64,
    pub withdrawals: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MarketBreakdownEntry {
    pub market: String,
    pub equity: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExecutedOrder {
    pub market: String,
    pub side: String,
    pub quantity: f64,
    pub price: f64,
    pub executed_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum ConnectorError {
    /// The connector's call did not complete within its deadline.
    Timeout,
    /// The exchange rejected the credentials or the request.
    Rejected(String),
    /// Transport or parse failure talking to the exchange.
    Unavailable(String),
}

impl fmt::Display for ConnectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "connector call timed out"),
            Self::Rejected(msg) => write!(f, "connector rejected request: {msg}"),
            Self::Unavailable(msg) => write!(f, "connector unavailable: {msg}"),
        }
    }
}

impl std::error::Error for ConnectorError {}

/// Per-market breakdown — the richest balance shape the scheduler prefers
/// when a connector can supply one.
#[async_trait]
pub trait MarketBreakdownCapability: Send + Sync {
    async fn get_current_positions(&self) -> Result<Vec<MarketBreakdownEntry>, ConnectorError>;
}

/// Aggregated historical totals, second preference behind a per-market
/// breakdown.
#[async_trait]
pub trait HistoricalSummariesCapability: Send + Sync {
    async fn get_historical_summaries(
        &self,
        since: DateTime<Utc>,
    ) -> Result<GlobalBalance, ConnectorError>;
}

#[async_trait]
pub trait ExecutedOrdersCapability: Send + Sync {
    async fn get_executed_orders(
        &self,
        market_type: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ExecutedOrder>, ConnectorError>;
}

#[async_trait]
pub trait FundingFeesCapability: Send + Sync {
    async fn get_funding_fees(
        &self,
        symbols: &[String],
        since: DateTime<Utc>,
    ) -> Result<f64, ConnectorError>;
}

#[async_trait]
pub trait EarnBalanceCapability: Send + Sync {
    async fn get_earn_balance(&self) -> Result<f64, ConnectorError>;
}

/// A per-exchange connector. `test_connection` and `get_balance` are the
/// only methods every connector must implement; everything else is
/// capability-detected so the scheduler can compose the richest snapshot
/// shape a given connector supports without downcasting or reflection.
#[async_trait]
pub trait Connector: Send + Sync {
    fn exchange(&self) -> &str;

    async fn test_connection(&self, creds: &ConnectorCredentials) -> Result<bool, ConnectorError>;

    async fn get_balance(
        &self,
        creds: &ConnectorCredentials,
    ) -> Result<GlobalBalance, ConnectorError>;

    fn as_market_breakdown(&self) -> Option<&dyn MarketBreakdownCapability> {
        None
    }

    fn as_historical_summaries(&self) -> Option<&dyn HistoricalSummariesCapability> {
        None
    }

    fn as_executed_orders(&self) -> Option<&dyn ExecutedOrdersCapability> {
        None
    }

    fn as_funding_fees(&self) -> Option<&dyn FundingFeesCapability> {
        None
    }

    fn as_earn_balance(&self) -> Option<&dyn EarnBalanceCapability> {
        None
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// A connector test double for scheduler tests. `should_fail` flips
    /// every call to `Err(ConnectorError::Rejected)`, standing in for a
    /// failing connector in the scheduler's atomic-abort tests.
    pub struct MockConnector {
        exchange: String,
        balance: GlobalBalance,
        breakdown: Option<Vec<MarketBreakdownEntry>>,
        should_fail: AtomicBool,
    }

    impl MockConnector {
        pub fn new(exchange: impl Into<String>, balance: GlobalBalance) -> Self {
            Self {
                exchange: exchange.into(),
                balance,
                breakdown: None,
                should_fail: AtomicBool::new(false),
            }
        }

        pub fn with_breakdown(mut self, breakdown: Vec<MarketBreakdownEntry>) -> Self {
            self.breakdown = Some(breakdown);
            self
        }

        pub fn failing(exchange: impl Into<String>) -> Self {
            Self {
                exchange: exchange.into(),
                balance: GlobalBalance::default(),
                breakdown: None,
                should_fail: AtomicBool::new(true),
            }
        }

        pub fn set_failing(&self, failing: bool) {
            self.should_fail.store(failing, Ordering::Release);
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        fn exchange(&self) -> &str {
            &self.exchange
        }

        async fn test_connection(
            &self,
            _creds: &ConnectorCredentials,
        ) -> Result<bool, ConnectorError> {
            if self.should_fail.load(Ordering::Acquire) {
                return Err(ConnectorError::Rejected("mock configured to fail".into()));
            }
            Ok(true)
        }

        async fn get_balance(
            &self,
            _creds: &ConnectorCredentials,
        ) -> Result<GlobalBalance, ConnectorError> {
            if self.should_fail.load(Ordering::Acquire) {
                return Err(ConnectorError::Rejected("mock configured to fail".into()));
            }
            Ok(self.balance.clone())
        }

        fn as_market_breakdown(&self) -> Option<&dyn MarketBreakdownCapability> {
            if self.breakdown.is_some() {
                Some(self)
            } else {
                None
            }
        }
    }

    #[async_trait]
    impl MarketBreakdownCapability for MockConnector {
        async fn get_current_positions(&self) -> Result<Vec<MarketBreakdownEntry>, ConnectorError> {
            if self.should_fail.load(Ordering::Acquire) {
                return Err(ConnectorError::Rejected("mock configured to fail".into()));
            }
            Ok(self.breakdown.clone().unwrap_or_default())
        }
    }
}
