//! Display-only balance lookup. Failures are reported, never fatal.

use crate::{
    errors::BalanceError,
    retry::{first_success, Backoff},
};
use alloy::{
    primitives::{Address, U256},
    providers::{Provider as _, RootProvider},
};
use eyre::Context as _;
use reqwest::Client;
use std::{future::Future, str::FromStr as _, time::Duration};

const RPC_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

pub trait BalanceLookup {
    /// Native balance of `address` in wei, bounded by `timeout`.
    fn get_balance(
        &self,
        address: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<U256, BalanceError>>;
}

/// `eth_getBalance` over JSON-RPC, primary endpoint first then fallbacks.
#[derive(Debug, Clone)]
pub struct RpcBalanceLookup {
    urls: Vec<String>,
    backoff: Backoff,
}

impl RpcBalanceLookup {
    /// Blank and repeated URLs are dropped; order is kept.
    pub fn new(rpc_url: Option<&str>, fallback_rpc_urls: &[String]) -> Self {
        let mut urls: Vec<String> = Vec::with_capacity(1 + fallback_rpc_urls.len());
        for u in rpc_url.into_iter().chain(fallback_rpc_urls.iter().map(String::as_str)) {
            let t = u.trim();
            if t.is_empty() || urls.iter().any(|x| x == t) {
                continue;
            }
            urls.push(t.to_owned());
        }
        Self {
            urls,
            backoff: Backoff::default(),
        }
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    fn provider_for_url(url: &str, timeout: Duration) -> eyre::Result<RootProvider> {
        let u: reqwest::Url = url
            .parse()
            .with_context(|| format!("invalid rpc url: {url}"))?;
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(RPC_CONNECT_TIMEOUT.min(timeout))
            .build()
            .context("build rpc http client")?;
        let http = alloy::transports::http::Http::with_client(client, u);
        let rpc_client = alloy::rpc::client::RpcClient::new(http, false);
        Ok(RootProvider::new(rpc_client))
    }
}

impl BalanceLookup for RpcBalanceLookup {
    async fn get_balance(&self, address: &str, timeout: Duration) -> Result<U256, BalanceError> {
        if self.urls.is_empty() {
            return Err(BalanceError::NotConfigured);
        }
        let addr = Address::from_str(address.trim()).map_err(|e| {
            tracing::debug!(address, error = %e, "unparseable address");
            BalanceError::InvalidAddress(address.to_owned())
        })?;

        let lookup = first_success(
            &self.urls,
            &self.backoff,
            |url| {
                let url = url.clone();
                async move {
                    let p = Self::provider_for_url(&url, timeout)?;
                    p.get_balance(addr).await.context("get balance")
                }
            },
            "eth_getBalance",
        );
        match tokio::time::timeout(timeout, lookup).await {
            Ok(Ok(wei)) => Ok(wei),
            Ok(Err(e)) => Err(BalanceError::Transport(format!("{e:#}"))),
            Err(elapsed) => {
                tracing::debug!(address, error = %elapsed, "balance lookup timed out");
                Err(BalanceError::Timeout(timeout))
            }
        }
    }
}

/// Wei rendered as ether with full precision.
pub fn format_wei(wei: U256) -> String {
    alloy::primitives::utils::format_ether(wei)
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::ContextCompat as _;

    const ADDR: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";

    fn quick() -> Backoff {
        Backoff {
            rounds: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter_ms: 0,
        }
    }

    #[test]
    fn urls_are_trimmed_and_deduplicated() {
        let l = RpcBalanceLookup::new(
            Some(" http://a "),
            &["http://a".to_owned(), String::new(), "http://b".to_owned()],
        );
        assert_eq!(l.urls(), ["http://a", "http://b"]);
    }

    #[tokio::test]
    async fn no_urls_is_not_configured() -> eyre::Result<()> {
        let err = RpcBalanceLookup::new(None, &[])
            .get_balance(ADDR, Duration::from_secs(1))
            .await
            .err()
            .context("must fail")?;
        assert!(matches!(err, BalanceError::NotConfigured));
        Ok(())
    }

    #[tokio::test]
    async fn bad_address_is_rejected_before_any_request() -> eyre::Result<()> {
        let err = RpcBalanceLookup::new(Some("http://127.0.0.1:9"), &[])
            .get_balance("0x1234", Duration::from_secs(1))
            .await
            .err()
            .context("must fail")?;
        assert!(matches!(err, BalanceError::InvalidAddress(_)));
        Ok(())
    }

    #[tokio::test]
    async fn silent_endpoint_hits_the_deadline() -> eyre::Result<()> {
        // Accepts connections (kernel backlog) but never answers.
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let url = format!("http://{}", listener.local_addr()?);
        let timeout = Duration::from_millis(300);
        let err = RpcBalanceLookup::new(Some(&url), &[])
            .with_backoff(quick())
            .get_balance(ADDR, timeout)
            .await
            .err()
            .context("must time out")?;
        assert!(matches!(err, BalanceError::Timeout(d) if d == timeout));
        drop(listener);
        Ok(())
    }

    #[tokio::test]
    async fn refused_connection_is_a_transport_error() -> eyre::Result<()> {
        let url = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
            format!("http://{}", listener.local_addr()?)
        };
        let err = RpcBalanceLookup::new(Some(&url), &[])
            .with_backoff(quick())
            .get_balance(ADDR, Duration::from_secs(5))
            .await
            .err()
            .context("must fail")?;
        assert!(matches!(err, BalanceError::Transport(_)), "{err:?}");
        Ok(())
    }

    #[test]
    fn formats_one_ether() {
        let one = U256::from(1_000_000_000_000_000_000_u128);
        assert_eq!(format_wei(one), "1.000000000000000000");
    }
}
