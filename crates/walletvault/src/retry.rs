use std::{future::Future, time::Duration};

/// Endpoint rotation policy for balance lookups.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Full passes over the endpoint list.
    pub rounds: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random jitter added to each pause, in milliseconds.
    pub jitter_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        // Balances are display-only; keep the whole thing well inside the lookup deadline.
        Self {
            rounds: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
            jitter_ms: 100,
        }
    }
}

impl Backoff {
    /// Pause after `round` failed passes: `base * 2^round`, capped, plus jitter.
    pub fn delay_after(&self, round: usize) -> Duration {
        let shift = u32::try_from(round.min(16)).unwrap_or(16_u32);
        let factor = 1_u64.checked_shl(shift).unwrap_or(u64::MAX);
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        let ms = base_ms.saturating_mul(factor).min(max_ms);
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::random::<u64>() % self.jitter_ms.saturating_add(1)
        };
        Duration::from_millis(ms.saturating_add(jitter))
    }
}

/// Run `op` against each endpoint in order until one succeeds.
///
/// A pause follows only a pass in which every endpoint failed. The last error is
/// returned, wrapped with `label`.
pub async fn first_success<E, T, Fut>(
    endpoints: &[E],
    policy: &Backoff,
    mut op: impl FnMut(&E) -> Fut,
    label: &'static str,
) -> eyre::Result<T>
where
    Fut: Future<Output = eyre::Result<T>>,
{
    if endpoints.is_empty() {
        eyre::bail!("{label}: no endpoints configured");
    }
    let mut last: Option<eyre::Report> = None;
    for round in 0..policy.rounds.max(1) {
        for endpoint in endpoints {
            match op(endpoint).await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    tracing::debug!(round, error = %e, "{label}: endpoint failed");
                    last = Some(e);
                }
            }
        }
        if round + 1 < policy.rounds {
            tokio::time::sleep(policy.delay_after(round)).await;
        }
    }
    Err(last
        .unwrap_or_else(|| eyre::eyre!("no attempt made"))
        .wrap_err(label))
}
