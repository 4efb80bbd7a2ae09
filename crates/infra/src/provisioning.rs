//! Session bootstrap and wallet funding.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use snapvault_core::WalletAddress;

use crate::backend::{BackendError, StorageBackend, StorageSession};
use crate::poll::{PollError, PollPolicy, poll_until};
use crate::transport::{TransportError, TransportOptions};

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("storage backend returned no account info")]
    NoAccountInfo,

    #[error("address {0} is not listed in the account balances")]
    AddressNotInBalances(String),

    #[error("balance of {addr} did not exceed {threshold} within {waited:?}")]
    BalanceDeadline {
        addr: String,
        threshold: u64,
        waited: Duration,
    },
}

/// A freshly opened storage session with its funding address.
pub struct Provisioned {
    pub session: Arc<dyn StorageSession>,
    pub address: WalletAddress,
    pub transport: TransportOptions,
}

impl std::fmt::Debug for Provisioned {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioned")
            .field("token", self.session.token())
            .field("address", &self.address)
            .field("transport", &self.transport)
            .finish()
    }
}

/// Open a session, provision a named address and derive the transport the
/// log store should connect through.
pub async fn initialize(
    backend: &dyn StorageBackend,
    endpoint: &Url,
    address_name: &str,
) -> Result<Provisioned, ProvisionError> {
    let session = backend.create_session(endpoint).await?;
    let address = session.new_address(address_name).await?;
    let transport = TransportOptions::from_endpoint(endpoint, session.token())?;

    info!(
        endpoint = %endpoint,
        address = %address.addr,
        name = %address.name,
        "storage session provisioned"
    );

    Ok(Provisioned {
        session,
        address,
        transport,
    })
}

/// Poll account info until `address` holds strictly more than `threshold`.
///
/// Transient backend errors are retried on the next tick. Missing account
/// info or an address absent from the balances list fail immediately.
pub async fn wait_for_balance(
    session: &dyn StorageSession,
    address: &WalletAddress,
    threshold: u64,
    policy: PollPolicy,
) -> Result<WalletAddress, ProvisionError> {
    let outcome = poll_until(policy, move || async move {
        let response = match session.info().await {
            Ok(response) => response,
            Err(e) if e.is_transient() => {
                warn!(address = %address.addr, error = %e, "account info unavailable, retrying");
                return Ok(None);
            }
            Err(e) => return Err(ProvisionError::Backend(e)),
        };

        if response.info.is_none() {
            return Err(ProvisionError::NoAccountInfo);
        }
        let Some(line) = response.balance_of(&address.addr) else {
            return Err(ProvisionError::AddressNotInBalances(address.addr.clone()));
        };

        if line.balance > threshold {
            return Ok(Some(address.clone().with_balance(line.balance)));
        }
        debug!(address = %address.addr, balance = line.balance, threshold, "waiting for funds");
        Ok(None)
    })
    .await;

    match outcome {
        Ok(wallet) => {
            info!(address = %wallet.addr, balance = wallet.balance, "wallet funded");
            Ok(wallet)
        }
        Err(PollError::Failed(e)) => Err(e),
        Err(PollError::DeadlineElapsed(waited)) => Err(ProvisionError::BalanceDeadline {
            addr: address.addr.clone(),
            threshold,
            waited,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{InMemoryBackend, InfoMode};
    use crate::transport::AUTH_HEADER;

    fn endpoint() -> Url {
        Url::parse("http://0.0.0.0:6002").unwrap()
    }

    #[tokio::test]
    async fn initialize_provisions_address_and_transport() {
        let backend = InMemoryBackend::new();
        let p = initialize(&backend, &endpoint(), "_default").await.unwrap();

        assert_eq!(p.address.name, "_default");
        assert_eq!(p.address.kind, "bls");
        assert_eq!(p.transport.port, 6002);
        assert_eq!(
            p.transport.headers.get(AUTH_HEADER).map(String::as_str),
            Some(p.session.token().as_str())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_once_balance_exceeds_threshold() {
        let backend = InMemoryBackend::new().with_funding_after(3, 250);
        let p = initialize(&backend, &endpoint(), "_default").await.unwrap();

        let wallet = wait_for_balance(p.session.as_ref(), &p.address, 0, PollPolicy::default())
            .await
            .unwrap();

        assert_eq!(wallet.addr, p.address.addr);
        assert_eq!(wallet.balance, 250);
    }

    #[tokio::test(start_paused = true)]
    async fn balance_equal_to_threshold_keeps_waiting() {
        let backend = InMemoryBackend::new().with_funding_after(0, 100);
        let p = initialize(&backend, &endpoint(), "_default").await.unwrap();
        let policy = PollPolicy::default().with_deadline(Duration::from_secs(3));

        let err = wait_for_balance(p.session.as_ref(), &p.address, 100, policy)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::BalanceDeadline { threshold: 100, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_info_fails_without_retry() {
        let backend = InMemoryBackend::new().with_info_mode(InfoMode::MissingInfo);
        let p = initialize(&backend, &endpoint(), "_default").await.unwrap();

        let err = wait_for_balance(p.session.as_ref(), &p.address, 0, PollPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::NoAccountInfo));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_address_fails_without_retry() {
        let backend = InMemoryBackend::new().with_info_mode(InfoMode::WithoutAddress);
        let p = initialize(&backend, &endpoint(), "_default").await.unwrap();

        let err = wait_for_balance(p.session.as_ref(), &p.address, 0, PollPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::AddressNotInBalances(a) if a == p.address.addr));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() {
        let backend = InMemoryBackend::new();
        let p = initialize(&backend, &endpoint(), "_default").await.unwrap();
        backend.fail_next_info_calls(2);

        let wallet = wait_for_balance(p.session.as_ref(), &p.address, 0, PollPolicy::default())
            .await
            .unwrap();
        assert!(wallet.balance > 0);
    }
}
