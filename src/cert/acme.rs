//! ACME order driver for Let's Encrypt, answering HTTP-01 challenges
//! through the relay's port-80 listener.
//!
//! One account is created on first use and its credentials persisted in the
//! certificate directory, so every hostname reuses the same account key.

use std::{path::PathBuf, pin::Pin, time::Duration};

use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, Order, OrderStatus,
};
use n0_error::{Result, StackResultExt, StdResultExt, anyerr};
use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use tokio::time::sleep;
use tracing::debug;

use super::{ChallengeSet, IssuedCert, OrderCerts};

const ACCOUNT_FILE: &str = "account.json";

/// How the order status is polled after the challenge is marked ready.
const POLL_INITIAL_DELAY: Duration = Duration::from_millis(500);
const POLL_MAX_DELAY: Duration = Duration::from_secs(8);
const POLL_ATTEMPTS: usize = 10;

/// Orders certificates from an ACME directory (Let's Encrypt production).
pub struct AcmeOrderer {
    account: Account,
}

impl AcmeOrderer {
    /// Loads the persisted ACME account, creating and persisting one on
    /// first run.
    pub async fn bootstrap(certs_dir: &PathBuf, contact_email: Option<&str>) -> Result<Self> {
        tokio::fs::create_dir_all(certs_dir)
            .await
            .std_context("failed to create certificate directory")?;
        let credentials_path = certs_dir.join(ACCOUNT_FILE);
        let account = match tokio::fs::read(&credentials_path).await {
            Ok(bytes) => {
                let credentials: AccountCredentials = serde_json::from_slice(&bytes)
                    .std_context("failed to parse persisted ACME account credentials")?;
                Account::from_credentials(credentials)
                    .await
                    .std_context("failed to restore ACME account")?
            }
            Err(_) => {
                let contact: Vec<String> = contact_email
                    .iter()
                    .map(|email| format!("mailto:{email}"))
                    .collect();
                let contact: Vec<&str> = contact.iter().map(String::as_str).collect();
                let (account, credentials) = Account::create(
                    &NewAccount {
                        contact: &contact,
                        terms_of_service_agreed: true,
                        only_return_existing: false,
                    },
                    LetsEncrypt::Production.url(),
                    None,
                )
                .await
                .std_context("failed to create ACME account")?;
                let bytes = serde_json::to_vec(&credentials).anyerr()?;
                super::write_atomic(credentials_path, &bytes).await?;
                debug!("created new ACME account");
                account
            }
        };
        Ok(Self { account })
    }

    async fn order_certificate(
        &self,
        host: &str,
        challenges: &ChallengeSet,
    ) -> Result<IssuedCert> {
        let identifier = Identifier::Dns(host.to_string());
        let mut order = self
            .account
            .new_order(&NewOrder {
                identifiers: &[identifier],
            })
            .await
            .std_context("failed to create ACME order")?;
        let authorizations = order
            .authorizations()
            .await
            .std_context("failed to fetch ACME authorizations")?;

        let mut tokens = Vec::new();
        for authorization in &authorizations {
            match authorization.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => continue,
                status => {
                    return Err(anyerr!("unexpected authorization status {status:?}"));
                }
            }
            let challenge = authorization
                .challenges
                .iter()
                .find(|challenge| challenge.r#type == ChallengeType::Http01)
                .context("server offered no HTTP-01 challenge")?;
            let key_authorization = order.key_authorization(challenge);
            debug!(%host, token = %challenge.token, "publishing HTTP-01 challenge");
            challenges.publish(
                challenge.token.clone(),
                key_authorization.as_str().to_string(),
            );
            tokens.push(challenge.token.clone());
            order
                .set_challenge_ready(&challenge.url)
                .await
                .std_context("failed to mark challenge ready")?;
        }

        let res = finalize(host, &mut order).await;
        for token in &tokens {
            challenges.withdraw(token);
        }
        res
    }
}

impl OrderCerts for AcmeOrderer {
    fn order<'a>(
        &'a self,
        host: &'a str,
        challenges: &'a ChallengeSet,
    ) -> Pin<Box<dyn Future<Output = Result<IssuedCert>> + Send + 'a>> {
        Box::pin(self.order_certificate(host, challenges))
    }
}

/// Waits for the validated order, then submits a CSR and downloads the chain.
async fn finalize(host: &str, order: &mut Order) -> Result<IssuedCert> {
    let mut delay = POLL_INITIAL_DELAY;
    let mut attempts = 0;
    loop {
        sleep(delay).await;
        let state = order
            .refresh()
            .await
            .std_context("failed to refresh ACME order")?;
        match state.status {
            OrderStatus::Ready => break,
            OrderStatus::Invalid => {
                return Err(anyerr!("ACME order for {host} was rejected"));
            }
            status if attempts < POLL_ATTEMPTS => {
                debug!(%host, ?status, "waiting for ACME validation");
                attempts += 1;
                delay = (delay * 2).min(POLL_MAX_DELAY);
            }
            status => {
                return Err(anyerr!(
                    "ACME order for {host} did not validate in time (status {status:?})"
                ));
            }
        }
    }

    let mut params =
        CertificateParams::new(vec![host.to_string()]).std_context("invalid certificate params")?;
    params.distinguished_name = DistinguishedName::new();
    let key_pair = KeyPair::generate().std_context("failed to generate certificate key")?;
    let csr = params
        .serialize_request(&key_pair)
        .std_context("failed to serialize certificate request")?;
    order
        .finalize(csr.der().as_ref())
        .await
        .std_context("failed to finalize ACME order")?;

    let chain_pem = loop {
        match order
            .certificate()
            .await
            .std_context("failed to download certificate chain")?
        {
            Some(chain) => break chain,
            None => sleep(Duration::from_secs(1)).await,
        }
    };
    debug!(%host, "certificate issued");
    Ok(IssuedCert {
        key_pem: key_pair.serialize_pem(),
        chain_pem,
    })
}
