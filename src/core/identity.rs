use alloy_primitives::{Address, B256};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::core::error::OracleError;
use crate::interfaces::alerts::{Notifier, Severity};
use crate::interfaces::attested::AttestedSigner;
use crate::interfaces::chain::{ChainClient, contract};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityOutcome {
    AlreadyRegistered,
    Registered { tx_hash: B256 },
}

/// Startup check that the contract points at this process's signer.
pub struct IdentityReconciler {
    chain: Arc<dyn ChainClient>,
    attested: Option<Arc<dyn AttestedSigner>>,
    notifier: Arc<dyn Notifier>,
    confidential: bool,
    trusted_network: bool,
}

impl IdentityReconciler {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        attested: Option<Arc<dyn AttestedSigner>>,
        notifier: Arc<dyn Notifier>,
        confidential: bool,
        trusted_network: bool,
    ) -> Self {
        Self {
            chain,
            attested,
            notifier,
            confidential,
            trusted_network,
        }
    }

    pub async fn reconcile(&self) -> Result<IdentityOutcome, OracleError> {
        let signer = self.chain.signer_address();
        let registered = self.chain.registered_oracle().await?;
        if registered == signer {
            info!(oracle = %signer, "Oracle identity matches contract");
            return Ok(IdentityOutcome::AlreadyRegistered);
        }

        warn!(%registered, %signer, "Registered oracle differs from signer");
        if !self.confidential {
            let err = OracleError::IdentityMismatch {
                registered: registered.to_string(),
                signer: signer.to_string(),
            };
            error!("Refusing to start: {}", err);
            self.notifier
                .notify(
                    Severity::Critical,
                    "Oracle identity mismatch",
                    &format!(
                        "contract {} expects {} but this process signs as {}; re-register manually",
                        self.chain.contract_address(),
                        registered,
                        signer
                    ),
                )
                .await;
            return Err(err);
        }

        let tx_hash = self.register(signer).await?;
        info!(oracle = %signer, %tx_hash, "Registered oracle identity");
        Ok(IdentityOutcome::Registered { tx_hash })
    }

    async fn register(&self, signer: Address) -> Result<B256, OracleError> {
        if self.trusted_network {
            return self.chain.set_oracle(signer).await;
        }
        let attested = self.attested.as_ref().ok_or_else(|| {
            OracleError::NotConfigured(
                "attested signer required to register on an untrusted network".to_string(),
            )
        })?;
        attested
            .submit(self.chain.contract_address(), &contract::set_oracle(signer))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockChain, RecordedAlert, RecordingNotifier, RecordingSigner, Submission};

    struct Harness {
        chain: Arc<MockChain>,
        signer: Arc<RecordingSigner>,
        alerts: Arc<RecordingNotifier>,
    }

    fn harness(registered: Address) -> Harness {
        let chain = Arc::new(MockChain::new(23295, Address::repeat_byte(0xaa)));
        chain.set_registered_oracle(registered);
        Harness {
            chain,
            signer: Arc::new(RecordingSigner::default()),
            alerts: Arc::new(RecordingNotifier::default()),
        }
    }

    impl Harness {
        fn reconciler(&self, confidential: bool, trusted: bool) -> IdentityReconciler {
            IdentityReconciler::new(
                self.chain.clone(),
                Some(self.signer.clone()),
                self.alerts.clone(),
                confidential,
                trusted,
            )
        }
    }

    #[tokio::test]
    async fn matching_identity_is_a_no_op() {
        let h = harness(Address::repeat_byte(0xaa));
        let outcome = h.reconciler(false, false).reconcile().await.unwrap();
        assert_eq!(outcome, IdentityOutcome::AlreadyRegistered);
        assert!(h.chain.submissions().is_empty());
        assert!(h.signer.submitted().is_empty());
    }

    #[tokio::test]
    async fn public_chain_mismatch_halts_with_alert() {
        let h = harness(Address::repeat_byte(0xbb));
        let err = h.reconciler(false, false).reconcile().await.unwrap_err();
        assert!(matches!(err, OracleError::IdentityMismatch { .. }));
        let alerts: Vec<RecordedAlert> = h.alerts.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Critical);
        assert!(h.signer.submitted().is_empty());
    }

    #[tokio::test]
    async fn confidential_chain_registers_through_attested_signer() {
        let h = harness(Address::repeat_byte(0xbb));
        let outcome = h.reconciler(true, false).reconcile().await.unwrap();
        assert!(matches!(outcome, IdentityOutcome::Registered { .. }));

        let submitted = h.signer.submitted();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].0, h.chain.contract_address());
        assert_eq!(submitted[0].1, contract::set_oracle(Address::repeat_byte(0xaa)));
        assert!(h.chain.submissions().is_empty());
    }

    #[tokio::test]
    async fn trusted_network_registers_directly() {
        let h = harness(Address::repeat_byte(0xbb));
        h.reconciler(true, true).reconcile().await.unwrap();
        assert_eq!(
            h.chain.submissions(),
            vec![Submission::SetOracle(Address::repeat_byte(0xaa))]
        );
        assert!(h.signer.submitted().is_empty());
    }

    #[tokio::test]
    async fn untrusted_network_without_attested_signer_fails() {
        let h = harness(Address::repeat_byte(0xbb));
        let reconciler =
            IdentityReconciler::new(h.chain.clone(), None, h.alerts.clone(), true, false);
        assert!(matches!(
            reconciler.reconcile().await,
            Err(OracleError::NotConfigured(_))
        ));
        assert!(h.chain.submissions().is_empty());
    }
}
