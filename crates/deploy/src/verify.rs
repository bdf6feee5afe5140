//! Best-effort source verification.

use std::{collections::HashMap, sync::Arc, time::Duration};

use alloy_core::primitives::Address;
use backon::{ConstantBuilder, Retryable};
use tokio::sync::Mutex;

use crate::{
    DeployedInstance, ResolvedArg,
    traits::{VerificationRequest, VerificationResult, Verifier, VerifierError},
};

/// Default pause before the single retry of a transient failure.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Default bound on a single verification attempt.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(180);

/// Transient failures are retried at most this many times.
const MAX_RETRIES: usize = 1;

impl VerificationRequest {
    /// The request matching a deployed instance.
    ///
    /// Proxies are verified through their implementation with no constructor
    /// arguments. The proxy address paired with the logical contract's
    /// arguments would publish wrong metadata.
    pub fn for_instance(instance: &DeployedInstance, constructor_args: &[ResolvedArg]) -> Self {
        match (instance.is_proxy, instance.implementation) {
            (true, Some(implementation)) => Self {
                address: implementation,
                source_path: instance.artifact.source_path.clone(),
                constructor_args: Vec::new(),
            },
            _ => Self {
                address: instance.address,
                source_path: instance.artifact.source_path.clone(),
                constructor_args: constructor_args.to_vec(),
            },
        }
    }
}

/// Wraps a [`Verifier`] so that verification can never fail a deployment.
///
/// Every outcome is folded into a [`VerificationResult`]. Requests for the same
/// address are serialized, and once an address is verified later requests
/// short-circuit to [`VerificationResult::AlreadyVerified`].
#[derive(Debug)]
pub struct VerificationService<V> {
    verifier: V,
    retry_delay: Duration,
    attempt_timeout: Duration,
    outcomes: Mutex<HashMap<Address, Arc<Mutex<Option<VerificationResult>>>>>,
}

impl<V: Verifier> VerificationService<V> {
    pub fn new(verifier: V) -> Self {
        Self {
            verifier,
            retry_delay: DEFAULT_RETRY_DELAY,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            outcomes: Mutex::default(),
        }
    }

    /// Set the backoff before retrying a transient failure.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Bound each attempt. An attempt that does not answer in time counts as
    /// a transient failure.
    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub async fn verify(&self, request: VerificationRequest) -> VerificationResult {
        let slot = Arc::clone(
            self.outcomes
                .lock()
                .await
                .entry(request.address)
                .or_default(),
        );
        let mut previous = slot.lock().await;

        if previous
            .as_ref()
            .is_some_and(VerificationResult::is_success)
        {
            tracing::debug!(address = %request.address, "Already verified, skipping");
            return VerificationResult::AlreadyVerified;
        }

        let result = self.submit_with_retry(&request).await;

        match &result {
            VerificationResult::Verified | VerificationResult::AlreadyVerified => {
                tracing::info!(
                    address = %request.address,
                    source = %request.source_path,
                    outcome = ?result,
                    "Contract verified"
                );
            }
            VerificationResult::Failed(reason) => {
                tracing::warn!(
                    address = %request.address,
                    source = %request.source_path,
                    %reason,
                    "Verification failed, continuing"
                );
            }
        }

        *previous = Some(result.clone());
        result
    }

    async fn submit_with_retry(&self, request: &VerificationRequest) -> VerificationResult {
        let attempt = || async {
            tokio::time::timeout(
                self.attempt_timeout,
                self.verifier.submit_verification(request),
            )
            .await
            .unwrap_or_else(|_| {
                Err(VerifierError::Transient(format!(
                    "no answer within {:?}",
                    self.attempt_timeout
                )))
            })
        };

        let outcome = attempt
            .retry(
                ConstantBuilder::default()
                    .with_delay(self.retry_delay)
                    .with_max_times(MAX_RETRIES),
            )
            .when(VerifierError::is_transient)
            .notify(|err: &VerifierError, delay: Duration| {
                tracing::debug!(
                    address = %request.address,
                    error = %err,
                    ?delay,
                    "Retrying verification"
                );
            })
            .await;

        match outcome {
            Ok(result) => result,
            Err(err) => VerificationResult::Failed(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use alloy_core::primitives::address;

    use crate::ArtifactRef;

    /// Replays a fixed list of responses, then keeps answering `Verified`.
    #[derive(Default)]
    struct Scripted {
        responses: std::sync::Mutex<Vec<Result<VerificationResult, VerifierError>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(mut responses: Vec<Result<VerificationResult, VerifierError>>) -> Self {
            responses.reverse();
            Self {
                responses: std::sync::Mutex::new(responses),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl Verifier for Arc<Scripted> {
        async fn submit_verification(
            &self,
            _request: &VerificationRequest,
        ) -> Result<VerificationResult, VerifierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.responses
                .lock()
                .expect("lock")
                .pop()
                .unwrap_or(Ok(VerificationResult::Verified))
        }
    }

    struct Unresponsive {
        calls: AtomicUsize,
    }

    impl Verifier for Arc<Unresponsive> {
        async fn submit_verification(
            &self,
            _request: &VerificationRequest,
        ) -> Result<VerificationResult, VerifierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    fn request() -> VerificationRequest {
        VerificationRequest {
            address: address!("e7f1725E7734CE288F8367e1Bb143E90bb3F0512"),
            source_path: "contracts/Token.sol:Token".to_string(),
            constructor_args: Vec::new(),
        }
    }

    fn service(verifier: &Arc<Scripted>) -> VerificationService<Arc<Scripted>> {
        VerificationService::new(Arc::clone(verifier)).retry_delay(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_transient_error_is_retried_once() {
        let verifier = Arc::new(Scripted::new(vec![Err(VerifierError::Transient(
            "502 Bad Gateway".to_string(),
        ))]));

        let result = service(&verifier).verify(request()).await;

        assert_eq!(result, VerificationResult::Verified);
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_repeated_transient_error_becomes_failed() {
        let verifier = Arc::new(Scripted::new(vec![
            Err(VerifierError::Transient("ETIMEDOUT".to_string())),
            Err(VerifierError::Transient("ETIMEDOUT".to_string())),
        ]));

        let result = service(&verifier).verify(request()).await;

        assert!(matches!(result, VerificationResult::Failed(reason) if reason.contains("ETIMEDOUT")));
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unresponsive_verifier_times_out() {
        let verifier = Arc::new(Unresponsive {
            calls: AtomicUsize::new(0),
        });
        let service = VerificationService::new(Arc::clone(&verifier))
            .retry_delay(Duration::from_millis(1))
            .attempt_timeout(Duration::from_millis(20));

        let result = tokio::time::timeout(Duration::from_secs(5), service.verify(request()))
            .await
            .expect("verification must not hang");

        assert!(matches!(result, VerificationResult::Failed(reason) if reason.contains("no answer")));
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let verifier = Arc::new(Scripted::new(vec![Err(VerifierError::Permanent(
            "source mismatch".to_string(),
        ))]));

        let result = service(&verifier).verify(request()).await;

        assert!(matches!(result, VerificationResult::Failed(_)));
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_for_one_address_are_deduplicated() {
        let verifier = Arc::new(Scripted::default());
        let service = Arc::new(service(&verifier));

        let (first, second) = tokio::join!(service.verify(request()), service.verify(request()));

        let mut outcomes = vec![first, second];
        outcomes.sort_by_key(|result| matches!(result, VerificationResult::AlreadyVerified));
        assert_eq!(
            outcomes,
            vec![
                VerificationResult::Verified,
                VerificationResult::AlreadyVerified
            ]
        );
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_verification_can_be_attempted_again() {
        let verifier = Arc::new(Scripted::new(vec![Err(VerifierError::Permanent(
            "missing API key".to_string(),
        ))]));
        let service = service(&verifier);

        assert!(matches!(
            service.verify(request()).await,
            VerificationResult::Failed(_)
        ));
        assert_eq!(service.verify(request()).await, VerificationResult::Verified);
    }

    #[test]
    fn test_proxies_verify_their_implementation_without_args() {
        let implementation = address!("9fE46736679d2D9a65F0992F2272dE9f3c7fa6e0");
        let instance = DeployedInstance {
            artifact: ArtifactRef::new("Manager", "contracts/Manager.sol:Manager"),
            address: address!("Cf7Ed3AccA5a467e9e704C703E8D87F634fB0Fc9"),
            is_proxy: true,
            implementation: Some(implementation),
            transaction_hash: None,
            reused: false,
        };

        let request = VerificationRequest::for_instance(&instance, &[ResolvedArg::Int(30)]);

        assert_eq!(request.address, implementation);
        assert!(request.constructor_args.is_empty());
        assert_eq!(request.source_path, "contracts/Manager.sol:Manager");
    }
}
