//! Workflow secrets from the vault capability.
//!
//! Secrets are requested in one batch per call. Every workflow DON member's
//! encryption key is forwarded so the vault can return key shares encrypted
//! for this DON; a share combiner then reveals the value. A failure on one
//! secret is reported on that item only.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::capabilities::{CapabilitiesRegistry, CapabilityRequest, RequestMetadata};
use crate::error::SecretsError;
use crate::semaphore::Semaphore;

/// Capability ID of the vault DON.
pub const VAULT_CAPABILITY_ID: &str = "vault@1.0.0";

/// Combines decryption key shares and decrypts a secret value.
///
/// Arguments are the encrypted value and this DON's encrypted key shares.
pub type ShareCombiner = Arc<dyn Fn(&str, &[String]) -> anyhow::Result<String> + Send + Sync>;

/// A secret requested by a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRequest {
    pub id: String,
    pub namespace: String,
}

/// Revealed secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    pub id: String,
    pub namespace: String,
    pub owner: String,
    pub value: String,
}

/// Per-item failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretError {
    pub id: String,
    pub namespace: String,
    pub owner: String,
    pub error: String,
}

/// Outcome for one requested secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretResponse {
    Secret(Secret),
    Error(SecretError),
}

/// Vault-side identifier of a secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretIdentifier {
    pub key: String,
    pub namespace: String,
    pub owner: String,
}

impl SecretIdentifier {
    fn lookup_key(&self) -> String {
        lookup_key(&self.owner, &self.namespace, &self.key)
    }
}

fn lookup_key(owner: &str, namespace: &str, id: &str) -> String {
    format!("{}::{}::{}", owner, namespace, id)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultSecretRequest {
    pub id: SecretIdentifier,
    pub encryption_keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultRequest {
    pub requests: Vec<VaultSecretRequest>,
}

/// Key shares encrypted for one node key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedShares {
    pub encryption_key: String,
    pub shares: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VaultResult {
    Data {
        encrypted_value: String,
        encrypted_decryption_key_shares: Vec<EncryptedShares>,
    },
    Error(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultSecretResponse {
    pub id: SecretIdentifier,
    pub result: VaultResult,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VaultResponse {
    pub responses: Vec<VaultSecretResponse>,
}

/// Fetches secrets for one workflow, bounded by its own semaphore.
pub struct SecretsFetcher {
    registry: Arc<dyn CapabilitiesRegistry>,
    semaphore: Semaphore<Vec<SecretResponse>>,
    combiner: ShareCombiner,
    workflow_owner: String,
    workflow_id: String,
    workflow_name: String,
}

impl SecretsFetcher {
    pub fn new(
        registry: Arc<dyn CapabilitiesRegistry>,
        max_concurrent_calls: usize,
        combiner: ShareCombiner,
        workflow_owner: impl Into<String>,
        workflow_id: impl Into<String>,
        workflow_name: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            semaphore: Semaphore::new(max_concurrent_calls),
            combiner,
            workflow_owner: workflow_owner.into(),
            workflow_id: workflow_id.into(),
            workflow_name: workflow_name.into(),
        }
    }

    /// Fetch a batch of secrets.
    pub async fn get_secrets(
        &self,
        cancel: &CancellationToken,
        execution_id: &str,
        requests: Vec<SecretRequest>,
    ) -> Result<Vec<SecretResponse>, SecretsError> {
        let started = Instant::now();

        let result = self
            .semaphore
            .when_acquired(cancel, || self.fetch(execution_id, requests))
            .await;

        metrics::histogram!(
            "workflow_engine_secrets_fetch_duration_ms",
            "workflow_id" => self.workflow_id.clone(),
            "success" => result.is_ok().to_string()
        )
        .record(started.elapsed().as_secs_f64() * 1000.0);

        if let Err(e) = &result {
            tracing::warn!(
                workflow_id = %self.workflow_id,
                execution_id,
                error = %e,
                "Secrets fetch failed"
            );
        }

        result
    }

    async fn fetch(
        &self,
        execution_id: &str,
        requests: Vec<SecretRequest>,
    ) -> Result<Vec<SecretResponse>, SecretsError> {
        let vault = self
            .registry
            .get_executable(VAULT_CAPABILITY_ID)
            .await
            .map_err(|e| SecretsError::CapabilityNotFound {
                id: VAULT_CAPABILITY_ID.to_string(),
                reason: e.to_string(),
            })?;

        let encryption_keys = self.encryption_keys().await?;

        let vault_request = VaultRequest {
            requests: requests
                .iter()
                .map(|r| VaultSecretRequest {
                    id: SecretIdentifier {
                        key: r.id.clone(),
                        namespace: r.namespace.clone(),
                        owner: self.workflow_owner.clone(),
                    },
                    encryption_keys: encryption_keys.clone(),
                })
                .collect(),
        };

        let payload = serde_json::to_value(&vault_request)
            .map_err(|e| SecretsError::VaultCall(e.to_string()))?;

        let response = vault
            .execute(CapabilityRequest {
                method: "GetSecrets".to_string(),
                payload,
                config: serde_json::json!({}),
                metadata: RequestMetadata {
                    workflow_id: self.workflow_id.clone(),
                    workflow_owner: self.workflow_owner.clone(),
                    workflow_name: self.workflow_name.clone(),
                    workflow_execution_id: execution_id.to_string(),
                    reference_id: VAULT_CAPABILITY_ID.to_string(),
                    spend_limits: Vec::new(),
                },
            })
            .await
            .map_err(|e| SecretsError::VaultCall(e.to_string()))?;

        let vault_response: VaultResponse = serde_json::from_value(response.payload)
            .map_err(|e| SecretsError::InvalidResponse(e.to_string()))?;

        let by_key: HashMap<String, VaultResult> = vault_response
            .responses
            .into_iter()
            .map(|r| (r.id.lookup_key(), r.result))
            .collect();

        Ok(requests
            .into_iter()
            .map(|request| {
                let key = lookup_key(&self.workflow_owner, &request.namespace, &request.id);
                match by_key.get(&key) {
                    None => self.item_error(request, "no response returned for secret".to_string()),
                    Some(VaultResult::Error(error)) => self.item_error(request, error.clone()),
                    Some(VaultResult::Data {
                        encrypted_value,
                        encrypted_decryption_key_shares,
                    }) => {
                        if encrypted_decryption_key_shares.len() != 1 {
                            return self.item_error(
                                request,
                                format!(
                                    "expected 1 set of encrypted key shares, got {}",
                                    encrypted_decryption_key_shares.len()
                                ),
                            );
                        }
                        match (self.combiner)(encrypted_value, &encrypted_decryption_key_shares[0].shares) {
                            Ok(value) => SecretResponse::Secret(Secret {
                                id: request.id,
                                namespace: request.namespace,
                                owner: self.workflow_owner.clone(),
                                value,
                            }),
                            Err(e) => self.item_error(request, format!("failed to decrypt secret: {}", e)),
                        }
                    }
                }
            })
            .collect())
    }

    fn item_error(&self, request: SecretRequest, error: String) -> SecretResponse {
        SecretResponse::Error(SecretError {
            id: request.id,
            namespace: request.namespace,
            owner: self.workflow_owner.clone(),
            error,
        })
    }

    /// Encryption public keys of every workflow DON member, sorted.
    async fn encryption_keys(&self) -> Result<Vec<String>, SecretsError> {
        let local = self
            .registry
            .local_node()
            .await
            .map_err(|e| SecretsError::EncryptionKeys(e.to_string()))?;

        let mut keys = Vec::with_capacity(local.workflow_don.members.len());
        for peer_id in &local.workflow_don.members {
            let node = self
                .registry
                .node_by_peer_id(peer_id)
                .await
                .map_err(|e| SecretsError::EncryptionKeys(format!("peer {}: {}", peer_id, e)))?;
            keys.push(node.encryption_public_key);
        }
        keys.sort();

        Ok(keys)
    }
}

impl std::fmt::Debug for SecretsFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretsFetcher")
            .field("workflow_id", &self.workflow_id)
            .field("semaphore", &self.semaphore)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockRegistry, MockVault, OWNER};

    fn fetcher(registry: Arc<MockRegistry>) -> SecretsFetcher {
        let combiner: ShareCombiner = Arc::new(|value: &str, shares: &[String]| {
            if value == "undecryptable" {
                anyhow::bail!("bad shares");
            }
            Ok(format!("{}:{}", value, shares.join(",")))
        });
        SecretsFetcher::new(registry, 2, combiner, OWNER, "wf", "name")
    }

    fn request(id: &str) -> SecretRequest {
        SecretRequest {
            id: id.to_string(),
            namespace: "main".to_string(),
        }
    }

    fn data(key: &str, value: &str, share_sets: usize) -> VaultSecretResponse {
        VaultSecretResponse {
            id: SecretIdentifier {
                key: key.to_string(),
                namespace: "main".to_string(),
                owner: OWNER.to_string(),
            },
            result: VaultResult::Data {
                encrypted_value: value.to_string(),
                encrypted_decryption_key_shares: (0..share_sets)
                    .map(|i| EncryptedShares {
                        encryption_key: format!("key-{}", i),
                        shares: vec!["s1".to_string(), "s2".to_string()],
                    })
                    .collect(),
            },
        }
    }

    #[tokio::test]
    async fn test_get_secrets_mixed_batch() {
        let vault = Arc::new(MockVault::responding(VaultResponse {
            responses: vec![
                data("api_key", "enc", 1),
                data("two_sets", "enc", 2),
                data("broken", "undecryptable", 1),
                VaultSecretResponse {
                    id: SecretIdentifier {
                        key: "denied".to_string(),
                        namespace: "main".to_string(),
                        owner: OWNER.to_string(),
                    },
                    result: VaultResult::Error("access denied".to_string()),
                },
            ],
        }));
        let registry = Arc::new(MockRegistry::new().with_executable(VAULT_CAPABILITY_ID, vault.clone()));
        let fetcher = fetcher(registry);

        let responses = fetcher
            .get_secrets(
                &CancellationToken::new(),
                "exec-1",
                vec![
                    request("api_key"),
                    request("two_sets"),
                    request("broken"),
                    request("denied"),
                    request("missing"),
                ],
            )
            .await
            .unwrap();

        assert_eq!(responses.len(), 5);
        assert_eq!(
            responses[0],
            SecretResponse::Secret(Secret {
                id: "api_key".to_string(),
                namespace: "main".to_string(),
                owner: OWNER.to_string(),
                value: "enc:s1,s2".to_string(),
            })
        );
        for (response, needle) in responses[1..].iter().zip([
            "expected 1 set",
            "failed to decrypt",
            "access denied",
            "no response",
        ]) {
            match response {
                SecretResponse::Error(e) => assert!(e.error.contains(needle), "{}", e.error),
                other => panic!("expected error, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_get_secrets_repeated_request_shares_response() {
        let vault = Arc::new(MockVault::responding(VaultResponse {
            responses: vec![data("api_key", "enc", 1)],
        }));
        let registry = Arc::new(MockRegistry::new().with_executable(VAULT_CAPABILITY_ID, vault));
        let fetcher = fetcher(registry);

        let responses = fetcher
            .get_secrets(
                &CancellationToken::new(),
                "exec-1",
                vec![request("api_key"), request("api_key")],
            )
            .await
            .unwrap();

        let expected = SecretResponse::Secret(Secret {
            id: "api_key".to_string(),
            namespace: "main".to_string(),
            owner: OWNER.to_string(),
            value: "enc:s1,s2".to_string(),
        });
        assert_eq!(responses, vec![expected.clone(), expected]);
    }

    #[tokio::test]
    async fn test_get_secrets_forwards_sorted_encryption_keys() {
        let vault = Arc::new(MockVault::responding(VaultResponse::default()));
        let registry = Arc::new(
            MockRegistry::new()
                .with_executable(VAULT_CAPABILITY_ID, vault.clone())
                .with_don_keys(&[("peer-b", "key-b"), ("peer-a", "key-c"), ("peer-c", "key-a")]),
        );
        let fetcher = fetcher(registry);

        fetcher
            .get_secrets(&CancellationToken::new(), "exec-1", vec![request("api_key")])
            .await
            .unwrap();

        let sent = vault.requests();
        assert_eq!(sent.len(), 1);
        let payload: VaultRequest = serde_json::from_value(sent[0].payload.clone()).unwrap();
        assert_eq!(payload.requests[0].encryption_keys, vec!["key-a", "key-b", "key-c"]);
        assert_eq!(payload.requests[0].id.owner, OWNER);
        assert_eq!(sent[0].metadata.workflow_execution_id, "exec-1");
    }

    #[tokio::test]
    async fn test_get_secrets_missing_vault_fails_batch() {
        let fetcher = fetcher(Arc::new(MockRegistry::new()));

        let err = fetcher
            .get_secrets(&CancellationToken::new(), "exec-1", vec![request("api_key")])
            .await
            .unwrap_err();
        assert!(matches!(err, SecretsError::CapabilityNotFound { .. }));
    }

    #[tokio::test]
    async fn test_get_secrets_vault_failure_fails_batch() {
        let vault = Arc::new(MockVault::failing("vault unavailable"));
        let registry = Arc::new(MockRegistry::new().with_executable(VAULT_CAPABILITY_ID, vault));
        let fetcher = fetcher(registry);

        let err = fetcher
            .get_secrets(&CancellationToken::new(), "exec-1", vec![request("api_key")])
            .await
            .unwrap_err();
        assert!(matches!(err, SecretsError::VaultCall(msg) if msg.contains("vault unavailable")));
    }

    #[tokio::test]
    async fn test_get_secrets_cancelled() {
        let fetcher = fetcher(Arc::new(MockRegistry::new()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = fetcher
            .get_secrets(&cancel, "exec-1", vec![request("api_key")])
            .await
            .unwrap_err();
        assert!(matches!(err, SecretsError::Cancelled(_)));
    }
}
