//! Bounded, retrying access to an HSM backend.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::HsmConfig;
use crate::error::{GatewayError, Result};
use crate::hsm::retry::with_retry;
use crate::hsm::{GeneratedKey, HsmConnector, HsmError, HsmSession, KeyGenParams};
use crate::types::{HsmHandle, KeyAlgorithm};

/// Outcome of a gateway call along with how many attempts it took.
#[derive(Debug)]
pub struct HsmCall<T> {
    pub result: Result<T>,
    pub attempts: u32,
    pub operation_id: String,
}

enum HsmCommand<'a> {
    Generate(&'a KeyGenParams),
    Sign { handle: &'a HsmHandle, algorithm: KeyAlgorithm, digest: &'a [u8] },
    ExportPublicKey(&'a HsmHandle),
    Destroy(&'a HsmHandle),
}

impl HsmCommand<'_> {
    fn name(&self) -> &'static str {
        match self {
            HsmCommand::Generate(_) => "generate_key",
            HsmCommand::Sign { .. } => "sign",
            HsmCommand::ExportPublicKey(_) => "export_public_key",
            HsmCommand::Destroy(_) => "destroy_key",
        }
    }
}

enum HsmReply {
    Generated(GeneratedKey),
    Bytes(Vec<u8>),
    Done,
}

/// A session together with the pool permit it occupies. Both are released on drop.
struct SessionLease {
    session: Box<dyn HsmSession>,
    _permit: OwnedSemaphorePermit,
}

#[derive(Clone)]
pub struct HsmGateway {
    connector: Arc<dyn HsmConnector>,
    permits: Arc<Semaphore>,
    config: HsmConfig,
}

impl HsmGateway {
    pub fn new(connector: Arc<dyn HsmConnector>, config: HsmConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.pool_size.max(1)));
        Self { connector, permits, config }
    }

    pub fn config(&self) -> &HsmConfig {
        &self.config
    }

    /// Sessions currently free in the pool.
    pub fn available_sessions(&self) -> usize {
        self.permits.available_permits()
    }

    async fn lease_session(&self) -> core::result::Result<SessionLease, HsmError> {
        let permit = tokio::time::timeout(
            self.config.acquire_timeout(),
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        .map_err(|_| {
            HsmError::Unavailable(format!(
                "no HSM session available within {} ms",
                self.config.acquire_timeout_ms
            ))
        })?
        .map_err(|_| HsmError::Unavailable("HSM session pool closed".to_string()))?;

        let session = self.connector.open_session().await?;
        Ok(SessionLease { session, _permit: permit })
    }

    async fn attempt(&self, command: &HsmCommand<'_>) -> core::result::Result<HsmReply, HsmError> {
        let mut lease = self.lease_session().await?;
        let session = lease.session.as_mut();

        let call = async {
            match command {
                HsmCommand::Generate(params) => session.generate_key(params).await.map(HsmReply::Generated),
                HsmCommand::Sign { handle, algorithm, digest } => {
                    session.sign(handle, *algorithm, digest).await.map(HsmReply::Bytes)
                }
                HsmCommand::ExportPublicKey(handle) => {
                    session.export_public_key(handle).await.map(HsmReply::Bytes)
                }
                HsmCommand::Destroy(handle) => match session.destroy_key(handle).await {
                    Ok(()) => Ok(HsmReply::Done),
                    Err(HsmError::KeyNotFound(_)) => {
                        debug!(handle = %handle, "key already absent from HSM");
                        Ok(HsmReply::Done)
                    }
                    Err(e) => Err(e),
                },
            }
        };

        tokio::time::timeout(self.config.attempt_timeout(), call)
            .await
            .map_err(|_| {
                HsmError::Unavailable(format!(
                    "{} timed out after {} ms",
                    command.name(),
                    self.config.attempt_timeout_ms
                ))
            })?
    }

    async fn execute(&self, command: HsmCommand<'_>) -> HsmCall<HsmReply> {
        let operation_id = Uuid::new_v4().to_string();
        let name = command.name();
        let (result, attempts) =
            with_retry(&self.config.retry, name, |_| self.attempt(&command)).await;

        match &result {
            Ok(_) => debug!(operation = name, operation_id = %operation_id, attempts, "HSM call completed"),
            Err(e) => warn!(operation = name, operation_id = %operation_id, attempts, error = %e, "HSM call failed"),
        }

        HsmCall { result: result.map_err(Into::into), attempts, operation_id }
    }

    pub async fn generate_key(&self, params: &KeyGenParams) -> HsmCall<GeneratedKey> {
        let call = self.execute(HsmCommand::Generate(params)).await;
        map_reply(call, |reply| match reply {
            HsmReply::Generated(key) => Some(key),
            _ => None,
        })
    }

    pub async fn sign(&self, handle: &HsmHandle, algorithm: KeyAlgorithm, digest: &[u8]) -> HsmCall<Vec<u8>> {
        let call = self.execute(HsmCommand::Sign { handle, algorithm, digest }).await;
        map_reply(call, |reply| match reply {
            HsmReply::Bytes(signature) => Some(signature),
            _ => None,
        })
    }

    pub async fn export_public_key(&self, handle: &HsmHandle) -> HsmCall<Vec<u8>> {
        let call = self.execute(HsmCommand::ExportPublicKey(handle)).await;
        map_reply(call, |reply| match reply {
            HsmReply::Bytes(der) => Some(der),
            _ => None,
        })
    }

    /// Destroy `handle`. A key the device no longer knows counts as destroyed.
    pub async fn destroy_key(&self, handle: &HsmHandle) -> HsmCall<()> {
        let call = self.execute(HsmCommand::Destroy(handle)).await;
        map_reply(call, |reply| match reply {
            HsmReply::Done => Some(()),
            _ => None,
        })
    }
}

fn map_reply<T>(call: HsmCall<HsmReply>, extract: impl FnOnce(HsmReply) -> Option<T>) -> HsmCall<T> {
    let result = call.result.and_then(|reply| {
        extract(reply).ok_or_else(|| GatewayError::hsm_rejected("HSM returned an unexpected reply"))
    });
    HsmCall { result, attempts: call.attempts, operation_id: call.operation_id }
}
