//! Certificate authority binding managed keys to tenant identities.
//!
//! The issuer key is an ECDSA P-256 key held in the HSM and registered
//! under a reserved tenant. Certificates are X.509 v3, signed by the HSM
//! over the SHA-256 of the TBS encoding. History is append-only: renewal
//! writes a new record that supersedes the old one.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info, warn};
use x509_cert::der::asn1::BitString;
use x509_cert::der::oid::ObjectIdentifier;
use x509_cert::der::pem::LineEnding;
use x509_cert::der::{Decode, Encode, EncodePem};
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};
use x509_cert::time::{Time, Validity};
use x509_cert::{Certificate, TbsCertificate, Version};

use crate::config::CertificateConfig;
use crate::error::{GatewayError, Result};
use crate::hsm::{HsmGateway, KeyGenParams};
use crate::registry::KeyRegistry;
use crate::storage::Journal;
use crate::types::{
    CertificateId, CertificateRecord, HsmHandle, KeyAlgorithm, KeyId, KeyRecord, KeyStatus, RequestId,
    TenantId,
};
use crate::utils::sha256;

/// Tenant that owns the issuer key. Never accepted from callers.
pub const CA_TENANT: &str = "__ca__";

/// ecdsa-with-SHA256 (RFC 5758)
const ECDSA_WITH_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.2");

#[derive(Clone, Debug)]
struct Issuer {
    key_id: KeyId,
    handle: HsmHandle,
    name: String,
}

struct CertStore {
    certificates: HashMap<CertificateId, CertificateRecord>,
    by_request: HashMap<RequestId, CertificateId>,
    journal: Journal<CertificateRecord>,
}

impl CertStore {
    fn insert(&mut self, record: CertificateRecord) -> Result<()> {
        self.journal.append(&record)?;
        self.index(record);
        Ok(())
    }

    fn index(&mut self, record: CertificateRecord) {
        if let Some(request_id) = &record.request_id {
            self.by_request.insert(request_id.clone(), record.certificate_id.clone());
        }
        self.certificates.insert(record.certificate_id.clone(), record);
    }
}

pub struct CertificateAuthority {
    hsm: HsmGateway,
    registry: Arc<KeyRegistry>,
    config: CertificateConfig,
    store: RwLock<CertStore>,
    issuer: RwLock<Option<Issuer>>,
}

fn issuance(context: &str, e: impl std::fmt::Display) -> GatewayError {
    GatewayError::issuance(format!("{}: {}", context, e))
}

/// Escape RFC 4514 special characters in an attribute value.
fn escape_dn_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for (i, c) in value.chars().enumerate() {
        let special = matches!(c, ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=')
            || (i == 0 && (c == '#' || c == ' '));
        if special {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Drop sub-second precision; DER times carry whole seconds.
fn whole_seconds(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(t.timestamp(), 0).unwrap_or(t)
}

fn der_time(t: DateTime<Utc>) -> Result<Time> {
    Time::try_from(SystemTime::from(t)).map_err(|e| issuance("invalid validity time", e))
}

fn random_serial() -> Result<(SerialNumber, String)> {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    // positive, no leading zero octet
    bytes[0] = (bytes[0] & 0x7f) | 0x01;
    let serial = SerialNumber::new(&bytes).map_err(|e| issuance("serial number", e))?;
    Ok((serial, hex::encode(bytes)))
}

impl CertificateAuthority {
    pub fn open(
        path: Option<&Path>,
        fsync: bool,
        hsm: HsmGateway,
        registry: Arc<KeyRegistry>,
        config: CertificateConfig,
    ) -> Result<Self> {
        let (journal, records) = Journal::<CertificateRecord>::open(path, fsync)?;
        let mut store = CertStore { certificates: HashMap::new(), by_request: HashMap::new(), journal };
        for record in records {
            store.index(record);
        }
        debug!(certificates = store.certificates.len(), "certificate history loaded");

        Ok(Self { hsm, registry, config, store: RwLock::new(store), issuer: RwLock::new(None) })
    }

    pub fn issuer_key_id(&self) -> KeyId {
        KeyId::new(format!("ca:{}", self.config.issuer_key_label))
    }

    /// Ensure the issuer key and its self-signed certificate exist.
    ///
    /// Returns the certificate when one was created by this call.
    pub async fn bootstrap(&self) -> Result<Option<CertificateRecord>> {
        let key_id = self.issuer_key_id();
        let tenant = TenantId::new(CA_TENANT);

        let mut record = match self.registry.get(&key_id) {
            Some(record) => record,
            None => {
                let now = Utc::now();
                self.registry.insert_pending(KeyRecord {
                    key_id: key_id.clone(),
                    tenant_id: tenant.clone(),
                    algorithm: KeyAlgorithm::EcdsaP256,
                    status: KeyStatus::Pending,
                    hsm_handle: None,
                    certificate_id: None,
                    label: Some(self.config.issuer_key_label.clone()),
                    rotated_from: None,
                    status_reason: None,
                    created_at: now,
                    updated_at: now,
                    last_used_at: None,
                })?
            }
        };

        if record.status == KeyStatus::Active {
            let handle = record
                .hsm_handle
                .clone()
                .ok_or_else(|| issuance("issuer key", "active issuer has no HSM handle"))?;
            *self.issuer.write() = Some(Issuer {
                key_id,
                handle,
                name: self.config.issuer_name.clone(),
            });
            return Ok(None);
        }
        if record.status != KeyStatus::Pending {
            return Err(GatewayError::issuance(format!(
                "issuer key {} is {:?}",
                key_id, record.status
            )));
        }

        if record.hsm_handle.is_none() {
            let call = self
                .hsm
                .generate_key(&KeyGenParams {
                    algorithm: KeyAlgorithm::EcdsaP256,
                    label: self.config.issuer_key_label.clone(),
                })
                .await;
            let generated = call.result.map_err(|e| issuance("issuer key generation", e))?;
            record = self.registry.attach_handle(&key_id, generated.handle)?;
        }
        let handle = record
            .hsm_handle
            .clone()
            .ok_or_else(|| issuance("issuer key", "missing HSM handle"))?;

        let issuer = Issuer { key_id: key_id.clone(), handle, name: self.config.issuer_name.clone() };
        let certificate = self
            .build_and_sign(&issuer, &record, &issuer.name, None, None)
            .await?;
        self.store.write().insert(certificate.clone())?;
        self.registry.attach_certificate(&key_id, certificate.certificate_id.clone())?;
        self.registry.transition(&key_id, KeyStatus::Active, Some("issuer bootstrap".into()))?;
        *self.issuer.write() = Some(issuer);

        info!(
            key_id = %key_id,
            certificate_id = %certificate.certificate_id,
            serial = %certificate.serial_number,
            "issuer key bootstrapped"
        );
        Ok(Some(certificate))
    }

    fn current_issuer(&self) -> Result<Issuer> {
        self.issuer
            .read()
            .clone()
            .ok_or_else(|| GatewayError::issuance("certificate authority has not been bootstrapped"))
    }

    /// Issue a certificate for `key`. Re-issuing under the same request id
    /// returns the certificate issued the first time.
    pub async fn issue(
        &self,
        key: &KeyRecord,
        request_id: &RequestId,
        supersedes: Option<CertificateId>,
    ) -> Result<CertificateRecord> {
        if let Some(existing) = self.by_request(request_id) {
            if existing.key_id == key.key_id {
                debug!(request_id = %request_id, certificate_id = %existing.certificate_id, "certificate already issued");
                return Ok(existing);
            }
        }
        if key.status.is_terminal() {
            return Err(GatewayError::issuance(format!("key {} is revoked", key.key_id)));
        }

        let issuer = self.current_issuer()?;
        let subject = format!(
            "CN={},O={}",
            escape_dn_value(key.key_id.as_str()),
            escape_dn_value(key.tenant_id.as_str())
        );
        let record = self
            .build_and_sign(&issuer, key, &subject, supersedes, Some(request_id.clone()))
            .await?;
        self.store.write().insert(record.clone())?;

        info!(
            key_id = %key.key_id,
            certificate_id = %record.certificate_id,
            supersedes = ?record.supersedes,
            "certificate issued"
        );
        Ok(record)
    }

    /// Issue a successor to the key's live certificate.
    pub async fn renew(&self, key: &KeyRecord, request_id: &RequestId) -> Result<CertificateRecord> {
        let previous = key
            .certificate_id
            .clone()
            .ok_or_else(|| GatewayError::issuance(format!("key {} has no certificate to renew", key.key_id)))?;
        self.issue(key, request_id, Some(previous)).await
    }

    async fn build_and_sign(
        &self,
        issuer: &Issuer,
        key: &KeyRecord,
        subject: &str,
        supersedes: Option<CertificateId>,
        request_id: Option<RequestId>,
    ) -> Result<CertificateRecord> {
        let handle = key
            .hsm_handle
            .as_ref()
            .ok_or_else(|| GatewayError::issuance(format!("key {} has no HSM handle", key.key_id)))?;

        let export = self.hsm.export_public_key(handle).await;
        let spki_der = export.result.map_err(|e| issuance("public key export failed", e))?;
        let subject_public_key_info =
            SubjectPublicKeyInfoOwned::from_der(&spki_der).map_err(|e| issuance("public key decode", e))?;

        let issued_at = Utc::now();
        let not_before = whole_seconds(issued_at);
        let not_after = not_before + chrono::Duration::days(i64::from(self.config.validity_days));
        let (serial_number, serial_hex) = random_serial()?;
        let signature_algorithm = AlgorithmIdentifierOwned { oid: ECDSA_WITH_SHA256, parameters: None };

        let tbs: TbsCertificate = TbsCertificate {
            version: Version::V3,
            serial_number,
            signature: signature_algorithm.clone(),
            issuer: Name::from_str(&issuer.name).map_err(|e| issuance("issuer name", e))?,
            validity: Validity { not_before: der_time(not_before)?, not_after: der_time(not_after)? },
            subject: Name::from_str(subject).map_err(|e| issuance("subject name", e))?,
            subject_public_key_info,
            issuer_unique_id: None,
            subject_unique_id: None,
            extensions: None,
        };

        let tbs_der = tbs.to_der().map_err(|e| issuance("TBS encoding", e))?;
        let digest = sha256(&tbs_der);
        let signed = self.hsm.sign(&issuer.handle, KeyAlgorithm::EcdsaP256, &digest).await;
        let signature = signed.result.map_err(|e| issuance("issuer signature", e))?;

        let certificate = Certificate {
            tbs_certificate: tbs,
            signature_algorithm,
            signature: BitString::from_bytes(&signature).map_err(|e| issuance("signature encoding", e))?,
        };
        let der = certificate.to_der().map_err(|e| issuance("certificate encoding", e))?;
        let pem = certificate.to_pem(LineEnding::LF).map_err(|e| issuance("PEM encoding", e))?;

        if issuer.key_id == key.key_id {
            debug!(key_id = %key.key_id, "self-signed issuer certificate built");
        }

        Ok(CertificateRecord {
            certificate_id: CertificateId::new(format!("cert-{}", uuid::Uuid::new_v4())),
            key_id: key.key_id.clone(),
            issuer: issuer.name.clone(),
            subject: subject.to_string(),
            not_before,
            not_after,
            serial_number: serial_hex,
            pem,
            fingerprint: hex::encode(sha256(&der)),
            supersedes,
            request_id,
            issued_at,
        })
    }

    pub fn get(&self, certificate_id: &CertificateId) -> Option<CertificateRecord> {
        self.store.read().certificates.get(certificate_id).cloned()
    }

    pub fn by_request(&self, request_id: &RequestId) -> Option<CertificateRecord> {
        let store = self.store.read();
        store
            .by_request
            .get(request_id)
            .and_then(|id| store.certificates.get(id))
            .cloned()
    }

    /// Every certificate ever issued for `key_id`, oldest first.
    pub fn history(&self, key_id: &KeyId) -> Vec<CertificateRecord> {
        let mut history: Vec<CertificateRecord> = self
            .store
            .read()
            .certificates
            .values()
            .filter(|c| &c.key_id == key_id)
            .cloned()
            .collect();
        history.sort_by(|a, b| a.issued_at.cmp(&b.issued_at));
        history
    }

    pub fn issuer_certificate(&self) -> Option<CertificateRecord> {
        let record = self.registry.get(&self.issuer_key_id())?;
        match record.certificate_id {
            Some(id) => self.get(&id),
            None => {
                warn!(key_id = %record.key_id, "issuer key has no certificate");
                None
            }
        }
    }
}
