//! Per-cluster certificate authority
//!
//! ## Overview
//! - Self-signed ECDSA P-384 root generated on first use per cluster
//! - Server and client certificate issuance with monotone serials
//! - Rotation with a retiring overlap window and trust-anchor publication
//! - Idempotent revocation into the CRL
//!
//! Private-key material flows only through the [`SecretSink`] interface;
//! the component hands leaf keys to the requester once and never persists
//! them itself.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose, PKCS_ECDSA_P384_SHA384, SanType, SerialNumber,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use crate::error::{ControlError, Result};
use crate::store::Store;

/// Root CA validity; issued certificates must fit inside the remainder.
const CA_VALIDITY_DAYS: i64 = 3650;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaStatus {
    Active,
    Retiring,
    Retired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaRecord {
    pub id: String,
    pub cluster_id: String,
    pub status: CaStatus,
    pub cert_pem: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub serial_counter: u64,
    pub rotated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertUsage {
    Server,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertStatus {
    Issued,
    Rotated,
    Revoked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub id: String,
    pub cluster_id: String,
    pub ca_id: String,
    pub subject: String,
    pub sans: Vec<String>,
    pub usage: CertUsage,
    pub serial: u64,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub status: CertStatus,
    pub cert_pem: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrlEntry {
    pub ca_id: String,
    pub serial: u64,
    pub reason: String,
    pub revoked_at: DateTime<Utc>,
}

/// An issued certificate together with its one-time private key.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedCertificate {
    pub record: CertificateRecord,
    pub certificate_pem: String,
    pub private_key_pem: String,
}

/// Pluggable private-key storage. Deployment config selects the backend;
/// external secret services and KMS implement this same interface.
#[async_trait]
pub trait SecretSink: Send + Sync {
    async fn put(&self, name: &str, value: &[u8]) -> Result<()>;
    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>>;
}

/// Volatile sink for embedded deployments and tests.
#[derive(Default)]
pub struct MemorySink {
    entries: DashMap<String, Vec<u8>>,
}

impl MemorySink {
    pub fn new() -> Self {
        MemorySink::default()
    }
}

#[async_trait]
impl SecretSink for MemorySink {
    async fn put(&self, name: &str, value: &[u8]) -> Result<()> {
        self.entries.insert(name.to_string(), value.to_vec());
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(name).map(|v| v.value().clone()))
    }
}

/// Local file sink; one file per secret under the configured directory.
pub struct FileSink {
    dir: PathBuf,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileSink { dir: dir.into() }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        // Secret names may contain `/` separators; flatten them.
        self.dir.join(name.replace('/', "_"))
    }
}

#[async_trait]
impl SecretSink for FileSink {
    async fn put(&self, name: &str, value: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| ControlError::KeyStore(e.to_string()))?;
        tokio::fs::write(self.path_for(name), value)
            .await
            .map_err(|e| ControlError::KeyStore(e.to_string()))
    }

    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(name)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ControlError::KeyStore(e.to_string())),
        }
    }
}

/// Resolve a `secret_sink` URI from configuration.
pub fn open_sink(uri: &str) -> Result<Arc<dyn SecretSink>> {
    if uri == "memory:" {
        Ok(Arc::new(MemorySink::new()))
    } else if let Some(dir) = uri.strip_prefix("file:") {
        Ok(Arc::new(FileSink::new(dir)))
    } else {
        Err(ControlError::invalid_field(
            "secret_sink",
            format!("unsupported sink `{uri}`"),
        ))
    }
}

pub struct CertificateAuthority {
    store: Arc<dyn Store>,
    sink: Arc<dyn SecretSink>,
    overlap: Duration,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CertificateAuthority {
    pub fn new(store: Arc<dyn Store>, sink: Arc<dyn SecretSink>, overlap: std::time::Duration) -> Self {
        CertificateAuthority {
            store,
            sink,
            overlap: Duration::from_std(overlap).unwrap_or_else(|_| Duration::days(60)),
            locks: DashMap::new(),
        }
    }

    fn cluster_lock(&self, cluster_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(cluster_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn key_name(ca_id: &str) -> String {
        format!("ca/{ca_id}/key.pem")
    }

    /// Returns the active CA for the cluster, generating one on first use.
    pub async fn ensure_ca(&self, cluster_id: &str) -> Result<CaRecord> {
        if let Some(ca) = self.store.active_ca(cluster_id).await? {
            return Ok(ca);
        }
        let lock = self.cluster_lock(cluster_id);
        let _guard = lock.lock().await;
        // Re-check under the lock; another task may have won the race.
        if let Some(ca) = self.store.active_ca(cluster_id).await? {
            return Ok(ca);
        }
        self.generate_ca(cluster_id).await
    }

    async fn generate_ca(&self, cluster_id: &str) -> Result<CaRecord> {
        let key = KeyPair::generate_for(&PKCS_ECDSA_P384_SHA384)
            .map_err(|e| ControlError::Internal(format!("ca keygen: {e}")))?;

        let now = Utc::now();
        let not_after = now + Duration::days(CA_VALIDITY_DAYS);

        let mut params = CertificateParams::default();
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, format!("fleetplane cluster {cluster_id} root"));
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.not_before = to_offset(now)?;
        params.not_after = to_offset(not_after)?;

        let cert = params
            .self_signed(&key)
            .map_err(|e| ControlError::Internal(format!("ca self-sign: {e}")))?;

        let ca = CaRecord {
            id: uuid::Uuid::new_v4().to_string(),
            cluster_id: cluster_id.to_string(),
            status: CaStatus::Active,
            cert_pem: cert.pem(),
            not_before: now,
            not_after,
            serial_counter: 0,
            rotated_at: None,
            created_at: now,
        };
        self.sink
            .put(&Self::key_name(&ca.id), key.serialize_pem().as_bytes())
            .await?;
        let ca = self.store.insert_ca(ca).await?;
        info!(cluster = cluster_id, ca = %ca.id, "generated cluster CA");
        Ok(ca)
    }

    pub async fn issue_server(
        &self,
        cluster_id: &str,
        subject: &str,
        sans: &[String],
        validity: std::time::Duration,
    ) -> Result<IssuedCertificate> {
        if subject.is_empty() {
            return Err(ControlError::invalid_field("subject", "subject is empty"));
        }
        if sans.is_empty() {
            return Err(ControlError::invalid_field("sans", "SAN set is empty"));
        }
        self.issue(cluster_id, subject, sans, CertUsage::Server, validity)
            .await
    }

    pub async fn issue_client(
        &self,
        cluster_id: &str,
        subject: &str,
        validity: std::time::Duration,
    ) -> Result<IssuedCertificate> {
        if subject.is_empty() {
            return Err(ControlError::invalid_field("subject", "subject is empty"));
        }
        self.issue(cluster_id, subject, &[], CertUsage::Client, validity)
            .await
    }

    async fn issue(
        &self,
        cluster_id: &str,
        subject: &str,
        sans: &[String],
        usage: CertUsage,
        validity: std::time::Duration,
    ) -> Result<IssuedCertificate> {
        let validity = Duration::from_std(validity)
            .map_err(|_| ControlError::ValidityWindow("validity out of range".into()))?;

        let lock = self.cluster_lock(cluster_id);
        let _guard = lock.lock().await;

        let mut ca = match self.store.active_ca(cluster_id).await? {
            Some(ca) => ca,
            None => self.generate_ca(cluster_id).await?,
        };
        let now = Utc::now();
        if ca.not_after <= now {
            return Err(ControlError::CaExpired);
        }
        let not_after = now + validity;
        if not_after > ca.not_after {
            return Err(ControlError::ValidityWindow(format!(
                "requested validity ends {not_after}, CA expires {}",
                ca.not_after
            )));
        }

        // Serial increments inside the cluster lock; the store's uniqueness
        // check on (ca, serial) backstops it.
        ca.serial_counter += 1;
        let serial = ca.serial_counter;
        let ca = self.store.update_ca(ca).await?;

        let issuer_key_pem = self
            .sink
            .get(&Self::key_name(&ca.id))
            .await?
            .ok_or_else(|| ControlError::KeyStore(format!("missing key for ca {}", ca.id)))?;
        let issuer_key = KeyPair::from_pem(&String::from_utf8_lossy(&issuer_key_pem))
            .map_err(|e| ControlError::KeyStore(format!("ca key unusable: {e}")))?;
        let issuer_params = CertificateParams::from_ca_cert_pem(&ca.cert_pem)
            .map_err(|e| ControlError::KeyStore(format!("ca cert unusable: {e}")))?;
        let issuer = issuer_params
            .self_signed(&issuer_key)
            .map_err(|e| ControlError::Internal(format!("issuer rebuild: {e}")))?;

        let leaf_key = KeyPair::generate_for(&PKCS_ECDSA_P384_SHA384)
            .map_err(|e| ControlError::Internal(format!("leaf keygen: {e}")))?;

        let mut params = CertificateParams::default();
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, subject.to_string());
        params.serial_number = Some(SerialNumber::from(serial.to_be_bytes().to_vec()));
        params.not_before = to_offset(now)?;
        params.not_after = to_offset(not_after)?;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![match usage {
            CertUsage::Server => ExtendedKeyUsagePurpose::ServerAuth,
            CertUsage::Client => ExtendedKeyUsagePurpose::ClientAuth,
        }];
        for san in sans {
            let san_type = match san.parse::<std::net::IpAddr>() {
                Ok(ip) => SanType::IpAddress(ip),
                Err(_) => SanType::DnsName(san.clone().try_into().map_err(|_| {
                    ControlError::invalid_field("sans", format!("invalid SAN `{san}`"))
                })?),
            };
            params.subject_alt_names.push(san_type);
        }

        let cert = params
            .signed_by(&leaf_key, &issuer, &issuer_key)
            .map_err(|e| ControlError::Internal(format!("issuance: {e}")))?;

        let record = CertificateRecord {
            id: uuid::Uuid::new_v4().to_string(),
            cluster_id: cluster_id.to_string(),
            ca_id: ca.id.clone(),
            subject: subject.to_string(),
            sans: sans.to_vec(),
            usage,
            serial,
            not_before: now,
            not_after,
            status: CertStatus::Issued,
            cert_pem: cert.pem(),
        };
        let record = self.store.insert_certificate(record).await?;
        Ok(IssuedCertificate {
            certificate_pem: record.cert_pem.clone(),
            private_key_pem: leaf_key.serialize_pem(),
            record,
        })
    }

    /// Rotate the cluster's CA. The old root moves to `retiring` and stays
    /// trust-anchor-published for the overlap window.
    pub async fn rotate(&self, cluster_id: &str) -> Result<CaRecord> {
        let lock = self.cluster_lock(cluster_id);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let cas = self.store.list_cas(cluster_id).await?;
        let rotation_pending = cas.iter().any(|ca| {
            ca.status == CaStatus::Retiring
                && ca
                    .rotated_at
                    .is_some_and(|at| at + self.overlap > now)
        });
        if rotation_pending {
            return Err(ControlError::Conflict("CA rotation in progress".into()));
        }

        let current = self
            .store
            .active_ca(cluster_id)
            .await?
            .ok_or(ControlError::CaAbsent)?;
        let mut retiring = current;
        retiring.status = CaStatus::Retiring;
        retiring.rotated_at = Some(now);
        self.store.update_ca(retiring).await?;

        let fresh = self.generate_ca(cluster_id).await?;
        info!(cluster = cluster_id, ca = %fresh.id, "rotated cluster CA");
        Ok(fresh)
    }

    /// Append the certificate to the CRL and mark it revoked. Returns
    /// `false` when the certificate was already revoked.
    pub async fn revoke(&self, cluster_id: &str, cert_id: &str, reason: &str) -> Result<bool> {
        let lock = self.cluster_lock(cluster_id);
        let _guard = lock.lock().await;

        let mut cert = self.store.get_certificate(cluster_id, cert_id).await?;
        let appended = self
            .store
            .append_crl(CrlEntry {
                ca_id: cert.ca_id.clone(),
                serial: cert.serial,
                reason: reason.to_string(),
                revoked_at: Utc::now(),
            })
            .await?;
        if cert.status != CertStatus::Revoked {
            cert.status = CertStatus::Revoked;
            self.store.update_certificate(cert).await?;
        }
        Ok(appended)
    }

    /// Trust anchors for discovery: the active CA plus retiring CAs still
    /// inside the overlap window.
    pub async fn trust_anchors(&self, cluster_id: &str) -> Result<Vec<String>> {
        let now = Utc::now();
        let mut anchors: Vec<String> = self
            .store
            .list_cas(cluster_id)
            .await?
            .into_iter()
            .filter(|ca| match ca.status {
                CaStatus::Active => true,
                CaStatus::Retiring => ca.rotated_at.is_some_and(|at| at + self.overlap > now),
                CaStatus::Retired => false,
            })
            .map(|ca| ca.cert_pem)
            .collect();
        anchors.sort();
        Ok(anchors)
    }

    pub async fn crl(&self, cluster_id: &str) -> Result<Vec<CrlEntry>> {
        self.store.list_crl(cluster_id).await
    }

    /// True when the proxy's client certificate chains to a usable CA and
    /// has not expired or been revoked.
    pub async fn certificate_is_current(&self, cluster_id: &str, cert_id: &str) -> Result<bool> {
        let cert = self.store.get_certificate(cluster_id, cert_id).await?;
        Ok(cert.status == CertStatus::Issued && cert.not_after > Utc::now())
    }
}

fn to_offset(ts: DateTime<Utc>) -> Result<time::OffsetDateTime> {
    time::OffsetDateTime::from_unix_timestamp(ts.timestamp())
        .map_err(|e| ControlError::Internal(format!("timestamp conversion: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn authority() -> CertificateAuthority {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        CertificateAuthority::new(
            store,
            Arc::new(MemorySink::new()),
            std::time::Duration::from_secs(60 * 86_400),
        )
    }

    #[tokio::test]
    async fn first_use_generates_one_ca_and_reuses_it() {
        let ca = authority();
        let first = ca.ensure_ca("c1").await.unwrap();
        let second = ca.ensure_ca("c1").await.unwrap();
        assert_eq!(first.id, second.id);
        assert!(first.cert_pem.contains("BEGIN CERTIFICATE"));
    }

    #[tokio::test]
    async fn serials_are_monotone_and_unique() {
        let ca = authority();
        let validity = std::time::Duration::from_secs(86_400);
        let a = ca.issue_client("c1", "proxy-a", validity).await.unwrap();
        let b = ca.issue_client("c1", "proxy-b", validity).await.unwrap();
        let c = ca
            .issue_server("c1", "web", &["web.internal".into()], validity)
            .await
            .unwrap();
        assert_eq!(a.record.serial, 1);
        assert_eq!(b.record.serial, 2);
        assert_eq!(c.record.serial, 3);
        assert!(a.private_key_pem.contains("PRIVATE KEY"));
    }

    #[tokio::test]
    async fn validity_must_fit_inside_ca_window() {
        let ca = authority();
        let too_long = std::time::Duration::from_secs((CA_VALIDITY_DAYS as u64 + 10) * 86_400);
        let err = ca.issue_client("c1", "proxy-a", too_long).await.unwrap_err();
        assert!(matches!(err, ControlError::ValidityWindow(_)));
    }

    #[tokio::test]
    async fn server_issuance_requires_subject_and_sans() {
        let ca = authority();
        let validity = std::time::Duration::from_secs(3600);
        assert!(ca.issue_server("c1", "", &["a".into()], validity).await.is_err());
        assert!(ca.issue_server("c1", "web", &[], validity).await.is_err());
    }

    #[tokio::test]
    async fn rotation_publishes_both_anchors_then_conflicts_while_pending() {
        let ca = authority();
        ca.ensure_ca("c1").await.unwrap();
        let fresh = ca.rotate("c1").await.unwrap();
        assert_eq!(fresh.status, CaStatus::Active);

        let anchors = ca.trust_anchors("c1").await.unwrap();
        assert_eq!(anchors.len(), 2);

        let err = ca.rotate("c1").await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn revocation_is_idempotent() {
        let ca = authority();
        let issued = ca
            .issue_client("c1", "proxy-a", std::time::Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(ca.revoke("c1", &issued.record.id, "compromised").await.unwrap());
        assert!(!ca.revoke("c1", &issued.record.id, "compromised").await.unwrap());
        assert_eq!(ca.crl("c1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn file_sink_roundtrips_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path());
        sink.put("ca/abc/key.pem", b"secret material").await.unwrap();
        assert_eq!(
            sink.get("ca/abc/key.pem").await.unwrap().as_deref(),
            Some(&b"secret material"[..])
        );
        assert_eq!(sink.get("ca/missing/key.pem").await.unwrap(), None);

        // A second sink over the same directory sees the same material.
        let reopened = FileSink::new(dir.path());
        assert!(reopened.get("ca/abc/key.pem").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn issued_certificates_remain_valid_across_rotation() {
        let ca = authority();
        let issued = ca
            .issue_client("c1", "proxy-a", std::time::Duration::from_secs(3600))
            .await
            .unwrap();
        ca.rotate("c1").await.unwrap();
        assert!(ca.certificate_is_current("c1", &issued.record.id).await.unwrap());
    }
}
