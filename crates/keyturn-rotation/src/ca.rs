//! CA key material, identity issuance and presented-credential verification.
//!
//! Each CA type owns one or two ECDSA P-256 key pairs generated with `rcgen`.
//! Issued identities carry their subject in the CN, the issuing CA type in
//! the O attribute (`keyturn-<type>`) and their role in the OU attribute.

use std::time::Duration;

use chrono::{DateTime, Utc};
use ::time::OffsetDateTime;
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose};
use x509_parser::prelude::*;

use crate::error::RotationError;
use crate::state::{pem_to_der, AgentRole, CaType, Certificate};

/// CA certificate validity period.
const CA_VALIDITY_DAYS: i64 = 3650;

/// Issued certificates start this far in the past to absorb clock skew.
const BACKDATE_SECS: i64 = 60;

const ORG_PREFIX: &str = "keyturn-";

/// A CA key pair with its self-signed certificate.
pub struct CaKeyPair {
    key: KeyPair,
    cert: rcgen::Certificate,
    public: Certificate,
}

impl std::fmt::Debug for CaKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaKeyPair")
            .field("fingerprint", &self.public.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Output of [`CaKeyPair::issue`].
#[derive(Debug, Clone)]
pub struct IssuedCredential {
    pub certificate_pem: String,
    pub private_key_pem: String,
    pub issuer_fingerprint: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Claims read from an identity certificate without checking its signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialClaims {
    pub subject: String,
    pub role: AgentRole,
    pub ca_type: CaType,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

/// A presented identity certificate that chains to a trusted CA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedCredential {
    pub subject: String,
    pub role: AgentRole,
    pub ca_type: CaType,
    pub issuer_fingerprint: String,
    pub expires_at: DateTime<Utc>,
}

impl CaKeyPair {
    /// Generate a fresh key pair and self-signed CA certificate.
    pub fn generate(ca_type: CaType, cluster: &str) -> Result<Self, RotationError> {
        let key = KeyPair::generate()?;

        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, format!("{cluster} {ca_type} CA"));
        params
            .distinguished_name
            .push(DnType::OrganizationName, format!("{ORG_PREFIX}{ca_type}"));
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let now = Utc::now().timestamp();
        params.not_before = offset_time(now - BACKDATE_SECS)?;
        params.not_after = offset_time(now + CA_VALIDITY_DAYS * 86_400)?;

        let cert = params.self_signed(&key)?;
        let public = Certificate::from_pem(cert.pem())?;

        tracing::debug!(%ca_type, fingerprint = %public.fingerprint, "CA key pair generated");
        Ok(Self { key, cert, public })
    }

    /// Public half of this pair.
    pub fn certificate(&self) -> &Certificate {
        &self.public
    }

    /// Issue an identity certificate with a freshly generated key.
    pub fn issue(
        &self,
        subject: &str,
        role: AgentRole,
        ca_type: CaType,
        ttl: Duration,
    ) -> Result<IssuedCredential, RotationError> {
        if subject.trim().is_empty() {
            return Err(RotationError::InvalidRequest("subject must not be empty".into()));
        }
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| RotationError::InvalidRequest(format!("certificate ttl: {e}")))?;

        let leaf_key = KeyPair::generate()?;

        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, subject);
        params
            .distinguished_name
            .push(DnType::OrganizationName, format!("{ORG_PREFIX}{ca_type}"));
        params
            .distinguished_name
            .push(DnType::OrganizationalUnitName, role.as_str());
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];

        let issued_at = DateTime::<Utc>::from_timestamp(Utc::now().timestamp(), 0)
            .ok_or_else(|| RotationError::Internal("clock out of range".into()))?;
        let expires_at = issued_at + ttl;
        params.not_before = offset_time(issued_at.timestamp() - BACKDATE_SECS)?;
        params.not_after = offset_time(expires_at.timestamp())?;

        let leaf = params.signed_by(&leaf_key, &self.cert, &self.key)?;

        Ok(IssuedCredential {
            certificate_pem: leaf.pem(),
            private_key_pem: leaf_key.serialize_pem(),
            issuer_fingerprint: self.public.fingerprint.clone(),
            issued_at,
            expires_at,
        })
    }
}

fn offset_time(unix: i64) -> Result<OffsetDateTime, RotationError> {
    OffsetDateTime::from_unix_timestamp(unix)
        .map_err(|e| RotationError::Internal(format!("timestamp out of range: {e}")))
}

fn timestamp(unix: i64) -> Result<DateTime<Utc>, RotationError> {
    DateTime::<Utc>::from_timestamp(unix, 0)
        .ok_or_else(|| RotationError::Certificate(format!("timestamp {unix} out of range")))
}

/// Read subject, role and CA type from an identity certificate.
pub fn inspect(certificate_pem: &str) -> Result<CredentialClaims, RotationError> {
    let der = pem_to_der(certificate_pem)?;
    let (_, cert) = X509Certificate::from_der(&der)
        .map_err(|e| RotationError::Certificate(format!("failed to parse certificate: {e}")))?;

    let subject_name = cert.subject();
    let subject = first_attr(subject_name.iter_common_name())
        .ok_or_else(|| RotationError::CredentialRejected("certificate has no CN".into()))?;
    let role = first_attr(subject_name.iter_organizational_unit())
        .ok_or_else(|| RotationError::CredentialRejected("certificate has no role".into()))?
        .parse::<AgentRole>()
        .map_err(RotationError::CredentialRejected)?;
    let ca_type = first_attr(subject_name.iter_organization())
        .and_then(|org| org.strip_prefix(ORG_PREFIX).map(str::to_string))
        .ok_or_else(|| RotationError::CredentialRejected("certificate has no CA type".into()))?
        .parse::<CaType>()
        .map_err(RotationError::CredentialRejected)?;

    Ok(CredentialClaims {
        subject,
        role,
        ca_type,
        not_before: timestamp(cert.validity().not_before.timestamp())?,
        not_after: timestamp(cert.validity().not_after.timestamp())?,
    })
}

fn first_attr<'a, 'b: 'a>(
    mut attrs: impl Iterator<Item = &'a AttributeTypeAndValue<'b>>,
) -> Option<String> {
    attrs
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_string)
}

/// Check that `certificate_pem` is currently valid and signed by one of
/// `trusted`. The matching anchor's fingerprint is reported as the issuer.
pub fn verify_credential(
    certificate_pem: &str,
    trusted: &[Certificate],
    now: DateTime<Utc>,
) -> Result<VerifiedCredential, RotationError> {
    let claims = inspect(certificate_pem)?;

    if now < claims.not_before {
        return Err(RotationError::CredentialRejected(
            "certificate not yet valid".into(),
        ));
    }
    if now > claims.not_after {
        return Err(RotationError::CredentialRejected("certificate expired".into()));
    }

    let der = pem_to_der(certificate_pem)?;
    let (_, cert) = X509Certificate::from_der(&der)
        .map_err(|e| RotationError::Certificate(format!("failed to parse certificate: {e}")))?;

    for anchor in trusted {
        let anchor_der = anchor.der()?;
        let Ok((_, anchor_cert)) = X509Certificate::from_der(&anchor_der) else {
            tracing::warn!(fingerprint = %anchor.fingerprint, "Skipping unparseable trust anchor");
            continue;
        };
        if cert.verify_signature(Some(anchor_cert.public_key())).is_ok() {
            return Ok(VerifiedCredential {
                subject: claims.subject,
                role: claims.role,
                ca_type: claims.ca_type,
                issuer_fingerprint: anchor.fingerprint.clone(),
                expires_at: claims.not_after,
            });
        }
    }

    Err(RotationError::CredentialRejected(
        "certificate not signed by any trusted CA".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn generated_pairs_are_distinct() {
        let a = CaKeyPair::generate(CaType::Host, "test").unwrap();
        let b = CaKeyPair::generate(CaType::Host, "test").unwrap();
        assert_ne!(a.certificate().fingerprint, b.certificate().fingerprint);
        assert!(a.certificate().pem.contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn issued_certificate_carries_claims() {
        let ca = CaKeyPair::generate(CaType::Host, "test").unwrap();
        let issued = ca.issue("node-1", AgentRole::Server, CaType::Host, HOUR).unwrap();

        assert!(issued.private_key_pem.contains("PRIVATE KEY"));
        assert_eq!(issued.issuer_fingerprint, ca.certificate().fingerprint);
        assert_eq!((issued.expires_at - issued.issued_at).num_seconds(), 3600);

        let claims = inspect(&issued.certificate_pem).unwrap();
        assert_eq!(claims.subject, "node-1");
        assert_eq!(claims.role, AgentRole::Server);
        assert_eq!(claims.ca_type, CaType::Host);
        assert_eq!(claims.not_after, issued.expires_at);
    }

    #[test]
    fn verification_reports_the_signing_anchor() {
        let old = CaKeyPair::generate(CaType::User, "test").unwrap();
        let new = CaKeyPair::generate(CaType::User, "test").unwrap();
        let issued = new.issue("alice", AgentRole::Client, CaType::User, HOUR).unwrap();

        let trusted = vec![old.certificate().clone(), new.certificate().clone()];
        let verified = verify_credential(&issued.certificate_pem, &trusted, Utc::now()).unwrap();
        assert_eq!(verified.issuer_fingerprint, new.certificate().fingerprint);
        assert_eq!(verified.subject, "alice");
        assert_eq!(verified.role, AgentRole::Client);
    }

    #[test]
    fn foreign_signature_is_rejected() {
        let ours = CaKeyPair::generate(CaType::Host, "test").unwrap();
        let theirs = CaKeyPair::generate(CaType::Host, "other").unwrap();
        let issued = theirs.issue("mallory", AgentRole::Server, CaType::Host, HOUR).unwrap();

        let err = verify_credential(
            &issued.certificate_pem,
            &[ours.certificate().clone()],
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, RotationError::CredentialRejected(_)));
    }

    #[test]
    fn expired_certificate_is_rejected() {
        let ca = CaKeyPair::generate(CaType::Host, "test").unwrap();
        let issued = ca.issue("node-1", AgentRole::Client, CaType::Host, HOUR).unwrap();

        let later = Utc::now() + chrono::Duration::hours(2);
        let err = verify_credential(&issued.certificate_pem, &[ca.certificate().clone()], later)
            .unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn empty_subject_is_refused() {
        let ca = CaKeyPair::generate(CaType::Host, "test").unwrap();
        assert!(matches!(
            ca.issue("  ", AgentRole::Client, CaType::Host, HOUR),
            Err(RotationError::InvalidRequest(_))
        ));
    }

    #[test]
    fn validity_bounds_are_unix_seconds() {
        let t = offset_time(1_700_000_000).unwrap();
        assert_eq!(t.unix_timestamp(), 1_700_000_000);
        assert!(offset_time(i64::MAX).is_err());
    }

    #[test]
    fn garbage_pem_is_a_certificate_error() {
        assert!(matches!(
            inspect("not a pem"),
            Err(RotationError::Certificate(_))
        ));
    }
}
