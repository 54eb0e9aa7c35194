//! Certificate chain verification against a per-key trust pool.
//!
//! Each presented certificate is a candidate leaf; the other presented
//! certificates may serve as intermediates, but the key's trust pool
//! supplies the only acceptable roots. Verification is standard webpki
//! path validation (signature chain, validity windows, basic
//! constraints) with **no** server-name matching: these are client
//! authentication certificates and carry no meaningful DNS identity.
//!
//! An empty pool fails every candidate. "No roots configured" must never
//! degrade into "accept anything".

use std::fmt;

use rustls::pki_types::{CertificateDer, TrustAnchor, UnixTime};
use webpki::{EndEntityCert, KeyUsage};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::{Error, Result};

/// A verified certificate chain, ordered leaf to trusted root.
#[derive(Debug, Clone)]
pub struct VerifiedChain {
    certs: Vec<CertificateDer<'static>>,
}

impl VerifiedChain {
    /// The client-presented leaf certificate, the authorizing identity.
    #[must_use]
    pub fn leaf(&self) -> &CertificateDer<'static> {
        &self.certs[0]
    }

    /// All certificates in the chain, leaf first.
    #[must_use]
    pub fn certs(&self) -> &[CertificateDer<'static>] {
        &self.certs
    }
}

impl fmt::Display for VerifiedChain {
    /// Human-readable arrow-joined rendering, e.g.
    /// `(0x3f21ab09 O=Example N=client) -> (0x90ee12c4 O=Example N=root)`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let labels: Vec<String> = self.certs.iter().map(|c| cert_label(c)).collect();
        write!(f, "{}", labels.join(" -> "))
    }
}

/// Why one presented certificate failed to verify. Server-side
/// diagnostics only; callers see a single generic rejection.
#[derive(Debug)]
pub struct VerifyFailure {
    /// Position of the candidate in the presented sequence.
    pub index: usize,
    /// Label of the candidate (signature prefix + subject).
    pub cert: String,
    /// Verification error text.
    pub reason: String,
}

/// Verify every presented certificate against the trust pool.
///
/// Returns the union of chains produced by all candidates that verify
/// (first successful candidate first), plus a failure record per
/// candidate that did not. An empty chain list is a normal outcome, not
/// an error; the only error here is a trust pool whose certificates
/// cannot act as anchors, which the per-key load already rules out.
pub fn verify_chains(
    presented: &[CertificateDer<'static>],
    trust_pool: &[CertificateDer<'static>],
) -> Result<(Vec<VerifiedChain>, Vec<VerifyFailure>)> {
    let anchors: Vec<TrustAnchor<'_>> = trust_pool
        .iter()
        .map(|cert| {
            webpki::anchor_from_trusted_cert(cert)
                .map_err(|e| Error::Config(format!("Unusable trust root: {e:?}")))
        })
        .collect::<Result<_>>()?;

    let algorithms = rustls::crypto::aws_lc_rs::default_provider()
        .signature_verification_algorithms
        .all;
    let now = UnixTime::now();
    let mut chains = Vec::new();
    let mut failures = Vec::new();

    for (index, candidate) in presented.iter().enumerate() {
        let leaf = match EndEntityCert::try_from(candidate) {
            Ok(leaf) => leaf,
            Err(e) => {
                failures.push(VerifyFailure {
                    index,
                    cert: cert_label(candidate),
                    reason: format!("not a usable end-entity certificate: {e:?}"),
                });
                continue;
            }
        };

        // Everything else the client presented may act as an intermediate
        // for this candidate.
        let intermediates: Vec<CertificateDer<'static>> = presented
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != index)
            .map(|(_, c)| c.clone())
            .collect();

        match leaf.verify_for_usage(
            algorithms,
            &anchors,
            &intermediates,
            now,
            KeyUsage::client_auth(),
            None,
            None,
        ) {
            Ok(path) => {
                let mut certs = vec![candidate.clone()];
                certs.extend(path.intermediate_certificates().map(|c| c.der().into_owned()));
                if let Some(root) = find_anchor_cert(path.anchor(), trust_pool) {
                    // The leaf may be its own anchor (self-signed roots in
                    // the pool); avoid listing it twice.
                    if root.as_ref() != candidate.as_ref() {
                        certs.push(root.clone());
                    }
                }
                chains.push(VerifiedChain { certs });
            }
            Err(e) => failures.push(VerifyFailure {
                index,
                cert: cert_label(candidate),
                reason: format!("{e:?}"),
            }),
        }
    }

    Ok((chains, failures))
}

/// Map a verified path's anchor back to the pool certificate it came from.
fn find_anchor_cert<'a>(
    anchor: &TrustAnchor<'_>,
    trust_pool: &'a [CertificateDer<'static>],
) -> Option<&'a CertificateDer<'static>> {
    trust_pool.iter().find(|cert| {
        webpki::anchor_from_trusted_cert(cert).is_ok_and(|a| {
            a.subject == anchor.subject
                && a.subject_public_key_info == anchor.subject_public_key_info
        })
    })
}

/// `(0x<8-hex-chars-of-signature> <subject>)` label for log lines and
/// chain rendering.
#[must_use]
pub fn cert_label(der: &CertificateDer<'_>) -> String {
    let sig = signature_hex(der);
    let prefix: String = sig.chars().take(8).collect();
    format!("(0x{prefix} {})", subject_string(der))
}

/// Hex encoding of the certificate's signature value, used as a stable
/// fingerprint in hook environment and notifications.
#[must_use]
pub fn signature_hex(der: &CertificateDer<'_>) -> String {
    match X509Certificate::from_der(der.as_ref()) {
        Ok((_, cert)) => hex::encode(cert.signature_value.data.as_ref()),
        Err(_) => String::new(),
    }
}

/// Human-friendly subject rendering: `C=.. O=.. OU=.. N=<common name>`.
#[must_use]
pub fn subject_string(der: &CertificateDer<'_>) -> String {
    let Ok((_, cert)) = X509Certificate::from_der(der.as_ref()) else {
        return "<unparseable>".to_string();
    };

    let subject = cert.subject();
    let mut parts = Vec::new();
    for attr in subject.iter_country().filter_map(|a| a.as_str().ok()) {
        parts.push(format!("C={attr}"));
    }
    for attr in subject.iter_organization().filter_map(|a| a.as_str().ok()) {
        parts.push(format!("O={attr}"));
    }
    for attr in subject
        .iter_organizational_unit()
        .filter_map(|a| a.as_str().ok())
    {
        parts.push(format!("OU={attr}"));
    }
    for attr in subject.iter_common_name().filter_map(|a| a.as_str().ok()) {
        parts.push(format!("N={attr}"));
    }

    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{
        BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    };

    // ── helpers ──────────────────────────────────────────────────────────

    /// Self-signed cert with the given CN, returned as owned DER.
    fn self_signed(cn: &str) -> CertificateDer<'static> {
        let key_pair = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, "kexd-test");
        dn.push(DnType::CommonName, cn);
        params.distinguished_name = dn;
        let cert = params.self_signed(&key_pair).unwrap();
        cert.der().clone().into_owned()
    }

    /// CA plus a leaf signed by it, both as owned DER.
    fn ca_and_leaf(ca_cn: &str, leaf_cn: &str) -> (CertificateDer<'static>, CertificateDer<'static>) {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, ca_cn);
        ca_params.distinguished_name = dn;
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca = ca_params.self_signed(&ca_key).unwrap();
        let ca_der = ca.der().clone().into_owned();
        let issuer = rcgen::Issuer::new(ca_params, ca_key);

        let leaf_key = KeyPair::generate().unwrap();
        let mut leaf_params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, leaf_cn);
        leaf_params.distinguished_name = dn;
        let leaf = leaf_params.signed_by(&leaf_key, &issuer).unwrap();

        (ca_der, leaf.der().clone().into_owned())
    }

    // ── verification ─────────────────────────────────────────────────────

    #[test]
    fn self_signed_cert_verifies_against_itself_in_pool() {
        // GIVEN: pool containing exactly the presented cert
        let x = self_signed("client-x");
        let (chains, failures) = verify_chains(&[x.clone()], &[x.clone()]).unwrap();

        // THEN: one chain, leaf is the presented cert
        assert_eq!(chains.len(), 1);
        assert!(failures.is_empty());
        assert_eq!(chains[0].leaf().as_ref(), x.as_ref());
    }

    #[test]
    fn unrelated_cert_does_not_verify() {
        let x = self_signed("client-x");
        let y = self_signed("client-y");
        let (chains, failures) = verify_chains(&[y], &[x]).unwrap();

        assert!(chains.is_empty());
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].index, 0);
    }

    #[test]
    fn empty_trust_pool_rejects_everything() {
        // "No roots configured" must never mean "accept any certificate"
        let x = self_signed("client-x");
        let (chains, failures) = verify_chains(&[x], &[]).unwrap();
        assert!(chains.is_empty());
        assert_eq!(failures.len(), 1);
    }

    #[test]
    fn ca_signed_leaf_chains_to_pool_root() {
        // GIVEN: pool holds the CA, client presents the leaf
        let (ca, leaf) = ca_and_leaf("test-root", "test-client");
        let (chains, failures) = verify_chains(&[leaf.clone()], &[ca.clone()]).unwrap();

        // THEN: chain runs leaf -> root
        assert!(failures.is_empty());
        assert_eq!(chains.len(), 1);
        let certs = chains[0].certs();
        assert_eq!(certs.first().unwrap().as_ref(), leaf.as_ref());
        assert_eq!(certs.last().unwrap().as_ref(), ca.as_ref());
        assert_eq!(certs.len(), 2);
    }

    #[test]
    fn only_second_presented_cert_verifies() {
        // GIVEN: first presented cert is unrelated, second is trusted
        let x = self_signed("trusted");
        let y = self_signed("stranger");
        let (chains, failures) = verify_chains(&[y, x.clone()], &[x.clone()]).unwrap();

        // THEN: success comes from the second candidate
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0].leaf().as_ref(), x.as_ref());
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].index, 0);
    }

    #[test]
    fn both_presented_certs_can_verify_independently() {
        // Primary and backup client certificates both in the pool
        let a = self_signed("primary");
        let b = self_signed("backup");
        let (chains, failures) =
            verify_chains(&[a.clone(), b.clone()], &[a.clone(), b.clone()]).unwrap();

        assert_eq!(chains.len(), 2);
        assert!(failures.is_empty());
        assert_eq!(chains[0].leaf().as_ref(), a.as_ref());
        assert_eq!(chains[1].leaf().as_ref(), b.as_ref());
    }

    #[test]
    fn garbage_der_is_reported_not_fatal() {
        let x = self_signed("client-x");
        let garbage = CertificateDer::from(b"not a certificate".to_vec());
        let (chains, failures) = verify_chains(&[garbage, x.clone()], &[x.clone()]).unwrap();

        assert_eq!(chains.len(), 1);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].index, 0);
    }

    // ── rendering ────────────────────────────────────────────────────────

    #[test]
    fn cert_label_contains_signature_prefix_and_subject() {
        let x = self_signed("render-me");
        let label = cert_label(&x);
        assert!(label.starts_with("(0x"), "label was {label}");
        assert!(label.contains("N=render-me"), "label was {label}");
        assert!(label.contains("O=kexd-test"), "label was {label}");
    }

    #[test]
    fn chain_display_joins_labels_with_arrows() {
        let (ca, leaf) = ca_and_leaf("display-root", "display-client");
        let (chains, _) = verify_chains(&[leaf], &[ca]).unwrap();
        let rendered = chains[0].to_string();
        assert!(rendered.contains(" -> "), "rendered was {rendered}");
        assert!(rendered.contains("N=display-client"));
        assert!(rendered.contains("N=display-root"));
    }

    #[test]
    fn signature_hex_is_stable_and_nonempty() {
        let x = self_signed("sig");
        let first = signature_hex(&x);
        assert!(!first.is_empty());
        assert_eq!(first, signature_hex(&x));
    }
}
