//! OCSP and certificate primitives - RFC 6960
//!
//! Everything the cache engine needs from the PKI layer lives here:
//! certificate parsing, OCSP request encoding and decoding, and response
//! verification against a known issuer. The rest of the crate treats this
//! module as an opaque collaborator and never touches DER itself.
//!
//! Certificates are parsed with `x509-parser`; the OCSP structures use the
//! RustCrypto `der`/`x509-ocsp` stack; raw signature checks go through
//! `ring`.

use std::time::SystemTime;

use const_oid::db::{rfc5912, rfc6960, rfc8410};
use const_oid::ObjectIdentifier;
use der::asn1::{GeneralizedTime, OctetString};
use der::{Any, Decode, Encode};
use ring::signature;
use spki::AlgorithmIdentifierOwned;
use x509_cert::serial_number::SerialNumber;
use x509_ocsp::{
    BasicOcspResponse, CertId, OcspGeneralizedTime, OcspRequest, OcspResponse, OcspResponseStatus,
    Request as SingleRequest, ResponderId, TbsRequest, Version,
};
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::parse_x509_certificate;
use x509_parser::pem::parse_x509_pem;

use crate::error::CacheError;
use crate::fingerprint::{self, HashAlgorithm};

/// AIA access method for OCSP responders
const AIA_OCSP: &str = "1.3.6.1.5.5.7.48.1";
/// AIA access method for issuer certificates
const AIA_CA_ISSUERS: &str = "1.3.6.1.5.5.7.48.2";

/// Owned view of the issuer certificate fields that matter to the cache:
/// the raw subject for name hashing, the subjectPublicKey bits for key
/// hashing and signature checks, and the full DER for delegated-responder
/// validation.
#[derive(Debug, Clone)]
pub struct IssuerInfo {
    der: Vec<u8>,
    subject_der: Vec<u8>,
    key_bits: Vec<u8>,
}

impl IssuerInfo {
    /// Parse an issuer certificate from PEM or DER bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, CacheError> {
        let der = decode_pem_or_der(data)?;
        let (subject_der, key_bits) = {
            let (_, cert) = parse_x509_certificate(&der).map_err(|e| {
                CacheError::Config(format!("failed to parse issuer certificate: {e}"))
            })?;
            (
                cert.subject().as_raw().to_vec(),
                cert.public_key().subject_public_key.data.to_vec(),
            )
        };
        Ok(Self {
            der,
            subject_der,
            key_bits,
        })
    }

    /// Raw DER of the issuer subject name
    pub fn subject_der(&self) -> &[u8] {
        &self.subject_der
    }

    /// Contents of the issuer subjectPublicKey BIT STRING
    pub fn key_bits(&self) -> &[u8] {
        &self.key_bits
    }

    #[cfg(test)]
    pub(crate) fn for_tests(subject_der: Vec<u8>, key_bits: Vec<u8>) -> Self {
        Self {
            der: Vec::new(),
            subject_der,
            key_bits,
        }
    }
}

/// Fields extracted from a monitored certificate
#[derive(Debug, Clone)]
pub struct CertInfo {
    /// Serial number, minimal big-endian bytes
    pub serial: Vec<u8>,
    /// OCSP responder URLs from the authority information access extension
    pub ocsp_responders: Vec<String>,
    /// caIssuers URLs from the authority information access extension
    pub issuer_urls: Vec<String>,
}

/// Parse a monitored certificate and pull out its serial and AIA URLs
pub fn parse_certificate_info(data: &[u8]) -> Result<CertInfo, CacheError> {
    let der = decode_pem_or_der(data)?;
    let (_, cert) = parse_x509_certificate(&der)
        .map_err(|e| CacheError::Config(format!("failed to parse certificate: {e}")))?;

    let serial = fingerprint::normalize_serial(&cert.serial.to_bytes_be());
    let mut ocsp_responders = Vec::new();
    let mut issuer_urls = Vec::new();
    for ext in cert.extensions() {
        if let ParsedExtension::AuthorityInfoAccess(aia) = ext.parsed_extension() {
            for desc in aia.accessdescs.iter() {
                if let GeneralName::URI(uri) = &desc.access_location {
                    match desc.access_method.to_id_string().as_str() {
                        AIA_OCSP => ocsp_responders.push(uri.to_string()),
                        AIA_CA_ISSUERS => issuer_urls.push(uri.to_string()),
                        _ => {}
                    }
                }
            }
        }
    }

    Ok(CertInfo {
        serial,
        ocsp_responders,
        issuer_urls,
    })
}

/// Decode PEM armor if present, otherwise pass the bytes through as DER
pub fn decode_pem_or_der(data: &[u8]) -> Result<Vec<u8>, CacheError> {
    if data.starts_with(b"-----BEGIN") {
        let (_, pem) = parse_x509_pem(data)
            .map_err(|e| CacheError::Config(format!("failed to parse PEM: {e}")))?;
        Ok(pem.contents)
    } else {
        Ok(data.to_vec())
    }
}

/// Encode an unsigned single-certificate OCSP request with SHA-1 hashes,
/// the variant most broadly accepted by deployed responders.
pub fn encode_request(issuer: &IssuerInfo, serial: &[u8]) -> Result<Vec<u8>, CacheError> {
    let name_hash = HashAlgorithm::Sha1.digest(&issuer.subject_der);
    let key_hash = HashAlgorithm::Sha1.digest(&issuer.key_bits);
    let serial_number = SerialNumber::new(serial)
        .map_err(|e| CacheError::Config(format!("invalid serial number: {e}")))?;

    let cert_id = CertId {
        hash_algorithm: AlgorithmIdentifierOwned {
            oid: rfc5912::ID_SHA_1,
            parameters: Some(Any::null()),
        },
        issuer_name_hash: OctetString::new(name_hash)
            .map_err(|e| CacheError::Hash(e.to_string()))?,
        issuer_key_hash: OctetString::new(key_hash)
            .map_err(|e| CacheError::Hash(e.to_string()))?,
        serial_number,
    };
    let request = OcspRequest {
        tbs_request: TbsRequest {
            version: Version::V1,
            requestor_name: None,
            request_list: vec![SingleRequest {
                req_cert: cert_id,
                single_request_extensions: None,
            }],
            request_extensions: None,
        },
        optional_signature: None,
    };
    request
        .to_der()
        .map_err(|e| CacheError::Config(format!("failed to encode OCSP request: {e}")))
}

/// An inbound OCSP request the handler could not decode
#[derive(Debug, thiserror::Error)]
#[error("malformed OCSP request: {0}")]
pub struct MalformedRequest(String);

/// The parts of an inbound OCSP request the cache needs for a lookup
#[derive(Debug, Clone)]
pub struct RequestInfo {
    /// Hash algorithm the requester used for the issuer hashes
    pub algorithm: HashAlgorithm,
    /// Hash of the issuer subject, as carried in the request
    pub issuer_name_hash: Vec<u8>,
    /// Hash of the issuer public key bits, as carried in the request
    pub issuer_key_hash: Vec<u8>,
    /// Serial number, minimal big-endian bytes
    pub serial: Vec<u8>,
}

impl RequestInfo {
    /// Cache fingerprint of this request
    pub fn digest(&self) -> [u8; 32] {
        fingerprint::request_digest(&self.issuer_name_hash, &self.issuer_key_hash, &self.serial)
    }
}

/// Decode an inbound DER OCSP request
///
/// Only the first CertID of the request list is considered, matching the
/// behavior of common single-certificate requesters.
pub fn parse_request(der: &[u8]) -> Result<RequestInfo, MalformedRequest> {
    let request =
        OcspRequest::from_der(der).map_err(|e| MalformedRequest(e.to_string()))?;
    let single = request
        .tbs_request
        .request_list
        .first()
        .ok_or_else(|| MalformedRequest("empty request list".to_string()))?;

    let cert_id = &single.req_cert;
    let algorithm = hash_algorithm_from_oid(&cert_id.hash_algorithm.oid).ok_or_else(|| {
        MalformedRequest(format!(
            "unsupported hash algorithm {}",
            cert_id.hash_algorithm.oid
        ))
    })?;

    Ok(RequestInfo {
        algorithm,
        issuer_name_hash: cert_id.issuer_name_hash.as_bytes().to_vec(),
        issuer_key_hash: cert_id.issuer_key_hash.as_bytes().to_vec(),
        serial: fingerprint::normalize_serial(cert_id.serial_number.as_bytes()),
    })
}

/// Timestamps carried by a verified response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseInfo {
    pub this_update: SystemTime,
    pub next_update: SystemTime,
}

/// Verify a DER OCSP response against the issuer it must answer for.
///
/// Checks, in order: the responder status is `successful`, the body is a
/// BasicOCSPResponse, the signature verifies under the issuer key or under
/// a delegated responder certificate that the issuer signed and marked for
/// OCSP signing, a single response matches `serial`, `thisUpdate` is not in
/// the future, and `nextUpdate` is in the future. Responses without a
/// `nextUpdate` are rejected because the refresh policy cannot schedule
/// around them.
pub fn verify_response(
    issuer: &IssuerInfo,
    serial: &[u8],
    response_der: &[u8],
    now: SystemTime,
) -> Result<ResponseInfo, CacheError> {
    let response = OcspResponse::from_der(response_der)
        .map_err(|e| CacheError::Verify(format!("malformed response: {e}")))?;
    if response.response_status != OcspResponseStatus::Successful {
        return Err(CacheError::Verify(format!(
            "responder returned status {:?}",
            response.response_status
        )));
    }
    let response_bytes = response
        .response_bytes
        .ok_or_else(|| CacheError::Verify("successful response carries no body".to_string()))?;
    if response_bytes.response_type != rfc6960::ID_PKIX_OCSP_BASIC {
        return Err(CacheError::Verify(format!(
            "unsupported response type {}",
            response_bytes.response_type
        )));
    }
    let basic = BasicOcspResponse::from_der(response_bytes.response.as_bytes())
        .map_err(|e| CacheError::Verify(format!("malformed basic response: {e}")))?;

    // DER is canonical, so re-encoding the decoded structure reproduces the
    // exact bytes the responder signed.
    let tbs_der = basic
        .tbs_response_data
        .to_der()
        .map_err(|e| CacheError::Verify(format!("failed to re-encode response data: {e}")))?;
    let sig = basic
        .signature
        .as_bytes()
        .ok_or_else(|| CacheError::Verify("signature is not octet aligned".to_string()))?;
    let signer_key_bits = resolve_signer(issuer, &basic)?;
    let algorithm = ring_algorithm(&basic.signature_algorithm.oid).ok_or_else(|| {
        CacheError::Verify(format!(
            "unsupported signature algorithm {}",
            basic.signature_algorithm.oid
        ))
    })?;
    signature::UnparsedPublicKey::new(algorithm, &signer_key_bits)
        .verify(&tbs_der, sig)
        .map_err(|_| CacheError::Verify("signature check failed".to_string()))?;

    let want = fingerprint::normalize_serial(serial);
    let single = basic
        .tbs_response_data
        .responses
        .iter()
        .find(|sr| fingerprint::normalize_serial(sr.cert_id.serial_number.as_bytes()) == want)
        .ok_or_else(|| CacheError::Verify("no status for the requested serial".to_string()))?;

    let this_update = generalized_to_system(&single.this_update);
    let next_update = single
        .next_update
        .as_ref()
        .map(generalized_to_system)
        .ok_or_else(|| CacheError::Verify("response has no nextUpdate".to_string()))?;
    if this_update > now {
        return Err(CacheError::Verify("thisUpdate is in the future".to_string()));
    }
    if next_update <= now {
        return Err(CacheError::Verify("nextUpdate has already passed".to_string()));
    }

    Ok(ResponseInfo {
        this_update,
        next_update,
    })
}

/// Find the public key that must have signed the response: the issuer
/// itself when the responder id names it, otherwise a delegated responder
/// certificate included in the response.
fn resolve_signer(issuer: &IssuerInfo, basic: &BasicOcspResponse) -> Result<Vec<u8>, CacheError> {
    let issuer_key_hash = HashAlgorithm::Sha1.digest(&issuer.key_bits);
    let responder_id = &basic.tbs_response_data.responder_id;

    let signed_by_issuer = match responder_id {
        ResponderId::ByName(name) => {
            let name_der = name
                .to_der()
                .map_err(|e| CacheError::Verify(format!("bad responder name: {e}")))?;
            name_der == issuer.subject_der
        }
        ResponderId::ByKey(key) => key.as_bytes() == issuer_key_hash.as_slice(),
    };
    if signed_by_issuer {
        return Ok(issuer.key_bits.clone());
    }

    let certs = basic.certs.as_ref().ok_or_else(|| {
        CacheError::Verify("responder is not the issuer and no certificates included".to_string())
    })?;
    let (_, issuer_cert) = parse_x509_certificate(&issuer.der)
        .map_err(|e| CacheError::Verify(format!("stored issuer failed to reparse: {e}")))?;

    for candidate in certs {
        let cert_der = candidate
            .to_der()
            .map_err(|e| CacheError::Verify(format!("bad certificate in response: {e}")))?;
        let Ok((_, cert)) = parse_x509_certificate(&cert_der) else {
            continue;
        };
        if !matches_responder_id(responder_id, &cert)? {
            continue;
        }
        if !has_ocsp_signing_eku(&cert) {
            return Err(CacheError::Verify(
                "delegated responder lacks the OCSP signing extended key usage".to_string(),
            ));
        }
        cert.verify_signature(Some(issuer_cert.public_key()))
            .map_err(|_| {
                CacheError::Verify(
                    "delegated responder certificate is not signed by the issuer".to_string(),
                )
            })?;
        return Ok(cert.public_key().subject_public_key.data.to_vec());
    }

    Err(CacheError::Verify(
        "no included certificate matches the responder id".to_string(),
    ))
}

fn matches_responder_id(
    responder_id: &ResponderId,
    cert: &X509Certificate<'_>,
) -> Result<bool, CacheError> {
    match responder_id {
        ResponderId::ByName(name) => {
            let name_der = name
                .to_der()
                .map_err(|e| CacheError::Verify(format!("bad responder name: {e}")))?;
            Ok(name_der == cert.subject().as_raw())
        }
        ResponderId::ByKey(key) => {
            let key_hash =
                HashAlgorithm::Sha1.digest(cert.public_key().subject_public_key.data.as_ref());
            Ok(key.as_bytes() == key_hash.as_slice())
        }
    }
}

fn has_ocsp_signing_eku(cert: &X509Certificate<'_>) -> bool {
    cert.extensions().iter().any(|ext| {
        matches!(
            ext.parsed_extension(),
            ParsedExtension::ExtendedKeyUsage(eku) if eku.ocsp_signing
        )
    })
}

fn ring_algorithm(
    oid: &ObjectIdentifier,
) -> Option<&'static dyn signature::VerificationAlgorithm> {
    if *oid == rfc5912::SHA_256_WITH_RSA_ENCRYPTION {
        Some(&signature::RSA_PKCS1_2048_8192_SHA256)
    } else if *oid == rfc5912::SHA_384_WITH_RSA_ENCRYPTION {
        Some(&signature::RSA_PKCS1_2048_8192_SHA384)
    } else if *oid == rfc5912::SHA_512_WITH_RSA_ENCRYPTION {
        Some(&signature::RSA_PKCS1_2048_8192_SHA512)
    } else if *oid == rfc5912::ECDSA_WITH_SHA_256 {
        Some(&signature::ECDSA_P256_SHA256_ASN1)
    } else if *oid == rfc5912::ECDSA_WITH_SHA_384 {
        Some(&signature::ECDSA_P384_SHA384_ASN1)
    } else if *oid == rfc8410::ID_ED_25519 {
        Some(&signature::ED25519)
    } else {
        None
    }
}

fn hash_algorithm_from_oid(oid: &ObjectIdentifier) -> Option<HashAlgorithm> {
    if *oid == rfc5912::ID_SHA_1 {
        Some(HashAlgorithm::Sha1)
    } else if *oid == rfc5912::ID_SHA_256 {
        Some(HashAlgorithm::Sha256)
    } else if *oid == rfc5912::ID_SHA_384 {
        Some(HashAlgorithm::Sha384)
    } else if *oid == rfc5912::ID_SHA_512 {
        Some(HashAlgorithm::Sha512)
    } else {
        None
    }
}

fn generalized_to_system(gt: &OcspGeneralizedTime) -> SystemTime {
    let gt: &GeneralizedTime = &gt.0;
    gt.to_system_time()
}

/// OCSP-layer error replies the responder handler can serve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcspErrorStatus {
    /// The request could not be decoded
    MalformedRequest,
    /// A response exists but is no longer fresh
    TryLater,
    /// No entry covers the requested certificate
    Unauthorized,
}

/// Status-only OCSP response bytes for an error reply
///
/// These are the fixed DER encodings of an OCSPResponse with the given
/// status and no response body.
pub fn status_response(status: OcspErrorStatus) -> &'static [u8] {
    match status {
        OcspErrorStatus::MalformedRequest => &[0x30, 0x03, 0x0a, 0x01, 0x01],
        OcspErrorStatus::TryLater => &[0x30, 0x03, 0x0a, 0x01, 0x03],
        OcspErrorStatus::Unauthorized => &[0x30, 0x03, 0x0a, 0x01, 0x06],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_issuer() -> IssuerInfo {
        IssuerInfo::for_tests(
            b"test subject der".to_vec(),
            b"test public key bits".to_vec(),
        )
    }

    #[test]
    fn status_responses_match_der_encoding() {
        for (status, raw) in [
            (OcspResponseStatus::MalformedRequest, OcspErrorStatus::MalformedRequest),
            (OcspResponseStatus::TryLater, OcspErrorStatus::TryLater),
            (OcspResponseStatus::Unauthorized, OcspErrorStatus::Unauthorized),
        ] {
            let encoded = OcspResponse {
                response_status: status,
                response_bytes: None,
            }
            .to_der()
            .unwrap();
            assert_eq!(encoded.as_slice(), status_response(raw));
        }
    }

    #[test]
    fn request_round_trip_uses_sha1() {
        let issuer = test_issuer();
        let serial = vec![0x0a, 0x0b, 0x0c];
        let der = encode_request(&issuer, &serial).unwrap();
        let parsed = parse_request(&der).unwrap();

        assert_eq!(parsed.algorithm, HashAlgorithm::Sha1);
        assert_eq!(
            parsed.issuer_name_hash,
            HashAlgorithm::Sha1.digest(issuer.subject_der())
        );
        assert_eq!(
            parsed.issuer_key_hash,
            HashAlgorithm::Sha1.digest(issuer.key_bits())
        );
        assert_eq!(parsed.serial, serial);
    }

    #[test]
    fn request_digest_matches_entry_indexing() {
        let issuer = test_issuer();
        let serial = vec![0x42];
        let der = encode_request(&issuer, &serial).unwrap();
        let parsed = parse_request(&der).unwrap();

        let expected = fingerprint::entry_digest(
            HashAlgorithm::Sha1,
            issuer.subject_der(),
            issuer.key_bits(),
            &serial,
        );
        assert_eq!(parsed.digest(), expected);
    }

    #[test]
    fn garbage_request_is_malformed() {
        assert!(parse_request(&[0x01, 0x02, 0x03]).is_err());
        assert!(parse_request(&[]).is_err());
    }

    #[test]
    fn garbage_response_fails_verification() {
        let issuer = test_issuer();
        let err = verify_response(&issuer, &[0x01], &[0xde, 0xad], SystemTime::now());
        assert!(matches!(err, Err(CacheError::Verify(_))));
    }

    #[test]
    fn status_only_response_fails_verification() {
        let issuer = test_issuer();
        let err = verify_response(
            &issuer,
            &[0x01],
            status_response(OcspErrorStatus::TryLater),
            SystemTime::now(),
        );
        assert!(matches!(err, Err(CacheError::Verify(_))));
    }
}
