//! Shared test fixtures: a self-contained generated PKI and a scripted
//! fetcher standing in for upstream responders.

// not every test binary exercises every fixture
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use const_oid::db::{rfc5912, rfc6960};
use der::asn1::{BitString, GeneralizedTime, Null, OctetString};
use der::{Any, Encode};
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{DerSignature, SigningKey};
use p256::pkcs8::EncodePublicKey;
use x509_cert::builder::{Builder, CertificateBuilder, Profile};
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};
use x509_cert::time::Validity;
use x509_ocsp::{
    BasicOcspResponse, CertId, CertStatus, OcspGeneralizedTime, OcspResponse, OcspResponseStatus,
    ResponderId, ResponseBytes, ResponseData, SingleResponse, Version,
};

use staple_cache::{CacheError, FetchOutcome, Fetcher, HashAlgorithm, IssuerInfo};

/// A generated issuer CA and one monitored serial
pub struct TestPki {
    pub key: SigningKey,
    pub issuer: IssuerInfo,
    pub serial: Vec<u8>,
}

/// Deterministic key so fixtures never depend on an OS RNG
fn key_from(byte: u8) -> SigningKey {
    SigningKey::from_slice(&[byte; 32]).expect("scalar in range")
}

fn self_signed_ca(key: &SigningKey, common_name: &str) -> Vec<u8> {
    let spki_der = key
        .verifying_key()
        .to_public_key_der()
        .expect("encode public key");
    let spki = SubjectPublicKeyInfoOwned::try_from(spki_der.as_bytes()).expect("decode spki");
    let builder = CertificateBuilder::new(
        Profile::Root,
        SerialNumber::new(&[0x01]).expect("serial"),
        Validity::from_now(Duration::from_secs(365 * 24 * 3600)).expect("validity"),
        common_name.parse().expect("subject name"),
        spki,
        key,
    )
    .expect("certificate builder");
    builder
        .build::<DerSignature>()
        .expect("build certificate")
        .to_der()
        .expect("encode certificate")
}

pub fn test_pki() -> TestPki {
    let key = key_from(0x07);
    let der = self_signed_ca(&key, "CN=Staple Test CA");
    TestPki {
        key,
        issuer: IssuerInfo::from_bytes(&der).expect("parse issuer"),
        serial: vec![0x0a, 0x0b],
    }
}

/// A second, unrelated CA key for bad-signature fixtures
pub fn rogue_key() -> SigningKey {
    key_from(0x2a)
}

pub fn at(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}

fn generalized(time: SystemTime) -> OcspGeneralizedTime {
    OcspGeneralizedTime(GeneralizedTime::from_system_time(time).expect("time in range"))
}

/// DER-encode and sign a good-status OCSP response for `serial`, signed by
/// `key` but naming `issuer` as the responder.
pub fn signed_response_with_key(
    key: &SigningKey,
    issuer: &IssuerInfo,
    serial: &[u8],
    this_update: SystemTime,
    next_update: SystemTime,
) -> Vec<u8> {
    let name_hash = HashAlgorithm::Sha1.digest(issuer.subject_der());
    let key_hash = HashAlgorithm::Sha1.digest(issuer.key_bits());

    let tbs = ResponseData {
        version: Version::V1,
        responder_id: ResponderId::ByKey(OctetString::new(key_hash.clone()).expect("key hash")),
        produced_at: generalized(this_update),
        responses: vec![SingleResponse {
            cert_id: CertId {
                hash_algorithm: AlgorithmIdentifierOwned {
                    oid: rfc5912::ID_SHA_1,
                    parameters: Some(Any::null()),
                },
                issuer_name_hash: OctetString::new(name_hash).expect("name hash"),
                issuer_key_hash: OctetString::new(key_hash).expect("key hash"),
                serial_number: SerialNumber::new(serial).expect("serial"),
            },
            cert_status: CertStatus::Good(Null),
            this_update: generalized(this_update),
            next_update: Some(generalized(next_update)),
            single_extensions: None,
        }],
        response_extensions: None,
    };

    let tbs_der = tbs.to_der().expect("encode response data");
    let signature: DerSignature = key.sign(&tbs_der);
    let signature_bytes = signature.as_bytes().to_vec();

    let basic = BasicOcspResponse {
        tbs_response_data: tbs,
        signature_algorithm: AlgorithmIdentifierOwned {
            oid: rfc5912::ECDSA_WITH_SHA_256,
            parameters: None,
        },
        signature: BitString::from_bytes(&signature_bytes).expect("signature bits"),
        certs: None,
    };
    let basic_der = basic.to_der().expect("encode basic response");

    OcspResponse {
        response_status: OcspResponseStatus::Successful,
        response_bytes: Some(ResponseBytes {
            response_type: rfc6960::ID_PKIX_OCSP_BASIC,
            response: OctetString::new(basic_der).expect("wrap basic response"),
        }),
    }
    .to_der()
    .expect("encode response")
}

pub fn signed_response(
    pki: &TestPki,
    this_update: SystemTime,
    next_update: SystemTime,
) -> Vec<u8> {
    signed_response_with_key(&pki.key, &pki.issuer, &pki.serial, this_update, next_update)
}

/// Fetcher that plays back a scripted sequence of outcomes and records how
/// it was called
pub struct ScriptedFetcher {
    script: Mutex<VecDeque<Result<FetchOutcome, CacheError>>>,
    calls: AtomicUsize,
    last_etag: Mutex<Option<String>>,
    last_request: Mutex<Vec<u8>>,
}

impl ScriptedFetcher {
    pub fn new(script: Vec<Result<FetchOutcome, CacheError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
            last_etag: Mutex::new(None),
            last_request: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_etag(&self) -> Option<String> {
        self.last_etag.lock().unwrap().clone()
    }

    pub fn last_request(&self) -> Vec<u8> {
        self.last_request.lock().unwrap().clone()
    }
}

pub fn body(bytes: Vec<u8>) -> FetchOutcome {
    FetchOutcome {
        body: Some(bytes),
        etag: None,
        max_age: Duration::ZERO,
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(
        &self,
        _responder: &str,
        request: &[u8],
        etag: Option<&str>,
    ) -> Result<FetchOutcome, CacheError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_etag.lock().unwrap() = etag.map(str::to_string);
        *self.last_request.lock().unwrap() = request.to_vec();
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(CacheError::Fetch("fetch script exhausted".to_string())))
    }
}
