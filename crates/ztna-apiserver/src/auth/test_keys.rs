//! RS256 signing fixtures for auth tests.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::{Value, json};

use super::jwks::StaticKeySet;

pub const KID: &str = "test-signing-key";
pub const ISSUER: &str = "https://issuer.test";
pub const AUDIENCE: &str = "ztna-client";

const PRIVATE_KEY_PEM: &str = include_str!("../../testdata/identity_rsa.pem");
const JWKS_JSON: &str = include_str!("../../testdata/identity_jwks.json");

pub fn jwks_json() -> Value {
    serde_json::from_str(JWKS_JSON).expect("testdata jwks")
}

pub fn key_source() -> StaticKeySet {
    let keys: JwkSet = serde_json::from_str(JWKS_JSON).expect("testdata jwks");
    StaticKeySet::new(keys)
}

/// Baseline claims valid for an hour against [`ISSUER`] and [`AUDIENCE`].
pub fn claims(subject: &str, groups: &[&str]) -> Value {
    let now = ztna_core::unix_timestamp();
    json!({
        "sub": subject,
        "oid": subject,
        "iss": ISSUER,
        "aud": AUDIENCE,
        "iat": now,
        "exp": now + 3600,
        "groups": groups,
    })
}

pub fn sign(claims: &Value) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(KID.to_string());
    let key = EncodingKey::from_rsa_pem(PRIVATE_KEY_PEM.as_bytes()).expect("testdata pem");
    jsonwebtoken::encode(&header, claims, &key).expect("sign test token")
}

/// A JWT payload segment for `claims`, for splicing into a signed token.
pub fn sign_unverified_payload(claims: &Value) -> String {
    URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).expect("claims json"))
}
