//! Key loading and signing, dispatched by the scheme recorded in `KeyInfo`.

pub mod error;

use repo_mirror_schema::{to_canonical_json, KeyInfo, Signature};
use ring::rand::SystemRandom;
use ring::signature::{
    Ed25519KeyPair, KeyPair, RsaKeyPair, UnparsedPublicKey, ED25519, RSA_PSS_2048_8192_SHA256,
    RSA_PSS_SHA256,
};
use snafu::{ensure, OptionExt, ResultExt};
use std::fs::File;
use std::path::Path;

pub use error::Error;

/// Signs the canonical-JSON encoding of `signed` with every key in `keys`, returning one
/// detached signature per key.
pub fn sign<T: serde::Serialize>(signed: &T, keys: &[&KeyInfo]) -> Result<Vec<Signature>, Error> {
    let payload = to_canonical_json(signed).context(error::EncodeSnafu)?;
    keys.iter().map(|key| sign_payload(key, &payload)).collect()
}

fn sign_payload(key: &KeyInfo, payload: &[u8]) -> Result<Signature, Error> {
    let keyid = key.key_id().context(error::EncodeSnafu)?;
    let sig = match key.scheme.as_str() {
        "rsa-pss-sha256" => rsa_pss_sha256(key, payload)?,
        "ed25519" => ed25519(key, payload)?,
        other => {
            return error::UnsupportedSchemeSnafu {
                scheme: other.to_string(),
            }
            .fail()
        }
    };
    Ok(Signature { keyid, sig })
}

fn private_bytes(key: &KeyInfo) -> Result<Vec<u8>, Error> {
    let encoded = key.value.get("private").context(error::MissingPrivateSnafu)?;
    data_encoding::HEXLOWER_PERMISSIVE
        .decode(encoded.as_bytes())
        .ok()
        .or_else(|| data_encoding::BASE64.decode(encoded.as_bytes()).ok())
        .context(error::MalformedKeySnafu)
}

fn public_bytes(key: &KeyInfo) -> Result<Vec<u8>, Error> {
    let encoded = key.value.get("public").context(error::MissingPublicSnafu)?;
    data_encoding::HEXLOWER_PERMISSIVE
        .decode(encoded.as_bytes())
        .ok()
        .or_else(|| data_encoding::BASE64.decode(encoded.as_bytes()).ok())
        .context(error::MalformedPublicKeySnafu)
}

/// Verifies `signature` (as recorded in a `Manifest`'s `signatures` list) against the
/// canonical-JSON encoding of `signed`, using the public half of `key`. `key` must be the
/// role key declared by the current `root.json` for this role.
pub fn verify<T: serde::Serialize>(
    signed: &T,
    signature: &Signature,
    key: &KeyInfo,
) -> Result<(), Error> {
    let payload = to_canonical_json(signed).context(error::EncodeSnafu)?;
    let public = public_bytes(key)?;
    let sig = data_encoding::HEXLOWER_PERMISSIVE
        .decode(signature.sig.as_bytes())
        .ok()
        .context(error::MalformedPublicKeySnafu)?;

    let verified = match key.scheme.as_str() {
        "rsa-pss-sha256" => {
            UnparsedPublicKey::new(&RSA_PSS_2048_8192_SHA256, &public).verify(&payload, &sig)
        }
        "ed25519" => UnparsedPublicKey::new(&ED25519, &public).verify(&payload, &sig),
        other => {
            return error::UnsupportedSchemeSnafu {
                scheme: other.to_string(),
            }
            .fail()
        }
    };
    verified.ok().context(error::VerifySnafu)
}

fn rsa_pss_sha256(key: &KeyInfo, payload: &[u8]) -> Result<String, Error> {
    let der = private_bytes(key)?;
    let pair = RsaKeyPair::from_pkcs8(&der).ok().context(error::MalformedKeySnafu)?;
    let rng = SystemRandom::new();
    let mut sig = vec![0u8; pair.public_modulus_len()];
    pair.sign(&RSA_PSS_SHA256, &rng, payload, &mut sig)
        .ok()
        .context(error::SignSnafu)?;
    Ok(data_encoding::HEXLOWER.encode(&sig))
}

fn ed25519(key: &KeyInfo, payload: &[u8]) -> Result<String, Error> {
    let der = private_bytes(key)?;
    let pair = Ed25519KeyPair::from_pkcs8(&der).ok().context(error::MalformedKeySnafu)?;
    let sig = pair.sign(payload);
    Ok(data_encoding::HEXLOWER.encode(sig.as_ref()))
}

/// Loads a signing key from its canonical-JSON `KeyInfo` file, validating it by deriving
/// its `keyID` once so a malformed key fails fast at startup rather than at first sign.
pub fn load_private_key(path: &Path) -> Result<KeyInfo, Error> {
    let file = File::open(path).context(error::OpenSnafu { path })?;
    let key: KeyInfo = serde_json::from_reader(file).context(error::ParseSnafu { path })?;
    ensure!(
        key.value.contains_key("private"),
        error::NotAPrivateKeySnafu { path }
    );
    key.key_id().context(error::EncodeSnafu)?;
    Ok(key)
}

/// Generates a fresh ed25519 `KeyInfo` keypair, for use in tests.
pub fn generate_ed25519_for_test() -> KeyInfo {
    let rng = SystemRandom::new();
    let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).expect("key generation");
    let pair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).expect("parsing freshly generated key");
    let mut value = std::collections::BTreeMap::new();
    value.insert(
        "private".to_string(),
        data_encoding::HEXLOWER.encode(pkcs8.as_ref()),
    );
    value.insert(
        "public".to_string(),
        data_encoding::HEXLOWER.encode(pair.public_key().as_ref()),
    );
    KeyInfo {
        scheme: "ed25519".to_string(),
        key_type: "ed25519".to_string(),
        value,
    }
}
