//! Object Signing and Verification.
//!
//! Nix utilitizes Ed25519 to generate signatures on NAR fingerprints.
//! narpool generates signatures on the fly per request, reading the
//! signing key from the cache's storage.
//!
//! ## String format
//!
//! All signing-related strings follow the canonical Nix format:
//!
//! ```text
//! {keyName}:{base64Payload}
//! ```
//!
//! Key names are derived from the cache and the node it lives on
//! (`{cache}.{hostname}-1`), so keys generated by narpool can be
//! dropped into `trusted-public-keys` as-is.
//!
//! Unlike the public key (whose payload is the raw 32-byte Ed25519
//! public key, as Nix expects), the private key file stores the
//! 32-byte *seed* of the keypair.

use std::convert::TryInto;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::{DecodeError, Engine};
use displaydoc::Display;
use ed25519_compact::{Error as SignatureError, KeyPair, PublicKey, Seed, Signature};

use crate::error::NarpoolResult;

#[cfg(test)]
mod tests;

/// An ed25519 keypair for signing.
#[derive(Debug)]
pub struct NixKeypair {
    /// Name of this key.
    name: String,

    /// The keypair.
    keypair: KeyPair,
}

/// An ed25519 public key for verification.
#[derive(Debug, Clone)]
pub struct NixPublicKey {
    /// Name of this key.
    name: String,

    /// The public key.
    public: PublicKey,
}

/// A signing error.
#[derive(Debug, Display)]
#[ignore_extra_doc_attributes]
pub enum Error {
    /// Signature error: {0}
    SignatureError(SignatureError),

    /// The string has a wrong key name attached to it: Our name is "{our_name}" and the string has "{string_name}"
    WrongKeyName {
        our_name: String,
        string_name: String,
    },

    /// The string lacks a colon separator.
    NoColonSeparator,

    /// The name portion of the string is blank.
    BlankKeyName,

    /// Base64 decode error: {0}
    Base64DecodeError(DecodeError),

    /// Invalid base64 payload length: Expected {expected} ({usage}), got {actual}
    InvalidPayloadLength {
        expected: usize,
        actual: usize,
        usage: &'static str,
    },

    /// Invalid signing key name "{0}".
    ///
    /// A valid name cannot be empty and must not contain colons (:).
    InvalidSigningKeyName(String),
}

impl NixKeypair {
    /// Generates a new keypair.
    pub fn generate(name: &str) -> NarpoolResult<Self> {
        validate_name(name)?;

        let keypair = KeyPair::from_seed(Seed::generate());

        Ok(Self {
            name: name.to_string(),
            keypair,
        })
    }

    /// Imports a keypair from the contents of a `key.priv` file.
    ///
    /// The payload is the 32-byte seed the keypair was generated from.
    pub fn from_str(keypair: &str) -> NarpoolResult<Self> {
        let (name, bytes) = decode_string(keypair, "seed", Seed::BYTES, None)?;

        let seed = Seed::from_slice(&bytes).map_err(Error::SignatureError)?;

        Ok(Self {
            name: name.to_string(),
            keypair: KeyPair::from_seed(seed),
        })
    }

    /// Returns the name of the key.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the canonical representation of the keypair.
    ///
    /// The payload is the 32-byte seed, so this is what `key.priv`
    /// files contain.
    pub fn export_keypair(&self) -> String {
        // The first half of an expanded secret key is the seed.
        let sk = *self.keypair.sk;
        format!(
            "{}:{}",
            self.name,
            BASE64_STANDARD.encode(&sk[..Seed::BYTES])
        )
    }

    /// Returns the canonical representation of the public key.
    ///
    /// For example, it can look like:
    ///     demo.cache-node-1:C929acssgtJoINkUtLbc81GFJPUW9maR77TxEu9ZpRw=
    pub fn export_public_key(&self) -> String {
        format!(
            "{}:{}",
            self.name,
            BASE64_STANDARD.encode(*self.keypair.pk)
        )
    }

    /// Returns the public key portion of the keypair.
    pub fn to_public_key(&self) -> NixPublicKey {
        NixPublicKey {
            name: self.name.clone(),
            public: self.keypair.pk,
        }
    }

    /// Signs a message, returning its canonical representation.
    pub fn sign(&self, message: &[u8]) -> String {
        let bytes = self.keypair.sk.sign(message, None);
        format!("{}:{}", self.name, BASE64_STANDARD.encode(*bytes))
    }

    /// Verifies a message.
    pub fn verify(&self, message: &[u8], signature: &str) -> NarpoolResult<()> {
        self.to_public_key().verify(message, signature)
    }
}

impl NixPublicKey {
    /// Imports an existing public key from its canonical representation.
    pub fn from_str(public_key: &str) -> NarpoolResult<Self> {
        let (name, bytes) = decode_string(public_key, "public key", PublicKey::BYTES, None)?;

        let public = PublicKey::from_slice(&bytes).map_err(Error::SignatureError)?;

        Ok(Self {
            name: name.to_string(),
            public,
        })
    }

    /// Returns the Nix-compatible textual representation of the public key.
    pub fn export(&self) -> String {
        format!("{}:{}", self.name, BASE64_STANDARD.encode(*self.public))
    }

    /// Verifies a message.
    pub fn verify(&self, message: &[u8], signature: &str) -> NarpoolResult<()> {
        let (_, bytes) = decode_string(signature, "signature", Signature::BYTES, Some(&self.name))?;

        let bytes: [u8; Signature::BYTES] = bytes.try_into().unwrap();
        let signature = Signature::new(bytes);

        self.public
            .verify(message, &signature)
            .map_err(|e| Error::SignatureError(e).into())
    }
}

/// Validates the name/label of a signing key.
///
/// A valid name cannot be empty and must not contain colons (:).
fn validate_name(name: &str) -> NarpoolResult<()> {
    if name.is_empty() || name.find(':').is_some() {
        Err(Error::InvalidSigningKeyName(name.to_string()).into())
    } else {
        Ok(())
    }
}

/// Decodes a colon-delimited string containing a key name and a base64 payload.
fn decode_string<'s>(
    s: &'s str,
    usage: &'static str,
    expected_payload_length: usize,
    expected_name: Option<&str>,
) -> NarpoolResult<(&'s str, Vec<u8>)> {
    let colon = s.find(':').ok_or(Error::NoColonSeparator)?;

    let (name, colon_and_payload) = s.split_at(colon);

    validate_name(name)?;

    // don't bother decoding base64 if the name doesn't match
    if let Some(expected_name) = expected_name {
        if expected_name != name {
            return Err(Error::WrongKeyName {
                our_name: expected_name.to_string(),
                string_name: name.to_string(),
            }
            .into());
        }
    }

    let bytes = BASE64_STANDARD
        .decode(&colon_and_payload[1..])
        .map_err(Error::Base64DecodeError)?;

    if bytes.len() != expected_payload_length {
        return Err(Error::InvalidPayloadLength {
            actual: bytes.len(),
            expected: expected_payload_length,
            usage,
        }
        .into());
    }

    Ok((name, bytes))
}
