//! NAR info.
//!
//! ## `.narinfo` format
//!
//! A narinfo is a plain-text manifest describing one NAR: where to fetch
//! it, its hashes, its references, and a detached signature. An example:
//!
//! ```text
//! StorePath: /nix/store/p4pclmv1gyja5kzc26npqpia1qqxrf0l-ruby-2.7.3
//! URL: nar/1w1fff338fvdw53sqgamddn1b2xgds473pv6y13gizdbqjv4i5p3.nar.xz
//! Compression: xz
//! FileHash: sha256:1w1fff338fvdw53sqgamddn1b2xgds473pv6y13gizdbqjv4i5p3
//! FileSize: 4029176
//! NarHash: sha256:1impfw8zdgisxkghq9a3q7cn7jb9zyzgxdydiamp8z2nlyyl0h5h
//! NarSize: 18735072
//! Deriver: bidkcs01mww363s4s7akdhbl6ws66b0z-ruby-2.7.3.drv
//! References: 0d71ygfwbmy1xjlbj1v027dfmy9cqavy-libffi-3.3
//! Sig: cache.nixos.org-1:GrGV/Ls10TzoOaCnrcAqmPbKXFLLSBDeGNh5EQGKyuGA4K1wv1LcRVb6/sU+NAPK8lDiam8XcdJzUngmdhfTBQ==
//! ```
//!
//! Serialization emits the fields in a fixed order so a served narinfo
//! is byte-identical across calls.
//!
//! ## Fingerprint
//!
//! Each fingerprint contains the full store path, the NAR hash, the NAR
//! size, as well as the comma-joined full store paths of the references:
//!
//! ```text
//! 1;{storePath};{narHash};{narSize};{commaDelimitedReferences}
//! ```

use std::fmt;
use std::str::FromStr;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::error::{ServerError, ServerResult};
use narpool::mime;
use narpool::signing::NixKeypair;


/// NAR information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NarInfo {
    /// The full store path being cached, including the store directory.
    ///
    /// Part of the fingerprint.
    ///
    /// Example: `/nix/store/p4pclmv1gyja5kzc26npqpia1qqxrf0l-ruby-2.7.3`.
    pub store_path: String,

    /// The URL to fetch the object, relative to the cache root.
    ///
    /// Example: `nar/1w1fff338fvdw53sqgamddn1b2xgds473pv6y13gizdbqjv4i5p3.nar.xz`
    pub url: String,

    /// Compression of the artifact.
    pub compression: Compression,

    /// The hash of the compressed file.
    pub file_hash: Option<String>,

    /// The size of the compressed file.
    pub file_size: Option<u64>,

    /// The hash of the NAR archive.
    ///
    /// Part of the fingerprint.
    pub nar_hash: String,

    /// The size of the NAR archive.
    ///
    /// Part of the fingerprint.
    pub nar_size: u64,

    /// The derivation that produced this object.
    pub deriver: Option<String>,

    /// The system this derivation is built for.
    pub system: Option<String>,

    /// Other store paths this object directly references.
    ///
    /// This only includes the base `{hash}-{name}` entries, not the
    /// store directory itself.
    ///
    /// Part of the fingerprint.
    pub references: Vec<String>,

    /// The signature of the object.
    pub signature: Option<String>,
}

/// NAR compression codec.
///
/// narpool artifacts are always stored pre-compressed as
/// `{file_hash}.nar.{codec}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Xz,
    Zst,
}

impl NarInfo {
    /// Parses a narinfo from its textual representation.
    pub fn from_str(manifest: &str) -> ServerResult<Self> {
        let mut store_path = None;
        let mut url = None;
        let mut compression = None;
        let mut file_hash = None;
        let mut file_size = None;
        let mut nar_hash = None;
        let mut nar_size = None;
        let mut deriver = None;
        let mut system = None;
        let mut references = Vec::new();
        let mut signature = None;

        for line in manifest.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| bad_manifest("line without a key"))?;
            let value = value.trim();

            match key {
                "StorePath" => store_path = Some(value.to_string()),
                "URL" => url = Some(value.to_string()),
                "Compression" => compression = Some(value.parse()?),
                "FileHash" => file_hash = some_nonempty(value),
                "FileSize" => {
                    file_size = Some(
                        value
                            .parse()
                            .map_err(|_| bad_manifest("invalid FileSize"))?,
                    )
                }
                "NarHash" => nar_hash = Some(value.to_string()),
                "NarSize" => {
                    nar_size =
                        Some(value.parse().map_err(|_| bad_manifest("invalid NarSize"))?)
                }
                "Deriver" => {
                    if value != "unknown-deriver" {
                        deriver = some_nonempty(value);
                    }
                }
                "System" => system = some_nonempty(value),
                "References" => {
                    references = value.split_whitespace().map(str::to_string).collect()
                }
                "Sig" => signature = some_nonempty(value),
                // Unknown fields (e.g. CA) are preserved nowhere; peers
                // re-sign what they serve anyway.
                _ => {}
            }
        }

        Ok(Self {
            store_path: store_path.ok_or_else(|| bad_manifest("missing StorePath"))?,
            url: url.ok_or_else(|| bad_manifest("missing URL"))?,
            compression: compression.ok_or_else(|| bad_manifest("missing Compression"))?,
            file_hash,
            file_size,
            nar_hash: nar_hash.ok_or_else(|| bad_manifest("missing NarHash"))?,
            nar_size: nar_size.ok_or_else(|| bad_manifest("missing NarSize"))?,
            deriver,
            system,
            references,
            signature,
        })
    }

    /// Returns the serialized representation of the narinfo.
    ///
    /// Fields appear in a fixed order: StorePath, URL, Compression,
    /// FileHash, FileSize, NarHash, NarSize, Deriver, System,
    /// References, Sig.
    pub fn to_manifest(&self) -> String {
        let mut out = String::new();

        out.push_str(&format!("StorePath: {}\n", self.store_path));
        out.push_str(&format!("URL: {}\n", self.url));
        out.push_str(&format!("Compression: {}\n", self.compression));

        if let Some(file_hash) = &self.file_hash {
            out.push_str(&format!("FileHash: {}\n", file_hash));
        }

        if let Some(file_size) = self.file_size {
            out.push_str(&format!("FileSize: {}\n", file_size));
        }

        out.push_str(&format!("NarHash: {}\n", self.nar_hash));
        out.push_str(&format!("NarSize: {}\n", self.nar_size));

        if let Some(deriver) = &self.deriver {
            out.push_str(&format!("Deriver: {}\n", deriver));
        }

        if let Some(system) = &self.system {
            out.push_str(&format!("System: {}\n", system));
        }

        out.push_str(&format!("References: {}\n", self.references.join(" ")));

        if let Some(signature) = &self.signature {
            out.push_str(&format!("Sig: {}\n", signature));
        }

        out
    }

    /// Returns the store directory of this object.
    pub fn store_dir(&self) -> &str {
        self.store_path
            .rsplit_once('/')
            .map(|(dir, _)| dir)
            .unwrap_or("/nix/store")
    }

    /// Returns the signature of this object, if it exists.
    pub fn signature(&self) -> Option<&String> {
        self.signature.as_ref()
    }

    /// Signs the narinfo, replacing any existing signature.
    pub fn sign(&mut self, keypair: &NixKeypair) {
        let fingerprint = self.fingerprint();
        self.signature = Some(keypair.sign(&fingerprint));
    }

    /// Returns the fingerprint of the object.
    pub fn fingerprint(&self) -> Vec<u8> {
        let store_dir = self.store_dir();

        let references = self
            .references
            .iter()
            .map(|r| format!("{}/{}", store_dir, r))
            .collect::<Vec<_>>()
            .join(",");

        format!(
            "1;{};{};{};{}",
            self.store_path, self.nar_hash, self.nar_size, references
        )
        .into_bytes()
    }
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Xz => "xz",
            Self::Zst => "zst",
        }
    }

    /// Extracts the codec from a `{name}.nar.{codec}` file name.
    pub fn from_file_name(name: &str) -> ServerResult<Self> {
        name.rsplit_once(".nar.")
            .map(|(_, ext)| ext)
            .ok_or_else(|| bad_manifest("file name without a codec"))?
            .parse()
    }
}

impl FromStr for Compression {
    type Err = ServerError;

    fn from_str(s: &str) -> ServerResult<Self> {
        match s {
            "xz" => Ok(Self::Xz),
            "zst" => Ok(Self::Zst),
            _ => Err(ServerError::InvalidCompressionType {
                name: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl IntoResponse for NarInfo {
    fn into_response(self) -> Response {
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, mime::NARINFO)],
            self.to_manifest(),
        )
            .into_response()
    }
}

fn bad_manifest(reason: &str) -> ServerError {
    ServerError::RequestError(anyhow::anyhow!("invalid narinfo: {}", reason))
}

fn some_nonempty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
