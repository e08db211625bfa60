// Copyright (C) 2025 Weft Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Data-blob codec.
//!
//! Every domain object crosses the store boundary as a [`DataBlob`]: an
//! `(encoding, bytes)` pair. The encoding field is opaque to stores; only the
//! codec interprets it. Encodings are enumerated here so that a decoder can
//! reject blobs written by a future, unknown codec version instead of
//! guessing.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Enumerated blob encodings.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
pub enum EncodingKind {
    /// Canonical JSON, the only encoding this codec writes.
    #[serde(rename = "json/plain")]
    #[strum(serialize = "json/plain")]
    JsonPlain,
    /// Present so stores can surface blobs written with no encoding tag;
    /// never produced by this codec, always rejected on decode.
    #[serde(rename = "unspecified")]
    #[strum(serialize = "unspecified")]
    Unspecified,
}

/// A binary payload tagged with its encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataBlob {
    /// How `data` was produced.
    pub encoding: EncodingKind,
    /// The raw bytes.
    pub data: Vec<u8>,
}

impl DataBlob {
    /// Encode a domain value into a blob.
    pub fn encode<T: Serialize>(value: &T) -> Result<Self> {
        let data = serde_json::to_vec(value)?;
        Ok(Self {
            encoding: EncodingKind::JsonPlain,
            data,
        })
    }

    /// Decode a blob back into a domain value.
    ///
    /// Rejects blobs whose encoding this codec does not understand.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        match self.encoding {
            EncodingKind::JsonPlain => Ok(serde_json::from_slice(&self.data)?),
            EncodingKind::Unspecified => Err(CoreError::Serialization {
                context: "data blob".to_string(),
                details: format!("unsupported encoding '{}'", self.encoding),
            }),
        }
    }

    /// Size of the payload in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Encode an opaque pagination token from its query-bound state.
///
/// Tokens are base64 so they survive logging and URL transport; they are
/// still opaque to callers.
pub fn encode_page_token<T: Serialize>(state: &T) -> Result<Vec<u8>> {
    use base64::Engine as _;
    let json = serde_json::to_vec(state)?;
    Ok(base64::engine::general_purpose::STANDARD
        .encode(json)
        .into_bytes())
}

/// Decode a pagination token produced by [`encode_page_token`].
pub fn decode_page_token<T: DeserializeOwned>(token: &[u8]) -> Result<T> {
    use base64::Engine as _;
    let json = base64::engine::general_purpose::STANDARD
        .decode(token)
        .map_err(|e| CoreError::Serialization {
            context: "page token".to_string(),
            details: e.to_string(),
        })?;
    Ok(serde_json::from_slice(&json)?)
}
