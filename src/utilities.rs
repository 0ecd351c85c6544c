// Copyright 2024 The Keysafe Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use base64::{
    alphabet,
    engine::{general_purpose, DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    DecodeError, Engine,
};

/// A base64 engine that accepts both padded and unpadded input while always
/// producing unpadded output, which is what the wire format expects.
const STANDARD_NO_PAD_INDIFFERENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Encode bytes as unpadded base64.
pub(crate) fn encode(input: impl AsRef<[u8]>) -> String {
    general_purpose::STANDARD_NO_PAD.encode(input)
}

/// Decode base64 bytes, accepting both padded and unpadded input.
pub(crate) fn decode(input: impl AsRef<[u8]>) -> Result<Vec<u8>, DecodeError> {
    STANDARD_NO_PAD_INDIFFERENT.decode(input)
}

/// Serde adapter for byte fields that are base64 strings on the wire.
pub(crate) mod base64_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::encode(bytes))
    }

    pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string: String = Deserialize::deserialize(deserializer)?;
        super::decode(string).map_err(serde::de::Error::custom)
    }
}

// Vodozemac serializes curve keys as byte slices, while the wire format
// expects base64 encoded strings, so we can't rely on the derived impls.
pub(crate) fn deserialize_curve_key<'de, D>(
    de: D,
) -> Result<vodozemac::Curve25519PublicKey, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;

    let key: String = Deserialize::deserialize(de)?;
    vodozemac::Curve25519PublicKey::from_base64(&key).map_err(serde::de::Error::custom)
}

pub(crate) fn serialize_curve_key<S>(
    key: &vodozemac::Curve25519PublicKey,
    s: S,
) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    s.serialize_str(&key.to_base64())
}

#[cfg(test)]
pub(crate) fn json_convert<T, U>(value: &T) -> serde_json::Result<U>
where
    T: serde::Serialize,
    U: serde::de::DeserializeOwned,
{
    let json = serde_json::to_string(value)?;
    serde_json::from_str(&json)
}

#[cfg(test)]
mod tests {
    use super::{decode, encode};

    #[test]
    fn base64_roundtrip() {
        let bytes = b"It's a secret to everybody";

        let encoded = encode(bytes);

        assert!(!encoded.ends_with('='), "The encoded string should be unpadded");
        assert_eq!(decode(&encoded).expect("We should be able to decode our own output"), bytes);
    }

    #[test]
    fn base64_accepts_padding() {
        assert_eq!(decode("Zm9vYg==").expect("Padded input should decode"), b"foob");
        assert_eq!(decode("Zm9vYg").expect("Unpadded input should decode"), b"foob");
    }
}
