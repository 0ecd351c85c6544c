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

use std::io::{Cursor, Read};

use hmac::Hmac;
use pbkdf2::pbkdf2;
use rand::{distributions::Alphanumeric, thread_rng, Rng, RngCore};
use sha2::Sha512;
use thiserror::Error;
use vodozemac::{
    pk_encryption::{Message, PkDecryption},
    Curve25519SecretKey,
};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::BackupKey;
use crate::{
    error::DecryptionError,
    types::{EncryptedSessionData, SessionKeys},
};

/// Error describing a recovery key string that could not be decoded.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The decoded recovery key has an invalid prefix.
    #[error("the decoded recovery key has an invalid prefix: expected {0:?}, got {1:?}")]
    Prefix([u8; 2], [u8; 2]),

    /// The parity byte of the recovery key didn't match.
    #[error("the parity byte of the recovery key doesn't match: expected {0:#x}, got {1:#x}")]
    Parity(u8, u8),

    /// The recovery key has an invalid length.
    #[error("the decoded recovery key has an invalid length: expected {0}, got {1}")]
    Length(usize, usize),

    /// The recovery key wasn't valid base58.
    #[error(transparent)]
    Base58(#[from] bs58::decode::Error),

    /// The recovery key wasn't valid base64.
    #[error(transparent)]
    Base64(#[from] base64::DecodeError),

    /// The backup version carries no passphrase derivation info, so a
    /// recovery key can't be derived from a passphrase for it.
    #[error("the backup version's auth data doesn't contain passphrase derivation info")]
    MissingDerivationInfo,

    /// The recovery key was too short to contain all its parts.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The private part of a backup key pair.
///
/// Holds the raw Curve25519 secret that can decrypt backed up session keys.
/// The bytes are wiped when the value is dropped and are never printed by the
/// `Debug` impl. Users only ever see the encoded string form produced by
/// [`RecoveryKey::to_base58`] or the `Display` impl.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct RecoveryKey {
    key: Box<[u8; RecoveryKey::KEY_SIZE]>,
}

impl std::fmt::Debug for RecoveryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryKey").finish_non_exhaustive()
    }
}

impl std::fmt::Display for RecoveryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let string = Zeroizing::new(self.to_base58());

        let chunks = Zeroizing::new(
            string
                .chars()
                .collect::<Vec<char>>()
                .chunks(Self::DISPLAY_CHUNK_SIZE)
                .map(|c| c.iter().collect::<String>())
                .collect::<Vec<_>>()
                .join(" "),
        );

        write!(f, "{}", chunks.as_str())
    }
}

impl TryFrom<&str> for RecoveryKey {
    type Error = DecodeError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::from_base58(value)
    }
}

impl RecoveryKey {
    const KEY_SIZE: usize = 32;
    const PREFIX: [u8; 2] = [0x8b, 0x01];
    const PREFIX_PARITY: u8 = Self::PREFIX[0] ^ Self::PREFIX[1];
    const DISPLAY_CHUNK_SIZE: usize = 4;
    const SALT_SIZE: usize = 32;

    /// The PBKDF2 iteration count used when a new passphrase-derived key is
    /// generated.
    pub const DEFAULT_PBKDF_ROUNDS: u32 = 500_000;

    fn parity_byte(bytes: &[u8]) -> u8 {
        bytes.iter().fold(Self::PREFIX_PARITY, |acc, x| acc ^ x)
    }

    /// Create a new, random recovery key.
    pub fn new() -> Self {
        let mut rng = thread_rng();

        let mut key = Box::new([0u8; Self::KEY_SIZE]);
        rng.fill_bytes(key.as_mut_slice());

        Self { key }
    }

    /// Derive a recovery key from a passphrase.
    ///
    /// The derivation is deterministic: the same passphrase, salt and
    /// iteration count always produce the same key, so a user can re-derive
    /// the key on another device knowing only the passphrase. The salt and
    /// iteration count are published in the backup version's auth data.
    pub fn from_passphrase(passphrase: &str, salt: &str, rounds: u32) -> Self {
        let mut key = Box::new([0u8; Self::KEY_SIZE]);

        pbkdf2::<Hmac<Sha512>>(passphrase.as_bytes(), salt.as_bytes(), rounds, key.as_mut_slice())
            .expect(
                "We should be able to expand a passphrase of any length due to \
                 HMAC being able to be initialized with any input size",
            );

        Self { key }
    }

    /// Derive a recovery key from a passphrase using a freshly generated
    /// salt and the default iteration count.
    ///
    /// Returns the key together with the salt and iteration count that need
    /// to be stored in the version's auth data.
    pub fn generate_with_passphrase(passphrase: &str) -> (Self, String, u32) {
        let salt: String =
            thread_rng().sample_iter(&Alphanumeric).take(Self::SALT_SIZE).map(char::from).collect();

        let key = Self::from_passphrase(passphrase, &salt, Self::DEFAULT_PBKDF_ROUNDS);

        (key, salt, Self::DEFAULT_PBKDF_ROUNDS)
    }

    /// Try to create a recovery key from an unpadded base64 export of the raw
    /// key bytes.
    pub fn from_base64(value: &str) -> Result<Self, DecodeError> {
        let decoded = Zeroizing::new(crate::utilities::decode(value)?);

        if decoded.len() != Self::KEY_SIZE {
            Err(DecodeError::Length(Self::KEY_SIZE, decoded.len()))
        } else {
            let mut key = Box::new([0u8; Self::KEY_SIZE]);
            key.copy_from_slice(&decoded);

            Ok(Self { key })
        }
    }

    /// Export the raw key bytes as unpadded base64.
    pub fn to_base64(&self) -> String {
        crate::utilities::encode(self.key.as_slice())
    }

    /// Try to decode a recovery key from its user-facing base58 form.
    ///
    /// Any whitespace in the input is ignored. Fails if the version prefix or
    /// the parity byte don't match, or if the decoded length is wrong.
    pub fn from_base58(value: &str) -> Result<Self, DecodeError> {
        // Remove any whitespace the display grouping may have introduced.
        let value: String = value.chars().filter(|c| !c.is_whitespace()).collect();

        let decoded = bs58::decode(value).with_alphabet(bs58::Alphabet::BITCOIN).into_vec()?;

        let expected_length = Self::PREFIX.len() + Self::KEY_SIZE + 1;
        if decoded.len() != expected_length {
            let length = decoded.len();
            let _ = Zeroizing::new(decoded);

            return Err(DecodeError::Length(expected_length, length));
        }

        let mut decoded = Cursor::new(decoded);

        let mut prefix = [0u8; 2];
        let mut key = Box::new([0u8; Self::KEY_SIZE]);
        let mut expected_parity = [0u8; 1];

        decoded.read_exact(&mut prefix)?;
        decoded.read_exact(key.as_mut_slice())?;
        decoded.read_exact(&mut expected_parity)?;

        let expected_parity = expected_parity[0];
        let parity = Self::parity_byte(key.as_slice());

        let _ = Zeroizing::new(decoded.into_inner());

        if prefix != Self::PREFIX {
            Err(DecodeError::Prefix(Self::PREFIX, prefix))
        } else if expected_parity != parity {
            Err(DecodeError::Parity(expected_parity, parity))
        } else {
            Ok(Self { key })
        }
    }

    /// Encode the recovery key into its user-facing base58 form: the version
    /// prefix, the key bytes and a single parity byte mapped through the
    /// Bitcoin base58 alphabet.
    pub fn to_base58(&self) -> String {
        let bytes = Zeroizing::new(
            [
                Self::PREFIX.as_ref(),
                self.key.as_slice(),
                [Self::parity_byte(self.key.as_slice())].as_ref(),
            ]
            .concat(),
        );

        bs58::encode(bytes.as_slice()).with_alphabet(bs58::Alphabet::BITCOIN).into_string()
    }

    /// Check if the given string is a valid encoding of a recovery key.
    pub fn is_valid(value: &str) -> bool {
        Self::from_base58(value).is_ok()
    }

    /// Get the public half of this key pair, the key that session keys get
    /// encrypted under.
    pub fn public_key(&self) -> BackupKey {
        let pk = PkDecryption::from_key(Curve25519SecretKey::from_slice(&self.key));

        BackupKey::new(pk.public_key())
    }

    /// Try to decrypt a single backed up session record.
    pub fn decrypt_session_data(
        &self,
        data: &EncryptedSessionData,
    ) -> Result<SessionKeys, DecryptionError> {
        let pk = PkDecryption::from_key(Curve25519SecretKey::from_slice(&self.key));

        let message = Message {
            ciphertext: data.ciphertext.to_owned(),
            mac: data.mac.to_owned(),
            ephemeral_key: data.ephemeral,
        };

        let decrypted = Zeroizing::new(pk.decrypt(&message)?);

        Ok(serde_json::from_slice(&decrypted)?)
    }
}

impl Default for RecoveryKey {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::{DecodeError, RecoveryKey};

    const TEST_KEY: [u8; 32] = [
        0x77, 0x07, 0x6d, 0x0a, 0x73, 0x18, 0xa5, 0x7d, 0x3c, 0x16, 0xc1, 0x72, 0x51, 0xb2, 0x66,
        0x45, 0xdf, 0x4c, 0x2f, 0x87, 0xeb, 0xc0, 0x99, 0x2a, 0xb1, 0x77, 0xfb, 0xa5, 0x1d, 0xb9,
        0x2c, 0x2a,
    ];

    fn test_key() -> RecoveryKey {
        RecoveryKey { key: Box::new(TEST_KEY) }
    }

    #[test]
    fn base58_roundtrip() {
        let key = RecoveryKey::new();
        let encoded = key.to_base58();
        let decoded = RecoveryKey::from_base58(&encoded)
            .expect("We should be able to decode our own encoding");

        assert_eq!(key.to_base64(), decoded.to_base64());
    }

    #[test]
    fn display_form_decodes() {
        let key = test_key();
        let display = key.to_string();

        assert!(display.contains(' '), "The display form should be grouped into blocks");

        let decoded = RecoveryKey::from_base58(&display)
            .expect("Whitespace should be ignored when decoding");
        assert_eq!(key.to_base64(), decoded.to_base64());
    }

    #[test]
    fn known_encoding() {
        // The well-known test vector for this encoding scheme.
        let key = test_key();

        assert_eq!(key.to_string(), "EsTc LW2K PGiF wKEA 3As5 g5c4 BXwk qeeJ ZJV8 Q9fu gUMN UE4d");
    }

    #[test]
    fn corrupted_parity_byte_is_rejected() {
        let key = test_key();
        let mut encoded = key.to_base58();

        // Flip the last character, which lands in the parity byte.
        let last = encoded.pop().expect("The encoding is never empty");
        encoded.push(if last == '1' { '2' } else { '1' });

        assert_matches!(
            RecoveryKey::from_base58(&encoded),
            Err(DecodeError::Parity(..) | DecodeError::Prefix(..) | DecodeError::Length(..))
        );
    }

    #[test]
    fn invalid_alphabet_is_rejected() {
        // '0' and 'l' are not part of the Bitcoin base58 alphabet.
        assert_matches!(RecoveryKey::from_base58("0000"), Err(DecodeError::Base58(_)));
        assert!(!RecoveryKey::is_valid("not a recovery key l0l"));
    }

    #[test]
    fn wrong_length_is_rejected() {
        let encoded = bs58::encode(&[0x8b, 0x01, 0x00, 0x8a])
            .with_alphabet(bs58::Alphabet::BITCOIN)
            .into_string();

        assert_matches!(RecoveryKey::from_base58(&encoded), Err(DecodeError::Length(..)));
    }

    #[test]
    fn passphrase_derivation_is_deterministic() {
        let first = RecoveryKey::from_passphrase("It's a secret to everybody", "salt", 10);
        let second = RecoveryKey::from_passphrase("It's a secret to everybody", "salt", 10);
        let different = RecoveryKey::from_passphrase("It's a secret to everybody", "pepper", 10);

        assert_eq!(first.to_base64(), second.to_base64());
        assert_ne!(first.to_base64(), different.to_base64());
    }

    #[test]
    fn base64_roundtrip() {
        let key = RecoveryKey::new();
        let decoded = RecoveryKey::from_base64(&key.to_base64())
            .expect("We should be able to decode our own base64 export");

        assert_eq!(key.to_base64(), decoded.to_base64());
    }
}
