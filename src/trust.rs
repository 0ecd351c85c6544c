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

//! Trust evaluation for backup versions.
//!
//! Whether a version found on the server may be used for uploads is decided
//! purely by the signatures over its auth data, never by who claims to have
//! created it.

use std::collections::BTreeMap;

use vodozemac::{Ed25519PublicKey, Ed25519Signature};

use crate::types::BackupVersion;

/// The result of verifying a single signature over a backup version's auth
/// data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignatureState {
    /// The signature is missing.
    Missing,
    /// The signature is invalid.
    Invalid,
    /// The signature is valid but the device that created it is not trusted.
    ValidButNotTrusted,
    /// The signature is valid and the device that created it is trusted.
    ValidAndTrusted,
}

impl SignatureState {
    /// Is the signature valid and made by a trusted device?
    pub fn trusted(self) -> bool {
        self == SignatureState::ValidAndTrusted
    }

    /// Is the signature valid, regardless of the trust of the device that
    /// created it?
    pub fn signed(self) -> bool {
        matches!(self, SignatureState::ValidButNotTrusted | SignatureState::ValidAndTrusted)
    }
}

/// The verdict over a backup version, broken down by signing device.
#[derive(Clone, Debug, Default)]
pub struct BackupVersionTrust {
    /// The verification state of each signature found in the auth data, keyed
    /// by device id.
    pub signatures: BTreeMap<String, SignatureState>,
}

impl BackupVersionTrust {
    /// May the version be used for uploads?
    ///
    /// True if at least one signature is valid and was made by a trusted
    /// device.
    pub fn usable(&self) -> bool {
        self.signatures.values().any(|state| state.trusted())
    }
}

/// The Ed25519 identity of a local device, as far as trust evaluation is
/// concerned.
#[derive(Clone, Debug)]
pub struct DeviceKey {
    /// The Ed25519 signing key of the device.
    pub ed25519_key: Ed25519PublicKey,
    /// Has the user marked this device as verified?
    pub locally_verified: bool,
}

/// Gives the backup engine access to the identity of the device it runs on
/// and of the user's other devices.
pub trait DeviceKeyProvider: Send + Sync + std::fmt::Debug {
    /// The id of the device this engine runs on.
    fn own_device_id(&self) -> &str;

    /// Sign the given canonical JSON with the own device's Ed25519 key.
    fn sign(&self, message: &[u8]) -> Ed25519Signature;

    /// Look up the signing key of one of the user's devices.
    ///
    /// Returns `None` if the device is unknown.
    fn device_signing_key(&self, device_id: &str) -> Option<DeviceKey>;
}

/// Evaluates whether backup versions can be trusted for uploads.
#[derive(Debug)]
pub struct TrustEvaluator {
    device_keys: std::sync::Arc<dyn DeviceKeyProvider>,
    trust_own_device: bool,
}

impl TrustEvaluator {
    pub(crate) fn new(
        device_keys: std::sync::Arc<dyn DeviceKeyProvider>,
        trust_own_device: bool,
    ) -> Self {
        Self { device_keys, trust_own_device }
    }

    /// Verify the signatures over the auth data of the given version.
    ///
    /// Versions using an algorithm we don't implement never get any valid
    /// signatures, they can't be used regardless of who signed them.
    pub fn verify(&self, version: &BackupVersion) -> BackupVersionTrust {
        let mut signatures = BTreeMap::new();

        let Some(auth_data) = version.auth_data() else {
            return BackupVersionTrust { signatures };
        };

        let canonical = auth_data.to_signable_json();

        for (device_id, signature) in &auth_data.signatures {
            let state = self.verify_device_signature(device_id, signature, canonical.as_bytes());
            signatures.insert(device_id.clone(), state);
        }

        BackupVersionTrust { signatures }
    }

    fn verify_device_signature(
        &self,
        device_id: &str,
        signature: &str,
        canonical: &[u8],
    ) -> SignatureState {
        let Some(device) = self.device_keys.device_signing_key(device_id) else {
            return SignatureState::Missing;
        };

        let Ok(signature) = Ed25519Signature::from_base64(signature) else {
            return SignatureState::Invalid;
        };

        if device.ed25519_key.verify(canonical, &signature).is_err() {
            return SignatureState::Invalid;
        }

        let own_device = device_id == self.device_keys.own_device_id();
        let trusted = device.locally_verified || (own_device && self.trust_own_device);

        if trusted {
            SignatureState::ValidAndTrusted
        } else {
            SignatureState::ValidButNotTrusted
        }
    }
}
