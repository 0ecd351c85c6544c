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

//! Key material for the backup engine.
//!
//! The [`RecoveryKey`] is the private half, it stays with the user and is the
//! only thing that can decrypt backed up session keys. The [`BackupKey`] is
//! the public half, it is published in the backup version's auth data and is
//! all that's needed to encrypt and upload session keys.

mod backup;
mod recovery;

pub use backup::BackupKey;
pub use recovery::{DecodeError, RecoveryKey};
