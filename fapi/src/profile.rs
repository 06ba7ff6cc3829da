// SPDX-License-Identifier: MIT

//! Crypto profiles.
//!
//! A profile bundles the defaults a keystore root was provisioned with:
//! key type and size, signing schemes, session symmetric parameters, the
//! name algorithm, the primary key templates and the NV buffer ceiling.
//! Profiles are JSON records living under the keystore root; the context
//! keeps the loaded set and a default selection.

use crate::error::{Error, Result};
use crate::types::{Algorithm, EccCurve, HashAlg, SignScheme, SymDef};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A loaded crypto profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    /// Profile directory name, e.g. `P_RSA2048SHA256`.
    pub name: String,
    /// Default asymmetric key type (`Rsa` or `Ecc`).
    pub key_type: Algorithm,
    pub rsa_key_bits: u16,
    pub rsa_exponent: u32,
    pub curve: EccCurve,
    /// Name algorithm for objects created under this profile.
    pub name_alg: HashAlg,
    pub rsa_signing_scheme: SignScheme,
    pub ecc_signing_scheme: SignScheme,
    pub rsa_decrypt_scheme: Algorithm,
    /// Block mode for symmetric encrypt/decrypt commands.
    pub sym_mode: Algorithm,
    /// Session parameter encryption definition.
    pub sym_parameters: SymDef,
    /// Largest chunk the TPM accepts in one NV read or write.
    pub nv_buffer_max: usize,
    /// Template flags for the storage root key.
    pub srk_template: String,
    /// Template flags for the endorsement key.
    pub ek_template: String,
    /// Policy path constrained onto the SRK, if any.
    pub srk_policy: Option<String>,
    /// Policy path constrained onto the EK, if any.
    pub ek_policy: Option<String>,
}

impl Default for Profile {
    fn default() -> Self {
        Profile {
            name: "P_RSA2048SHA256".to_string(),
            key_type: Algorithm::Rsa,
            rsa_key_bits: 2048,
            rsa_exponent: 0,
            curve: EccCurve::NistP256,
            name_alg: HashAlg::Sha256,
            rsa_signing_scheme: SignScheme {
                scheme: Algorithm::Rsapss,
                hash_alg: HashAlg::Sha256,
            },
            ecc_signing_scheme: SignScheme {
                scheme: Algorithm::Ecdsa,
                hash_alg: HashAlg::Sha256,
            },
            rsa_decrypt_scheme: Algorithm::Oaep,
            sym_mode: Algorithm::Cfb,
            sym_parameters: SymDef::default(),
            nv_buffer_max: 1024,
            srk_template: "system,restricted,decrypt,noda".to_string(),
            ek_template: "system,restricted,decrypt".to_string(),
            srk_policy: None,
            ek_policy: None,
        }
    }
}

impl Profile {
    /// The signing scheme matching the profile's key type.
    #[must_use]
    pub fn signing_scheme(&self) -> SignScheme {
        match self.key_type {
            Algorithm::Ecc => self.ecc_signing_scheme,
            _ => self.rsa_signing_scheme,
        }
    }
}

/// The set of profiles known to a context.
#[derive(Debug, Clone)]
pub struct Profiles {
    default_name: String,
    profiles: HashMap<String, Profile>,
}

impl Profiles {
    /// Creates a profile set with `default` preselected.
    #[must_use]
    pub fn new(default: Profile) -> Profiles {
        let default_name = default.name.clone();
        let mut profiles = HashMap::new();
        profiles.insert(default_name.clone(), default);
        Profiles {
            default_name,
            profiles,
        }
    }

    /// Registers an additional profile.
    pub fn insert(&mut self, profile: Profile) {
        self.profiles.insert(profile.name.clone(), profile);
    }

    /// The context's default profile.
    #[must_use]
    pub fn default_profile(&self) -> &Profile {
        &self.profiles[&self.default_name]
    }

    /// Name of the default profile.
    #[must_use]
    pub fn default_name(&self) -> &str {
        &self.default_name
    }

    /// Looks up a profile by directory name.
    ///
    /// # Errors
    ///
    /// Fails with `BadPath` for unknown profiles.
    pub fn get(&self, name: &str) -> Result<&Profile> {
        self.profiles.get(name).ok_or(Error::BadPath)
    }
}

impl Default for Profiles {
    fn default() -> Self {
        Profiles::new(Profile::default())
    }
}
