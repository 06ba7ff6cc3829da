// SPDX-License-Identifier: MIT

//! The policy model.
//!
//! A policy harness is a declarative tree of policy elements plus the
//! digests already calculated for it, one per hash algorithm. `PolicyOR`
//! elements branch the tree; every other element contributes one policy
//! command. Harnesses are persisted as JSON records in the policy store,
//! referenced from key and NV objects.

pub mod calculate;
pub mod execute;

pub use calculate::{calculate, instantiate};
pub use execute::PolicyExecContext;

use crate::error::{Error, Result};
use crate::object::{NvPublicArea, PublicArea};
use crate::types::{CommandCode, ComparisonOp, HashAlg};
use serde::{Deserialize, Serialize};

/// A calculated digest under one hash algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDigest {
    pub hash_alg: HashAlg,
    #[serde(with = "hex")]
    pub digest: Vec<u8>,
}

/// A table of calculated digests, at most one entry per algorithm.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyDigests(pub Vec<PolicyDigest>);

impl PolicyDigests {
    /// The digest calculated under `hash_alg`, if any.
    #[must_use]
    pub fn get(&self, hash_alg: HashAlg) -> Option<&[u8]> {
        self.0
            .iter()
            .find(|d| d.hash_alg == hash_alg)
            .map(|d| d.digest.as_slice())
    }

    /// Records a digest, replacing any previous entry for the algorithm.
    pub fn set(&mut self, hash_alg: HashAlg, digest: Vec<u8>) {
        if let Some(entry) = self.0.iter_mut().find(|d| d.hash_alg == hash_alg) {
            entry.digest = digest;
        } else {
            self.0.push(PolicyDigest { hash_alg, digest });
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// An authorization produced while executing a `PolicyAuthorize` element;
/// persisted with the harness so it can be replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyAuthorization {
    pub key_public: PublicArea,
    #[serde(with = "hex")]
    pub policy_ref: Vec<u8>,
    #[serde(with = "hex")]
    pub signature: Vec<u8>,
}

/// One branch of a `PolicyOR` element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyBranch {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub policy: Vec<PolicyElement>,
    #[serde(default)]
    pub policy_digests: PolicyDigests,
}

/// The current value of one PCR, used by `PolicyPCR` elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PcrValue {
    pub pcr: u32,
    pub hash_alg: HashAlg,
    /// Empty until instantiation reads the PCR.
    #[serde(default, with = "hex")]
    pub digest: Vec<u8>,
}

fn is_empty_bytes(bytes: &[u8]) -> bool {
    bytes.is_empty()
}

/// A node of the policy tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PolicyElement {
    PolicyOr {
        branches: Vec<PolicyBranch>,
    },
    PolicyPcr {
        pcrs: Vec<PcrValue>,
    },
    PolicySigned {
        #[serde(skip_serializing_if = "Option::is_none")]
        key_path: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        key_public: Option<PublicArea>,
        hash_alg: HashAlg,
        #[serde(default, with = "hex", skip_serializing_if = "is_empty_bytes")]
        policy_ref: Vec<u8>,
        #[serde(default, with = "hex", skip_serializing_if = "is_empty_bytes")]
        cp_hash: Vec<u8>,
    },
    PolicySecret {
        #[serde(skip_serializing_if = "Option::is_none")]
        object_path: Option<String>,
        #[serde(default, with = "hex", skip_serializing_if = "is_empty_bytes")]
        object_name: Vec<u8>,
        #[serde(default, with = "hex", skip_serializing_if = "is_empty_bytes")]
        policy_ref: Vec<u8>,
        #[serde(default, with = "hex", skip_serializing_if = "is_empty_bytes")]
        cp_hash: Vec<u8>,
    },
    PolicyAuthorize {
        #[serde(skip_serializing_if = "Option::is_none")]
        key_path: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        key_public: Option<PublicArea>,
        #[serde(default, with = "hex", skip_serializing_if = "is_empty_bytes")]
        policy_ref: Vec<u8>,
        /// Digest of the authorized policy; read from the session when
        /// empty at execution time.
        #[serde(default, with = "hex", skip_serializing_if = "is_empty_bytes")]
        approved_policy: Vec<u8>,
    },
    PolicyAuthorizeNv {
        #[serde(skip_serializing_if = "Option::is_none")]
        nv_path: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        nv_public: Option<NvPublicArea>,
    },
    PolicyNv {
        #[serde(skip_serializing_if = "Option::is_none")]
        nv_path: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        nv_public: Option<NvPublicArea>,
        #[serde(with = "hex")]
        operand_b: Vec<u8>,
        #[serde(default)]
        offset: u16,
        operation: ComparisonOp,
    },
    PolicyDuplicationSelect {
        #[serde(default, with = "hex", skip_serializing_if = "is_empty_bytes")]
        object_name: Vec<u8>,
        #[serde(skip_serializing_if = "Option::is_none")]
        new_parent_path: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        new_parent_public: Option<PublicArea>,
        #[serde(default, with = "hex", skip_serializing_if = "is_empty_bytes")]
        new_parent_name: Vec<u8>,
        #[serde(default)]
        include_object: bool,
    },
    PolicyLocality {
        locality: u8,
    },
    PolicyCommandCode {
        code: CommandCode,
    },
    PolicyCounterTimer {
        #[serde(with = "hex")]
        operand_b: Vec<u8>,
        #[serde(default)]
        offset: u16,
        operation: ComparisonOp,
    },
    PolicyNvWritten {
        written_set: bool,
    },
    PolicyNameHash {
        #[serde(default)]
        object_paths: Vec<String>,
        #[serde(default, with = "hex", skip_serializing_if = "is_empty_bytes")]
        name_hash: Vec<u8>,
    },
    PolicyCpHash {
        #[serde(with = "hex")]
        cp_hash: Vec<u8>,
    },
    PolicyAuthValue,
    PolicyPassword,
    PolicyPhysicalPresence,
    PolicyAction {
        action: String,
    },
}

impl PolicyElement {
    /// Whether executing this element asserts knowledge of the object's
    /// auth value.
    #[must_use]
    pub fn asserts_auth_value(&self) -> bool {
        matches!(
            self,
            PolicyElement::PolicyAuthValue | PolicyElement::PolicyPassword
        )
    }
}

/// A policy tree plus its cached digests and recorded authorizations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyHarness {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub policy: Vec<PolicyElement>,
    #[serde(default)]
    pub policy_digests: PolicyDigests,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policy_authorizations: Vec<PolicyAuthorization>,
}

impl PolicyHarness {
    /// A harness over the given root element list.
    #[must_use]
    pub fn new(policy: Vec<PolicyElement>) -> PolicyHarness {
        PolicyHarness {
            description: None,
            policy,
            policy_digests: PolicyDigests::default(),
            policy_authorizations: Vec::new(),
        }
    }

    /// The digest calculated under `hash_alg`.
    ///
    /// # Errors
    ///
    /// Fails with `PolicyUnknown` when the digest has not been calculated.
    pub fn digest(&self, hash_alg: HashAlg) -> Result<&[u8]> {
        self.policy_digests.get(hash_alg).ok_or(Error::PolicyUnknown)
    }
}

#[cfg(test)]
mod tests {
    use super::{PolicyBranch, PolicyDigests, PolicyElement, PolicyHarness};
    use crate::types::{CommandCode, HashAlg};

    #[test]
    fn digest_table_replaces_per_alg() {
        let mut digests = PolicyDigests::default();
        digests.set(HashAlg::Sha256, vec![1; 32]);
        digests.set(HashAlg::Sha256, vec![2; 32]);
        digests.set(HashAlg::Sha384, vec![3; 48]);
        assert_eq!(digests.len(), 2);
        assert_eq!(digests.get(HashAlg::Sha256), Some(&[2u8; 32][..]));
    }

    #[test]
    fn harness_record_round_trip() {
        let harness = PolicyHarness::new(vec![PolicyElement::PolicyOr {
            branches: vec![
                PolicyBranch {
                    name: "pin".to_string(),
                    description: None,
                    policy: vec![PolicyElement::PolicyAuthValue],
                    policy_digests: PolicyDigests::default(),
                },
                PolicyBranch {
                    name: "signing".to_string(),
                    description: None,
                    policy: vec![PolicyElement::PolicyCommandCode {
                        code: CommandCode::Sign,
                    }],
                    policy_digests: PolicyDigests::default(),
                },
            ],
        }]);
        let json = serde_json::to_string_pretty(&harness).unwrap();
        let back: PolicyHarness = serde_json::from_str(&json).unwrap();
        assert_eq!(back, harness);
    }
}
