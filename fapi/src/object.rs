// SPDX-License-Identifier: MIT

//! The object model: keys, NV indices and hierarchies, their canonical
//! wire form, and the templates objects are created from.
//!
//! The name of an object is `nameAlg || Hash(nameAlg, marshal(public))`
//! with the same canonical marshaling the TPM itself applies, so names
//! computed here match names reported by the device.

use crate::crypto;
use crate::error::{Error, Result};
use crate::path::Hierarchy;
use crate::policy::PolicyHarness;
use crate::types::{
    put_2b, put_u16, put_u32, Algorithm, EccCurve, EsysTr, HashAlg, NvAttributes, NvType,
    ObjectAttributes, Reader, SignScheme, SymDef, TpmHandle, MAX_DIGEST_SIZE,
};
use serde::{Deserialize, Serialize};

/// Algorithm-specific part of a `TPMT_PUBLIC`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "alg")]
pub enum PublicParams {
    Rsa {
        symmetric: Option<SymDef>,
        scheme: SignScheme,
        key_bits: u16,
        exponent: u32,
    },
    Ecc {
        symmetric: Option<SymDef>,
        scheme: SignScheme,
        curve: EccCurve,
    },
    KeyedHash {
        scheme: Algorithm,
    },
    SymCipher {
        sym: SymDef,
    },
}

fn put_symmetric(buf: &mut Vec<u8>, symmetric: Option<&SymDef>) {
    match symmetric {
        Some(sym) => {
            put_u16(buf, sym.algorithm as u16);
            put_u16(buf, sym.key_bits);
            put_u16(buf, sym.mode as u16);
        }
        None => put_u16(buf, Algorithm::Null as u16),
    }
}

fn put_scheme(buf: &mut Vec<u8>, scheme: SignScheme) {
    put_u16(buf, scheme.scheme as u16);
    if scheme.scheme != Algorithm::Null {
        put_u16(buf, scheme.hash_alg as u16);
    }
}

fn get_symmetric(r: &mut Reader) -> Option<Option<SymDef>> {
    let alg = Algorithm::from_repr(r.get_u16()?)?;
    if alg == Algorithm::Null {
        return Some(None);
    }
    let key_bits = r.get_u16()?;
    let mode = Algorithm::from_repr(r.get_u16()?)?;
    Some(Some(SymDef {
        algorithm: alg,
        key_bits,
        mode,
    }))
}

fn get_scheme(r: &mut Reader) -> Option<SignScheme> {
    let scheme = Algorithm::from_repr(r.get_u16()?)?;
    let hash_alg = if scheme == Algorithm::Null {
        HashAlg::Sha256
    } else {
        HashAlg::from_repr(r.get_u16()?)?
    };
    Some(SignScheme { scheme, hash_alg })
}

/// `TPMT_PUBLIC`: the public area of a key object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicArea {
    pub name_alg: HashAlg,
    pub attributes: ObjectAttributes,
    /// Policy digest constrained onto the object; empty when none.
    #[serde(with = "hex")]
    pub auth_policy: Vec<u8>,
    pub params: PublicParams,
    /// Unique field (modulus, point or keyed-hash digest).
    #[serde(with = "hex")]
    pub unique: Vec<u8>,
}

impl PublicArea {
    /// The `TPM_ALG_ID` of the object type.
    #[must_use]
    pub fn alg_type(&self) -> Algorithm {
        match self.params {
            PublicParams::Rsa { .. } => Algorithm::Rsa,
            PublicParams::Ecc { .. } => Algorithm::Ecc,
            PublicParams::KeyedHash { .. } => Algorithm::KeyedHash,
            PublicParams::SymCipher { .. } => Algorithm::SymCipher,
        }
    }

    /// Canonical big-endian marshaling of the public area.
    #[must_use]
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_u16(&mut buf, self.alg_type() as u16);
        put_u16(&mut buf, self.name_alg as u16);
        put_u32(&mut buf, self.attributes.bits());
        put_2b(&mut buf, &self.auth_policy);
        match &self.params {
            PublicParams::Rsa {
                symmetric,
                scheme,
                key_bits,
                exponent,
            } => {
                put_symmetric(&mut buf, symmetric.as_ref());
                put_scheme(&mut buf, *scheme);
                put_u16(&mut buf, *key_bits);
                put_u32(&mut buf, *exponent);
            }
            PublicParams::Ecc {
                symmetric,
                scheme,
                curve,
            } => {
                put_symmetric(&mut buf, symmetric.as_ref());
                put_scheme(&mut buf, *scheme);
                put_u16(&mut buf, *curve as u16);
                // KDF scheme is always null.
                put_u16(&mut buf, Algorithm::Null as u16);
            }
            PublicParams::KeyedHash { scheme } => {
                put_u16(&mut buf, *scheme as u16);
            }
            PublicParams::SymCipher { sym } => {
                put_u16(&mut buf, sym.algorithm as u16);
                put_u16(&mut buf, sym.key_bits);
                put_u16(&mut buf, sym.mode as u16);
            }
        }
        put_2b(&mut buf, &self.unique);
        buf
    }

    /// Parses a canonical public area, returning it and the bytes consumed.
    ///
    /// # Errors
    ///
    /// Fails with `BadValue` on truncated or inconsistent input.
    pub fn unmarshal(buf: &[u8]) -> Result<(PublicArea, usize)> {
        let mut r = Reader::new(buf);
        let mut inner = || -> Option<PublicArea> {
            let alg_type = Algorithm::from_repr(r.get_u16()?)?;
            let name_alg = HashAlg::from_repr(r.get_u16()?)?;
            let attributes = ObjectAttributes::from_bits_retain(r.get_u32()?);
            let auth_policy = r.get_2b()?;
            let params = match alg_type {
                Algorithm::Rsa => PublicParams::Rsa {
                    symmetric: get_symmetric(&mut r)?,
                    scheme: get_scheme(&mut r)?,
                    key_bits: r.get_u16()?,
                    exponent: r.get_u32()?,
                },
                Algorithm::Ecc => {
                    let symmetric = get_symmetric(&mut r)?;
                    let scheme = get_scheme(&mut r)?;
                    let curve = EccCurve::from_repr(r.get_u16()?)?;
                    // Skip the null KDF scheme.
                    r.get_u16()?;
                    PublicParams::Ecc {
                        symmetric,
                        scheme,
                        curve,
                    }
                }
                Algorithm::KeyedHash => PublicParams::KeyedHash {
                    scheme: Algorithm::from_repr(r.get_u16()?)?,
                },
                Algorithm::SymCipher => PublicParams::SymCipher {
                    sym: SymDef {
                        algorithm: Algorithm::from_repr(r.get_u16()?)?,
                        key_bits: r.get_u16()?,
                        mode: Algorithm::from_repr(r.get_u16()?)?,
                    },
                },
                _ => return None,
            };
            let unique = r.get_2b()?;
            Some(PublicArea {
                name_alg,
                attributes,
                auth_policy,
                params,
                unique,
            })
        };
        let area = inner().ok_or(Error::BadValue)?;
        Ok((area, r.offset()))
    }

    /// Computes the object name, `nameAlg || Hash(nameAlg, marshal(self))`.
    ///
    /// # Errors
    ///
    /// Propagates hashing errors.
    pub fn name(&self) -> Result<Vec<u8>> {
        object_name(self.name_alg, &self.marshal())
    }
}

/// `TPMS_NV_PUBLIC`: the public area of an NV index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NvPublicArea {
    pub nv_index: TpmHandle,
    pub name_alg: HashAlg,
    pub attributes: NvAttributes,
    #[serde(with = "hex")]
    pub auth_policy: Vec<u8>,
    pub data_size: u16,
}

impl NvPublicArea {
    /// Canonical big-endian marshaling of the NV public area.
    #[must_use]
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_u32(&mut buf, self.nv_index);
        put_u16(&mut buf, self.name_alg as u16);
        put_u32(&mut buf, self.attributes.bits());
        put_2b(&mut buf, &self.auth_policy);
        put_u16(&mut buf, self.data_size);
        buf
    }

    /// Parses a canonical NV public area.
    ///
    /// # Errors
    ///
    /// Fails with `BadValue` on truncated or inconsistent input.
    pub fn unmarshal(buf: &[u8]) -> Result<(NvPublicArea, usize)> {
        let mut r = Reader::new(buf);
        let mut inner = || -> Option<NvPublicArea> {
            Some(NvPublicArea {
                nv_index: r.get_u32()?,
                name_alg: HashAlg::from_repr(r.get_u16()?)?,
                attributes: NvAttributes::from_bits_retain(r.get_u32()?),
                auth_policy: r.get_2b()?,
                data_size: r.get_u16()?,
            })
        };
        let area = inner().ok_or(Error::BadValue)?;
        Ok((area, r.offset()))
    }

    /// Computes the NV index name.
    ///
    /// # Errors
    ///
    /// Propagates hashing errors.
    pub fn name(&self) -> Result<Vec<u8>> {
        object_name(self.name_alg, &self.marshal())
    }
}

fn object_name(name_alg: HashAlg, marshaled: &[u8]) -> Result<Vec<u8>> {
    let digest = crypto::hash(name_alg, marshaled)?;
    let mut name = Vec::with_capacity(2 + digest.len());
    put_u16(&mut name, name_alg as u16);
    name.extend(digest);
    Ok(name)
}

/// `TPMS_SENSITIVE_CREATE`: secret creation parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sensitive {
    pub user_auth: Vec<u8>,
    pub data: Vec<u8>,
}

/// State of the per-object authorization sub-FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthState {
    #[default]
    Init,
    ExecPolicy,
}

/// A key as persisted in the keystore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyObject {
    pub public: PublicArea,
    /// TPM-wrapped private blob; empty for primaries.
    #[serde(with = "hex")]
    pub private: Vec<u8>,
    /// ESYS-serialized handle, present iff the key is persistent.
    pub serialization: Option<Vec<u8>>,
    pub policy: Option<PolicyHarness>,
    pub signing_scheme: SignScheme,
    pub description: Option<String>,
    pub certificate: Option<String>,
    pub app_data: Option<Vec<u8>>,
    pub with_auth: bool,
    /// 0 for transient keys.
    pub persistent_handle: TpmHandle,
}

/// An NV index as persisted in the keystore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NvObject {
    pub public: NvPublicArea,
    pub policy: Option<PolicyHarness>,
    pub description: Option<String>,
    pub app_data: Option<Vec<u8>>,
    /// JSON array text of the extend event log.
    pub event_log: Option<String>,
    pub serialization: Option<Vec<u8>>,
    pub with_auth: bool,
}

/// A hierarchy as persisted in the keystore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HierarchyObject {
    pub hierarchy: HierarchyKind,
    #[serde(with = "hex")]
    pub auth_policy: Vec<u8>,
    pub with_auth: bool,
    pub description: Option<String>,
}

/// Serde-friendly mirror of [`Hierarchy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HierarchyKind {
    Owner,
    Endorsement,
    Platform,
    Null,
    Lockout,
}

impl From<Hierarchy> for HierarchyKind {
    fn from(h: Hierarchy) -> HierarchyKind {
        match h {
            Hierarchy::Owner => HierarchyKind::Owner,
            Hierarchy::Endorsement => HierarchyKind::Endorsement,
            Hierarchy::Platform => HierarchyKind::Platform,
            Hierarchy::Null => HierarchyKind::Null,
            Hierarchy::Lockout => HierarchyKind::Lockout,
        }
    }
}

impl From<HierarchyKind> for Hierarchy {
    fn from(h: HierarchyKind) -> Hierarchy {
        match h {
            HierarchyKind::Owner => Hierarchy::Owner,
            HierarchyKind::Endorsement => Hierarchy::Endorsement,
            HierarchyKind::Platform => Hierarchy::Platform,
            HierarchyKind::Null => Hierarchy::Null,
            HierarchyKind::Lockout => Hierarchy::Lockout,
        }
    }
}

/// Kind-specific payload of an [`Object`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ObjectKind {
    Key(KeyObject),
    Nv(NvObject),
    Hierarchy(HierarchyObject),
}

/// A loaded FAPI object: the stored record plus its runtime TPM binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Object {
    #[serde(flatten)]
    pub kind: ObjectKind,
    /// Live ESYS handle; never persisted.
    #[serde(skip)]
    pub handle: EsysTr,
    #[serde(skip)]
    pub auth_state: AuthState,
}

impl Object {
    /// Wraps a key record.
    #[must_use]
    pub fn key(key: KeyObject) -> Object {
        Object {
            kind: ObjectKind::Key(key),
            handle: EsysTr::NONE,
            auth_state: AuthState::Init,
        }
    }

    /// Wraps an NV record.
    #[must_use]
    pub fn nv(nv: NvObject) -> Object {
        Object {
            kind: ObjectKind::Nv(nv),
            handle: EsysTr::NONE,
            auth_state: AuthState::Init,
        }
    }

    /// Builds a hierarchy object bound to its reserved ESYS handle.
    #[must_use]
    pub fn hierarchy(hierarchy: Hierarchy) -> Object {
        Object {
            kind: ObjectKind::Hierarchy(HierarchyObject {
                hierarchy: hierarchy.into(),
                auth_policy: Vec::new(),
                with_auth: false,
                description: None,
            }),
            handle: hierarchy.esys_handle(),
            auth_state: AuthState::Init,
        }
    }

    #[must_use]
    pub fn as_key(&self) -> Option<&KeyObject> {
        match &self.kind {
            ObjectKind::Key(key) => Some(key),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_key_mut(&mut self) -> Option<&mut KeyObject> {
        match &mut self.kind {
            ObjectKind::Key(key) => Some(key),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_nv(&self) -> Option<&NvObject> {
        match &self.kind {
            ObjectKind::Nv(nv) => Some(nv),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_nv_mut(&mut self) -> Option<&mut NvObject> {
        match &mut self.kind {
            ObjectKind::Nv(nv) => Some(nv),
            _ => None,
        }
    }

    /// Size of the policy digest constrained onto the object, 0 when none.
    #[must_use]
    pub fn policy_digest_size(&self) -> usize {
        match &self.kind {
            ObjectKind::Key(key) => key.public.auth_policy.len(),
            ObjectKind::Nv(nv) => nv.public.auth_policy.len(),
            ObjectKind::Hierarchy(h) => h.auth_policy.len(),
        }
    }

    /// Whether an auth value is set on the object.
    #[must_use]
    pub fn with_auth(&self) -> bool {
        match &self.kind {
            ObjectKind::Key(key) => key.with_auth,
            ObjectKind::Nv(nv) => nv.with_auth,
            ObjectKind::Hierarchy(h) => h.with_auth,
        }
    }

    /// The policy harness constrained onto the object, if any.
    #[must_use]
    pub fn policy(&self) -> Option<&PolicyHarness> {
        match &self.kind {
            ObjectKind::Key(key) => key.policy.as_ref(),
            ObjectKind::Nv(nv) => nv.policy.as_ref(),
            ObjectKind::Hierarchy(_) => None,
        }
    }

    /// Name algorithm governing the object's sessions and name.
    #[must_use]
    pub fn name_alg(&self) -> HashAlg {
        match &self.kind {
            ObjectKind::Key(key) => key.public.name_alg,
            ObjectKind::Nv(nv) => nv.public.name_alg,
            ObjectKind::Hierarchy(_) => HashAlg::Sha256,
        }
    }

    /// The object's description, if set.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        match &self.kind {
            ObjectKind::Key(key) => key.description.as_deref(),
            ObjectKind::Nv(nv) => nv.description.as_deref(),
            ObjectKind::Hierarchy(h) => h.description.as_deref(),
        }
    }

    /// Replaces the object's description.
    pub fn set_description(&mut self, description: Option<String>) {
        match &mut self.kind {
            ObjectKind::Key(key) => key.description = description,
            ObjectKind::Nv(nv) => nv.description = description,
            ObjectKind::Hierarchy(h) => h.description = description,
        }
    }

    /// The application data blob, if set. Hierarchies carry none.
    ///
    /// # Errors
    ///
    /// Fails with `BadPath` for object kinds without app data.
    pub fn app_data(&self) -> Result<Option<&[u8]>> {
        match &self.kind {
            ObjectKind::Key(key) => Ok(key.app_data.as_deref()),
            ObjectKind::Nv(nv) => Ok(nv.app_data.as_deref()),
            ObjectKind::Hierarchy(_) => Err(Error::BadPath),
        }
    }

    /// Replaces the application data blob.
    ///
    /// # Errors
    ///
    /// Fails with `BadPath` for object kinds without app data.
    pub fn set_app_data(&mut self, app_data: Option<Vec<u8>>) -> Result<()> {
        match &mut self.kind {
            ObjectKind::Key(key) => key.app_data = app_data,
            ObjectKind::Nv(nv) => nv.app_data = app_data,
            ObjectKind::Hierarchy(_) => return Err(Error::BadPath),
        }
        Ok(())
    }

    /// Computes the object's TPM name. Hierarchies have none.
    ///
    /// # Errors
    ///
    /// Propagates hashing errors.
    pub fn name(&self) -> Result<Vec<u8>> {
        match &self.kind {
            ObjectKind::Key(key) => key.public.name(),
            ObjectKind::Nv(nv) => nv.public.name(),
            ObjectKind::Hierarchy(_) => Ok(Vec::new()),
        }
    }
}

/// Template for key creation, produced from a comma-separated flag list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyTemplate {
    /// Store the record under the system root instead of the user root.
    pub system: bool,
    pub persistent: bool,
    pub persistent_handle: TpmHandle,
    pub attributes: ObjectAttributes,
}

/// Parses key flags (`system`, `sign`, `decrypt`, `restricted`,
/// `exportable`, `noda`, `0x<hex>`).
///
/// # Errors
///
/// Fails with `BadValue` on unknown flags or when `restricted` is not
/// combined with exactly one of `sign`/`decrypt`.
pub fn set_key_flags(flags: &str, with_policy: bool) -> Result<KeyTemplate> {
    let mut template = KeyTemplate::default();
    let mut attributes = ObjectAttributes::empty();
    let mut exportable = false;

    for flag in flags
        .split([',', ' '])
        .map(str::trim)
        .filter(|f| !f.is_empty())
    {
        if flag.eq_ignore_ascii_case("system") {
            template.system = true;
        } else if flag.eq_ignore_ascii_case("sign") {
            attributes |= ObjectAttributes::SIGN_ENCRYPT;
        } else if flag.eq_ignore_ascii_case("decrypt") {
            attributes |= ObjectAttributes::DECRYPT;
        } else if flag.eq_ignore_ascii_case("restricted") {
            attributes |= ObjectAttributes::RESTRICTED;
        } else if flag.eq_ignore_ascii_case("exportable") {
            // No inner symmetric encryption is used, so encrypted
            // duplication stays clear.
            exportable = true;
        } else if flag.eq_ignore_ascii_case("noda") {
            attributes |= ObjectAttributes::NO_DA;
        } else if let Some(hex_part) = flag.strip_prefix("0x") {
            let handle = TpmHandle::from_str_radix(hex_part, 16).map_err(|_| Error::BadValue)?;
            template.persistent_handle = handle;
            template.persistent = true;
        } else {
            return Err(Error::BadValue);
        }
    }

    if exportable {
        attributes.remove(ObjectAttributes::FIXED_TPM | ObjectAttributes::FIXED_PARENT);
    } else {
        attributes |= ObjectAttributes::FIXED_TPM | ObjectAttributes::FIXED_PARENT;
    }
    attributes |= ObjectAttributes::SENSITIVE_DATA_ORIGIN;
    if with_policy {
        attributes |= ObjectAttributes::ADMIN_WITH_POLICY;
    } else {
        attributes |= ObjectAttributes::USER_WITH_AUTH;
    }

    if attributes.contains(ObjectAttributes::RESTRICTED)
        && attributes.contains(ObjectAttributes::SIGN_ENCRYPT)
        && attributes.contains(ObjectAttributes::DECRYPT)
    {
        return Err(Error::BadValue);
    }

    template.attributes = attributes;
    Ok(template)
}

/// Template for NV index creation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NvTemplate {
    pub system: bool,
    pub nv_index: TpmHandle,
    pub attributes: NvAttributes,
}

/// Parses NV flags (`system`, `bitfield`, `counter`, `pcr`, `noda`,
/// `0x<hex>`).
///
/// # Errors
///
/// Fails with `BadValue` on unknown flags or more than one type flag.
pub fn set_nv_flags(flags: &str, with_policy: bool) -> Result<NvTemplate> {
    let mut template = NvTemplate::default();
    let mut attributes = NvAttributes::empty();
    let mut type_count = 0;

    for flag in flags
        .split([',', ' '])
        .map(str::trim)
        .filter(|f| !f.is_empty())
    {
        if flag.eq_ignore_ascii_case("system") {
            template.system = true;
        } else if flag.eq_ignore_ascii_case("bitfield") {
            attributes = attributes.with_nv_type(NvType::Bits);
            type_count += 1;
        } else if flag.eq_ignore_ascii_case("counter") {
            attributes = attributes.with_nv_type(NvType::Counter);
            type_count += 1;
        } else if flag.eq_ignore_ascii_case("pcr") {
            attributes = attributes.with_nv_type(NvType::Extend);
            type_count += 1;
        } else if flag.eq_ignore_ascii_case("noda") {
            attributes |= NvAttributes::NO_DA;
        } else if let Some(hex_part) = flag.strip_prefix("0x") {
            template.nv_index = TpmHandle::from_str_radix(hex_part, 16).map_err(|_| Error::BadValue)?;
        } else {
            return Err(Error::BadValue);
        }
    }

    if type_count > 1 {
        return Err(Error::BadValue);
    }

    if with_policy {
        attributes |= NvAttributes::POLICYWRITE | NvAttributes::POLICYREAD;
    } else {
        attributes |= NvAttributes::AUTHWRITE | NvAttributes::AUTHREAD;
    }
    attributes |= NvAttributes::READ_STCLEAR | NvAttributes::WRITE_STCLEAR;

    template.attributes = attributes;
    Ok(template)
}

/// Merges a profile into a key template, yielding the public area used
/// for creation.
///
/// Restricted decryptors get the profile's symmetric parameters and a
/// null scheme; restricted signers get the profile's signing scheme.
/// Everything else leaves both null so the scheme is chosen per command.
#[must_use]
pub fn merge_profile_into_template(
    profile: &crate::profile::Profile,
    template: &KeyTemplate,
) -> PublicArea {
    let attributes = template.attributes;
    let restricted = attributes.contains(ObjectAttributes::RESTRICTED);
    let symmetric = (restricted && attributes.contains(ObjectAttributes::DECRYPT))
        .then_some(profile.sym_parameters);
    let null_scheme = SignScheme {
        scheme: Algorithm::Null,
        hash_alg: profile.name_alg,
    };

    let params = if profile.key_type == Algorithm::Ecc {
        PublicParams::Ecc {
            symmetric,
            scheme: if restricted && attributes.contains(ObjectAttributes::SIGN_ENCRYPT) {
                profile.ecc_signing_scheme
            } else {
                null_scheme
            },
            curve: profile.curve,
        }
    } else {
        PublicParams::Rsa {
            symmetric,
            scheme: if restricted && attributes.contains(ObjectAttributes::SIGN_ENCRYPT) {
                profile.rsa_signing_scheme
            } else {
                null_scheme
            },
            key_bits: profile.rsa_key_bits,
            exponent: profile.rsa_exponent,
        }
    };

    PublicArea {
        name_alg: profile.name_alg,
        attributes,
        auth_policy: Vec::new(),
        params,
        unique: Vec::new(),
    }
}

/// Default data size of an ordinary NV index when the caller passes none.
pub const NV_DEFAULT_SIZE: u16 = 64;

/// The NV data size mandated by the template type and profile.
///
/// Extendable indices hold one digest under the profile's name algorithm;
/// counters and bit fields are fixed at eight bytes; ordinary space takes
/// the requested size or the default.
#[must_use]
pub fn nv_template_size(attributes: NvAttributes, name_alg: HashAlg, requested: Option<u16>) -> u16 {
    match attributes.nv_type() {
        NvType::Extend => u16::try_from(name_alg.digest_size()).unwrap_or(MAX_DIGEST_SIZE as u16),
        NvType::Counter | NvType::Bits => 8,
        _ => requested.unwrap_or(NV_DEFAULT_SIZE),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        nv_template_size, set_key_flags, set_nv_flags, NvPublicArea, Object, PublicArea,
        PublicParams,
    };
    use crate::error::Error;
    use crate::path::Hierarchy;
    use crate::types::{
        Algorithm, HashAlg, NvAttributes, NvType, ObjectAttributes, SignScheme, SymDef,
    };

    fn rsa_public() -> PublicArea {
        PublicArea {
            name_alg: HashAlg::Sha256,
            attributes: ObjectAttributes::SIGN_ENCRYPT
                | ObjectAttributes::FIXED_TPM
                | ObjectAttributes::FIXED_PARENT
                | ObjectAttributes::USER_WITH_AUTH,
            auth_policy: Vec::new(),
            params: PublicParams::Rsa {
                symmetric: None,
                scheme: SignScheme {
                    scheme: Algorithm::Rsapss,
                    hash_alg: HashAlg::Sha256,
                },
                key_bits: 2048,
                exponent: 0,
            },
            unique: vec![0xAB; 256],
        }
    }

    #[test]
    fn public_marshal_round_trip_preserves_name() {
        let public = rsa_public();
        let wire = public.marshal();
        let (back, used) = PublicArea::unmarshal(&wire).unwrap();
        assert_eq!(used, wire.len());
        assert_eq!(back, public);
        assert_eq!(back.name().unwrap(), public.name().unwrap());
    }

    #[test]
    fn sym_cipher_round_trip() {
        let public = PublicArea {
            name_alg: HashAlg::Sha256,
            attributes: ObjectAttributes::DECRYPT | ObjectAttributes::SIGN_ENCRYPT,
            auth_policy: vec![1, 2, 3],
            params: PublicParams::SymCipher {
                sym: SymDef::default(),
            },
            unique: vec![9; 32],
        };
        let (back, _) = PublicArea::unmarshal(&public.marshal()).unwrap();
        assert_eq!(back, public);
    }

    #[test]
    fn nv_public_round_trip() {
        let public = NvPublicArea {
            nv_index: 0x0180_0004,
            name_alg: HashAlg::Sha256,
            attributes: NvAttributes::AUTHREAD | NvAttributes::AUTHWRITE,
            auth_policy: Vec::new(),
            data_size: 64,
        };
        let wire = public.marshal();
        let (back, used) = NvPublicArea::unmarshal(&wire).unwrap();
        assert_eq!(used, wire.len());
        assert_eq!(back, public);
        // Name starts with the marshaled name algorithm.
        let name = public.name().unwrap();
        assert_eq!(&name[..2], &(HashAlg::Sha256 as u16).to_be_bytes());
        assert_eq!(name.len(), 2 + 32);
    }

    #[test]
    fn name_changes_with_attributes() {
        let a = rsa_public();
        let mut b = a.clone();
        b.attributes |= ObjectAttributes::NO_DA;
        assert_ne!(a.name().unwrap(), b.name().unwrap());
    }

    #[test]
    fn key_flags() {
        let template = set_key_flags("system, sign, noda, 0x81000001", false).unwrap();
        assert!(template.system);
        assert!(template.persistent);
        assert_eq!(template.persistent_handle, 0x8100_0001);
        assert!(template.attributes.contains(ObjectAttributes::SIGN_ENCRYPT));
        assert!(template.attributes.contains(ObjectAttributes::FIXED_TPM));
        assert!(template
            .attributes
            .contains(ObjectAttributes::USER_WITH_AUTH));

        let exportable = set_key_flags("sign,exportable", true).unwrap();
        assert!(!exportable.attributes.contains(ObjectAttributes::FIXED_TPM));
        assert!(exportable
            .attributes
            .contains(ObjectAttributes::ADMIN_WITH_POLICY));

        assert_eq!(
            set_key_flags("restricted,sign,decrypt", false),
            Err(Error::BadValue)
        );
        assert_eq!(set_key_flags("bogus", false), Err(Error::BadValue));
    }

    #[test]
    fn nv_flags() {
        let template = set_nv_flags("pcr,noda", false).unwrap();
        assert_eq!(template.attributes.nv_type(), NvType::Extend);
        assert!(template.attributes.contains(NvAttributes::AUTHREAD));
        assert!(template.attributes.contains(NvAttributes::READ_STCLEAR));

        let policy = set_nv_flags("counter", true).unwrap();
        assert!(policy.attributes.contains(NvAttributes::POLICYWRITE));
        assert!(!policy.attributes.contains(NvAttributes::AUTHWRITE));

        assert_eq!(set_nv_flags("counter,bitfield", false), Err(Error::BadValue));
    }

    #[test]
    fn template_sizes() {
        let extend = set_nv_flags("pcr", false).unwrap();
        assert_eq!(
            nv_template_size(extend.attributes, HashAlg::Sha256, Some(100)),
            32
        );
        let counter = set_nv_flags("counter", false).unwrap();
        assert_eq!(
            nv_template_size(counter.attributes, HashAlg::Sha256, None),
            8
        );
        let ordinary = set_nv_flags("", false).unwrap();
        assert_eq!(
            nv_template_size(ordinary.attributes, HashAlg::Sha256, None),
            64
        );
        assert_eq!(
            nv_template_size(ordinary.attributes, HashAlg::Sha256, Some(100)),
            100
        );
    }

    #[test]
    fn hierarchy_binding() {
        let object = Object::hierarchy(Hierarchy::Platform);
        assert_eq!(object.handle, Hierarchy::Platform.esys_handle());
        assert_eq!(object.policy_digest_size(), 0);
        assert!(object.name().unwrap().is_empty());
    }
}
