// SPDX-License-Identifier: MIT

//! TPM 2.0 constants and attribute words used by the feature API engine.
//!
//! Only the values the engine actually touches are enumerated; the numeric
//! assignments follow the TPM 2.0 Structures specification.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use strum_macros::FromRepr;

/// Enumeration of the `TPM_ALG_ID` hash values accepted as name algorithms.
///
/// The possible values for `TPM_ALG_ID` are described in the section 6.3 of
/// the TPM 2.0 Structures specification.
#[derive(FromRepr, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum HashAlg {
    /// `TPM_ALG_SHA1`
    Sha1 = 0x0004,
    /// `TPM_ALG_SHA256`
    Sha256 = 0x000B,
    /// `TPM_ALG_SHA384`
    Sha384 = 0x000C,
    /// `TPM_ALG_SHA512`
    Sha512 = 0x000D,
}

impl HashAlg {
    /// Size in bytes of a digest produced under this algorithm.
    #[must_use]
    pub fn digest_size(self) -> usize {
        match self {
            HashAlg::Sha1 => 20,
            HashAlg::Sha256 => 32,
            HashAlg::Sha384 => 48,
            HashAlg::Sha512 => 64,
        }
    }
}

/// Largest digest size the engine handles (`sizeof(TPMU_HA)`).
pub const MAX_DIGEST_SIZE: usize = 64;

/// Enumeration of the `TPM_ALG_ID` values used by object templates and
/// schemes.
#[derive(FromRepr, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum Algorithm {
    /// `TPM_ALG_ERROR`
    Error = 0x0000,
    /// `TPM_ALG_RSA`
    Rsa = 0x0001,
    /// `TPM_ALG_HMAC`
    Hmac = 0x0005,
    /// `TPM_ALG_AES`
    Aes = 0x0006,
    /// `TPM_ALG_KEYEDHASH`
    KeyedHash = 0x0008,
    /// `TPM_ALG_NULL`
    Null = 0x0010,
    /// `TPM_ALG_RSASSA`
    Rsassa = 0x0014,
    /// `TPM_ALG_RSAES`
    Rsaes = 0x0015,
    /// `TPM_ALG_RSAPSS`
    Rsapss = 0x0016,
    /// `TPM_ALG_OAEP`
    Oaep = 0x0017,
    /// `TPM_ALG_ECDSA`
    Ecdsa = 0x0018,
    /// `TPM_ALG_ECDH`
    Ecdh = 0x0019,
    /// `TPM_ALG_ECC`
    Ecc = 0x0023,
    /// `TPM_ALG_SYMCIPHER`
    SymCipher = 0x0025,
    /// `TPM_ALG_CTR`
    Ctr = 0x0040,
    /// `TPM_ALG_OFB`
    Ofb = 0x0041,
    /// `TPM_ALG_CBC`
    Cbc = 0x0042,
    /// `TPM_ALG_CFB`
    Cfb = 0x0043,
    /// `TPM_ALG_ECB`
    Ecb = 0x0044,
}

/// Enumeration of the `TPM_ECC_CURVE` values.
#[derive(FromRepr, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum EccCurve {
    /// `TPM_ECC_NONE`
    None = 0x0000,
    /// `TPM_ECC_NIST_P256`
    NistP256 = 0x0003,
    /// `TPM_ECC_NIST_P384`
    NistP384 = 0x0004,
    /// `TPM_ECC_NIST_P521`
    NistP521 = 0x0005,
}

/// Enumeration of the `TPM_CC` values the engine issues or folds into
/// policy digests.
///
/// The possible values for `TPM_CC` are described in the section 6.5.2 of
/// the TPM 2.0 Structures specification.
#[derive(FromRepr, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum CommandCode {
    /// `TPM_CC_NV_Extend`
    NvExtend = 0x0000_0136,
    /// `TPM_CC_NV_Write`
    NvWrite = 0x0000_0137,
    /// `TPM_CC_PolicyNV`
    PolicyNv = 0x0000_0149,
    /// `TPM_CC_NV_Read`
    NvRead = 0x0000_014E,
    /// `TPM_CC_PolicySecret`
    PolicySecret = 0x0000_0151,
    /// `TPM_CC_Create`
    Create = 0x0000_0153,
    /// `TPM_CC_Load`
    Load = 0x0000_0157,
    /// `TPM_CC_Sign`
    Sign = 0x0000_015D,
    /// `TPM_CC_Unseal`
    Unseal = 0x0000_015E,
    /// `TPM_CC_PolicySigned`
    PolicySigned = 0x0000_0160,
    /// `TPM_CC_EncryptDecrypt`
    EncryptDecrypt = 0x0000_0164,
    /// `TPM_CC_PolicyAuthorize`
    PolicyAuthorize = 0x0000_016A,
    /// `TPM_CC_PolicyAuthValue`
    PolicyAuthValue = 0x0000_016B,
    /// `TPM_CC_PolicyCommandCode`
    PolicyCommandCode = 0x0000_016C,
    /// `TPM_CC_PolicyCounterTimer`
    PolicyCounterTimer = 0x0000_016D,
    /// `TPM_CC_PolicyCpHash`
    PolicyCpHash = 0x0000_016E,
    /// `TPM_CC_PolicyLocality`
    PolicyLocality = 0x0000_016F,
    /// `TPM_CC_PolicyNameHash`
    PolicyNameHash = 0x0000_0170,
    /// `TPM_CC_PolicyOR`
    PolicyOr = 0x0000_0171,
    /// `TPM_CC_GetCapability`
    GetCapability = 0x0000_017A,
    /// `TPM_CC_PolicyPCR`
    PolicyPcr = 0x0000_017F,
    /// `TPM_CC_PolicyPhysicalPresence`
    PolicyPhysicalPresence = 0x0000_0187,
    /// `TPM_CC_PolicyDuplicationSelect`
    PolicyDuplicationSelect = 0x0000_0188,
    /// `TPM_CC_PolicyPassword`
    PolicyPassword = 0x0000_018C,
    /// `TPM_CC_PolicyNvWritten`
    PolicyNvWritten = 0x0000_018F,
    /// `TPM_CC_PolicyAuthorizeNV`
    PolicyAuthorizeNv = 0x0000_0192,
}

/// `TPM_EO`: comparison operators for `PolicyNV` and `PolicyCounterTimer`.
#[derive(FromRepr, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ComparisonOp {
    /// `TPM_EO_EQ`
    Eq = 0x0000,
    /// `TPM_EO_NEQ`
    Neq = 0x0001,
    /// `TPM_EO_SIGNED_GT`
    SignedGt = 0x0002,
    /// `TPM_EO_UNSIGNED_GT`
    UnsignedGt = 0x0003,
    /// `TPM_EO_SIGNED_LT`
    SignedLt = 0x0004,
    /// `TPM_EO_UNSIGNED_LT`
    UnsignedLt = 0x0005,
    /// `TPM_EO_SIGNED_GE`
    SignedGe = 0x0006,
    /// `TPM_EO_UNSIGNED_GE`
    UnsignedGe = 0x0007,
    /// `TPM_EO_SIGNED_LE`
    SignedLe = 0x0008,
    /// `TPM_EO_UNSIGNED_LE`
    UnsignedLe = 0x0009,
    /// `TPM_EO_BITSET`
    BitSet = 0x000A,
    /// `TPM_EO_BITCLEAR`
    BitClear = 0x000B,
}

/// `TPM_SE`
#[derive(FromRepr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionType {
    /// `TPM_SE_HMAC`
    Hmac = 0x00,
    /// `TPM_SE_POLICY`
    Policy = 0x01,
    /// `TPM_SE_TRIAL`
    Trial = 0x03,
}

/// `TPM_CAP`
#[derive(FromRepr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Capability {
    /// `TPM_CAP_ALGS`
    Algs = 0x0000_0000,
    /// `TPM_CAP_HANDLES`
    Handles = 0x0000_0001,
    /// `TPM_CAP_COMMANDS`
    Commands = 0x0000_0002,
    /// `TPM_CAP_PP_COMMANDS`
    PpCommands = 0x0000_0003,
    /// `TPM_CAP_AUDIT_COMMANDS`
    AuditCommands = 0x0000_0004,
    /// `TPM_CAP_PCRS`
    Pcrs = 0x0000_0005,
    /// `TPM_CAP_TPM_PROPERTIES`
    TpmProperties = 0x0000_0006,
    /// `TPM_CAP_PCR_PROPERTIES`
    PcrProperties = 0x0000_0007,
    /// `TPM_CAP_ECC_CURVES`
    EccCurves = 0x0000_0008,
    /// `TPM_CAP_VENDOR_PROPERTY`: manufacturer-specific
    VendorProperty = 0x0000_0100,
}

bitflags! {
    /// `TPMA_OBJECT`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ObjectAttributes: u32 {
        /// Hierarchy is immutable
        const FIXED_TPM = 0x0000_0002;
        /// TPM chip reset invalidates also saved contexts
        const ST_CLEAR = 0x0000_0004;
        /// Parent is immutable
        const FIXED_PARENT = 0x0000_0010;
        /// TPM-only generated secrets
        const SENSITIVE_DATA_ORIGIN = 0x0000_0020;
        /// Allow user access without policy session
        const USER_WITH_AUTH = 0x0000_0040;
        /// Deny admin access without policy session
        const ADMIN_WITH_POLICY = 0x0000_0080;
        /// Deny dictionary attack protections
        const NO_DA = 0x0000_0400;
        /// Encrypted duplication
        const ENCRYPTED_DUPLICATION = 0x0000_0800;
        /// Manipulate only structures of known format
        const RESTRICTED = 0x0001_0000;
        /// Decrypt with the private key
        const DECRYPT = 0x0002_0000;
        /// Sign with the private key
        const SIGN_ENCRYPT = 0x0004_0000;
    }
}

bitflags! {
    /// `TPMA_NV`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NvAttributes: u32 {
        /// `TPMA_NV_PPWRITE`
        const PPWRITE = 0x0000_0001;
        /// `TPMA_NV_OWNERWRITE`
        const OWNERWRITE = 0x0000_0002;
        /// `TPMA_NV_AUTHWRITE`
        const AUTHWRITE = 0x0000_0004;
        /// `TPMA_NV_POLICYWRITE`
        const POLICYWRITE = 0x0000_0008;
        /// `TPMA_NV_POLICY_DELETE`
        const POLICY_DELETE = 0x0000_0400;
        /// `TPMA_NV_WRITELOCKED`
        const WRITELOCKED = 0x0000_0800;
        /// `TPMA_NV_WRITEALL`
        const WRITEALL = 0x0000_1000;
        /// `TPMA_NV_WRITEDEFINE`
        const WRITEDEFINE = 0x0000_2000;
        /// `TPMA_NV_WRITE_STCLEAR`
        const WRITE_STCLEAR = 0x0000_4000;
        /// `TPMA_NV_GLOBALLOCK`
        const GLOBALLOCK = 0x0000_8000;
        /// `TPMA_NV_PPREAD`
        const PPREAD = 0x0001_0000;
        /// `TPMA_NV_OWNERREAD`
        const OWNERREAD = 0x0002_0000;
        /// `TPMA_NV_AUTHREAD`
        const AUTHREAD = 0x0004_0000;
        /// `TPMA_NV_POLICYREAD`
        const POLICYREAD = 0x0008_0000;
        /// `TPMA_NV_NO_DA`
        const NO_DA = 0x0200_0000;
        /// `TPMA_NV_ORDERLY`
        const ORDERLY = 0x0400_0000;
        /// `TPMA_NV_CLEAR_STCLEAR`
        const CLEAR_STCLEAR = 0x0800_0000;
        /// `TPMA_NV_READLOCKED`
        const READLOCKED = 0x1000_0000;
        /// `TPMA_NV_WRITTEN`
        const WRITTEN = 0x2000_0000;
        /// `TPMA_NV_PLATFORMCREATE`
        const PLATFORMCREATE = 0x4000_0000;
        /// `TPMA_NV_READ_STCLEAR`
        const READ_STCLEAR = 0x8000_0000;
    }
}

/// Shift of the `TPM_NT` field inside `TPMA_NV`.
const NV_TYPE_SHIFT: u32 = 4;
/// Mask of the `TPM_NT` field inside `TPMA_NV`.
const NV_TYPE_MASK: u32 = 0x0000_00F0;

/// `TPM_NT`: the index type carried in bits 7:4 of `TPMA_NV`.
#[derive(FromRepr, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum NvType {
    /// `TPM_NT_ORDINARY`
    Ordinary = 0x0,
    /// `TPM_NT_COUNTER`
    Counter = 0x1,
    /// `TPM_NT_BITS`
    Bits = 0x2,
    /// `TPM_NT_EXTEND`
    Extend = 0x4,
    /// `TPM_NT_PIN_FAIL`
    PinFail = 0x8,
    /// `TPM_NT_PIN_PASS`
    PinPass = 0x9,
}

impl NvAttributes {
    /// The `TPM_NT` index type carried in the attribute word.
    #[must_use]
    pub fn nv_type(self) -> NvType {
        NvType::from_repr((self.bits() & NV_TYPE_MASK) >> NV_TYPE_SHIFT)
            .unwrap_or(NvType::Ordinary)
    }

    /// Replaces the `TPM_NT` field.
    #[must_use]
    pub fn with_nv_type(self, nv_type: NvType) -> NvAttributes {
        NvAttributes::from_bits_retain(
            (self.bits() & !NV_TYPE_MASK) | ((nv_type as u32) << NV_TYPE_SHIFT),
        )
    }
}

bitflags! {
    /// `TPMA_SESSION`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SessionAttributes: u8 {
        /// Session stays loaded across command completion
        const CONTINUE_SESSION = 0x01;
        /// `TPMA_SESSION_AUDITEXCLUSIVE`
        const AUDIT_EXCLUSIVE = 0x02;
        /// `TPMA_SESSION_AUDITRESET`
        const AUDIT_RESET = 0x04;
        /// First command parameter is encrypted
        const DECRYPT = 0x20;
        /// First response parameter is encrypted
        const ENCRYPT = 0x40;
        /// `TPMA_SESSION_AUDIT`
        const AUDIT = 0x80;
    }
}

/// `TPMT_SIG_SCHEME`: a signing scheme with its hash algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignScheme {
    pub scheme: Algorithm,
    pub hash_alg: HashAlg,
}

impl Default for SignScheme {
    fn default() -> Self {
        SignScheme {
            scheme: Algorithm::Null,
            hash_alg: HashAlg::Sha256,
        }
    }
}

/// `TPMT_SYM_DEF`: symmetric algorithm, key size and mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymDef {
    pub algorithm: Algorithm,
    pub key_bits: u16,
    pub mode: Algorithm,
}

impl Default for SymDef {
    fn default() -> Self {
        SymDef {
            algorithm: Algorithm::Aes,
            key_bits: 128,
            mode: Algorithm::Cfb,
        }
    }
}

/// `TPMS_PCR_SELECTION`: a hash bank plus a PCR bitmap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcrSelection {
    pub hash: HashAlg,
    /// Bitmap over the PCR indices, 8 registers per octet.
    pub select: Vec<u8>,
}

impl PcrSelection {
    /// Builds a selection covering the listed PCR indices.
    #[must_use]
    pub fn from_pcrs(hash: HashAlg, pcrs: &[u32]) -> PcrSelection {
        let mut select = vec![0u8; 3];
        for &pcr in pcrs {
            let octet = (pcr / 8) as usize;
            if octet >= select.len() {
                select.resize(octet + 1, 0);
            }
            select[octet] |= 1 << (pcr % 8);
        }
        PcrSelection { hash, select }
    }
}

/// Marshals a `TPML_PCR_SELECTION` in canonical TPM form.
#[must_use]
pub fn marshal_pcr_selection_list(selections: &[PcrSelection]) -> Vec<u8> {
    let mut buf = Vec::new();
    put_u32(&mut buf, u32::try_from(selections.len()).unwrap_or(0));
    for selection in selections {
        put_u16(&mut buf, selection.hash as u16);
        put_u8(&mut buf, u8::try_from(selection.select.len()).unwrap_or(3));
        buf.extend(&selection.select);
    }
    buf
}

/// A raw TPM handle (`TPM2_HANDLE`).
pub type TpmHandle = u32;

/// `TPM2_RH_OWNER`
pub const RH_OWNER: TpmHandle = 0x4000_0001;
/// `TPM2_RH_LOCKOUT`
pub const RH_LOCKOUT: TpmHandle = 0x4000_000A;
/// `TPM2_RH_ENDORSEMENT`
pub const RH_ENDORSEMENT: TpmHandle = 0x4000_000B;
/// `TPM2_RH_PLATFORM`
pub const RH_PLATFORM: TpmHandle = 0x4000_000C;
/// The first persistent handle
pub const FIRST_PERSISTENT_HANDLE: TpmHandle = 0x8100_0000;

/// An ESYS resource handle. The values of the reserved handles follow the
/// TSS 2.0 Enhanced System API specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EsysTr(pub u32);

impl EsysTr {
    /// `ESYS_TR_NONE`
    pub const NONE: EsysTr = EsysTr(0xFFF);
    /// `ESYS_TR_PASSWORD`
    pub const PASSWORD: EsysTr = EsysTr(0x0FF);
    /// `ESYS_TR_RH_OWNER`
    pub const RH_OWNER: EsysTr = EsysTr(0x101);
    /// `ESYS_TR_RH_NULL`
    pub const RH_NULL: EsysTr = EsysTr(0x107);
    /// `ESYS_TR_RH_LOCKOUT`
    pub const RH_LOCKOUT: EsysTr = EsysTr(0x10A);
    /// `ESYS_TR_RH_ENDORSEMENT`
    pub const RH_ENDORSEMENT: EsysTr = EsysTr(0x10B);
    /// `ESYS_TR_RH_PLATFORM`
    pub const RH_PLATFORM: EsysTr = EsysTr(0x10C);

    /// Whether the handle refers to an actual resource.
    #[must_use]
    pub fn is_some(self) -> bool {
        self != EsysTr::NONE
    }
}

impl Default for EsysTr {
    fn default() -> Self {
        EsysTr::NONE
    }
}

/// Appends a big-endian `u8` to a wire buffer.
pub(crate) fn put_u8(buf: &mut Vec<u8>, value: u8) {
    buf.push(value);
}

/// Appends a big-endian `u16` to a wire buffer.
pub(crate) fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend(value.to_be_bytes());
}

/// Appends a big-endian `u32` to a wire buffer.
pub(crate) fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend(value.to_be_bytes());
}

/// Appends a TPM2B (u16 size prefix plus payload) to a wire buffer.
pub(crate) fn put_2b(buf: &mut Vec<u8>, bytes: &[u8]) {
    put_u16(buf, u16::try_from(bytes.len()).unwrap_or(u16::MAX));
    buf.extend(bytes);
}

/// A cursor over a canonical TPM wire buffer.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    pub(crate) fn offset(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    pub(crate) fn get_u8(&mut self) -> Option<u8> {
        self.take(1).map(|s| s[0])
    }

    pub(crate) fn get_u16(&mut self) -> Option<u16> {
        self.take(2).map(|s| u16::from_be_bytes([s[0], s[1]]))
    }

    pub(crate) fn get_u32(&mut self) -> Option<u32> {
        self.take(4)
            .map(|s| u32::from_be_bytes([s[0], s[1], s[2], s[3]]))
    }

    pub(crate) fn get_2b(&mut self) -> Option<Vec<u8>> {
        let size = self.get_u16()? as usize;
        self.take(size).map(<[u8]>::to_vec)
    }
}

mod bits_serde {
    //! Keystore records carry attribute words as their raw `TPMA_*` bits.

    use super::{NvAttributes, ObjectAttributes};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    impl Serialize for ObjectAttributes {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            self.bits().serialize(serializer)
        }
    }

    impl<'de> Deserialize<'de> for ObjectAttributes {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            Ok(ObjectAttributes::from_bits_retain(u32::deserialize(
                deserializer,
            )?))
        }
    }

    impl Serialize for NvAttributes {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            self.bits().serialize(serializer)
        }
    }

    impl<'de> Deserialize<'de> for NvAttributes {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            Ok(NvAttributes::from_bits_retain(u32::deserialize(
                deserializer,
            )?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CommandCode, HashAlg, NvAttributes, NvType};

    #[test]
    fn nv_type_round_trip() {
        let attrs = NvAttributes::AUTHREAD.with_nv_type(NvType::Extend);
        assert_eq!(attrs.nv_type(), NvType::Extend);
        assert!(attrs.contains(NvAttributes::AUTHREAD));

        let attrs = attrs.with_nv_type(NvType::Ordinary);
        assert_eq!(attrs.nv_type(), NvType::Ordinary);
    }

    #[test]
    fn command_codes() {
        assert_eq!(CommandCode::PolicyOr as u32, 0x171);
        assert_eq!(CommandCode::from_repr(0x17F), Some(CommandCode::PolicyPcr));
    }

    #[test]
    fn digest_sizes() {
        assert_eq!(HashAlg::Sha256.digest_size(), 32);
        assert_eq!(HashAlg::Sha512.digest_size(), 64);
    }
}
