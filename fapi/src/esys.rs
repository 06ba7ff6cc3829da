// SPDX-License-Identifier: MIT

//! The ESYS collaborator interface.
//!
//! The engine drives the TPM exclusively through this trait, one
//! `*_async`/`*_finish` pair per command, mirroring the Enhanced System
//! API. An `_async` submits the command without blocking; the paired
//! `_finish` returns `TryAgain` until the response arrived and at most one
//! command is outstanding per context. The wire codec behind the trait is
//! not the engine's concern; tests drive it with a software double.

use crate::capability::CapabilityData;
use crate::error::Result;
use crate::object::{NvPublicArea, PublicArea, Sensitive};
use crate::types::{
    Capability, CommandCode, ComparisonOp, EsysTr, HashAlg, PcrSelection, SessionAttributes,
    SessionType, SignScheme, SymDef, TpmHandle,
};

/// Result of a `CreatePrimary` exchange.
#[derive(Debug, Clone)]
pub struct CreatedPrimary {
    pub handle: EsysTr,
    pub public: PublicArea,
    pub name: Vec<u8>,
}

/// Result of a `Create` exchange.
#[derive(Debug, Clone)]
pub struct CreatedKey {
    pub private: Vec<u8>,
    pub public: PublicArea,
}

/// All methods return `TryAgain` from a `_finish` while the exchange is in
/// flight, and map TPM response codes into the engine taxonomy otherwise;
/// `BadAuth` is surfaced unchanged so commands can retry with a prompted
/// password.
#[allow(clippy::missing_errors_doc)]
pub trait EsysContext {
    /// Switches the transport between blocking and immediate response.
    fn set_timeout_blocking(&mut self, blocking: bool) -> Result<()>;

    fn start_auth_session_async(
        &mut self,
        salt_key: EsysTr,
        session_type: SessionType,
        symmetric: &SymDef,
        auth_hash: HashAlg,
    ) -> Result<()>;
    fn start_auth_session_finish(&mut self) -> Result<EsysTr>;

    fn flush_context_async(&mut self, handle: EsysTr) -> Result<()>;
    fn flush_context_finish(&mut self) -> Result<()>;

    /// Synchronous flush for error paths; loops the finish until the
    /// response arrived.
    fn flush_context(&mut self, handle: EsysTr) -> Result<()> {
        self.flush_context_async(handle)?;
        loop {
            match self.flush_context_finish() {
                Err(crate::error::Error::TryAgain) => {}
                other => return other,
            }
        }
    }

    /// Installs an auth value on a resource handle.
    fn tr_set_auth(&mut self, handle: EsysTr, auth: &[u8]) -> Result<()>;

    fn tr_sess_set_attributes(
        &mut self,
        session: EsysTr,
        set: SessionAttributes,
        clear: SessionAttributes,
    ) -> Result<()>;

    /// Whether an executed policy asserted that an auth value is required.
    fn tr_sess_get_auth_required(&mut self, session: EsysTr) -> Result<bool>;

    fn tr_sess_get_nonce_tpm(&mut self, session: EsysTr) -> Result<Vec<u8>>;

    fn tr_get_name(&mut self, handle: EsysTr) -> Result<Vec<u8>>;

    /// Serializes resource metadata so a persistent handle survives the
    /// context.
    fn tr_serialize(&mut self, handle: EsysTr) -> Result<Vec<u8>>;
    fn tr_deserialize(&mut self, blob: &[u8]) -> Result<EsysTr>;

    fn tr_from_tpm_public_async(&mut self, handle: TpmHandle) -> Result<()>;
    fn tr_from_tpm_public_finish(&mut self) -> Result<EsysTr>;

    fn create_primary_async(
        &mut self,
        hierarchy: EsysTr,
        session: EsysTr,
        sensitive: &Sensitive,
        template: &PublicArea,
    ) -> Result<()>;
    fn create_primary_finish(&mut self) -> Result<CreatedPrimary>;

    fn create_async(
        &mut self,
        parent: EsysTr,
        session: EsysTr,
        sensitive: &Sensitive,
        template: &PublicArea,
    ) -> Result<()>;
    fn create_finish(&mut self) -> Result<CreatedKey>;

    fn load_async(
        &mut self,
        parent: EsysTr,
        session: EsysTr,
        private: &[u8],
        public: &PublicArea,
    ) -> Result<()>;
    fn load_finish(&mut self) -> Result<EsysTr>;

    fn load_external_async(&mut self, public: &PublicArea, hierarchy: TpmHandle) -> Result<()>;
    fn load_external_finish(&mut self) -> Result<EsysTr>;

    fn evict_control_async(
        &mut self,
        auth: EsysTr,
        object: EsysTr,
        session: EsysTr,
        persistent_handle: TpmHandle,
    ) -> Result<()>;
    fn evict_control_finish(&mut self) -> Result<EsysTr>;

    fn sign_async(
        &mut self,
        key: EsysTr,
        session: EsysTr,
        digest: &[u8],
        scheme: SignScheme,
    ) -> Result<()>;
    fn sign_finish(&mut self) -> Result<Vec<u8>>;

    fn verify_signature_async(
        &mut self,
        key: EsysTr,
        digest: &[u8],
        signature: &[u8],
    ) -> Result<()>;
    /// Returns the verification ticket.
    fn verify_signature_finish(&mut self) -> Result<Vec<u8>>;

    fn encrypt_decrypt_async(
        &mut self,
        key: EsysTr,
        session: EsysTr,
        decrypt: bool,
        mode: crate::types::Algorithm,
        iv: &[u8],
        data: &[u8],
    ) -> Result<()>;
    /// Returns the transformed data and the chained IV.
    fn encrypt_decrypt_finish(&mut self) -> Result<(Vec<u8>, Vec<u8>)>;

    fn get_random_async(&mut self, session: EsysTr, bytes: u16) -> Result<()>;
    fn get_random_finish(&mut self) -> Result<Vec<u8>>;

    fn nv_define_space_async(
        &mut self,
        auth_handle: EsysTr,
        session: EsysTr,
        auth: &[u8],
        public: &NvPublicArea,
    ) -> Result<()>;
    fn nv_define_space_finish(&mut self) -> Result<EsysTr>;

    fn nv_read_public_async(&mut self, nv_index: EsysTr) -> Result<()>;
    fn nv_read_public_finish(&mut self) -> Result<(NvPublicArea, Vec<u8>)>;

    fn nv_write_async(
        &mut self,
        auth_handle: EsysTr,
        nv_index: EsysTr,
        session1: EsysTr,
        session2: EsysTr,
        data: &[u8],
        offset: u16,
    ) -> Result<()>;
    fn nv_write_finish(&mut self) -> Result<()>;

    fn nv_read_async(
        &mut self,
        auth_handle: EsysTr,
        nv_index: EsysTr,
        session1: EsysTr,
        size: u16,
        offset: u16,
    ) -> Result<()>;
    fn nv_read_finish(&mut self) -> Result<Vec<u8>>;

    fn nv_extend_async(
        &mut self,
        auth_handle: EsysTr,
        nv_index: EsysTr,
        session1: EsysTr,
        data: &[u8],
    ) -> Result<()>;
    fn nv_extend_finish(&mut self) -> Result<()>;

    fn get_capability_async(
        &mut self,
        capability: Capability,
        property: u32,
        count: u32,
    ) -> Result<()>;
    /// Returns the `moreData` flag and one page of capability data.
    fn get_capability_finish(&mut self) -> Result<(bool, CapabilityData)>;

    fn policy_get_digest_async(&mut self, session: EsysTr) -> Result<()>;
    fn policy_get_digest_finish(&mut self) -> Result<Vec<u8>>;

    fn policy_or_async(&mut self, session: EsysTr, digests: &[Vec<u8>]) -> Result<()>;
    fn policy_or_finish(&mut self) -> Result<()>;

    fn policy_pcr_async(
        &mut self,
        session: EsysTr,
        pcr_digest: &[u8],
        selection: &[PcrSelection],
    ) -> Result<()>;
    fn policy_pcr_finish(&mut self) -> Result<()>;

    #[allow(clippy::too_many_arguments)]
    fn policy_signed_async(
        &mut self,
        key: EsysTr,
        session: EsysTr,
        nonce_tpm: &[u8],
        cp_hash: &[u8],
        policy_ref: &[u8],
        signature: &[u8],
    ) -> Result<()>;
    fn policy_signed_finish(&mut self) -> Result<()>;

    fn policy_secret_async(
        &mut self,
        auth_handle: EsysTr,
        session: EsysTr,
        auth_session: EsysTr,
        nonce_tpm: &[u8],
        cp_hash: &[u8],
        policy_ref: &[u8],
    ) -> Result<()>;
    fn policy_secret_finish(&mut self) -> Result<()>;

    fn policy_authorize_async(
        &mut self,
        session: EsysTr,
        approved_policy: &[u8],
        policy_ref: &[u8],
        key_name: &[u8],
        ticket: &[u8],
    ) -> Result<()>;
    fn policy_authorize_finish(&mut self) -> Result<()>;

    fn policy_authorize_nv_async(
        &mut self,
        auth_handle: EsysTr,
        nv_index: EsysTr,
        session: EsysTr,
        auth_session: EsysTr,
    ) -> Result<()>;
    fn policy_authorize_nv_finish(&mut self) -> Result<()>;

    fn policy_auth_value_async(&mut self, session: EsysTr) -> Result<()>;
    fn policy_auth_value_finish(&mut self) -> Result<()>;

    fn policy_password_async(&mut self, session: EsysTr) -> Result<()>;
    fn policy_password_finish(&mut self) -> Result<()>;

    fn policy_command_code_async(&mut self, session: EsysTr, code: CommandCode) -> Result<()>;
    fn policy_command_code_finish(&mut self) -> Result<()>;

    fn policy_counter_timer_async(
        &mut self,
        session: EsysTr,
        operand_b: &[u8],
        offset: u16,
        operation: ComparisonOp,
    ) -> Result<()>;
    fn policy_counter_timer_finish(&mut self) -> Result<()>;

    fn policy_cp_hash_async(&mut self, session: EsysTr, cp_hash: &[u8]) -> Result<()>;
    fn policy_cp_hash_finish(&mut self) -> Result<()>;

    fn policy_name_hash_async(&mut self, session: EsysTr, name_hash: &[u8]) -> Result<()>;
    fn policy_name_hash_finish(&mut self) -> Result<()>;

    fn policy_physical_presence_async(&mut self, session: EsysTr) -> Result<()>;
    fn policy_physical_presence_finish(&mut self) -> Result<()>;

    fn policy_locality_async(&mut self, session: EsysTr, locality: u8) -> Result<()>;
    fn policy_locality_finish(&mut self) -> Result<()>;

    #[allow(clippy::too_many_arguments)]
    fn policy_nv_async(
        &mut self,
        auth_handle: EsysTr,
        nv_index: EsysTr,
        session: EsysTr,
        auth_session: EsysTr,
        operand_b: &[u8],
        offset: u16,
        operation: ComparisonOp,
    ) -> Result<()>;
    fn policy_nv_finish(&mut self) -> Result<()>;

    fn policy_nv_written_async(&mut self, session: EsysTr, written: bool) -> Result<()>;
    fn policy_nv_written_finish(&mut self) -> Result<()>;

    fn policy_duplication_select_async(
        &mut self,
        session: EsysTr,
        object_name: &[u8],
        new_parent_name: &[u8],
        include_object: bool,
    ) -> Result<()>;
    fn policy_duplication_select_finish(&mut self) -> Result<()>;
}
