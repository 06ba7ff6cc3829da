// SPDX-License-Identifier: MIT

//! A software TPM double and shared-store wrappers for the integration
//! tests.
//!
//! `SoftTpm` answers the ESYS trait in memory: transient handles, NV
//! space, and policy sessions whose digests are updated with the same
//! formulae a real TPM applies, so calculator/executor consistency can
//! be asserted end to end. A `Probe` handle shared with the test records
//! call counts and TPM-side state the engine does not expose.

// Not every test target exercises every helper.
#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;

use tpm2_fapi::callbacks::Callbacks;
use tpm2_fapi::capability::CapabilityData;
use tpm2_fapi::crypto;
use tpm2_fapi::error::{Error, Result};
use tpm2_fapi::esys::{CreatedKey, CreatedPrimary, EsysContext};
use tpm2_fapi::object::{NvPublicArea, PublicArea, Sensitive};
use tpm2_fapi::policy::PolicyHarness;
use tpm2_fapi::store::{Keystore, MemoryPolicyStore, MemoryStore, PolicyStore};
use tpm2_fapi::types::{
    marshal_pcr_selection_list, Capability, CommandCode, ComparisonOp, EsysTr, HashAlg,
    PcrSelection, SessionAttributes, SessionType, SignScheme, SymDef, TpmHandle,
};
use tpm2_fapi::Object;

/// TPM-side observations shared with the test body.
#[derive(Default)]
pub struct ProbeData {
    pub nv_write_calls: u32,
    pub nv_read_calls: u32,
    pub extend_calls: u32,
    pub sign_calls: u32,
    pub live_handles: usize,
    pub last_sign_session_digest: Option<Vec<u8>>,
    /// Raw NV contents by TPM index.
    pub nv_data: HashMap<TpmHandle, Vec<u8>>,
    /// Auth values the TPM insists on per NV index; tests may add
    /// entries to provoke `BadAuth` retries.
    pub expected_nv_auth: HashMap<TpmHandle, Vec<u8>>,
}

pub type Probe = Rc<RefCell<ProbeData>>;

struct NvSpace {
    public: NvPublicArea,
    data: Vec<u8>,
}

struct Session {
    hash: HashAlg,
    digest: Vec<u8>,
    auth_required: bool,
    continue_session: bool,
}

enum Outcome {
    Unit(Result<()>),
    Handle(Result<EsysTr>),
    Bytes(Result<Vec<u8>>),
    Pair(Result<(Vec<u8>, Vec<u8>)>),
    Created(Box<Result<CreatedKey>>),
    Primary(Box<Result<CreatedPrimary>>),
    NvPublic(Result<(NvPublicArea, Vec<u8>)>),
    Cap(Result<(bool, CapabilityData)>),
}

/// The in-memory TPM.
pub struct SoftTpm {
    next: u32,
    keys: HashMap<u32, PublicArea>,
    nv_space: BTreeMap<TpmHandle, NvSpace>,
    nv_bindings: HashMap<u32, TpmHandle>,
    sessions: HashMap<u32, Session>,
    auths: HashMap<u32, Vec<u8>>,
    /// Preset capability pages; used before the auto-answer.
    pub cap_pages: VecDeque<(bool, CapabilityData)>,
    pending: Option<Outcome>,
    random_counter: u8,
    priv_counter: u8,
    probe: Probe,
}

impl SoftTpm {
    pub fn new() -> (SoftTpm, Probe) {
        let probe: Probe = Rc::default();
        (
            SoftTpm {
                next: 0x8000_0000,
                keys: HashMap::new(),
                nv_space: BTreeMap::new(),
                nv_bindings: HashMap::new(),
                sessions: HashMap::new(),
                auths: HashMap::new(),
                cap_pages: VecDeque::new(),
                pending: None,
                random_counter: 0,
                priv_counter: 0,
                probe: probe.clone(),
            },
            probe,
        )
    }

    fn new_handle(&mut self) -> u32 {
        self.next += 1;
        self.next
    }

    fn update_live(&self) {
        self.probe.borrow_mut().live_handles = self.keys.len() + self.sessions.len();
    }

    fn submit(&mut self, outcome: Outcome) -> Result<()> {
        if self.pending.is_some() {
            return Err(Error::GeneralFailure);
        }
        self.pending = Some(outcome);
        Ok(())
    }

    fn take_unit(&mut self) -> Result<()> {
        match self.pending.take() {
            Some(Outcome::Unit(r)) => r,
            _ => Err(Error::GeneralFailure),
        }
    }

    fn take_handle(&mut self) -> Result<EsysTr> {
        match self.pending.take() {
            Some(Outcome::Handle(r)) => r,
            _ => Err(Error::GeneralFailure),
        }
    }

    fn take_bytes(&mut self) -> Result<Vec<u8>> {
        match self.pending.take() {
            Some(Outcome::Bytes(r)) => r,
            _ => Err(Error::GeneralFailure),
        }
    }

    fn session_digest(&self, session: EsysTr) -> Option<Vec<u8>> {
        self.sessions.get(&session.0).map(|s| s.digest.clone())
    }

    /// A session without the continue flag is gone once it gates a
    /// command, like on a real TPM.
    fn consume_session(&mut self, session: EsysTr) {
        if self
            .sessions
            .get(&session.0)
            .is_some_and(|s| !s.continue_session)
        {
            self.sessions.remove(&session.0);
            self.update_live();
        }
    }

    fn extend_session(&mut self, session: EsysTr, parts: &[&[u8]]) -> Result<()> {
        let Some(state) = self.sessions.get_mut(&session.0) else {
            return Err(Error::BadValue);
        };
        let mut data = state.digest.clone();
        for part in parts {
            data.extend(*part);
        }
        state.digest = crypto::hash(state.hash, &data)?;
        Ok(())
    }

    fn policy_update(&mut self, session: EsysTr, code: CommandCode, parts: &[&[u8]]) -> Result<()> {
        let cc = (code as u32).to_be_bytes();
        let mut all: Vec<&[u8]> = Vec::with_capacity(parts.len() + 1);
        all.push(&cc);
        all.extend(parts);
        self.extend_session(session, &all)
    }

    fn derived_public(&mut self, template: &PublicArea) -> PublicArea {
        let mut public = template.clone();
        self.priv_counter += 1;
        public.unique = crypto::hash(HashAlg::Sha256, &[template.marshal(), vec![self.priv_counter]].concat())
            .unwrap_or_default();
        public
    }
}

impl EsysContext for SoftTpm {
    fn set_timeout_blocking(&mut self, _blocking: bool) -> Result<()> {
        Ok(())
    }

    fn start_auth_session_async(
        &mut self,
        _salt_key: EsysTr,
        _session_type: SessionType,
        _symmetric: &SymDef,
        auth_hash: HashAlg,
    ) -> Result<()> {
        let handle = self.new_handle();
        self.sessions.insert(
            handle,
            Session {
                hash: auth_hash,
                digest: vec![0; auth_hash.digest_size()],
                auth_required: false,
                continue_session: false,
            },
        );
        self.update_live();
        self.submit(Outcome::Handle(Ok(EsysTr(handle))))
    }

    fn start_auth_session_finish(&mut self) -> Result<EsysTr> {
        self.take_handle()
    }

    fn flush_context_async(&mut self, handle: EsysTr) -> Result<()> {
        let known = self.keys.remove(&handle.0).is_some()
            | self.sessions.remove(&handle.0).is_some()
            | self.nv_bindings.remove(&handle.0).is_some();
        self.update_live();
        self.submit(Outcome::Unit(if known {
            Ok(())
        } else {
            Err(Error::BadValue)
        }))
    }

    fn flush_context_finish(&mut self) -> Result<()> {
        self.take_unit()
    }

    fn tr_set_auth(&mut self, handle: EsysTr, auth: &[u8]) -> Result<()> {
        self.auths.insert(handle.0, auth.to_vec());
        Ok(())
    }

    fn tr_sess_set_attributes(
        &mut self,
        session: EsysTr,
        set: SessionAttributes,
        clear: SessionAttributes,
    ) -> Result<()> {
        let Some(state) = self.sessions.get_mut(&session.0) else {
            return Err(Error::BadValue);
        };
        if set.contains(SessionAttributes::CONTINUE_SESSION) {
            state.continue_session = true;
        }
        if clear.contains(SessionAttributes::CONTINUE_SESSION) {
            state.continue_session = false;
        }
        Ok(())
    }

    fn tr_sess_get_auth_required(&mut self, session: EsysTr) -> Result<bool> {
        self.sessions
            .get(&session.0)
            .map(|s| s.auth_required)
            .ok_or(Error::BadValue)
    }

    fn tr_sess_get_nonce_tpm(&mut self, _session: EsysTr) -> Result<Vec<u8>> {
        Ok(vec![0x5A; 16])
    }

    fn tr_get_name(&mut self, handle: EsysTr) -> Result<Vec<u8>> {
        if let Some(public) = self.keys.get(&handle.0) {
            return public.name();
        }
        if let Some(index) = self.nv_bindings.get(&handle.0) {
            if let Some(space) = self.nv_space.get(index) {
                return space.public.name();
            }
        }
        Err(Error::BadValue)
    }

    fn tr_serialize(&mut self, handle: EsysTr) -> Result<Vec<u8>> {
        if let Some(index) = self.nv_bindings.get(&handle.0) {
            let mut blob = vec![0x01];
            blob.extend(index.to_be_bytes());
            return Ok(blob);
        }
        let mut blob = vec![0x02];
        blob.extend(handle.0.to_be_bytes());
        Ok(blob)
    }

    fn tr_deserialize(&mut self, blob: &[u8]) -> Result<EsysTr> {
        if blob.len() != 5 {
            return Err(Error::BadValue);
        }
        let value = u32::from_be_bytes([blob[1], blob[2], blob[3], blob[4]]);
        match blob[0] {
            0x01 => {
                if !self.nv_space.contains_key(&value) {
                    return Err(Error::BadValue);
                }
                let handle = self.new_handle();
                self.nv_bindings.insert(handle, value);
                Ok(EsysTr(handle))
            }
            0x02 => Ok(EsysTr(value)),
            _ => Err(Error::BadValue),
        }
    }

    fn tr_from_tpm_public_async(&mut self, handle: TpmHandle) -> Result<()> {
        let outcome = if self.nv_space.contains_key(&handle) {
            let esys = self.new_handle();
            self.nv_bindings.insert(esys, handle);
            Ok(EsysTr(esys))
        } else {
            Err(Error::BadValue)
        };
        self.submit(Outcome::Handle(outcome))
    }

    fn tr_from_tpm_public_finish(&mut self) -> Result<EsysTr> {
        self.take_handle()
    }

    fn create_primary_async(
        &mut self,
        _hierarchy: EsysTr,
        _session: EsysTr,
        _sensitive: &Sensitive,
        template: &PublicArea,
    ) -> Result<()> {
        let public = self.derived_public(template);
        let handle = self.new_handle();
        let name = public.name()?;
        self.keys.insert(handle, public.clone());
        self.update_live();
        self.submit(Outcome::Primary(Box::new(Ok(CreatedPrimary {
            handle: EsysTr(handle),
            public,
            name,
        }))))
    }

    fn create_primary_finish(&mut self) -> Result<CreatedPrimary> {
        match self.pending.take() {
            Some(Outcome::Primary(r)) => *r,
            _ => Err(Error::GeneralFailure),
        }
    }

    fn create_async(
        &mut self,
        parent: EsysTr,
        session: EsysTr,
        _sensitive: &Sensitive,
        template: &PublicArea,
    ) -> Result<()> {
        if !self.keys.contains_key(&parent.0) {
            return Err(Error::BadValue);
        }
        let public = self.derived_public(template);
        let private = vec![0x70, self.priv_counter];
        self.consume_session(session);
        self.submit(Outcome::Created(Box::new(Ok(CreatedKey {
            private,
            public,
        }))))
    }

    fn create_finish(&mut self) -> Result<CreatedKey> {
        match self.pending.take() {
            Some(Outcome::Created(r)) => *r,
            _ => Err(Error::GeneralFailure),
        }
    }

    fn load_async(
        &mut self,
        parent: EsysTr,
        session: EsysTr,
        private: &[u8],
        public: &PublicArea,
    ) -> Result<()> {
        let outcome = if self.keys.contains_key(&parent.0) && !private.is_empty() {
            let handle = self.new_handle();
            self.keys.insert(handle, public.clone());
            Ok(EsysTr(handle))
        } else {
            Err(Error::BadValue)
        };
        if outcome.is_ok() {
            self.consume_session(session);
        }
        self.update_live();
        self.submit(Outcome::Handle(outcome))
    }

    fn load_finish(&mut self) -> Result<EsysTr> {
        self.take_handle()
    }

    fn load_external_async(&mut self, public: &PublicArea, _hierarchy: TpmHandle) -> Result<()> {
        let handle = self.new_handle();
        self.keys.insert(handle, public.clone());
        self.update_live();
        self.submit(Outcome::Handle(Ok(EsysTr(handle))))
    }

    fn load_external_finish(&mut self) -> Result<EsysTr> {
        self.take_handle()
    }

    fn evict_control_async(
        &mut self,
        _auth: EsysTr,
        object: EsysTr,
        _session: EsysTr,
        _persistent_handle: TpmHandle,
    ) -> Result<()> {
        let outcome = if self.keys.contains_key(&object.0) {
            Ok(object)
        } else {
            Err(Error::BadValue)
        };
        self.submit(Outcome::Handle(outcome))
    }

    fn evict_control_finish(&mut self) -> Result<EsysTr> {
        self.take_handle()
    }

    fn sign_async(
        &mut self,
        key: EsysTr,
        session: EsysTr,
        digest: &[u8],
        _scheme: SignScheme,
    ) -> Result<()> {
        let outcome = if self.keys.contains_key(&key.0) {
            let mut probe = self.probe.borrow_mut();
            probe.sign_calls += 1;
            probe.last_sign_session_digest = self.sessions.get(&session.0).map(|s| s.digest.clone());
            let mut signature = b"sig:".to_vec();
            signature.extend(digest);
            Ok(signature)
        } else {
            Err(Error::BadValue)
        };
        if outcome.is_ok() {
            self.consume_session(session);
        }
        self.submit(Outcome::Bytes(outcome))
    }

    fn sign_finish(&mut self) -> Result<Vec<u8>> {
        self.take_bytes()
    }

    fn verify_signature_async(
        &mut self,
        key: EsysTr,
        _digest: &[u8],
        signature: &[u8],
    ) -> Result<()> {
        let outcome = if self.keys.contains_key(&key.0) && !signature.is_empty() {
            Ok(b"ticket".to_vec())
        } else {
            Err(Error::SignatureVerificationFailed)
        };
        self.submit(Outcome::Bytes(outcome))
    }

    fn verify_signature_finish(&mut self) -> Result<Vec<u8>> {
        self.take_bytes()
    }

    fn encrypt_decrypt_async(
        &mut self,
        key: EsysTr,
        session: EsysTr,
        _decrypt: bool,
        _mode: tpm2_fapi::types::Algorithm,
        _iv: &[u8],
        data: &[u8],
    ) -> Result<()> {
        let outcome = if self.keys.contains_key(&key.0) {
            // An involution stands in for the block cipher.
            let out: Vec<u8> = data.iter().map(|b| b ^ 0x5A).collect();
            Ok((out, vec![0; 16]))
        } else {
            Err(Error::BadValue)
        };
        if outcome.is_ok() {
            self.consume_session(session);
        }
        self.submit(Outcome::Pair(outcome))
    }

    fn encrypt_decrypt_finish(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        match self.pending.take() {
            Some(Outcome::Pair(r)) => r,
            _ => Err(Error::GeneralFailure),
        }
    }

    fn get_random_async(&mut self, _session: EsysTr, bytes: u16) -> Result<()> {
        let mut out = Vec::with_capacity(usize::from(bytes));
        for _ in 0..bytes {
            self.random_counter = self.random_counter.wrapping_add(1);
            out.push(self.random_counter);
        }
        self.submit(Outcome::Bytes(Ok(out)))
    }

    fn get_random_finish(&mut self) -> Result<Vec<u8>> {
        self.take_bytes()
    }

    fn nv_define_space_async(
        &mut self,
        _auth_handle: EsysTr,
        _session: EsysTr,
        auth: &[u8],
        public: &NvPublicArea,
    ) -> Result<()> {
        let outcome = if self.nv_space.contains_key(&public.nv_index) {
            Err(Error::BadValue)
        } else {
            self.nv_space.insert(
                public.nv_index,
                NvSpace {
                    public: public.clone(),
                    data: vec![0; usize::from(public.data_size)],
                },
            );
            if !auth.is_empty() {
                self.probe
                    .borrow_mut()
                    .expected_nv_auth
                    .insert(public.nv_index, auth.to_vec());
            }
            let handle = self.new_handle();
            self.nv_bindings.insert(handle, public.nv_index);
            Ok(EsysTr(handle))
        };
        self.submit(Outcome::Handle(outcome))
    }

    fn nv_define_space_finish(&mut self) -> Result<EsysTr> {
        self.take_handle()
    }

    fn nv_read_public_async(&mut self, nv_index: EsysTr) -> Result<()> {
        let outcome = match self.nv_bindings.get(&nv_index.0) {
            Some(index) => match self.nv_space.get(index) {
                Some(space) => Ok((space.public.clone(), space.public.name()?)),
                None => Err(Error::BadValue),
            },
            None => Err(Error::BadValue),
        };
        self.submit(Outcome::NvPublic(outcome))
    }

    fn nv_read_public_finish(&mut self) -> Result<(NvPublicArea, Vec<u8>)> {
        match self.pending.take() {
            Some(Outcome::NvPublic(r)) => r,
            _ => Err(Error::GeneralFailure),
        }
    }

    fn nv_write_async(
        &mut self,
        auth_handle: EsysTr,
        nv_index: EsysTr,
        session1: EsysTr,
        _session2: EsysTr,
        data: &[u8],
        offset: u16,
    ) -> Result<()> {
        self.probe.borrow_mut().nv_write_calls += 1;
        let Some(index) = self.nv_bindings.get(&nv_index.0).copied() else {
            return self.submit(Outcome::Unit(Err(Error::BadValue)));
        };
        let expected = self.probe.borrow().expected_nv_auth.get(&index).cloned();
        if let Some(expected) = expected {
            let presented = self.auths.get(&auth_handle.0);
            if presented.map(Vec::as_slice) != Some(expected.as_slice()) {
                return self.submit(Outcome::Unit(Err(Error::BadAuth)));
            }
        }
        let outcome = match self.nv_space.get_mut(&index) {
            Some(space) => {
                let start = usize::from(offset);
                if start + data.len() > space.data.len() {
                    Err(Error::NvExceeded)
                } else {
                    space.data[start..start + data.len()].copy_from_slice(data);
                    space.public.attributes |= tpm2_fapi::types::NvAttributes::WRITTEN;
                    self.probe
                        .borrow_mut()
                        .nv_data
                        .insert(index, space.data.clone());
                    Ok(())
                }
            }
            None => Err(Error::BadValue),
        };
        if outcome.is_ok() {
            self.consume_session(session1);
        }
        self.submit(Outcome::Unit(outcome))
    }

    fn nv_write_finish(&mut self) -> Result<()> {
        self.take_unit()
    }

    fn nv_read_async(
        &mut self,
        _auth_handle: EsysTr,
        nv_index: EsysTr,
        session1: EsysTr,
        size: u16,
        offset: u16,
    ) -> Result<()> {
        self.probe.borrow_mut().nv_read_calls += 1;
        let outcome = match self
            .nv_bindings
            .get(&nv_index.0)
            .and_then(|index| self.nv_space.get(index))
        {
            Some(space) => {
                let start = usize::from(offset).min(space.data.len());
                let end = (start + usize::from(size)).min(space.data.len());
                Ok(space.data[start..end].to_vec())
            }
            None => Err(Error::BadValue),
        };
        if outcome.is_ok() {
            self.consume_session(session1);
        }
        self.submit(Outcome::Bytes(outcome))
    }

    fn nv_read_finish(&mut self) -> Result<Vec<u8>> {
        self.take_bytes()
    }

    fn nv_extend_async(
        &mut self,
        _auth_handle: EsysTr,
        nv_index: EsysTr,
        session1: EsysTr,
        data: &[u8],
    ) -> Result<()> {
        self.probe.borrow_mut().extend_calls += 1;
        let Some(index) = self.nv_bindings.get(&nv_index.0).copied() else {
            return self.submit(Outcome::Unit(Err(Error::BadValue)));
        };
        let outcome = match self.nv_space.get_mut(&index) {
            Some(space) => {
                // new = H(old || H(data)) under the index name algorithm.
                let alg = space.public.name_alg;
                let inner = crypto::hash(alg, data)?;
                let mut concat = space.data.clone();
                concat.extend(inner);
                space.data = crypto::hash(alg, &concat)?;
                space.public.attributes |= tpm2_fapi::types::NvAttributes::WRITTEN;
                self.probe
                    .borrow_mut()
                    .nv_data
                    .insert(index, space.data.clone());
                Ok(())
            }
            None => Err(Error::BadValue),
        };
        if outcome.is_ok() {
            self.consume_session(session1);
        }
        self.submit(Outcome::Unit(outcome))
    }

    fn nv_extend_finish(&mut self) -> Result<()> {
        self.take_unit()
    }

    fn get_capability_async(
        &mut self,
        capability: Capability,
        property: u32,
        _count: u32,
    ) -> Result<()> {
        if let Some(page) = self.cap_pages.pop_front() {
            return self.submit(Outcome::Cap(Ok(page)));
        }
        let data = match capability {
            Capability::Handles => CapabilityData::Handles(
                self.nv_space
                    .keys()
                    .copied()
                    .filter(|index| *index >= property)
                    .collect(),
            ),
            Capability::EccCurves => CapabilityData::EccCurves(Vec::new()),
            _ => CapabilityData::TpmProperties(Vec::new()),
        };
        self.submit(Outcome::Cap(Ok((false, data))))
    }

    fn get_capability_finish(&mut self) -> Result<(bool, CapabilityData)> {
        match self.pending.take() {
            Some(Outcome::Cap(r)) => r,
            _ => Err(Error::GeneralFailure),
        }
    }

    fn policy_get_digest_async(&mut self, session: EsysTr) -> Result<()> {
        let outcome = self.session_digest(session).ok_or(Error::BadValue);
        self.submit(Outcome::Bytes(outcome))
    }

    fn policy_get_digest_finish(&mut self) -> Result<Vec<u8>> {
        self.take_bytes()
    }

    fn policy_or_async(&mut self, session: EsysTr, digests: &[Vec<u8>]) -> Result<()> {
        let Some(state) = self.sessions.get_mut(&session.0) else {
            return self.submit(Outcome::Unit(Err(Error::BadValue)));
        };
        // The current digest must be one of the branches.
        if !digests.iter().any(|d| *d == state.digest) {
            return self.submit(Outcome::Unit(Err(Error::BadValue)));
        }
        state.digest = vec![0; state.hash.digest_size()];
        let parts: Vec<&[u8]> = digests.iter().map(Vec::as_slice).collect();
        let outcome = self.policy_update(session, CommandCode::PolicyOr, &parts);
        self.submit(Outcome::Unit(outcome))
    }

    fn policy_or_finish(&mut self) -> Result<()> {
        self.take_unit()
    }

    fn policy_pcr_async(
        &mut self,
        session: EsysTr,
        pcr_digest: &[u8],
        selection: &[PcrSelection],
    ) -> Result<()> {
        let wire = marshal_pcr_selection_list(selection);
        let outcome = self.policy_update(session, CommandCode::PolicyPcr, &[&wire, pcr_digest]);
        self.submit(Outcome::Unit(outcome))
    }

    fn policy_pcr_finish(&mut self) -> Result<()> {
        self.take_unit()
    }

    fn policy_signed_async(
        &mut self,
        key: EsysTr,
        session: EsysTr,
        _nonce_tpm: &[u8],
        cp_hash: &[u8],
        policy_ref: &[u8],
        signature: &[u8],
    ) -> Result<()> {
        let outcome = if !self.keys.contains_key(&key.0) || signature.is_empty() {
            Err(Error::SignatureVerificationFailed)
        } else {
            let _ = cp_hash;
            let name = self.keys.get(&key.0).map(PublicArea::name);
            match name {
                Some(Ok(name)) => {
                    self.policy_update(session, CommandCode::PolicySigned, &[&name, policy_ref])
                }
                _ => Err(Error::BadValue),
            }
        };
        self.submit(Outcome::Unit(outcome))
    }

    fn policy_signed_finish(&mut self) -> Result<()> {
        self.take_unit()
    }

    fn policy_secret_async(
        &mut self,
        _auth_handle: EsysTr,
        _session: EsysTr,
        _auth_session: EsysTr,
        _nonce_tpm: &[u8],
        _cp_hash: &[u8],
        _policy_ref: &[u8],
    ) -> Result<()> {
        self.submit(Outcome::Unit(Err(Error::NotImplemented)))
    }

    fn policy_secret_finish(&mut self) -> Result<()> {
        self.take_unit()
    }

    fn policy_authorize_async(
        &mut self,
        session: EsysTr,
        _approved_policy: &[u8],
        policy_ref: &[u8],
        key_name: &[u8],
        ticket: &[u8],
    ) -> Result<()> {
        let outcome = if ticket.is_empty() {
            Err(Error::SignatureVerificationFailed)
        } else {
            if let Some(state) = self.sessions.get_mut(&session.0) {
                state.digest = vec![0; state.hash.digest_size()];
            }
            self.policy_update(session, CommandCode::PolicyAuthorize, &[key_name, policy_ref])
        };
        self.submit(Outcome::Unit(outcome))
    }

    fn policy_authorize_finish(&mut self) -> Result<()> {
        self.take_unit()
    }

    fn policy_authorize_nv_async(
        &mut self,
        _auth_handle: EsysTr,
        _nv_index: EsysTr,
        _session: EsysTr,
        _auth_session: EsysTr,
    ) -> Result<()> {
        self.submit(Outcome::Unit(Err(Error::NotImplemented)))
    }

    fn policy_authorize_nv_finish(&mut self) -> Result<()> {
        self.take_unit()
    }

    fn policy_auth_value_async(&mut self, session: EsysTr) -> Result<()> {
        let outcome = self.policy_update(session, CommandCode::PolicyAuthValue, &[]);
        if let Some(state) = self.sessions.get_mut(&session.0) {
            state.auth_required = true;
        }
        self.submit(Outcome::Unit(outcome))
    }

    fn policy_auth_value_finish(&mut self) -> Result<()> {
        self.take_unit()
    }

    fn policy_password_async(&mut self, session: EsysTr) -> Result<()> {
        let outcome = self.policy_update(session, CommandCode::PolicyAuthValue, &[]);
        if let Some(state) = self.sessions.get_mut(&session.0) {
            state.auth_required = true;
        }
        self.submit(Outcome::Unit(outcome))
    }

    fn policy_password_finish(&mut self) -> Result<()> {
        self.take_unit()
    }

    fn policy_command_code_async(&mut self, session: EsysTr, code: CommandCode) -> Result<()> {
        let wire = (code as u32).to_be_bytes();
        let outcome = self.policy_update(session, CommandCode::PolicyCommandCode, &[&wire]);
        self.submit(Outcome::Unit(outcome))
    }

    fn policy_command_code_finish(&mut self) -> Result<()> {
        self.take_unit()
    }

    fn policy_counter_timer_async(
        &mut self,
        session: EsysTr,
        operand_b: &[u8],
        offset: u16,
        operation: ComparisonOp,
    ) -> Result<()> {
        let hash = match self.sessions.get(&session.0) {
            Some(state) => state.hash,
            None => return self.submit(Outcome::Unit(Err(Error::BadValue))),
        };
        let mut args = operand_b.to_vec();
        args.extend(offset.to_be_bytes());
        args.extend((operation as u16).to_be_bytes());
        let outcome = match crypto::hash(hash, &args) {
            Ok(args_digest) => {
                self.policy_update(session, CommandCode::PolicyCounterTimer, &[&args_digest])
            }
            Err(err) => Err(err),
        };
        self.submit(Outcome::Unit(outcome))
    }

    fn policy_counter_timer_finish(&mut self) -> Result<()> {
        self.take_unit()
    }

    fn policy_cp_hash_async(&mut self, session: EsysTr, cp_hash: &[u8]) -> Result<()> {
        let outcome = self.policy_update(session, CommandCode::PolicyCpHash, &[cp_hash]);
        self.submit(Outcome::Unit(outcome))
    }

    fn policy_cp_hash_finish(&mut self) -> Result<()> {
        self.take_unit()
    }

    fn policy_name_hash_async(&mut self, session: EsysTr, name_hash: &[u8]) -> Result<()> {
        let outcome = self.policy_update(session, CommandCode::PolicyNameHash, &[name_hash]);
        self.submit(Outcome::Unit(outcome))
    }

    fn policy_name_hash_finish(&mut self) -> Result<()> {
        self.take_unit()
    }

    fn policy_physical_presence_async(&mut self, session: EsysTr) -> Result<()> {
        let outcome = self.policy_update(session, CommandCode::PolicyPhysicalPresence, &[]);
        self.submit(Outcome::Unit(outcome))
    }

    fn policy_physical_presence_finish(&mut self) -> Result<()> {
        self.take_unit()
    }

    fn policy_locality_async(&mut self, session: EsysTr, locality: u8) -> Result<()> {
        let outcome = self.policy_update(session, CommandCode::PolicyLocality, &[&[locality]]);
        self.submit(Outcome::Unit(outcome))
    }

    fn policy_locality_finish(&mut self) -> Result<()> {
        self.take_unit()
    }

    fn policy_nv_async(
        &mut self,
        _auth_handle: EsysTr,
        _nv_index: EsysTr,
        _session: EsysTr,
        _auth_session: EsysTr,
        _operand_b: &[u8],
        _offset: u16,
        _operation: ComparisonOp,
    ) -> Result<()> {
        self.submit(Outcome::Unit(Err(Error::NotImplemented)))
    }

    fn policy_nv_finish(&mut self) -> Result<()> {
        self.take_unit()
    }

    fn policy_nv_written_async(&mut self, session: EsysTr, written: bool) -> Result<()> {
        let outcome =
            self.policy_update(session, CommandCode::PolicyNvWritten, &[&[u8::from(written)]]);
        self.submit(Outcome::Unit(outcome))
    }

    fn policy_nv_written_finish(&mut self) -> Result<()> {
        self.take_unit()
    }

    fn policy_duplication_select_async(
        &mut self,
        session: EsysTr,
        object_name: &[u8],
        new_parent_name: &[u8],
        include_object: bool,
    ) -> Result<()> {
        let include = [u8::from(include_object)];
        let outcome = if include_object {
            self.policy_update(
                session,
                CommandCode::PolicyDuplicationSelect,
                &[object_name, new_parent_name, &include],
            )
        } else {
            self.policy_update(
                session,
                CommandCode::PolicyDuplicationSelect,
                &[new_parent_name, &include],
            )
        };
        self.submit(Outcome::Unit(outcome))
    }

    fn policy_duplication_select_finish(&mut self) -> Result<()> {
        self.take_unit()
    }
}

/// Keystore handle shared between the context and the test body.
pub struct SharedStore(pub Rc<RefCell<MemoryStore>>);

impl Keystore for SharedStore {
    fn load_async(&mut self, path: &str) -> Result<()> {
        self.0.borrow_mut().load_async(path)
    }

    fn load_finish(&mut self) -> Result<Object> {
        self.0.borrow_mut().load_finish()
    }

    fn store_async(&mut self, path: &str, object: &Object) -> Result<()> {
        self.0.borrow_mut().store_async(path, object)
    }

    fn store_finish(&mut self) -> Result<()> {
        self.0.borrow_mut().store_finish()
    }

    fn check_writeable(&mut self, path: &str) -> Result<()> {
        self.0.borrow_mut().check_writeable(path)
    }

    fn check_overwrite(&mut self, path: &str) -> Result<()> {
        self.0.borrow_mut().check_overwrite(path)
    }
}

/// Policy-store handle shared between the context and the test body.
pub struct SharedPolicyStore(pub Rc<RefCell<MemoryPolicyStore>>);

impl PolicyStore for SharedPolicyStore {
    fn load_async(&mut self, path: &str) -> Result<()> {
        self.0.borrow_mut().load_async(path)
    }

    fn load_finish(&mut self) -> Result<PolicyHarness> {
        self.0.borrow_mut().load_finish()
    }

    fn store_async(&mut self, path: &str, policy: &PolicyHarness) -> Result<()> {
        self.0.borrow_mut().store_async(path, policy)
    }

    fn store_finish(&mut self) -> Result<()> {
        self.0.borrow_mut().store_finish()
    }
}

/// A scriptable application capability.
#[derive(Default)]
pub struct TestCallbacks {
    pub password: Option<String>,
    pub branch: usize,
    pub auth_prompts: RefCell<u32>,
}

impl Callbacks for TestCallbacks {
    fn auth(&mut self, _path: &str, _description: &str) -> Result<String> {
        *self.auth_prompts.borrow_mut() += 1;
        self.password.clone().ok_or(Error::AuthorizationUnknown)
    }

    fn branch_select(&mut self, branches: &[String]) -> Result<usize> {
        if self.branch >= branches.len() {
            return Err(Error::BadValue);
        }
        Ok(self.branch)
    }
}

/// A fully wired context plus the probes the tests assert on.
pub struct Fixture {
    pub ctx: tpm2_fapi::FapiContext,
    pub probe: Probe,
    pub store: Rc<RefCell<MemoryStore>>,
    pub policies: Rc<RefCell<MemoryPolicyStore>>,
}

/// Builds a context over a prepared software TPM.
#[must_use]
pub fn fixture_from(tpm: SoftTpm, probe: Probe, nv_buffer_max: usize) -> Fixture {
    let store = Rc::new(RefCell::new(MemoryStore::new()));
    let policies = Rc::new(RefCell::new(MemoryPolicyStore::new()));
    let mut profile = tpm2_fapi::Profile::default();
    profile.nv_buffer_max = nv_buffer_max;
    let ctx = tpm2_fapi::FapiContext::new(
        Box::new(tpm),
        Box::new(SharedStore(store.clone())),
        Box::new(SharedPolicyStore(policies.clone())),
        tpm2_fapi::Profiles::new(profile),
    );
    Fixture {
        ctx,
        probe,
        store,
        policies,
    }
}

/// Builds a context over the software TPM with the given NV chunk size.
#[must_use]
pub fn fixture_with_buffer(nv_buffer_max: usize) -> Fixture {
    let (tpm, probe) = SoftTpm::new();
    fixture_from(tpm, probe.clone(), nv_buffer_max)
}

/// Builds a context with the default chunk size.
#[must_use]
pub fn fixture() -> Fixture {
    fixture_with_buffer(1024)
}
