// SPDX-License-Identifier: MIT

//! The policy executor.
//!
//! Execution mirrors calculation but issues real policy commands against a
//! pre-opened policy session. The tree is first flattened: every
//! `PolicyOR` asks the application to pick a branch, the branch elements
//! are spliced in front of the `PolicyOR` itself, and the resulting list
//! runs element by element, each with its own suspension states.

use super::{PolicyAuthorization, PolicyElement, PolicyHarness};
use crate::callbacks::{AuthorizedObject, Callbacks};
use crate::crypto;
use crate::error::{Error, Result};
use crate::esys::EsysContext;
use crate::types::{ComparisonOp, EsysTr, HashAlg, RH_OWNER};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ExecState {
    #[default]
    Init,
    GetDigest,
    Callback,
    LoadKey,
    Verify,
    Finish,
    FlushKey,
    AuthCallback,
    ExecEsys,
    AuthSent,
}

/// Execution context for one flattened policy.
pub struct PolicyExecContext {
    session: EsysTr,
    hash_alg: HashAlg,
    elements: VecDeque<PolicyElement>,
    state: ExecState,
    object_handle: EsysTr,
    nonce_tpm: Vec<u8>,
    signature: Vec<u8>,
    key_name: Vec<u8>,
    approved: Vec<u8>,
    authorized: Option<AuthorizedObject>,
    new_authorizations: Vec<PolicyAuthorization>,
}

fn flatten(
    elements: &[PolicyElement],
    out: &mut Vec<PolicyElement>,
    cb: &mut dyn Callbacks,
) -> Result<()> {
    for element in elements {
        if let PolicyElement::PolicyOr { branches } = element {
            if branches.is_empty() {
                return Err(Error::BadValue);
            }
            let names: Vec<String> = branches.iter().map(|b| b.name.clone()).collect();
            let index = cb.branch_select(&names)?;
            if index >= branches.len() {
                log::error!("branch selection {index} out of range");
                return Err(Error::BadValue);
            }
            flatten(&branches[index].policy, out, cb)?;
        }
        out.push(element.clone());
    }
    Ok(())
}

impl PolicyExecContext {
    /// Flattens `harness` for execution against `session`, resolving every
    /// branch through the selection callback.
    ///
    /// # Errors
    ///
    /// Fails with `BadValue` on empty or out-of-range branch selections
    /// and `AuthorizationUnknown` when no selector is registered.
    pub fn prepare(
        harness: &PolicyHarness,
        hash_alg: HashAlg,
        session: EsysTr,
        cb: &mut dyn Callbacks,
    ) -> Result<PolicyExecContext> {
        let mut flat = Vec::new();
        flatten(&harness.policy, &mut flat, cb)?;
        Ok(PolicyExecContext {
            session,
            hash_alg,
            elements: flat.into(),
            state: ExecState::Init,
            object_handle: EsysTr::NONE,
            nonce_tpm: Vec::new(),
            signature: Vec::new(),
            key_name: Vec::new(),
            approved: Vec::new(),
            authorized: None,
            new_authorizations: Vec::new(),
        })
    }

    /// The policy session being satisfied.
    #[must_use]
    pub fn session(&self) -> EsysTr {
        self.session
    }

    /// Authorizations recorded by `PolicyAuthorize` elements during
    /// execution, for persisting into the harness.
    pub fn take_authorizations(&mut self) -> Vec<PolicyAuthorization> {
        core::mem::take(&mut self.new_authorizations)
    }

    /// Runs the flattened element list to completion.
    ///
    /// `TryAgain` suspends without losing position. Any other error
    /// flushes the policy session eagerly and poisons the context.
    ///
    /// # Errors
    ///
    /// Propagates ESYS and callback failures.
    pub fn execute(&mut self, esys: &mut dyn EsysContext, cb: &mut dyn Callbacks) -> Result<()> {
        while let Some(element) = self.elements.front().cloned() {
            match self.execute_element(esys, cb, &element) {
                Ok(()) => {
                    self.elements.pop_front();
                    self.state = ExecState::Init;
                }
                Err(Error::TryAgain) => return Err(Error::TryAgain),
                Err(err) => {
                    if self.object_handle.is_some() {
                        let _ = esys.flush_context(self.object_handle);
                        self.object_handle = EsysTr::NONE;
                    }
                    let _ = esys.flush_context(self.session);
                    self.session = EsysTr::NONE;
                    self.elements.clear();
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn execute_element(
        &mut self,
        esys: &mut dyn EsysContext,
        cb: &mut dyn Callbacks,
        element: &PolicyElement,
    ) -> Result<()> {
        match element {
            PolicyElement::PolicyOr { branches } => {
                if self.state == ExecState::Init {
                    let mut digests = Vec::with_capacity(branches.len());
                    for branch in branches {
                        digests.push(
                            branch
                                .policy_digests
                                .get(self.hash_alg)
                                .ok_or(Error::BadValue)?
                                .to_vec(),
                        );
                    }
                    esys.policy_or_async(self.session, &digests)?;
                    self.state = ExecState::Finish;
                }
                esys.policy_or_finish()
            }
            PolicyElement::PolicyPcr { pcrs } => {
                if self.state == ExecState::Init {
                    let (selection, digest) = super::calculate::compute_pcr_digest(pcrs, self.hash_alg)?;
                    esys.policy_pcr_async(self.session, &digest, &selection)?;
                    self.state = ExecState::Finish;
                }
                esys.policy_pcr_finish()
            }
            PolicyElement::PolicySigned {
                key_public,
                hash_alg,
                policy_ref,
                cp_hash,
                ..
            } => self.exec_signed(
                esys,
                cb,
                key_public.as_ref().ok_or(Error::BadTemplate)?,
                *hash_alg,
                policy_ref,
                cp_hash,
            ),
            PolicyElement::PolicyAuthorize {
                key_public,
                policy_ref,
                approved_policy,
                ..
            } => self.exec_authorize(
                esys,
                cb,
                key_public.as_ref().ok_or(Error::BadTemplate)?,
                policy_ref,
                approved_policy,
            ),
            PolicyElement::PolicyAuthorizeNv { nv_public, .. } => {
                self.exec_authorize_nv(esys, cb, nv_public.as_ref().ok_or(Error::BadTemplate)?)
            }
            PolicyElement::PolicySecret {
                object_name,
                policy_ref,
                cp_hash,
                ..
            } => self.exec_secret(esys, cb, object_name, policy_ref, cp_hash),
            PolicyElement::PolicyNv {
                nv_public,
                operand_b,
                offset,
                operation,
                ..
            } => self.exec_nv(
                esys,
                cb,
                nv_public.as_ref().ok_or(Error::BadTemplate)?,
                operand_b,
                *offset,
                *operation,
            ),
            PolicyElement::PolicyDuplicationSelect {
                object_name,
                new_parent_name,
                include_object,
                ..
            } => {
                if self.state == ExecState::Init {
                    let object_name = if object_name.is_empty() {
                        cb.duplication_name()?
                    } else {
                        object_name.clone()
                    };
                    if new_parent_name.is_empty() {
                        return Err(Error::BadTemplate);
                    }
                    esys.policy_duplication_select_async(
                        self.session,
                        &object_name,
                        new_parent_name,
                        *include_object,
                    )?;
                    self.state = ExecState::Finish;
                }
                esys.policy_duplication_select_finish()
            }
            PolicyElement::PolicyLocality { locality } => {
                if self.state == ExecState::Init {
                    esys.policy_locality_async(self.session, *locality)?;
                    self.state = ExecState::Finish;
                }
                esys.policy_locality_finish()
            }
            PolicyElement::PolicyCommandCode { code } => {
                if self.state == ExecState::Init {
                    esys.policy_command_code_async(self.session, *code)?;
                    self.state = ExecState::Finish;
                }
                esys.policy_command_code_finish()
            }
            PolicyElement::PolicyCounterTimer {
                operand_b,
                offset,
                operation,
            } => {
                if self.state == ExecState::Init {
                    esys.policy_counter_timer_async(self.session, operand_b, *offset, *operation)?;
                    self.state = ExecState::Finish;
                }
                esys.policy_counter_timer_finish()
            }
            PolicyElement::PolicyNvWritten { written_set } => {
                if self.state == ExecState::Init {
                    esys.policy_nv_written_async(self.session, *written_set)?;
                    self.state = ExecState::Finish;
                }
                esys.policy_nv_written_finish()
            }
            PolicyElement::PolicyNameHash { name_hash, .. } => {
                if self.state == ExecState::Init {
                    if name_hash.is_empty() {
                        return Err(Error::BadTemplate);
                    }
                    esys.policy_name_hash_async(self.session, name_hash)?;
                    self.state = ExecState::Finish;
                }
                esys.policy_name_hash_finish()
            }
            PolicyElement::PolicyCpHash { cp_hash } => {
                if self.state == ExecState::Init {
                    esys.policy_cp_hash_async(self.session, cp_hash)?;
                    self.state = ExecState::Finish;
                }
                esys.policy_cp_hash_finish()
            }
            PolicyElement::PolicyAuthValue => {
                if self.state == ExecState::Init {
                    esys.policy_auth_value_async(self.session)?;
                    self.state = ExecState::Finish;
                }
                esys.policy_auth_value_finish()
            }
            PolicyElement::PolicyPassword => {
                if self.state == ExecState::Init {
                    esys.policy_password_async(self.session)?;
                    self.state = ExecState::Finish;
                }
                esys.policy_password_finish()
            }
            PolicyElement::PolicyPhysicalPresence => {
                if self.state == ExecState::Init {
                    esys.policy_physical_presence_async(self.session)?;
                    self.state = ExecState::Finish;
                }
                esys.policy_physical_presence_finish()
            }
            PolicyElement::PolicyAction { action } => cb.action(action),
        }
    }

    fn exec_signed(
        &mut self,
        esys: &mut dyn EsysContext,
        cb: &mut dyn Callbacks,
        key_public: &crate::object::PublicArea,
        hash_alg: HashAlg,
        policy_ref: &[u8],
        cp_hash: &[u8],
    ) -> Result<()> {
        loop {
            match self.state {
                ExecState::Init => {
                    self.nonce_tpm = esys.tr_sess_get_nonce_tpm(self.session)?;
                    self.state = ExecState::Callback;
                }
                ExecState::Callback => {
                    // Message: nonceTPM || expiration (0) || cpHashA || policyRef.
                    let mut message =
                        Vec::with_capacity(self.nonce_tpm.len() + 4 + cp_hash.len() + policy_ref.len());
                    message.extend(&self.nonce_tpm);
                    message.extend(0_i32.to_be_bytes());
                    message.extend(cp_hash);
                    message.extend(policy_ref);
                    self.signature = cb.sign(key_public, hash_alg, &message)?;
                    esys.load_external_async(key_public, RH_OWNER)?;
                    self.state = ExecState::LoadKey;
                }
                ExecState::LoadKey => {
                    self.object_handle = esys.load_external_finish()?;
                    esys.policy_signed_async(
                        self.object_handle,
                        self.session,
                        &self.nonce_tpm,
                        cp_hash,
                        policy_ref,
                        &self.signature,
                    )?;
                    self.state = ExecState::Finish;
                }
                ExecState::Finish => {
                    esys.policy_signed_finish()?;
                    esys.flush_context_async(self.object_handle)?;
                    self.state = ExecState::FlushKey;
                }
                ExecState::FlushKey => {
                    esys.flush_context_finish()?;
                    self.object_handle = EsysTr::NONE;
                    return Ok(());
                }
                _ => return Err(Error::GeneralFailure),
            }
        }
    }

    fn exec_authorize(
        &mut self,
        esys: &mut dyn EsysContext,
        cb: &mut dyn Callbacks,
        key_public: &crate::object::PublicArea,
        policy_ref: &[u8],
        approved_policy: &[u8],
    ) -> Result<()> {
        loop {
            match self.state {
                ExecState::Init => {
                    if approved_policy.is_empty() {
                        // The approved policy is whatever the session has
                        // accumulated so far.
                        esys.policy_get_digest_async(self.session)?;
                        self.state = ExecState::GetDigest;
                    } else {
                        self.approved = approved_policy.to_vec();
                        self.state = ExecState::Callback;
                    }
                }
                ExecState::GetDigest => {
                    self.approved = esys.policy_get_digest_finish()?;
                    self.state = ExecState::Callback;
                }
                ExecState::Callback => {
                    self.signature = cb.authorize_policy(key_public, self.hash_alg, &self.approved)?;
                    esys.load_external_async(key_public, RH_OWNER)?;
                    self.state = ExecState::LoadKey;
                }
                ExecState::LoadKey => {
                    self.object_handle = esys.load_external_finish()?;
                    self.key_name = esys.tr_get_name(self.object_handle)?;

                    let mut ahash = crypto::HashSequence::start(self.hash_alg)?;
                    ahash.update(&self.approved);
                    ahash.update(policy_ref);
                    let ahash = ahash.finish();
                    esys.verify_signature_async(self.object_handle, &ahash, &self.signature)?;
                    self.state = ExecState::Verify;
                }
                ExecState::Verify => {
                    let ticket = esys.verify_signature_finish()?;
                    esys.policy_authorize_async(
                        self.session,
                        &self.approved,
                        policy_ref,
                        &self.key_name,
                        &ticket,
                    )?;
                    self.state = ExecState::Finish;
                }
                ExecState::Finish => {
                    esys.policy_authorize_finish()?;
                    esys.flush_context_async(self.object_handle)?;
                    self.state = ExecState::FlushKey;
                }
                ExecState::FlushKey => {
                    esys.flush_context_finish()?;
                    self.object_handle = EsysTr::NONE;
                    self.new_authorizations.push(PolicyAuthorization {
                        key_public: key_public.clone(),
                        policy_ref: policy_ref.to_vec(),
                        signature: core::mem::take(&mut self.signature),
                    });
                    return Ok(());
                }
                _ => return Err(Error::GeneralFailure),
            }
        }
    }

    fn exec_authorize_nv(
        &mut self,
        esys: &mut dyn EsysContext,
        cb: &mut dyn Callbacks,
        nv_public: &crate::object::NvPublicArea,
    ) -> Result<()> {
        loop {
            match self.state {
                ExecState::Init => {
                    cb.authorize_nv(nv_public, self.hash_alg)?;
                    self.key_name = nv_public.name()?;
                    self.state = ExecState::AuthCallback;
                }
                ExecState::AuthCallback => {
                    self.authorized = Some(cb.authorize_object_by_name(&self.key_name)?);
                    self.state = ExecState::ExecEsys;
                }
                ExecState::ExecEsys => {
                    let auth = self.authorized.ok_or(Error::GeneralFailure)?;
                    esys.policy_authorize_nv_async(
                        auth.auth_handle,
                        auth.object,
                        self.session,
                        auth.session,
                    )?;
                    self.state = ExecState::AuthSent;
                }
                ExecState::AuthSent => {
                    esys.policy_authorize_nv_finish()?;
                    self.authorized = None;
                    return Ok(());
                }
                _ => return Err(Error::GeneralFailure),
            }
        }
    }

    fn exec_secret(
        &mut self,
        esys: &mut dyn EsysContext,
        cb: &mut dyn Callbacks,
        object_name: &[u8],
        policy_ref: &[u8],
        cp_hash: &[u8],
    ) -> Result<()> {
        loop {
            match self.state {
                ExecState::Init => {
                    if object_name.is_empty() {
                        return Err(Error::BadTemplate);
                    }
                    self.authorized = Some(cb.authorize_object_by_name(object_name)?);
                    self.state = ExecState::ExecEsys;
                }
                ExecState::ExecEsys => {
                    let auth = self.authorized.ok_or(Error::GeneralFailure)?;
                    let nonce = esys.tr_sess_get_nonce_tpm(self.session)?;
                    esys.policy_secret_async(
                        auth.auth_handle,
                        self.session,
                        auth.session,
                        &nonce,
                        cp_hash,
                        policy_ref,
                    )?;
                    self.state = ExecState::AuthSent;
                }
                ExecState::AuthSent => {
                    esys.policy_secret_finish()?;
                    self.authorized = None;
                    return Ok(());
                }
                _ => return Err(Error::GeneralFailure),
            }
        }
    }

    fn exec_nv(
        &mut self,
        esys: &mut dyn EsysContext,
        cb: &mut dyn Callbacks,
        nv_public: &crate::object::NvPublicArea,
        operand_b: &[u8],
        offset: u16,
        operation: ComparisonOp,
    ) -> Result<()> {
        loop {
            match self.state {
                ExecState::Init => {
                    self.key_name = nv_public.name()?;
                    self.state = ExecState::AuthCallback;
                }
                ExecState::AuthCallback => {
                    self.authorized = Some(cb.authorize_object_by_name(&self.key_name)?);
                    self.state = ExecState::ExecEsys;
                }
                ExecState::ExecEsys => {
                    let auth = self.authorized.ok_or(Error::GeneralFailure)?;
                    esys.policy_nv_async(
                        auth.auth_handle,
                        auth.object,
                        self.session,
                        auth.session,
                        operand_b,
                        offset,
                        operation,
                    )?;
                    self.state = ExecState::AuthSent;
                }
                ExecState::AuthSent => {
                    esys.policy_nv_finish()?;
                    self.authorized = None;
                    return Ok(());
                }
                _ => return Err(Error::GeneralFailure),
            }
        }
    }
}
