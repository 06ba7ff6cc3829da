// SPDX-License-Identifier: MIT

//! The per-object authorization state machine.
//!
//! For every object a command touches, authorization takes one of three
//! shapes: a plain password session when the object has neither policy
//! nor auth value, the shared HMAC session with a prompted auth value, or
//! a freshly opened policy session driven by the policy executor. Policy
//! sessions get `CONTINUESESSION` cleared so the TPM flushes them with
//! the command they authorize.

use crate::callbacks::Callbacks;
use crate::error::{Error, Result};
use crate::esys::EsysContext;
use crate::object::{AuthState, Object, ObjectKind};
use crate::policy::PolicyExecContext;
use crate::session::SessionPool;
use crate::types::{EsysTr, SessionAttributes, SessionType, SymDef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Phase {
    #[default]
    Idle,
    CreateSession,
    ExecPolicy,
}

/// Authorization bookkeeping shared by all commands of a context.
#[derive(Default)]
pub struct AuthSubsystem {
    phase: Phase,
    exec: Option<PolicyExecContext>,
}

impl AuthSubsystem {
    /// Prompts for and installs the auth value of `object`.
    ///
    /// # Errors
    ///
    /// Propagates callback refusal and ESYS errors.
    pub fn set_auth(
        esys: &mut dyn EsysContext,
        object: &Object,
        path: &str,
        description: &str,
        cb: &mut dyn Callbacks,
    ) -> Result<()> {
        let auth = cb.auth(path, description)?;
        esys.tr_set_auth(object.handle, auth.as_bytes())
    }

    /// Authorizes `object`, returning the session to pass to the next
    /// ESYS call.
    ///
    /// # Errors
    ///
    /// `TryAgain` while policy execution is pending; policy errors flush
    /// the policy session before surfacing.
    pub fn authorize_object(
        &mut self,
        esys: &mut dyn EsysContext,
        pool: &mut SessionPool,
        object: &mut Object,
        path: &str,
        cb: &mut dyn Callbacks,
    ) -> Result<EsysTr> {
        loop {
            match (object.auth_state, self.phase) {
                (AuthState::Init, Phase::Idle) => {
                    if object.policy_digest_size() == 0 {
                        if object.with_auth() {
                            Self::set_auth(esys, object, path, "Authorize object", cb)?;
                        }
                        // No policy session needed, the shared session or
                        // a password session authorizes.
                        let session = if pool.session1.is_some() {
                            pool.session1
                        } else {
                            EsysTr::PASSWORD
                        };
                        return Ok(session);
                    }
                    esys.start_auth_session_async(
                        pool.srk_handle,
                        SessionType::Policy,
                        &SymDef::default(),
                        object.name_alg(),
                    )?;
                    self.phase = Phase::CreateSession;
                }
                (AuthState::Init, Phase::CreateSession) => {
                    let session = esys.start_auth_session_finish()?;
                    pool.policy_session = session;
                    let harness = object.policy().ok_or(Error::PolicyUnknown)?;
                    self.exec = Some(PolicyExecContext::prepare(
                        harness,
                        object.name_alg(),
                        session,
                        cb,
                    )?);
                    object.auth_state = AuthState::ExecPolicy;
                    self.phase = Phase::ExecPolicy;
                }
                (AuthState::ExecPolicy, _) => {
                    let exec = self.exec.as_mut().ok_or(Error::GeneralFailure)?;
                    let session = exec.session();
                    match exec.execute(esys, cb) {
                        Ok(()) => {}
                        Err(Error::TryAgain) => return Err(Error::TryAgain),
                        Err(err) => {
                            // The executor already flushed the session.
                            pool.policy_session = EsysTr::NONE;
                            self.abort(object);
                            return Err(err);
                        }
                    }

                    if esys.tr_sess_get_auth_required(session)? {
                        Self::set_auth(esys, object, path, "Authorize object", cb)?;
                    }
                    // Clear the continue flag so the policy session is
                    // flushed together with the authorized command.
                    esys.tr_sess_set_attributes(
                        session,
                        SessionAttributes::empty(),
                        SessionAttributes::CONTINUE_SESSION,
                    )?;

                    let mut exec = self.exec.take().ok_or(Error::GeneralFailure)?;
                    let authorizations = exec.take_authorizations();
                    if !authorizations.is_empty() {
                        if let ObjectKind::Key(key) = &mut object.kind {
                            if let Some(harness) = key.policy.as_mut() {
                                harness.policy_authorizations.extend(authorizations);
                            }
                        } else if let ObjectKind::Nv(nv) = &mut object.kind {
                            if let Some(harness) = nv.policy.as_mut() {
                                harness.policy_authorizations.extend(authorizations);
                            }
                        }
                    }

                    object.auth_state = AuthState::Init;
                    self.phase = Phase::Idle;
                    return Ok(session);
                }
                (AuthState::Init, Phase::ExecPolicy) => {
                    // A previous authorization was aborted; start over.
                    self.phase = Phase::Idle;
                    self.exec = None;
                }
            }
        }
    }

    /// Drops any half-run policy execution, resetting the object's
    /// authorization state.
    pub fn abort(&mut self, object: &mut Object) {
        object.auth_state = AuthState::Init;
        self.reset();
    }

    /// Drops any half-run policy execution; part of the command error
    /// path.
    pub fn reset(&mut self) {
        self.phase = Phase::Idle;
        self.exec = None;
    }

    /// Whether a policy execution is currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> bool {
        self.phase != Phase::Idle
    }
}
