// SPDX-License-Identifier: MIT

//! Session and primary-key management.
//!
//! Every command that talks to the TPM first runs the session machinery:
//! optionally load or re-create the storage root key as a salting key
//! (`GENEK`), then open up to two HMAC sessions with the requested
//! attributes. Cleanup is the mirror image, a three-step machine flushing
//! session1, session2 and a transient SRK.

use crate::callbacks::Callbacks;
use crate::error::{Error, Result};
use crate::esys::EsysContext;
use crate::object::{merge_profile_into_template, set_key_flags, Object, ObjectKind};
use crate::profile::Profile;
use crate::store::Keystore;
use crate::types::{EsysTr, SessionAttributes, SessionType};
use bitflags::bitflags;

bitflags! {
    /// What the session machinery should provide for the next command.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SessionFlags: u8 {
        /// Load or create the SRK as the session salting key.
        const GENEK = 0x01;
        /// Open the primary HMAC session.
        const SESSION1 = 0x02;
        /// Open the secondary session.
        const SESSION2 = 0x04;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum CleanupState {
    #[default]
    Init,
    Session1,
    Session2,
    Srk,
}

/// The context-owned TPM handles shared by all commands.
#[derive(Debug, Default)]
pub struct SessionPool {
    pub session1: EsysTr,
    pub session2: EsysTr,
    pub policy_session: EsysTr,
    pub srk_handle: EsysTr,
    pub srk_persistent: bool,
    pub ek_handle: EsysTr,
    pub ek_persistent: bool,
    cleanup_state: CleanupState,
}

impl SessionPool {
    /// Resets the per-command handles at command start.
    pub fn init_for_command(&mut self) {
        self.session1 = EsysTr::NONE;
        self.session2 = EsysTr::NONE;
        self.policy_session = EsysTr::NONE;
        self.srk_handle = EsysTr::NONE;
    }

    /// State machine flushing session1, session2 and a transient SRK.
    ///
    /// Safe to call repeatedly; once everything is flushed further calls
    /// are no-ops.
    ///
    /// # Errors
    ///
    /// `TryAgain` while a flush is in flight.
    pub fn cleanup_session(&mut self, esys: &mut dyn EsysContext) -> Result<()> {
        loop {
            match self.cleanup_state {
                CleanupState::Init => {
                    if self.session1.is_some() {
                        esys.flush_context_async(self.session1)?;
                    }
                    self.cleanup_state = CleanupState::Session1;
                }
                CleanupState::Session1 => {
                    if self.session1.is_some() {
                        esys.flush_context_finish()?;
                        self.session1 = EsysTr::NONE;
                    }
                    if self.session2.is_some() {
                        esys.flush_context_async(self.session2)?;
                    }
                    self.cleanup_state = CleanupState::Session2;
                }
                CleanupState::Session2 => {
                    if self.session2.is_some() {
                        esys.flush_context_finish()?;
                        self.session2 = EsysTr::NONE;
                    }
                    if !self.srk_persistent && self.srk_handle.is_some() {
                        esys.flush_context_async(self.srk_handle)?;
                    }
                    self.cleanup_state = CleanupState::Srk;
                }
                CleanupState::Srk => {
                    if !self.srk_persistent && self.srk_handle.is_some() {
                        esys.flush_context_finish()?;
                        self.srk_handle = EsysTr::NONE;
                        self.srk_persistent = false;
                    }
                    self.cleanup_state = CleanupState::Init;
                    return Ok(());
                }
            }
        }
    }

    /// Synchronous best-effort flush for error paths.
    pub fn session_clean(&mut self, esys: &mut dyn EsysContext) {
        for handle in [self.session1, self.session2, self.policy_session] {
            if handle.is_some() && esys.flush_context(handle).is_err() {
                log::error!("session cleanup failed");
            }
        }
        self.session1 = EsysTr::NONE;
        self.session2 = EsysTr::NONE;
        self.policy_session = EsysTr::NONE;
        if !self.srk_persistent && self.srk_handle.is_some() {
            if esys.flush_context(self.srk_handle).is_err() {
                log::error!("SRK cleanup failed");
            }
            self.srk_handle = EsysTr::NONE;
        }
        self.srk_persistent = false;
        self.cleanup_state = CleanupState::Init;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PrimaryState {
    ReadKey,
    WaitForPrimary,
}

/// Loads a primary key from its keystore record, re-creating it on the
/// TPM when it is not persistent.
pub struct PrimaryLoad {
    path: String,
    state: PrimaryState,
    hierarchy: Object,
    template: Option<Object>,
}

/// Result of a primary load: the handle plus whether it is persistent.
pub struct LoadedPrimary {
    pub handle: EsysTr,
    pub persistent: bool,
    pub object: Object,
}

impl PrimaryLoad {
    /// Begins loading the primary stored at `path` (an explicit keystore
    /// path such as `P_RSA2048SHA256/HS/SRK`).
    ///
    /// # Errors
    ///
    /// Fails with `BadPath` when no record exists, which means the
    /// keystore was never provisioned.
    pub fn start(keystore: &mut dyn Keystore, path: &str) -> Result<PrimaryLoad> {
        keystore.load_async(path)?;
        let hierarchy = if path.contains("/HE/") || path.ends_with("/EK") {
            Object::hierarchy(crate::path::Hierarchy::Endorsement)
        } else {
            Object::hierarchy(crate::path::Hierarchy::Owner)
        };
        Ok(PrimaryLoad {
            path: path.to_string(),
            state: PrimaryState::ReadKey,
            hierarchy,
            template: None,
        })
    }

    /// Drives the load to completion.
    ///
    /// # Errors
    ///
    /// `TryAgain` while keystore or TPM I/O is pending.
    pub fn finish(
        &mut self,
        esys: &mut dyn EsysContext,
        keystore: &mut dyn Keystore,
        cb: &mut dyn Callbacks,
    ) -> Result<LoadedPrimary> {
        loop {
            match self.state {
                PrimaryState::ReadKey => {
                    let mut object = keystore.load_finish()?;
                    let ObjectKind::Key(key) = &object.kind else {
                        log::error!("{} is no key", self.path);
                        return Err(Error::BadPath);
                    };

                    if let Some(blob) = key.serialization.clone() {
                        // Persistent primaries deserialize straight into a
                        // usable handle.
                        let handle = esys.tr_deserialize(&blob)?;
                        object.handle = handle;
                        return Ok(LoadedPrimary {
                            handle,
                            persistent: true,
                            object,
                        });
                    }

                    // Transient: re-create from the stored public area.
                    if self.hierarchy.with_auth() {
                        let auth = cb.auth(&self.path, "Authorize hierarchy")?;
                        esys.tr_set_auth(self.hierarchy.handle, auth.as_bytes())?;
                    }
                    esys.create_primary_async(
                        self.hierarchy.handle,
                        EsysTr::PASSWORD,
                        &crate::object::Sensitive::default(),
                        &key.public,
                    )?;
                    self.template = Some(object);
                    self.state = PrimaryState::WaitForPrimary;
                }
                PrimaryState::WaitForPrimary => {
                    let created = esys.create_primary_finish()?;
                    let mut object = self.template.take().ok_or(Error::GeneralFailure)?;
                    object.handle = created.handle;
                    if let Some(key) = object.as_key_mut() {
                        key.public = created.public;
                    }
                    return Ok(LoadedPrimary {
                        handle: created.handle,
                        persistent: false,
                        object,
                    });
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    WaitForPrimary,
    CreateSession,
    WaitForSession1,
    WaitForSession2,
}

/// The session setup state machine: primary load, then up to two HMAC
/// sessions.
pub struct GetSessions {
    flags: SessionFlags,
    attrs1: SessionAttributes,
    attrs2: SessionAttributes,
    state: SessionState,
    primary: Option<PrimaryLoad>,
}

impl GetSessions {
    /// Kicks off session setup. With `GENEK` the SRK load starts
    /// immediately; otherwise session creation is first.
    ///
    /// # Errors
    ///
    /// Propagates keystore failures from the SRK load.
    pub fn start(
        flags: SessionFlags,
        attrs1: SessionAttributes,
        attrs2: SessionAttributes,
        keystore: &mut dyn Keystore,
        profile_name: &str,
    ) -> Result<GetSessions> {
        let (primary, state) = if flags.contains(SessionFlags::GENEK) {
            let srk_path = format!("{profile_name}/{}", crate::path::SRK_PATH);
            (
                Some(PrimaryLoad::start(keystore, &srk_path)?),
                SessionState::WaitForPrimary,
            )
        } else {
            (None, SessionState::CreateSession)
        };
        Ok(GetSessions {
            flags,
            attrs1,
            attrs2,
            state,
            primary,
        })
    }

    /// Drives session setup to completion, parking the results in `pool`.
    ///
    /// # Errors
    ///
    /// `TryAgain` while any step is pending.
    pub fn finish(
        &mut self,
        esys: &mut dyn EsysContext,
        keystore: &mut dyn Keystore,
        pool: &mut SessionPool,
        profile: &Profile,
        cb: &mut dyn Callbacks,
    ) -> Result<()> {
        loop {
            match self.state {
                SessionState::WaitForPrimary => {
                    let primary = self.primary.as_mut().ok_or(Error::GeneralFailure)?;
                    let loaded = primary.finish(esys, keystore, cb)?;
                    pool.srk_handle = loaded.handle;
                    pool.srk_persistent = loaded.persistent;
                    self.state = SessionState::CreateSession;
                }
                SessionState::CreateSession => {
                    if !self.flags.contains(SessionFlags::SESSION1) {
                        return Ok(());
                    }
                    esys.start_auth_session_async(
                        pool.srk_handle,
                        SessionType::Hmac,
                        &profile.sym_parameters,
                        profile.name_alg,
                    )?;
                    self.state = SessionState::WaitForSession1;
                }
                SessionState::WaitForSession1 => {
                    let session = esys.start_auth_session_finish()?;
                    esys.tr_sess_set_attributes(
                        session,
                        self.attrs1 | SessionAttributes::CONTINUE_SESSION,
                        SessionAttributes::empty(),
                    )?;
                    pool.session1 = session;

                    if !self.flags.contains(SessionFlags::SESSION2) {
                        return Ok(());
                    }
                    esys.start_auth_session_async(
                        pool.srk_handle,
                        SessionType::Hmac,
                        &profile.sym_parameters,
                        profile.name_alg,
                    )?;
                    self.state = SessionState::WaitForSession2;
                }
                SessionState::WaitForSession2 => {
                    let session = esys.start_auth_session_finish()?;
                    esys.tr_sess_set_attributes(
                        session,
                        self.attrs2 | SessionAttributes::CONTINUE_SESSION,
                        SessionAttributes::empty(),
                    )?;
                    pool.session2 = session;
                    return Ok(());
                }
            }
        }
    }
}

/// Builds the SRK record stored by provisioning: the profile's SRK
/// template merged into a public area.
///
/// # Errors
///
/// Fails with `BadValue` on a broken template string.
pub fn srk_template(profile: &Profile) -> Result<crate::object::PublicArea> {
    let template = set_key_flags(&profile.srk_template, profile.srk_policy.is_some())?;
    Ok(merge_profile_into_template(profile, &template))
}

/// Builds the EK record stored by provisioning.
///
/// # Errors
///
/// Fails with `BadValue` on a broken template string.
pub fn ek_template(profile: &Profile) -> Result<crate::object::PublicArea> {
    let template = set_key_flags(&profile.ek_template, profile.ek_policy.is_some())?;
    Ok(merge_profile_into_template(profile, &template))
}
