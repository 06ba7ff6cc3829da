// SPDX-License-Identifier: MIT

//! The key-chain loader.
//!
//! Loading `/HS/SRK/parent/child` means walking the explicit path from
//! the leaf upwards, stacking the stored records until a loadable anchor
//! is found (a persistent key or a primary), then unwinding: authorize
//! the current parent, `Load` the child, optionally flush the parent,
//! repeat. After success the last-loaded key is the authorization object
//! for the command that asked.

use crate::auth::AuthSubsystem;
use crate::callbacks::Callbacks;
use crate::error::{Error, Result};
use crate::esys::EsysContext;
use crate::path::path_string_n;
use crate::session::{PrimaryLoad, SessionPool};
use crate::store::Keystore;
use crate::types::EsysTr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadState {
    GetPath,
    ReadKey,
    LoadKey,
    Authorize,
    Auth,
    WaitForPrimary,
}

/// The loaded result: handle plus the object metadata of the leaf key.
pub struct LoadedKey {
    pub handle: EsysTr,
    pub object: crate::object::Object,
}

/// State machine loading a key and every ancestor it needs.
pub struct LoadKey {
    state: LoadState,
    path_list: Vec<String>,
    position: usize,
    key_stack: Vec<crate::object::Object>,
    auth_object: Option<crate::object::Object>,
    parent_handle: EsysTr,
    handle: EsysTr,
    primary: Option<PrimaryLoad>,
    flush_parent: bool,
}

impl LoadKey {
    /// Starts loading the key named by the explicit `path_list`
    /// (`[profile, hierarchy, segment…]`).
    #[must_use]
    pub fn start(path_list: Vec<String>, flush_parent: bool) -> LoadKey {
        let position = path_list.len();
        LoadKey {
            state: LoadState::GetPath,
            path_list,
            position,
            key_stack: Vec::new(),
            auth_object: None,
            parent_handle: EsysTr::NONE,
            handle: EsysTr::NONE,
            primary: None,
            flush_parent,
        }
    }

    /// Drives the load. Returns the leaf key once the whole chain is on
    /// the TPM.
    ///
    /// # Errors
    ///
    /// `TryAgain` while any step is pending; `BadPath` when a chain
    /// segment is not a key.
    #[allow(clippy::too_many_lines)]
    pub fn finish(
        &mut self,
        esys: &mut dyn EsysContext,
        keystore: &mut dyn Keystore,
        pool: &mut SessionPool,
        auth: &mut AuthSubsystem,
        cb: &mut dyn Callbacks,
    ) -> Result<LoadedKey> {
        loop {
            match self.state {
                LoadState::GetPath => {
                    let path = path_string_n(&self.path_list, self.position);
                    keystore.load_async(&path)?;
                    self.state = LoadState::ReadKey;
                }
                LoadState::ReadKey => {
                    let mut object = keystore.load_finish()?;
                    let Some(key) = object.as_key() else {
                        log::error!(
                            "{} is no key",
                            path_string_n(&self.path_list, self.position)
                        );
                        return Err(Error::BadPath);
                    };
                    let serialization = key.serialization.clone();
                    let is_primary = key.private.is_empty();

                    if let Some(blob) = serialization {
                        // A persistent key anchors the chain directly.
                        object.handle = esys.tr_deserialize(&blob)?;
                        self.handle = object.handle;
                        self.auth_object = Some(object);
                        self.state = LoadState::LoadKey;
                        continue;
                    }

                    if is_primary {
                        // The node is the primary; re-create it.
                        let path = path_string_n(&self.path_list, self.position);
                        self.primary = Some(PrimaryLoad::start(keystore, &path)?);
                        self.state = LoadState::WaitForPrimary;
                        continue;
                    }

                    self.key_stack.push(object);
                    self.position -= 1;
                    if self.position == 0 {
                        log::error!("key chain without a loadable anchor");
                        return Err(Error::BadPath);
                    }
                    self.state = LoadState::GetPath;
                }
                LoadState::WaitForPrimary => {
                    let primary = self.primary.as_mut().ok_or(Error::GeneralFailure)?;
                    let loaded = primary.finish(esys, keystore, cb)?;
                    self.primary = None;
                    self.handle = loaded.handle;
                    self.auth_object = Some(loaded.object);
                    self.state = LoadState::LoadKey;
                }
                LoadState::LoadKey => {
                    if self.key_stack.is_empty() {
                        let object = self.auth_object.take().ok_or(Error::GeneralFailure)?;
                        log::trace!("all keys loaded");
                        return Ok(LoadedKey {
                            handle: self.handle,
                            object,
                        });
                    }
                    // With flush_parent off, a retained parent is flushed
                    // only now that a new parent takes over.
                    if !self.flush_parent && self.parent_handle.is_some() {
                        esys.flush_context(self.parent_handle)?;
                        self.parent_handle = EsysTr::NONE;
                    }
                    self.state = LoadState::Authorize;
                }
                LoadState::Authorize => {
                    let path = path_string_n(&self.path_list, self.position);
                    let parent = self.auth_object.as_mut().ok_or(Error::GeneralFailure)?;
                    let session = auth.authorize_object(esys, pool, parent, &path, cb)?;

                    self.parent_handle = self.handle;
                    let child = self.key_stack.last().ok_or(Error::GeneralFailure)?;
                    let key = child.as_key().ok_or(Error::GeneralFailure)?;
                    esys.load_async(self.handle, session, &key.private, &key.public)?;
                    self.state = LoadState::Auth;
                }
                LoadState::Auth => {
                    let new_handle = esys.load_finish()?;

                    // The spent parent is flushed unless pinned.
                    if let Some(parent) = &self.auth_object {
                        let transient = parent
                            .as_key()
                            .is_some_and(|key| key.persistent_handle == 0);
                        if self.flush_parent && transient && parent.handle.is_some() {
                            esys.flush_context(parent.handle)?;
                        }
                    }

                    let mut child = self.key_stack.pop().ok_or(Error::GeneralFailure)?;
                    child.handle = new_handle;
                    self.handle = new_handle;
                    self.auth_object = Some(child);
                    self.state = LoadState::LoadKey;
                }
            }
        }
    }

    /// Flushes every transient handle the loader still owns; for command
    /// error paths.
    pub fn cleanup(&mut self, esys: &mut dyn EsysContext) {
        if let Some(object) = &self.auth_object {
            let transient = object
                .as_key()
                .is_some_and(|key| key.persistent_handle == 0);
            if transient && object.handle.is_some() && esys.flush_context(object.handle).is_err() {
                log::error!("flush of loaded key failed");
            }
        }
        self.auth_object = None;
        self.key_stack.clear();
    }
}
