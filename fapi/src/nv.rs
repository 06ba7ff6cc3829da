// SPDX-License-Identifier: MIT

//! The NV I/O engine.
//!
//! Reads and writes are chunked to the profile's NV buffer ceiling, with
//! per-chunk authorization. The authorization principal follows the index
//! attributes: `PPWRITE` means the platform hierarchy, `OWNERWRITE` the
//! owner hierarchy, otherwise the index authorizes itself. A `BadAuth`
//! response in the no-auth-sent state is retried once with a prompted
//! password. The extend variant pushes one event onto the index's log per
//! successful extend.

use crate::auth::AuthSubsystem;
use crate::callbacks::Callbacks;
use crate::crypto;
use crate::error::{Error, Result};
use crate::esys::EsysContext;
use crate::eventlog::{self, Event, EventDigest, EVENT_TYPE_TAG};
use crate::object::{Object, ObjectKind};
use crate::path::Hierarchy;
use crate::session::SessionPool;
use crate::store::Keystore;
use crate::types::{EsysTr, NvAttributes};

/// Extend data must stay below this bound.
pub const MAX_EXTEND_SIZE: usize = 1024;

/// Binds a loaded NV record to the TPM and picks its write/read
/// authorization principal.
///
/// # Errors
///
/// Fails with `BadPath` when the record is no NV object and `BadValue`
/// when it lacks an ESYS serialization.
pub fn bind_nv_object(
    esys: &mut dyn EsysContext,
    object: &mut Object,
) -> Result<(EsysTr, EsysTr, Object)> {
    let Some(nv) = object.as_nv() else {
        return Err(Error::BadPath);
    };
    let attributes = nv.public.attributes;

    let Some(blob) = &nv.serialization else {
        log::error!("NV record carries no ESYS serialization");
        return Err(Error::BadValue);
    };
    let nv_index = esys.tr_deserialize(blob)?;
    object.handle = nv_index;

    let (auth_index, auth_object) = if attributes.contains(NvAttributes::PPWRITE) {
        (
            Hierarchy::Platform.esys_handle(),
            Object::hierarchy(Hierarchy::Platform),
        )
    } else if attributes.contains(NvAttributes::OWNERWRITE) {
        (
            Hierarchy::Owner.esys_handle(),
            Object::hierarchy(Hierarchy::Owner),
        )
    } else {
        (nv_index, object.clone())
    };
    Ok((nv_index, auth_index, auth_object))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteState {
    Read,
    Authorize,
    AuthSent,
    NullAuthSent,
    WritePrepare,
    Write,
}

/// The chunked NV write state machine.
pub struct NvWrite {
    state: WriteState,
    path: String,
    offset: u16,
    data: Vec<u8>,
    write_data: Vec<u8>,
    num_bytes: usize,
    data_idx: usize,
    bytes_requested: u16,
    nv_index: EsysTr,
    auth_index: EsysTr,
    nv_object: Option<Object>,
    auth_object: Option<Object>,
    nv_buffer_max: usize,
}

impl NvWrite {
    /// Begins a write of `data` at `offset` into the index stored at
    /// `path`, starting with the keystore load of the record.
    ///
    /// # Errors
    ///
    /// Fails with `BadPath` when no record exists.
    pub fn start(
        keystore: &mut dyn Keystore,
        path: &str,
        offset: u16,
        data: Vec<u8>,
        nv_buffer_max: usize,
    ) -> Result<NvWrite> {
        keystore.check_writeable(path)?;
        keystore.load_async(path)?;
        Ok(NvWrite {
            state: WriteState::Read,
            path: path.to_string(),
            offset,
            num_bytes: data.len(),
            data,
            write_data: Vec::new(),
            data_idx: 0,
            bytes_requested: 0,
            nv_index: EsysTr::NONE,
            auth_index: EsysTr::NONE,
            nv_object: None,
            auth_object: None,
            nv_buffer_max,
        })
    }

    fn chunk(&self) -> usize {
        self.num_bytes.min(self.nv_buffer_max)
    }

    /// Drives the write to completion, including the record update that
    /// sets `WRITTEN`.
    ///
    /// # Errors
    ///
    /// `TryAgain` while suspended; `NvExceeded` when the write would pass
    /// the declared data size; `BadAuth` after the one retry failed.
    #[allow(clippy::too_many_lines)]
    pub fn finish(
        &mut self,
        esys: &mut dyn EsysContext,
        keystore: &mut dyn Keystore,
        pool: &mut SessionPool,
        auth: &mut AuthSubsystem,
        cb: &mut dyn Callbacks,
    ) -> Result<()> {
        loop {
            match self.state {
                WriteState::Read => {
                    let mut object = keystore.load_finish()?;
                    let (nv_index, auth_index, auth_object) = bind_nv_object(esys, &mut object)?;

                    let data_size = object
                        .as_nv()
                        .map(|nv| usize::from(nv.public.data_size))
                        .unwrap_or_default();
                    if usize::from(self.offset) + self.data.len() > data_size {
                        log::error!(
                            "write of {} bytes at {} exceeds NV size {data_size}",
                            self.data.len(),
                            self.offset
                        );
                        return Err(Error::NvExceeded);
                    }

                    // Zero-padded image of the full index; chunks are cut
                    // from it.
                    self.write_data = vec![0; data_size];
                    self.write_data[..self.data.len()].copy_from_slice(&self.data);

                    self.nv_index = nv_index;
                    self.auth_index = auth_index;
                    self.nv_object = Some(object);
                    self.auth_object = Some(auth_object);
                    self.state = WriteState::Authorize;
                }
                WriteState::Authorize => {
                    let auth_object = self.auth_object.as_mut().ok_or(Error::GeneralFailure)?;
                    let path = self.path.clone();
                    let session = auth.authorize_object(esys, pool, auth_object, &path, cb)?;

                    let chunk = self.chunk();
                    esys.nv_write_async(
                        self.auth_index,
                        self.nv_index,
                        session,
                        pool.session2,
                        &self.write_data[self.data_idx..self.data_idx + chunk],
                        self.offset,
                    )?;
                    self.bytes_requested = u16::try_from(chunk).map_err(|_| Error::BadValue)?;

                    let no_da = self
                        .nv_object
                        .as_ref()
                        .and_then(Object::as_nv)
                        .is_some_and(|nv| nv.public.attributes.contains(NvAttributes::NO_DA));
                    self.state = if no_da {
                        WriteState::NullAuthSent
                    } else {
                        WriteState::AuthSent
                    };
                    return Err(Error::TryAgain);
                }
                WriteState::AuthSent | WriteState::NullAuthSent => {
                    match esys.nv_write_finish() {
                        Ok(()) => {}
                        Err(Error::BadAuth) if self.state == WriteState::NullAuthSent => {
                            // One retry with a prompted password.
                            let auth_object =
                                self.auth_object.as_mut().ok_or(Error::GeneralFailure)?;
                            let path = self.path.clone();
                            AuthSubsystem::set_auth(esys, auth_object, &path, "NV Write", cb)?;

                            let session = if pool.policy_session.is_some() {
                                pool.policy_session
                            } else {
                                pool.session1
                            };
                            let chunk = usize::from(self.bytes_requested);
                            esys.nv_write_async(
                                self.auth_index,
                                self.nv_index,
                                session,
                                pool.session2,
                                &self.write_data[self.data_idx..self.data_idx + chunk],
                                self.offset,
                            )?;
                            self.state = WriteState::AuthSent;
                            return Err(Error::TryAgain);
                        }
                        Err(err) => return Err(err),
                    }

                    self.num_bytes -= usize::from(self.bytes_requested);
                    self.data_idx += usize::from(self.bytes_requested);
                    if self.num_bytes > 0 {
                        self.offset += self.bytes_requested;
                        let chunk = self.chunk();
                        esys.nv_write_async(
                            self.auth_index,
                            self.nv_index,
                            pool.session1,
                            pool.session2,
                            &self.write_data[self.data_idx..self.data_idx + chunk],
                            self.offset,
                        )?;
                        self.bytes_requested = u16::try_from(chunk).map_err(|_| Error::BadValue)?;
                        return Err(Error::TryAgain);
                    }
                    self.state = WriteState::WritePrepare;
                }
                WriteState::WritePrepare => {
                    let object = self.nv_object.as_mut().ok_or(Error::GeneralFailure)?;
                    if let ObjectKind::Nv(nv) = &mut object.kind {
                        nv.public.attributes |= NvAttributes::WRITTEN;
                    }
                    keystore.store_async(&self.path, object)?;
                    self.state = WriteState::Write;
                }
                WriteState::Write => {
                    keystore.store_finish()?;
                    log::debug!("NV write to {} finished", self.path);
                    return Ok(());
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Authorize,
    AuthSent,
}

/// The chunked NV read state machine.
///
/// The caller prepares the TPM bindings (from a loaded record via
/// [`bind_nv_object`], or directly for certificate retrieval) and drives
/// `finish` until the full buffer is assembled.
pub struct NvRead {
    state: ReadState,
    nv_index: EsysTr,
    auth_index: EsysTr,
    auth_object: Option<Object>,
    session_override: Option<EsysTr>,
    offset: u16,
    num_bytes: usize,
    bytes_requested: u16,
    data: Vec<u8>,
    nv_buffer_max: usize,
    path: String,
}

impl NvRead {
    #[must_use]
    pub fn new(
        nv_index: EsysTr,
        auth_index: EsysTr,
        auth_object: Object,
        path: &str,
        offset: u16,
        num_bytes: usize,
        nv_buffer_max: usize,
    ) -> NvRead {
        NvRead {
            state: ReadState::Authorize,
            nv_index,
            auth_index,
            auth_object: Some(auth_object),
            session_override: None,
            offset,
            num_bytes,
            bytes_requested: 0,
            data: Vec::new(),
            nv_buffer_max,
            path: path.to_string(),
        }
    }

    /// Uses a fixed session instead of running object authorization;
    /// certificate retrieval reads with a password session.
    #[must_use]
    pub fn with_session(mut self, session: EsysTr) -> NvRead {
        self.session_override = Some(session);
        self
    }

    /// Drives the read; returns the assembled bytes.
    ///
    /// # Errors
    ///
    /// `TryAgain` while suspended.
    pub fn finish(
        &mut self,
        esys: &mut dyn EsysContext,
        pool: &mut SessionPool,
        auth: &mut AuthSubsystem,
        cb: &mut dyn Callbacks,
    ) -> Result<Vec<u8>> {
        loop {
            match self.state {
                ReadState::Authorize => {
                    let session = match self.session_override {
                        Some(session) => session,
                        None => {
                            let auth_object =
                                self.auth_object.as_mut().ok_or(Error::GeneralFailure)?;
                            let path = self.path.clone();
                            auth.authorize_object(esys, pool, auth_object, &path, cb)?
                        }
                    };
                    let chunk = self.num_bytes.min(self.nv_buffer_max);
                    esys.nv_read_async(
                        self.auth_index,
                        self.nv_index,
                        session,
                        u16::try_from(chunk).map_err(|_| Error::BadValue)?,
                        self.offset,
                    )?;
                    self.bytes_requested = u16::try_from(chunk).map_err(|_| Error::BadValue)?;
                    self.state = ReadState::AuthSent;
                    return Err(Error::TryAgain);
                }
                ReadState::AuthSent => {
                    let chunk = esys.nv_read_finish()?;
                    if chunk.len() < usize::from(self.bytes_requested) {
                        // Short response ends the transfer.
                        self.num_bytes = 0;
                    } else {
                        self.num_bytes = self.num_bytes.saturating_sub(chunk.len());
                    }
                    self.data.extend(&chunk);

                    if self.num_bytes > 0 {
                        self.offset += self.bytes_requested;
                        let next = self.num_bytes.min(self.nv_buffer_max);
                        esys.nv_read_async(
                            self.auth_index,
                            self.nv_index,
                            self.session_override.unwrap_or(pool.session1),
                            u16::try_from(next).map_err(|_| Error::BadValue)?,
                            self.offset,
                        )?;
                        self.bytes_requested = u16::try_from(next).map_err(|_| Error::BadValue)?;
                        return Err(Error::TryAgain);
                    }
                    return Ok(core::mem::take(&mut self.data));
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExtendState {
    Read,
    Authorize,
    AuthSent,
    Log,
    Write,
}

/// The NV extend pipeline: chunked extends, then one event appended to
/// the index's log.
pub struct NvExtend {
    state: ExtendState,
    path: String,
    data: Vec<u8>,
    log_data: Option<serde_json::Value>,
    num_bytes: usize,
    data_idx: usize,
    bytes_requested: u16,
    last_chunk: Vec<u8>,
    nv_index: EsysTr,
    auth_index: EsysTr,
    nv_object: Option<Object>,
    auth_object: Option<Object>,
    nv_buffer_max: usize,
}

impl NvExtend {
    /// Begins an extend of `data` onto the index stored at `path`.
    ///
    /// # Errors
    ///
    /// Fails with `BadValue` for data of [`MAX_EXTEND_SIZE`] bytes or
    /// more, `BadPath` when no record exists.
    pub fn start(
        keystore: &mut dyn Keystore,
        path: &str,
        data: Vec<u8>,
        log_data: Option<serde_json::Value>,
    ) -> Result<NvExtend> {
        if data.is_empty() || data.len() >= MAX_EXTEND_SIZE {
            return Err(Error::BadValue);
        }
        keystore.check_writeable(path)?;
        keystore.load_async(path)?;
        Ok(NvExtend {
            state: ExtendState::Read,
            path: path.to_string(),
            num_bytes: data.len(),
            data,
            log_data,
            data_idx: 0,
            bytes_requested: 0,
            last_chunk: Vec::new(),
            nv_index: EsysTr::NONE,
            auth_index: EsysTr::NONE,
            nv_object: None,
            auth_object: None,
            nv_buffer_max: 0,
        })
    }

    /// Drives the extend to completion.
    ///
    /// # Errors
    ///
    /// `TryAgain` while suspended; `NvWrongType` when the index is not
    /// extendable.
    #[allow(clippy::too_many_lines)]
    pub fn finish(
        &mut self,
        esys: &mut dyn EsysContext,
        keystore: &mut dyn Keystore,
        pool: &mut SessionPool,
        auth: &mut AuthSubsystem,
        cb: &mut dyn Callbacks,
    ) -> Result<()> {
        loop {
            match self.state {
                ExtendState::Read => {
                    let mut object = keystore.load_finish()?;
                    if !object
                        .as_nv()
                        .is_some_and(|nv| nv.public.attributes.nv_type() == crate::types::NvType::Extend)
                    {
                        log::error!("{} is no extendable NV index", self.path);
                        return Err(Error::NvWrongType);
                    }
                    let (nv_index, auth_index, auth_object) = bind_nv_object(esys, &mut object)?;

                    // Extends move one digest-sized block at a time.
                    self.nv_buffer_max = object
                        .as_nv()
                        .map(|nv| nv.public.name_alg.digest_size())
                        .unwrap_or_default();
                    self.nv_index = nv_index;
                    self.auth_index = auth_index;
                    self.nv_object = Some(object);
                    self.auth_object = Some(auth_object);
                    self.state = ExtendState::Authorize;
                }
                ExtendState::Authorize => {
                    // Authorization runs to a terminal state before the
                    // first extend is issued.
                    let auth_object = self.auth_object.as_mut().ok_or(Error::GeneralFailure)?;
                    let path = self.path.clone();
                    let session = auth.authorize_object(esys, pool, auth_object, &path, cb)?;

                    let chunk = self.num_bytes.min(self.nv_buffer_max);
                    self.last_chunk = self.data[self.data_idx..self.data_idx + chunk].to_vec();
                    esys.nv_extend_async(self.auth_index, self.nv_index, session, &self.last_chunk)?;
                    self.bytes_requested = u16::try_from(chunk).map_err(|_| Error::BadValue)?;
                    self.state = ExtendState::AuthSent;
                    return Err(Error::TryAgain);
                }
                ExtendState::AuthSent => {
                    esys.nv_extend_finish()?;
                    self.num_bytes -= usize::from(self.bytes_requested);
                    self.data_idx += usize::from(self.bytes_requested);
                    if self.num_bytes > 0 {
                        let chunk = self.num_bytes.min(self.nv_buffer_max);
                        self.last_chunk = self.data[self.data_idx..self.data_idx + chunk].to_vec();
                        esys.nv_extend_async(
                            self.auth_index,
                            self.nv_index,
                            pool.session1,
                            &self.last_chunk,
                        )?;
                        self.bytes_requested = u16::try_from(chunk).map_err(|_| Error::BadValue)?;
                        return Err(Error::TryAgain);
                    }
                    self.state = ExtendState::Log;
                }
                ExtendState::Log => {
                    let object = self.nv_object.as_mut().ok_or(Error::GeneralFailure)?;
                    let ObjectKind::Nv(nv) = &mut object.kind else {
                        return Err(Error::GeneralFailure);
                    };

                    let digest = crypto::hash(nv.public.name_alg, &self.last_chunk)?;
                    let mut event = Event {
                        recnum: 0,
                        pcr: nv.public.nv_index,
                        digests: vec![EventDigest {
                            hash_alg: nv.public.name_alg,
                            digest,
                        }],
                        event_type: EVENT_TYPE_TAG.to_string(),
                        data: self.last_chunk.clone(),
                        event: self.log_data.take(),
                    };
                    nv.event_log = Some(eventlog::append_event(nv.event_log.as_deref(), &mut event)?);
                    nv.public.attributes |= NvAttributes::WRITTEN;

                    keystore.store_async(&self.path, object)?;
                    self.state = ExtendState::Write;
                }
                ExtendState::Write => {
                    keystore.store_finish()?;
                    log::debug!("NV extend of {} finished", self.path);
                    return Ok(());
                }
            }
        }
    }
}
