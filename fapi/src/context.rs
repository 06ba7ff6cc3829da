// SPDX-License-Identifier: MIT

//! The FAPI context and the outer state-machine executor.
//!
//! A context owns the TPM channel, the stores, the loaded profiles and
//! the session pool, plus at most one in-flight command. Every public
//! operation comes as a triplet: the one-call form drives the paired
//! `_async`/`_finish` until the finish stops reporting `TryAgain`.
//! Starting an operation while another is in flight fails with
//! `BadSequence` and leaves the running command untouched.

use crate::auth::AuthSubsystem;
use crate::callbacks::Callbacks;
use crate::capability::{CapabilityData, CapabilityFetch, GetCertificates as CertScan,
    MAX_EK_CERT_HANDLE, MIN_EK_CERT_HANDLE};
use crate::error::{Error, Result};
use crate::esys::EsysContext;
use crate::keychain::LoadKey;
use crate::nv::{bind_nv_object, NvExtend, NvRead, NvWrite};
use crate::object::{
    merge_profile_into_template, nv_template_size, set_key_flags, set_nv_flags, KeyObject,
    NvObject, NvPublicArea, Object, PublicArea, PublicParams, Sensitive,
};
use crate::path::{self, Hierarchy};
use crate::policy::{calculate, PolicyHarness};
use crate::profile::Profiles;
use crate::session::{ek_template, srk_template, GetSessions, SessionFlags, SessionPool};
use crate::store::{Keystore, PolicyStore};
use crate::types::{
    put_u16, Algorithm, Capability, EsysTr, SessionAttributes, SignScheme, MAX_DIGEST_SIZE,
};

/// Chunk ceiling for symmetric encrypt/decrypt (`TPM2_MAX_BUFFER`).
const ENC_DEC_CHUNK: usize = 1024;
/// Largest single `GetRandom` request (`sizeof(TPMU_HA)`).
const RANDOM_CHUNK: usize = MAX_DIGEST_SIZE;

struct PathInfoCmd {
    store_path: String,
    description: Option<String>,
    app_data: Option<Vec<u8>>,
    writing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NvCmdState {
    WaitForSession,
    ReadObject,
    Engine,
    Cleanup,
}

struct NvWriteCmd {
    state: NvCmdState,
    store_path: String,
    offset: u16,
    data: Vec<u8>,
    sessions: GetSessions,
    engine: Option<NvWrite>,
}

struct NvReadCmd {
    state: NvCmdState,
    store_path: String,
    sessions: GetSessions,
    engine: Option<NvRead>,
    result: Option<Vec<u8>>,
}

struct NvExtendCmd {
    state: NvCmdState,
    store_path: String,
    data: Vec<u8>,
    log_data: Option<serde_json::Value>,
    sessions: GetSessions,
    engine: Option<NvExtend>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CreateNvState {
    ReadPolicy,
    WaitForSession,
    FindIndex,
    DefineSpace,
    WriteObject,
    Cleanup,
}

struct CreateNvCmd {
    state: CreateNvState,
    store_path: String,
    nv_path: String,
    template: crate::object::NvTemplate,
    size: Option<u16>,
    auth_value: Option<String>,
    policy: Option<PolicyHarness>,
    sessions: Option<GetSessions>,
    fetch: Option<CapabilityFetch>,
    public: Option<NvPublicArea>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteAuthNvState {
    ReadNv,
    ReadPolicy,
    WaitForSession,
    WriteNvRam,
    WritePolicy,
    Cleanup,
}

struct WriteAuthNvCmd {
    state: WriteAuthNvState,
    store_path: String,
    policy_path: String,
    policy_disk_path: String,
    nv_object: Option<Object>,
    policy: Option<PolicyHarness>,
    sessions: Option<GetSessions>,
    engine: Option<NvWrite>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CreateKeyState {
    ReadPolicy,
    WaitForSession,
    LoadParent,
    Authorize,
    WaitForCreate,
    FlushParent,
    WriteKey,
    Cleanup,
}

struct CreateKeyCmd {
    state: CreateKeyState,
    path_list: Vec<String>,
    store_path: String,
    template: crate::object::KeyTemplate,
    public: Option<PublicArea>,
    sensitive: Sensitive,
    policy: Option<PolicyHarness>,
    sessions: Option<GetSessions>,
    loader: Option<LoadKey>,
    parent: Option<Object>,
    parent_handle: EsysTr,
    with_auth: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignState {
    WaitForSession,
    LoadKey,
    Authorize,
    WaitForSign,
    FlushKey,
    Cleanup,
}

struct SignCmd {
    state: SignState,
    path_list: Vec<String>,
    digest: Vec<u8>,
    sessions: GetSessions,
    loader: Option<LoadKey>,
    key: Option<Object>,
    signature: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EncDecState {
    WaitForSession,
    LoadKey,
    Authorize,
    WaitForData,
    FlushKey,
    Cleanup,
}

struct EncDecCmd {
    state: EncDecState,
    decrypt: bool,
    path_list: Vec<String>,
    data: Vec<u8>,
    data_idx: usize,
    iv: Vec<u8>,
    out: Vec<u8>,
    sessions: GetSessions,
    loader: Option<LoadKey>,
    key: Option<Object>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RandomState {
    WaitForSession,
    Sent,
    Cleanup,
}

struct GetRandomCmd {
    state: RandomState,
    num_bytes: usize,
    data: Vec<u8>,
    sessions: GetSessions,
}

struct GetInfoCmd {
    fetch: CapabilityFetch,
}

struct GetCertCmd {
    scan: CertScan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProvisionState {
    CreateSrk,
    WaitForSrk,
    StoreSrk,
    CreateEk,
    WaitForEk,
    StoreEk,
    StoreHierarchy(usize),
    StoreHierarchyFinish(usize),
    Cleanup,
}

/// Hierarchies that get a keystore record during provisioning.
const PROVISIONED_HIERARCHIES: [Hierarchy; 3] =
    [Hierarchy::Owner, Hierarchy::Endorsement, Hierarchy::Lockout];

struct ProvisionCmd {
    state: ProvisionState,
    srk_public: PublicArea,
    ek_public: PublicArea,
    srk_handle: EsysTr,
    ek_handle: EsysTr,
}

enum Command {
    Idle,
    GetDescription(PathInfoCmd),
    SetDescription(PathInfoCmd),
    GetAppData(PathInfoCmd),
    SetAppData(PathInfoCmd),
    NvWrite(NvWriteCmd),
    NvRead(NvReadCmd),
    NvExtend(NvExtendCmd),
    CreateNv(CreateNvCmd),
    WriteAuthorizeNv(WriteAuthNvCmd),
    CreateKey(CreateKeyCmd),
    Sign(SignCmd),
    EncryptDecrypt(EncDecCmd),
    GetRandom(GetRandomCmd),
    GetInfo(GetInfoCmd),
    GetCertificates(GetCertCmd),
    Provision(ProvisionCmd),
}

impl Command {
    fn is_idle(&self) -> bool {
        matches!(self, Command::Idle)
    }
}

/// The feature API context.
pub struct FapiContext {
    esys: Box<dyn EsysContext>,
    keystore: Box<dyn Keystore>,
    policy_store: Box<dyn PolicyStore>,
    profiles: Profiles,
    pool: SessionPool,
    auth: AuthSubsystem,
    command: Command,
    /// Leaves the transport non-blocking in the one-call wrappers so the
    /// state automata can be exercised.
    pub test_async_mode: bool,
}

impl FapiContext {
    /// Creates a context over a TPM channel and its stores.
    #[must_use]
    pub fn new(
        esys: Box<dyn EsysContext>,
        keystore: Box<dyn Keystore>,
        policy_store: Box<dyn PolicyStore>,
        profiles: Profiles,
    ) -> FapiContext {
        FapiContext {
            esys,
            keystore,
            policy_store,
            profiles,
            pool: SessionPool::default(),
            auth: AuthSubsystem::default(),
            command: Command::Idle,
            test_async_mode: false,
        }
    }

    /// Whether a command is currently in flight.
    #[must_use]
    pub fn busy(&self) -> bool {
        !self.command.is_idle()
    }

    fn begin_command(&mut self) -> Result<()> {
        if self.busy() {
            log::error!("another command is in flight");
            return Err(Error::BadSequence);
        }
        self.pool.init_for_command();
        Ok(())
    }

    /// Concentrated error path: flush sessions and transient handles,
    /// drop the command scratch, surface the error.
    fn command_error(&mut self, err: Error) -> Error {
        debug_assert!(err != Error::TryAgain);
        let (loader, held) = match &mut self.command {
            Command::Sign(cmd) => (cmd.loader.as_mut(), cmd.key.take()),
            Command::EncryptDecrypt(cmd) => (cmd.loader.as_mut(), cmd.key.take()),
            Command::CreateKey(cmd) => (cmd.loader.as_mut(), cmd.parent.take()),
            _ => (None, None),
        };
        if let Some(loader) = loader {
            loader.cleanup(self.esys.as_mut());
        }
        if let Some(object) = held {
            let transient = object
                .as_key()
                .is_some_and(|key| key.persistent_handle == 0);
            if transient && object.handle.is_some() {
                let _ = self.esys.flush_context(object.handle);
            }
        }
        self.auth.reset();
        self.pool.session_clean(self.esys.as_mut());
        self.command = Command::Idle;
        err
    }

    fn run_to_completion<T>(
        &mut self,
        cb: &mut dyn Callbacks,
        mut finish: impl FnMut(&mut FapiContext, &mut dyn Callbacks) -> Result<T>,
    ) -> Result<T> {
        if !self.test_async_mode {
            self.esys.set_timeout_blocking(true)?;
        }
        let result = loop {
            self.keystore.io_poll()?;
            match finish(self, cb) {
                Err(Error::TryAgain) => {}
                other => break other,
            }
        };
        if !self.test_async_mode {
            self.esys.set_timeout_blocking(false)?;
        }
        result
    }

    fn nv_store_path(path: &str) -> Result<String> {
        if !path::path_type_p(path, path::NV_PATH) {
            return Err(Error::BadPath);
        }
        Ok(path::to_disk_path(path))
    }

    fn object_store_path(&self, logical: &str) -> Result<String> {
        if path::path_type_p(logical, path::NV_PATH)
            || path::path_type_p(logical, path::POLICY_PATH)
            || path::path_type_p(logical, path::EXT_PATH)
        {
            return Ok(path::to_disk_path(logical));
        }
        if path::hierarchy_path_p(logical) {
            let rel = path::to_disk_path(logical);
            if rel.starts_with("P_") {
                return Ok(rel);
            }
            let hierarchy = path::hierarchy_of(logical)?;
            return Ok(format!(
                "{}/{}",
                self.profiles.default_name(),
                hierarchy.segment()
            ));
        }
        let list = path::explicit_key_path(self.profiles.default_name(), logical)?;
        Ok(path::path_string(&list))
    }

    // ------------------------------------------------------------------
    // GetDescription / SetDescription / GetAppData / SetAppData
    // ------------------------------------------------------------------

    /// One-call form of [`get_description_async`].
    ///
    /// # Errors
    ///
    /// See [`get_description_finish`].
    ///
    /// [`get_description_async`]: FapiContext::get_description_async
    /// [`get_description_finish`]: FapiContext::get_description_finish
    pub fn get_description(&mut self, path: &str) -> Result<Option<String>> {
        self.get_description_async(path)?;
        self.run_to_completion(&mut crate::callbacks::NoCallbacks, |ctx, _| {
            ctx.get_description_finish()
        })
    }

    /// Begins reading the description of the object at `path`.
    ///
    /// # Errors
    ///
    /// `BadSequence` when a command is in flight, `BadPath` for unknown
    /// objects.
    pub fn get_description_async(&mut self, path: &str) -> Result<()> {
        self.begin_command()?;
        let store_path = self.object_store_path(path)?;
        self.keystore.load_async(&store_path)?;
        self.command = Command::GetDescription(PathInfoCmd {
            store_path,
            description: None,
            app_data: None,
            writing: false,
        });
        Ok(())
    }

    /// Completes [`get_description_async`].
    ///
    /// # Errors
    ///
    /// `TryAgain` while the record read is pending.
    ///
    /// [`get_description_async`]: FapiContext::get_description_async
    pub fn get_description_finish(&mut self) -> Result<Option<String>> {
        let Command::GetDescription(_) = &self.command else {
            return Err(Error::BadSequence);
        };
        match self.keystore.load_finish() {
            Ok(object) => {
                let description = object.description().map(str::to_string);
                self.command = Command::Idle;
                Ok(description)
            }
            Err(Error::TryAgain) => Err(Error::TryAgain),
            Err(err) => Err(self.command_error(err)),
        }
    }

    /// One-call form of [`set_description_async`].
    ///
    /// # Errors
    ///
    /// See [`set_description_finish`].
    ///
    /// [`set_description_async`]: FapiContext::set_description_async
    /// [`set_description_finish`]: FapiContext::set_description_finish
    pub fn set_description(&mut self, path: &str, description: Option<&str>) -> Result<()> {
        self.set_description_async(path, description)?;
        self.run_to_completion(&mut crate::callbacks::NoCallbacks, |ctx, _| {
            ctx.set_description_finish()
        })
    }

    /// Begins replacing the description of the object at `path`.
    ///
    /// # Errors
    ///
    /// `BadSequence` when a command is in flight.
    pub fn set_description_async(&mut self, path: &str, description: Option<&str>) -> Result<()> {
        self.begin_command()?;
        let store_path = self.object_store_path(path)?;
        self.keystore.check_writeable(&store_path)?;
        self.keystore.load_async(&store_path)?;
        self.command = Command::SetDescription(PathInfoCmd {
            store_path,
            description: description.map(str::to_string),
            app_data: None,
            writing: false,
        });
        Ok(())
    }

    /// Completes [`set_description_async`].
    ///
    /// # Errors
    ///
    /// `TryAgain` while store I/O is pending.
    ///
    /// [`set_description_async`]: FapiContext::set_description_async
    pub fn set_description_finish(&mut self) -> Result<()> {
        let Command::SetDescription(_) = &self.command else {
            return Err(Error::BadSequence);
        };
        match self.path_info_write_step(false) {
            Err(Error::TryAgain) => Err(Error::TryAgain),
            Err(err) => Err(self.command_error(err)),
            Ok(done) => {
                if done {
                    self.command = Command::Idle;
                }
                Ok(())
            }
        }
    }

    /// One-call form of [`get_app_data_async`].
    ///
    /// # Errors
    ///
    /// See [`get_app_data_finish`].
    ///
    /// [`get_app_data_async`]: FapiContext::get_app_data_async
    /// [`get_app_data_finish`]: FapiContext::get_app_data_finish
    pub fn get_app_data(&mut self, path: &str) -> Result<Option<Vec<u8>>> {
        self.get_app_data_async(path)?;
        self.run_to_completion(&mut crate::callbacks::NoCallbacks, |ctx, _| {
            ctx.get_app_data_finish()
        })
    }

    /// Begins reading the application data of the object at `path`.
    ///
    /// # Errors
    ///
    /// `BadSequence` when a command is in flight.
    pub fn get_app_data_async(&mut self, path: &str) -> Result<()> {
        self.begin_command()?;
        let store_path = self.object_store_path(path)?;
        self.keystore.load_async(&store_path)?;
        self.command = Command::GetAppData(PathInfoCmd {
            store_path,
            description: None,
            app_data: None,
            writing: false,
        });
        Ok(())
    }

    /// Completes [`get_app_data_async`].
    ///
    /// # Errors
    ///
    /// `TryAgain` while the record read is pending; `BadPath` for object
    /// kinds without app data.
    ///
    /// [`get_app_data_async`]: FapiContext::get_app_data_async
    pub fn get_app_data_finish(&mut self) -> Result<Option<Vec<u8>>> {
        let Command::GetAppData(_) = &self.command else {
            return Err(Error::BadSequence);
        };
        match self.keystore.load_finish() {
            Ok(object) => match object.app_data() {
                Ok(data) => {
                    let data = data.map(<[u8]>::to_vec);
                    self.command = Command::Idle;
                    Ok(data)
                }
                Err(err) => Err(self.command_error(err)),
            },
            Err(Error::TryAgain) => Err(Error::TryAgain),
            Err(err) => Err(self.command_error(err)),
        }
    }

    /// One-call form of [`set_app_data_async`].
    ///
    /// # Errors
    ///
    /// See [`set_app_data_finish`].
    ///
    /// [`set_app_data_async`]: FapiContext::set_app_data_async
    /// [`set_app_data_finish`]: FapiContext::set_app_data_finish
    pub fn set_app_data(&mut self, path: &str, app_data: Option<&[u8]>) -> Result<()> {
        self.set_app_data_async(path, app_data)?;
        self.run_to_completion(&mut crate::callbacks::NoCallbacks, |ctx, _| {
            ctx.set_app_data_finish()
        })
    }

    /// Begins replacing the application data of the object at `path`.
    ///
    /// # Errors
    ///
    /// `BadSequence` when a command is in flight.
    pub fn set_app_data_async(&mut self, path: &str, app_data: Option<&[u8]>) -> Result<()> {
        self.begin_command()?;
        let store_path = self.object_store_path(path)?;
        self.keystore.check_writeable(&store_path)?;
        self.keystore.load_async(&store_path)?;
        self.command = Command::SetAppData(PathInfoCmd {
            store_path,
            description: None,
            app_data: app_data.map(<[u8]>::to_vec),
            writing: false,
        });
        Ok(())
    }

    /// Completes [`set_app_data_async`].
    ///
    /// # Errors
    ///
    /// `TryAgain` while store I/O is pending.
    ///
    /// [`set_app_data_async`]: FapiContext::set_app_data_async
    pub fn set_app_data_finish(&mut self) -> Result<()> {
        let Command::SetAppData(_) = &self.command else {
            return Err(Error::BadSequence);
        };
        match self.path_info_write_step(true) {
            Err(Error::TryAgain) => Err(Error::TryAgain),
            Err(err) => Err(self.command_error(err)),
            Ok(done) => {
                if done {
                    self.command = Command::Idle;
                }
                Ok(())
            }
        }
    }

    /// Shared read-modify-store step of the Set* info commands.
    fn path_info_write_step(&mut self, app_data: bool) -> Result<bool> {
        let FapiContext {
            keystore, command, ..
        } = self;
        let cmd = match command {
            Command::SetDescription(cmd) | Command::SetAppData(cmd) => cmd,
            _ => return Err(Error::BadSequence),
        };

        if !cmd.writing {
            let mut object = keystore.load_finish()?;
            if app_data {
                object.set_app_data(cmd.app_data.take())?;
            } else {
                object.set_description(cmd.description.take());
            }
            keystore.store_async(&cmd.store_path, &object)?;
            cmd.writing = true;
        }
        keystore.store_finish()?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // NvWrite / NvRead / NvExtend
    // ------------------------------------------------------------------

    /// One-call form of [`nv_write_async`].
    ///
    /// # Errors
    ///
    /// See [`nv_write_finish`].
    ///
    /// [`nv_write_async`]: FapiContext::nv_write_async
    /// [`nv_write_finish`]: FapiContext::nv_write_finish
    pub fn nv_write(&mut self, path: &str, data: &[u8], cb: &mut dyn Callbacks) -> Result<()> {
        self.nv_write_async(path, data)?;
        self.run_to_completion(cb, FapiContext::nv_write_finish)
    }

    /// Begins writing `data` at offset 0 of the NV index at `path`.
    ///
    /// # Errors
    ///
    /// `BadSequence` when a command is in flight, `BadReference` for
    /// empty data.
    pub fn nv_write_async(&mut self, path: &str, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(Error::BadReference);
        }
        self.begin_command()?;
        let store_path = Self::nv_store_path(path)?;
        let sessions = GetSessions::start(
            SessionFlags::GENEK | SessionFlags::SESSION1,
            SessionAttributes::DECRYPT,
            SessionAttributes::empty(),
            self.keystore.as_mut(),
            self.profiles.default_name(),
        )?;
        self.command = Command::NvWrite(NvWriteCmd {
            state: NvCmdState::WaitForSession,
            store_path,
            offset: 0,
            data: data.to_vec(),
            sessions,
            engine: None,
        });
        Ok(())
    }

    /// Completes [`nv_write_async`].
    ///
    /// # Errors
    ///
    /// `TryAgain` while suspended; NV and authorization errors otherwise.
    ///
    /// [`nv_write_async`]: FapiContext::nv_write_async
    pub fn nv_write_finish(&mut self, cb: &mut dyn Callbacks) -> Result<()> {
        let Command::NvWrite(_) = &self.command else {
            return Err(Error::BadSequence);
        };
        match self.nv_write_step(cb) {
            Err(Error::TryAgain) => Err(Error::TryAgain),
            Err(err) => Err(self.command_error(err)),
            Ok(()) => {
                self.command = Command::Idle;
                Ok(())
            }
        }
    }

    fn nv_write_step(&mut self, cb: &mut dyn Callbacks) -> Result<()> {
        let FapiContext {
            esys,
            keystore,
            profiles,
            pool,
            auth,
            command,
            ..
        } = self;
        let Command::NvWrite(cmd) = command else {
            return Err(Error::BadSequence);
        };
        loop {
            match cmd.state {
                NvCmdState::WaitForSession => {
                    cmd.sessions.finish(
                        esys.as_mut(),
                        keystore.as_mut(),
                        pool,
                        profiles.default_profile(),
                        cb,
                    )?;
                    cmd.engine = Some(NvWrite::start(
                        keystore.as_mut(),
                        &cmd.store_path,
                        cmd.offset,
                        core::mem::take(&mut cmd.data),
                        profiles.default_profile().nv_buffer_max,
                    )?);
                    cmd.state = NvCmdState::Engine;
                }
                NvCmdState::ReadObject => return Err(Error::GeneralFailure),
                NvCmdState::Engine => {
                    let engine = cmd.engine.as_mut().ok_or(Error::GeneralFailure)?;
                    engine.finish(esys.as_mut(), keystore.as_mut(), pool, auth, cb)?;
                    cmd.state = NvCmdState::Cleanup;
                }
                NvCmdState::Cleanup => {
                    pool.cleanup_session(esys.as_mut())?;
                    return Ok(());
                }
            }
        }
    }

    /// One-call form of [`nv_read_async`].
    ///
    /// # Errors
    ///
    /// See [`nv_read_finish`].
    ///
    /// [`nv_read_async`]: FapiContext::nv_read_async
    /// [`nv_read_finish`]: FapiContext::nv_read_finish
    pub fn nv_read(&mut self, path: &str, cb: &mut dyn Callbacks) -> Result<Vec<u8>> {
        self.nv_read_async(path)?;
        self.run_to_completion(cb, FapiContext::nv_read_finish)
    }

    /// Begins reading the full declared size of the NV index at `path`.
    ///
    /// # Errors
    ///
    /// `BadSequence` when a command is in flight.
    pub fn nv_read_async(&mut self, path: &str) -> Result<()> {
        self.begin_command()?;
        let store_path = Self::nv_store_path(path)?;
        let sessions = GetSessions::start(
            SessionFlags::GENEK | SessionFlags::SESSION1,
            SessionAttributes::ENCRYPT,
            SessionAttributes::empty(),
            self.keystore.as_mut(),
            self.profiles.default_name(),
        )?;
        self.command = Command::NvRead(NvReadCmd {
            state: NvCmdState::WaitForSession,
            store_path,
            sessions,
            engine: None,
            result: None,
        });
        Ok(())
    }

    /// Completes [`nv_read_async`], returning the read bytes.
    ///
    /// # Errors
    ///
    /// `TryAgain` while suspended.
    ///
    /// [`nv_read_async`]: FapiContext::nv_read_async
    pub fn nv_read_finish(&mut self, cb: &mut dyn Callbacks) -> Result<Vec<u8>> {
        let Command::NvRead(_) = &self.command else {
            return Err(Error::BadSequence);
        };
        match self.nv_read_step(cb) {
            Err(Error::TryAgain) => Err(Error::TryAgain),
            Err(err) => Err(self.command_error(err)),
            Ok(data) => {
                self.command = Command::Idle;
                Ok(data)
            }
        }
    }

    fn nv_read_step(&mut self, cb: &mut dyn Callbacks) -> Result<Vec<u8>> {
        let FapiContext {
            esys,
            keystore,
            profiles,
            pool,
            auth,
            command,
            ..
        } = self;
        let Command::NvRead(cmd) = command else {
            return Err(Error::BadSequence);
        };
        loop {
            match cmd.state {
                NvCmdState::WaitForSession => {
                    cmd.sessions.finish(
                        esys.as_mut(),
                        keystore.as_mut(),
                        pool,
                        profiles.default_profile(),
                        cb,
                    )?;
                    keystore.load_async(&cmd.store_path)?;
                    cmd.state = NvCmdState::ReadObject;
                }
                NvCmdState::ReadObject => {
                    let mut object = keystore.load_finish()?;
                    let (nv_index, auth_index, auth_object) =
                        bind_nv_object(esys.as_mut(), &mut object)?;
                    let size = object
                        .as_nv()
                        .map(|nv| usize::from(nv.public.data_size))
                        .unwrap_or_default();
                    cmd.engine = Some(NvRead::new(
                        nv_index,
                        auth_index,
                        auth_object,
                        &cmd.store_path,
                        0,
                        size,
                        profiles.default_profile().nv_buffer_max,
                    ));
                    cmd.state = NvCmdState::Engine;
                }
                NvCmdState::Engine => {
                    let engine = cmd.engine.as_mut().ok_or(Error::GeneralFailure)?;
                    cmd.result = Some(engine.finish(esys.as_mut(), pool, auth, cb)?);
                    cmd.state = NvCmdState::Cleanup;
                }
                NvCmdState::Cleanup => {
                    pool.cleanup_session(esys.as_mut())?;
                    return cmd.result.take().ok_or(Error::GeneralFailure);
                }
            }
        }
    }

    /// One-call form of [`nv_extend_async`].
    ///
    /// # Errors
    ///
    /// See [`nv_extend_finish`].
    ///
    /// [`nv_extend_async`]: FapiContext::nv_extend_async
    /// [`nv_extend_finish`]: FapiContext::nv_extend_finish
    pub fn nv_extend(
        &mut self,
        path: &str,
        data: &[u8],
        log_data: Option<serde_json::Value>,
        cb: &mut dyn Callbacks,
    ) -> Result<()> {
        self.nv_extend_async(path, data, log_data)?;
        self.run_to_completion(cb, FapiContext::nv_extend_finish)
    }

    /// Begins extending `data` onto the extendable NV index at `path`,
    /// with an optional JSON event annotation.
    ///
    /// # Errors
    ///
    /// `BadValue` for data of 1024 bytes or more; `BadSequence` when a
    /// command is in flight.
    pub fn nv_extend_async(
        &mut self,
        path: &str,
        data: &[u8],
        log_data: Option<serde_json::Value>,
    ) -> Result<()> {
        if data.is_empty() {
            return Err(Error::BadReference);
        }
        if data.len() >= crate::nv::MAX_EXTEND_SIZE {
            return Err(Error::BadValue);
        }
        self.begin_command()?;
        let store_path = Self::nv_store_path(path)?;
        let sessions = GetSessions::start(
            SessionFlags::GENEK | SessionFlags::SESSION1,
            SessionAttributes::DECRYPT,
            SessionAttributes::empty(),
            self.keystore.as_mut(),
            self.profiles.default_name(),
        )?;
        self.command = Command::NvExtend(NvExtendCmd {
            state: NvCmdState::WaitForSession,
            store_path,
            data: data.to_vec(),
            log_data,
            sessions,
            engine: None,
        });
        Ok(())
    }

    /// Completes [`nv_extend_async`].
    ///
    /// # Errors
    ///
    /// `TryAgain` while suspended; `NvWrongType` for non-extendable
    /// indices.
    ///
    /// [`nv_extend_async`]: FapiContext::nv_extend_async
    pub fn nv_extend_finish(&mut self, cb: &mut dyn Callbacks) -> Result<()> {
        let Command::NvExtend(_) = &self.command else {
            return Err(Error::BadSequence);
        };
        match self.nv_extend_step(cb) {
            Err(Error::TryAgain) => Err(Error::TryAgain),
            Err(err) => Err(self.command_error(err)),
            Ok(()) => {
                self.command = Command::Idle;
                Ok(())
            }
        }
    }

    fn nv_extend_step(&mut self, cb: &mut dyn Callbacks) -> Result<()> {
        let FapiContext {
            esys,
            keystore,
            profiles,
            pool,
            auth,
            command,
            ..
        } = self;
        let Command::NvExtend(cmd) = command else {
            return Err(Error::BadSequence);
        };
        loop {
            match cmd.state {
                NvCmdState::WaitForSession => {
                    cmd.sessions.finish(
                        esys.as_mut(),
                        keystore.as_mut(),
                        pool,
                        profiles.default_profile(),
                        cb,
                    )?;
                    cmd.engine = Some(NvExtend::start(
                        keystore.as_mut(),
                        &cmd.store_path,
                        core::mem::take(&mut cmd.data),
                        cmd.log_data.take(),
                    )?);
                    cmd.state = NvCmdState::Engine;
                }
                NvCmdState::ReadObject => return Err(Error::GeneralFailure),
                NvCmdState::Engine => {
                    let engine = cmd.engine.as_mut().ok_or(Error::GeneralFailure)?;
                    engine.finish(esys.as_mut(), keystore.as_mut(), pool, auth, cb)?;
                    cmd.state = NvCmdState::Cleanup;
                }
                NvCmdState::Cleanup => {
                    pool.cleanup_session(esys.as_mut())?;
                    return Ok(());
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // CreateNv
    // ------------------------------------------------------------------

    /// One-call form of [`create_nv_async`].
    ///
    /// # Errors
    ///
    /// See [`create_nv_finish`].
    ///
    /// [`create_nv_async`]: FapiContext::create_nv_async
    /// [`create_nv_finish`]: FapiContext::create_nv_finish
    pub fn create_nv(
        &mut self,
        path: &str,
        type_flags: &str,
        size: Option<u16>,
        policy_path: Option<&str>,
        auth_value: Option<&str>,
        cb: &mut dyn Callbacks,
    ) -> Result<()> {
        self.create_nv_async(path, type_flags, size, policy_path, auth_value)?;
        self.run_to_completion(cb, FapiContext::create_nv_finish)
    }

    /// Begins defining an NV index at `path` from a template flag list.
    ///
    /// # Errors
    ///
    /// `BadValue` on broken flags, `BadPath` when the path is taken or
    /// not an NV path.
    pub fn create_nv_async(
        &mut self,
        path: &str,
        type_flags: &str,
        size: Option<u16>,
        policy_path: Option<&str>,
        auth_value: Option<&str>,
    ) -> Result<()> {
        self.begin_command()?;
        let store_path = Self::nv_store_path(path)?;
        self.keystore.check_overwrite(&store_path)?;
        let template = set_nv_flags(type_flags, policy_path.is_some())?;

        let (state, policy) = match policy_path {
            Some(policy_path) => {
                self.policy_store
                    .load_async(&path::to_disk_path(policy_path))?;
                (CreateNvState::ReadPolicy, None)
            }
            None => (CreateNvState::WaitForSession, None),
        };
        let sessions = if state == CreateNvState::WaitForSession {
            Some(GetSessions::start(
                SessionFlags::GENEK | SessionFlags::SESSION1,
                SessionAttributes::DECRYPT,
                SessionAttributes::empty(),
                self.keystore.as_mut(),
                self.profiles.default_name(),
            )?)
        } else {
            None
        };

        self.command = Command::CreateNv(CreateNvCmd {
            state,
            store_path,
            nv_path: path.to_string(),
            template,
            size,
            auth_value: auth_value.map(str::to_string),
            policy,
            sessions,
            fetch: None,
            public: None,
        });
        Ok(())
    }

    /// Completes [`create_nv_async`].
    ///
    /// # Errors
    ///
    /// `TryAgain` while suspended.
    ///
    /// [`create_nv_async`]: FapiContext::create_nv_async
    pub fn create_nv_finish(&mut self, cb: &mut dyn Callbacks) -> Result<()> {
        let Command::CreateNv(_) = &self.command else {
            return Err(Error::BadSequence);
        };
        match self.create_nv_step(cb) {
            Err(Error::TryAgain) => Err(Error::TryAgain),
            Err(err) => Err(self.command_error(err)),
            Ok(()) => {
                self.command = Command::Idle;
                Ok(())
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    fn create_nv_step(&mut self, cb: &mut dyn Callbacks) -> Result<()> {
        let FapiContext {
            esys,
            keystore,
            policy_store,
            profiles,
            pool,
            command,
            ..
        } = self;
        let Command::CreateNv(cmd) = command else {
            return Err(Error::BadSequence);
        };
        loop {
            match cmd.state {
                CreateNvState::ReadPolicy => {
                    let mut harness = policy_store.load_finish()?;
                    calculate(&mut harness, profiles.default_profile().name_alg, cb)?;
                    cmd.policy = Some(harness);
                    cmd.sessions = Some(GetSessions::start(
                        SessionFlags::GENEK | SessionFlags::SESSION1,
                        SessionAttributes::DECRYPT,
                        SessionAttributes::empty(),
                        keystore.as_mut(),
                        profiles.default_name(),
                    )?);
                    cmd.state = CreateNvState::WaitForSession;
                }
                CreateNvState::WaitForSession => {
                    let sessions = cmd.sessions.as_mut().ok_or(Error::GeneralFailure)?;
                    sessions.finish(
                        esys.as_mut(),
                        keystore.as_mut(),
                        pool,
                        profiles.default_profile(),
                        cb,
                    )?;
                    if cmd.template.nv_index == 0 {
                        let base = path::nv_start_index(&cmd.nv_path)?;
                        cmd.fetch = Some(CapabilityFetch::new(
                            Capability::Handles,
                            base,
                            crate::capability::MAX_CAP_HANDLES,
                        ));
                        cmd.state = CreateNvState::FindIndex;
                    } else {
                        cmd.state = CreateNvState::DefineSpace;
                    }
                }
                CreateNvState::FindIndex => {
                    let fetch = cmd.fetch.as_mut().ok_or(Error::GeneralFailure)?;
                    let data = fetch.finish(esys.as_mut())?;
                    let CapabilityData::Handles(used) = data else {
                        return Err(Error::GeneralFailure);
                    };
                    let base = path::nv_start_index(&cmd.nv_path)?;
                    let mut candidate = base + 1;
                    while used.contains(&candidate) {
                        candidate += 1;
                    }
                    if candidate > base + 0xFFFF {
                        return Err(Error::NvTooSmall);
                    }
                    cmd.template.nv_index = candidate;
                    cmd.fetch = None;
                    cmd.state = CreateNvState::DefineSpace;
                }
                CreateNvState::DefineSpace => {
                    let profile = profiles.default_profile();
                    let auth_policy = match &cmd.policy {
                        Some(harness) => harness.digest(profile.name_alg)?.to_vec(),
                        None => Vec::new(),
                    };
                    let public = NvPublicArea {
                        nv_index: cmd.template.nv_index,
                        name_alg: profile.name_alg,
                        attributes: cmd.template.attributes,
                        auth_policy,
                        data_size: nv_template_size(
                            cmd.template.attributes,
                            profile.name_alg,
                            cmd.size,
                        ),
                    };
                    let auth = cmd.auth_value.clone().unwrap_or_default();
                    esys.nv_define_space_async(
                        Hierarchy::Owner.esys_handle(),
                        pool.session1,
                        auth.as_bytes(),
                        &public,
                    )?;
                    cmd.public = Some(public);
                    cmd.state = CreateNvState::WriteObject;
                    return Err(Error::TryAgain);
                }
                CreateNvState::WriteObject => {
                    // The define settles first; the taken public marks
                    // that the record write has already started.
                    if cmd.public.is_some() {
                        let nv_index = esys.nv_define_space_finish()?;
                        let serialization = esys.tr_serialize(nv_index)?;
                        let public = cmd.public.take().ok_or(Error::GeneralFailure)?;
                        let object = Object::nv(NvObject {
                            public,
                            policy: cmd.policy.take(),
                            description: None,
                            app_data: None,
                            event_log: None,
                            serialization: Some(serialization),
                            with_auth: cmd.auth_value.as_deref().is_some_and(|a| !a.is_empty()),
                        });
                        keystore.store_async(&cmd.store_path, &object)?;
                    }
                    keystore.store_finish()?;
                    cmd.state = CreateNvState::Cleanup;
                }
                CreateNvState::Cleanup => {
                    pool.cleanup_session(esys.as_mut())?;
                    return Ok(());
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // WriteAuthorizeNv
    // ------------------------------------------------------------------

    /// One-call form of [`write_authorize_nv_async`].
    ///
    /// # Errors
    ///
    /// See [`write_authorize_nv_finish`].
    ///
    /// [`write_authorize_nv_async`]: FapiContext::write_authorize_nv_async
    /// [`write_authorize_nv_finish`]: FapiContext::write_authorize_nv_finish
    pub fn write_authorize_nv(
        &mut self,
        nv_path: &str,
        policy_path: &str,
        cb: &mut dyn Callbacks,
    ) -> Result<()> {
        self.write_authorize_nv_async(nv_path, policy_path)?;
        self.run_to_completion(cb, FapiContext::write_authorize_nv_finish)
    }

    /// Begins writing the digest of the policy at `policy_path` into the
    /// NV index at `nv_path`, for `PolicyAuthorizeNV` chains.
    ///
    /// # Errors
    ///
    /// `BadSequence` when a command is in flight.
    pub fn write_authorize_nv_async(&mut self, nv_path: &str, policy_path: &str) -> Result<()> {
        self.begin_command()?;
        let store_path = Self::nv_store_path(nv_path)?;
        let policy_disk_path = path::to_disk_path(policy_path);
        self.keystore.check_writeable(&store_path)?;
        self.keystore.load_async(&store_path)?;
        self.command = Command::WriteAuthorizeNv(WriteAuthNvCmd {
            state: WriteAuthNvState::ReadNv,
            store_path,
            policy_path: policy_path.to_string(),
            policy_disk_path,
            nv_object: None,
            policy: None,
            sessions: None,
            engine: None,
        });
        Ok(())
    }

    /// Completes [`write_authorize_nv_async`].
    ///
    /// # Errors
    ///
    /// `TryAgain` while suspended; `PolicyPathNotFound` for unknown
    /// policies.
    ///
    /// [`write_authorize_nv_async`]: FapiContext::write_authorize_nv_async
    pub fn write_authorize_nv_finish(&mut self, cb: &mut dyn Callbacks) -> Result<()> {
        let Command::WriteAuthorizeNv(_) = &self.command else {
            return Err(Error::BadSequence);
        };
        match self.write_authorize_nv_step(cb) {
            Err(Error::TryAgain) => Err(Error::TryAgain),
            Err(err) => Err(self.command_error(err)),
            Ok(()) => {
                self.command = Command::Idle;
                Ok(())
            }
        }
    }

    fn write_authorize_nv_step(&mut self, cb: &mut dyn Callbacks) -> Result<()> {
        let FapiContext {
            esys,
            keystore,
            policy_store,
            profiles,
            pool,
            auth,
            command,
            ..
        } = self;
        let Command::WriteAuthorizeNv(cmd) = command else {
            return Err(Error::BadSequence);
        };
        loop {
            match cmd.state {
                WriteAuthNvState::ReadNv => {
                    let object = keystore.load_finish()?;
                    if object.as_nv().is_none() {
                        log::error!("{} is no NV object", cmd.store_path);
                        return Err(Error::BadPath);
                    }
                    cmd.nv_object = Some(object);
                    policy_store.load_async(&cmd.policy_disk_path)?;
                    cmd.state = WriteAuthNvState::ReadPolicy;
                }
                WriteAuthNvState::ReadPolicy => {
                    let mut harness = policy_store.load_finish()?;
                    let name_alg = cmd
                        .nv_object
                        .as_ref()
                        .ok_or(Error::GeneralFailure)?
                        .name_alg();
                    calculate(&mut harness, name_alg, cb)?;
                    cmd.policy = Some(harness);
                    cmd.sessions = Some(GetSessions::start(
                        SessionFlags::GENEK | SessionFlags::SESSION1,
                        SessionAttributes::DECRYPT,
                        SessionAttributes::empty(),
                        keystore.as_mut(),
                        profiles.default_name(),
                    )?);
                    cmd.state = WriteAuthNvState::WaitForSession;
                }
                WriteAuthNvState::WaitForSession => {
                    let sessions = cmd.sessions.as_mut().ok_or(Error::GeneralFailure)?;
                    sessions.finish(
                        esys.as_mut(),
                        keystore.as_mut(),
                        pool,
                        profiles.default_profile(),
                        cb,
                    )?;

                    // NV payload: hash algorithm identifier followed by
                    // the calculated digest.
                    let nv_object = cmd.nv_object.as_ref().ok_or(Error::GeneralFailure)?;
                    let name_alg = nv_object.name_alg();
                    let harness = cmd.policy.as_ref().ok_or(Error::GeneralFailure)?;
                    let digest = harness.digest(name_alg)?;
                    let mut buffer = Vec::with_capacity(2 + digest.len());
                    put_u16(&mut buffer, name_alg as u16);
                    buffer.extend(digest);

                    cmd.engine = Some(NvWrite::start(
                        keystore.as_mut(),
                        &cmd.store_path,
                        0,
                        buffer,
                        profiles.default_profile().nv_buffer_max,
                    )?);
                    cmd.state = WriteAuthNvState::WriteNvRam;
                }
                WriteAuthNvState::WriteNvRam => {
                    let engine = cmd.engine.as_mut().ok_or(Error::GeneralFailure)?;
                    engine.finish(esys.as_mut(), keystore.as_mut(), pool, auth, cb)?;
                    let harness = cmd.policy.as_ref().ok_or(Error::GeneralFailure)?;
                    policy_store.store_async(&cmd.policy_disk_path, harness)?;
                    log::debug!("authorized policy {} written", cmd.policy_path);
                    cmd.state = WriteAuthNvState::WritePolicy;
                }
                WriteAuthNvState::WritePolicy => {
                    policy_store.store_finish()?;
                    cmd.state = WriteAuthNvState::Cleanup;
                }
                WriteAuthNvState::Cleanup => {
                    pool.cleanup_session(esys.as_mut())?;
                    return Ok(());
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // CreateKey / Sign / Encrypt / Decrypt
    // ------------------------------------------------------------------

    /// One-call form of [`create_key_async`].
    ///
    /// # Errors
    ///
    /// See [`create_key_finish`].
    ///
    /// [`create_key_async`]: FapiContext::create_key_async
    /// [`create_key_finish`]: FapiContext::create_key_finish
    pub fn create_key(
        &mut self,
        path: &str,
        type_flags: &str,
        policy_path: Option<&str>,
        auth_value: Option<&str>,
        cb: &mut dyn Callbacks,
    ) -> Result<()> {
        self.create_key_async(path, type_flags, policy_path, auth_value)?;
        self.run_to_completion(cb, FapiContext::create_key_finish)
    }

    /// Begins creating a key under the parent named by `path`.
    ///
    /// # Errors
    ///
    /// `BadValue` on broken flags or an over-long auth value;
    /// `BadSequence` when a command is in flight.
    pub fn create_key_async(
        &mut self,
        path: &str,
        type_flags: &str,
        policy_path: Option<&str>,
        auth_value: Option<&str>,
    ) -> Result<()> {
        if auth_value.is_some_and(|a| a.len() > MAX_DIGEST_SIZE) {
            log::error!("password too long");
            return Err(Error::BadValue);
        }
        self.begin_command()?;
        let path_list = path::explicit_key_path(self.profiles.default_name(), path)?;
        let store_path = path::path_string(&path_list);
        self.keystore.check_overwrite(&store_path)?;
        let template = set_key_flags(type_flags, policy_path.is_some())?;

        let sensitive = Sensitive {
            user_auth: auth_value.unwrap_or_default().as_bytes().to_vec(),
            data: Vec::new(),
        };

        let (state, sessions) = match policy_path {
            Some(policy_path) => {
                self.policy_store
                    .load_async(&path::to_disk_path(policy_path))?;
                (CreateKeyState::ReadPolicy, None)
            }
            None => (
                CreateKeyState::WaitForSession,
                Some(GetSessions::start(
                    SessionFlags::GENEK | SessionFlags::SESSION1,
                    SessionAttributes::DECRYPT,
                    SessionAttributes::empty(),
                    self.keystore.as_mut(),
                    self.profiles.default_name(),
                )?),
            ),
        };

        self.command = Command::CreateKey(CreateKeyCmd {
            state,
            path_list,
            store_path,
            template,
            public: None,
            sensitive,
            policy: None,
            sessions,
            loader: None,
            parent: None,
            parent_handle: EsysTr::NONE,
            with_auth: auth_value.is_some_and(|a| !a.is_empty()),
        });
        Ok(())
    }

    /// Completes [`create_key_async`].
    ///
    /// # Errors
    ///
    /// `TryAgain` while suspended.
    ///
    /// [`create_key_async`]: FapiContext::create_key_async
    pub fn create_key_finish(&mut self, cb: &mut dyn Callbacks) -> Result<()> {
        let Command::CreateKey(_) = &self.command else {
            return Err(Error::BadSequence);
        };
        match self.create_key_step(cb) {
            Err(Error::TryAgain) => Err(Error::TryAgain),
            Err(err) => Err(self.command_error(err)),
            Ok(()) => {
                self.command = Command::Idle;
                Ok(())
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    fn create_key_step(&mut self, cb: &mut dyn Callbacks) -> Result<()> {
        let FapiContext {
            esys,
            keystore,
            policy_store,
            profiles,
            pool,
            auth,
            command,
            ..
        } = self;
        let Command::CreateKey(cmd) = command else {
            return Err(Error::BadSequence);
        };
        loop {
            match cmd.state {
                CreateKeyState::ReadPolicy => {
                    let mut harness = policy_store.load_finish()?;
                    calculate(&mut harness, profiles.default_profile().name_alg, cb)?;
                    cmd.policy = Some(harness);
                    cmd.sessions = Some(GetSessions::start(
                        SessionFlags::GENEK | SessionFlags::SESSION1,
                        SessionAttributes::DECRYPT,
                        SessionAttributes::empty(),
                        keystore.as_mut(),
                        profiles.default_name(),
                    )?);
                    cmd.state = CreateKeyState::WaitForSession;
                }
                CreateKeyState::WaitForSession => {
                    let sessions = cmd.sessions.as_mut().ok_or(Error::GeneralFailure)?;
                    sessions.finish(
                        esys.as_mut(),
                        keystore.as_mut(),
                        pool,
                        profiles.default_profile(),
                        cb,
                    )?;

                    // The profile governing the key is the path's first
                    // segment.
                    let profile = profiles.get(&cmd.path_list[0])?;
                    let mut public = merge_profile_into_template(profile, &cmd.template);
                    if !cmd.sensitive.data.is_empty() {
                        // Sealed data becomes a keyed-hash object.
                        public.params = PublicParams::KeyedHash {
                            scheme: Algorithm::Null,
                        };
                    }
                    if let Some(harness) = &cmd.policy {
                        public.auth_policy = harness.digest(profile.name_alg)?.to_vec();
                    }
                    cmd.public = Some(public);

                    let parent_list = cmd.path_list[..cmd.path_list.len() - 1].to_vec();
                    cmd.loader = Some(LoadKey::start(parent_list, false));
                    cmd.state = CreateKeyState::LoadParent;
                }
                CreateKeyState::LoadParent => {
                    let loader = cmd.loader.as_mut().ok_or(Error::GeneralFailure)?;
                    let loaded = loader.finish(esys.as_mut(), keystore.as_mut(), pool, auth, cb)?;
                    cmd.parent_handle = loaded.handle;
                    cmd.parent = Some(loaded.object);
                    cmd.state = CreateKeyState::Authorize;
                }
                CreateKeyState::Authorize => {
                    let parent = cmd.parent.as_mut().ok_or(Error::GeneralFailure)?;
                    let parent_path =
                        path::path_string_n(&cmd.path_list, cmd.path_list.len() - 1);
                    let session =
                        auth.authorize_object(esys.as_mut(), pool, parent, &parent_path, cb)?;
                    let public = cmd.public.as_ref().ok_or(Error::GeneralFailure)?;
                    esys.create_async(cmd.parent_handle, session, &cmd.sensitive, public)?;
                    cmd.state = CreateKeyState::WaitForCreate;
                    return Err(Error::TryAgain);
                }
                CreateKeyState::WaitForCreate => {
                    let created = esys.create_finish()?;
                    let profile = profiles.get(&cmd.path_list[0])?;
                    let key = KeyObject {
                        public: created.public,
                        private: created.private,
                        serialization: None,
                        policy: cmd.policy.take(),
                        signing_scheme: profile.signing_scheme(),
                        description: None,
                        certificate: None,
                        app_data: None,
                        with_auth: cmd.with_auth,
                        persistent_handle: if cmd.template.persistent {
                            cmd.template.persistent_handle
                        } else {
                            0
                        },
                    };
                    keystore.store_async(&cmd.store_path, &Object::key(key))?;
                    cmd.state = CreateKeyState::WriteKey;
                }
                CreateKeyState::WriteKey => {
                    keystore.store_finish()?;
                    cmd.state = CreateKeyState::FlushParent;
                }
                CreateKeyState::FlushParent => {
                    // The parent was pinned during creation; drop it now.
                    if let Some(parent) = &cmd.parent {
                        let transient = parent
                            .as_key()
                            .is_some_and(|key| key.persistent_handle == 0);
                        if transient && parent.handle.is_some() {
                            esys.flush_context(parent.handle)?;
                        }
                    }
                    cmd.parent = None;
                    cmd.state = CreateKeyState::Cleanup;
                }
                CreateKeyState::Cleanup => {
                    pool.cleanup_session(esys.as_mut())?;
                    return Ok(());
                }
            }
        }
    }

    /// One-call form of [`sign_async`].
    ///
    /// # Errors
    ///
    /// See [`sign_finish`].
    ///
    /// [`sign_async`]: FapiContext::sign_async
    /// [`sign_finish`]: FapiContext::sign_finish
    pub fn sign(&mut self, path: &str, digest: &[u8], cb: &mut dyn Callbacks) -> Result<Vec<u8>> {
        self.sign_async(path, digest)?;
        self.run_to_completion(cb, FapiContext::sign_finish)
    }

    /// Begins signing `digest` with the key at `path`.
    ///
    /// # Errors
    ///
    /// `BadValue` for an empty digest; `BadSequence` when a command is in
    /// flight.
    pub fn sign_async(&mut self, path: &str, digest: &[u8]) -> Result<()> {
        if digest.is_empty() {
            return Err(Error::BadValue);
        }
        self.begin_command()?;
        let path_list = path::explicit_key_path(self.profiles.default_name(), path)?;
        let sessions = GetSessions::start(
            SessionFlags::GENEK | SessionFlags::SESSION1,
            SessionAttributes::DECRYPT,
            SessionAttributes::empty(),
            self.keystore.as_mut(),
            self.profiles.default_name(),
        )?;
        self.command = Command::Sign(SignCmd {
            state: SignState::WaitForSession,
            path_list,
            digest: digest.to_vec(),
            sessions,
            loader: None,
            key: None,
            signature: None,
        });
        Ok(())
    }

    /// Completes [`sign_async`], returning the TPM signature blob.
    ///
    /// # Errors
    ///
    /// `TryAgain` while suspended.
    ///
    /// [`sign_async`]: FapiContext::sign_async
    pub fn sign_finish(&mut self, cb: &mut dyn Callbacks) -> Result<Vec<u8>> {
        let Command::Sign(_) = &self.command else {
            return Err(Error::BadSequence);
        };
        match self.sign_step(cb) {
            Err(Error::TryAgain) => Err(Error::TryAgain),
            Err(err) => Err(self.command_error(err)),
            Ok(signature) => {
                self.command = Command::Idle;
                Ok(signature)
            }
        }
    }

    fn sign_step(&mut self, cb: &mut dyn Callbacks) -> Result<Vec<u8>> {
        let FapiContext {
            esys,
            keystore,
            profiles,
            pool,
            auth,
            command,
            ..
        } = self;
        let Command::Sign(cmd) = command else {
            return Err(Error::BadSequence);
        };
        loop {
            match cmd.state {
                SignState::WaitForSession => {
                    cmd.sessions.finish(
                        esys.as_mut(),
                        keystore.as_mut(),
                        pool,
                        profiles.default_profile(),
                        cb,
                    )?;
                    cmd.loader = Some(LoadKey::start(cmd.path_list.clone(), true));
                    cmd.state = SignState::LoadKey;
                }
                SignState::LoadKey => {
                    let loader = cmd.loader.as_mut().ok_or(Error::GeneralFailure)?;
                    let loaded = loader.finish(esys.as_mut(), keystore.as_mut(), pool, auth, cb)?;
                    cmd.key = Some(loaded.object);
                    cmd.state = SignState::Authorize;
                }
                SignState::Authorize => {
                    let key = cmd.key.as_mut().ok_or(Error::GeneralFailure)?;
                    let key_path = path::path_string(&cmd.path_list);
                    let session = auth.authorize_object(esys.as_mut(), pool, key, &key_path, cb)?;

                    let profile = profiles.get(&cmd.path_list[0])?;
                    let mut scheme = key
                        .as_key()
                        .map(|k| k.signing_scheme)
                        .unwrap_or_default();
                    if scheme.scheme == Algorithm::Null {
                        scheme = profile.signing_scheme();
                    }
                    if cmd.digest.len() != scheme.hash_alg.digest_size() {
                        log::error!("digest size does not match the signing scheme");
                        return Err(Error::BadValue);
                    }
                    esys.sign_async(key.handle, session, &cmd.digest, scheme)?;
                    cmd.state = SignState::WaitForSign;
                    return Err(Error::TryAgain);
                }
                SignState::WaitForSign => {
                    cmd.signature = Some(esys.sign_finish()?);
                    cmd.state = SignState::FlushKey;
                }
                SignState::FlushKey => {
                    if let Some(key) = &cmd.key {
                        let transient = key
                            .as_key()
                            .is_some_and(|k| k.persistent_handle == 0);
                        if transient && key.handle.is_some() {
                            esys.flush_context(key.handle)?;
                        }
                    }
                    cmd.key = None;
                    cmd.state = SignState::Cleanup;
                }
                SignState::Cleanup => {
                    pool.cleanup_session(esys.as_mut())?;
                    return cmd.signature.take().ok_or(Error::GeneralFailure);
                }
            }
        }
    }

    /// One-call symmetric encryption with the key at `path`.
    ///
    /// # Errors
    ///
    /// See [`encrypt_finish`].
    ///
    /// [`encrypt_finish`]: FapiContext::encrypt_finish
    pub fn encrypt(&mut self, path: &str, data: &[u8], cb: &mut dyn Callbacks) -> Result<Vec<u8>> {
        self.encrypt_async(path, data)?;
        self.run_to_completion(cb, FapiContext::encrypt_finish)
    }

    /// Begins encrypting `data` with the symmetric key at `path`.
    ///
    /// # Errors
    ///
    /// `BadSequence` when a command is in flight.
    pub fn encrypt_async(&mut self, path: &str, data: &[u8]) -> Result<()> {
        self.enc_dec_async(path, data, false)
    }

    /// Completes [`encrypt_async`].
    ///
    /// # Errors
    ///
    /// `TryAgain` while suspended.
    ///
    /// [`encrypt_async`]: FapiContext::encrypt_async
    pub fn encrypt_finish(&mut self, cb: &mut dyn Callbacks) -> Result<Vec<u8>> {
        self.enc_dec_finish(cb)
    }

    /// One-call symmetric decryption with the key at `path`.
    ///
    /// # Errors
    ///
    /// See [`decrypt_finish`].
    ///
    /// [`decrypt_finish`]: FapiContext::decrypt_finish
    pub fn decrypt(&mut self, path: &str, data: &[u8], cb: &mut dyn Callbacks) -> Result<Vec<u8>> {
        self.decrypt_async(path, data)?;
        self.run_to_completion(cb, FapiContext::decrypt_finish)
    }

    /// Begins decrypting `data` with the symmetric key at `path`.
    ///
    /// # Errors
    ///
    /// `BadSequence` when a command is in flight.
    pub fn decrypt_async(&mut self, path: &str, data: &[u8]) -> Result<()> {
        self.enc_dec_async(path, data, true)
    }

    /// Completes [`decrypt_async`].
    ///
    /// # Errors
    ///
    /// `TryAgain` while suspended.
    ///
    /// [`decrypt_async`]: FapiContext::decrypt_async
    pub fn decrypt_finish(&mut self, cb: &mut dyn Callbacks) -> Result<Vec<u8>> {
        self.enc_dec_finish(cb)
    }

    fn enc_dec_async(&mut self, path: &str, data: &[u8], decrypt: bool) -> Result<()> {
        if data.is_empty() {
            return Err(Error::BadReference);
        }
        self.begin_command()?;
        let path_list = path::explicit_key_path(self.profiles.default_name(), path)?;
        let sessions = GetSessions::start(
            SessionFlags::GENEK | SessionFlags::SESSION1,
            SessionAttributes::DECRYPT,
            SessionAttributes::empty(),
            self.keystore.as_mut(),
            self.profiles.default_name(),
        )?;
        self.command = Command::EncryptDecrypt(EncDecCmd {
            state: EncDecState::WaitForSession,
            decrypt,
            path_list,
            data: data.to_vec(),
            data_idx: 0,
            iv: Vec::new(),
            out: Vec::new(),
            sessions,
            loader: None,
            key: None,
        });
        Ok(())
    }

    fn enc_dec_finish(&mut self, cb: &mut dyn Callbacks) -> Result<Vec<u8>> {
        let Command::EncryptDecrypt(_) = &self.command else {
            return Err(Error::BadSequence);
        };
        match self.enc_dec_step(cb) {
            Err(Error::TryAgain) => Err(Error::TryAgain),
            Err(err) => Err(self.command_error(err)),
            Ok(data) => {
                self.command = Command::Idle;
                Ok(data)
            }
        }
    }

    fn enc_dec_step(&mut self, cb: &mut dyn Callbacks) -> Result<Vec<u8>> {
        let FapiContext {
            esys,
            keystore,
            profiles,
            pool,
            auth,
            command,
            ..
        } = self;
        let Command::EncryptDecrypt(cmd) = command else {
            return Err(Error::BadSequence);
        };
        loop {
            match cmd.state {
                EncDecState::WaitForSession => {
                    cmd.sessions.finish(
                        esys.as_mut(),
                        keystore.as_mut(),
                        pool,
                        profiles.default_profile(),
                        cb,
                    )?;
                    cmd.loader = Some(LoadKey::start(cmd.path_list.clone(), true));
                    cmd.state = EncDecState::LoadKey;
                }
                EncDecState::LoadKey => {
                    let loader = cmd.loader.as_mut().ok_or(Error::GeneralFailure)?;
                    let loaded = loader.finish(esys.as_mut(), keystore.as_mut(), pool, auth, cb)?;
                    cmd.key = Some(loaded.object);
                    cmd.state = EncDecState::Authorize;
                }
                EncDecState::Authorize => {
                    let key = cmd.key.as_mut().ok_or(Error::GeneralFailure)?;
                    let key_path = path::path_string(&cmd.path_list);
                    let session = auth.authorize_object(esys.as_mut(), pool, key, &key_path, cb)?;

                    let chunk = (cmd.data.len() - cmd.data_idx).min(ENC_DEC_CHUNK);
                    let profile = profiles.default_profile();
                    esys.encrypt_decrypt_async(
                        key.handle,
                        session,
                        cmd.decrypt,
                        profile.sym_mode,
                        &cmd.iv,
                        &cmd.data[cmd.data_idx..cmd.data_idx + chunk],
                    )?;
                    cmd.state = EncDecState::WaitForData;
                    return Err(Error::TryAgain);
                }
                EncDecState::WaitForData => {
                    let (out, iv) = esys.encrypt_decrypt_finish()?;
                    cmd.data_idx += out.len().min(cmd.data.len() - cmd.data_idx);
                    cmd.out.extend(out);
                    cmd.iv = iv;

                    if cmd.data_idx < cmd.data.len() {
                        let key = cmd.key.as_ref().ok_or(Error::GeneralFailure)?;
                        let chunk = (cmd.data.len() - cmd.data_idx).min(ENC_DEC_CHUNK);
                        let profile = profiles.default_profile();
                        esys.encrypt_decrypt_async(
                            key.handle,
                            pool.session1,
                            cmd.decrypt,
                            profile.sym_mode,
                            &cmd.iv,
                            &cmd.data[cmd.data_idx..cmd.data_idx + chunk],
                        )?;
                        return Err(Error::TryAgain);
                    }
                    cmd.state = EncDecState::FlushKey;
                }
                EncDecState::FlushKey => {
                    if let Some(key) = &cmd.key {
                        let transient = key
                            .as_key()
                            .is_some_and(|k| k.persistent_handle == 0);
                        if transient && key.handle.is_some() {
                            esys.flush_context(key.handle)?;
                        }
                    }
                    cmd.key = None;
                    cmd.state = EncDecState::Cleanup;
                }
                EncDecState::Cleanup => {
                    pool.cleanup_session(esys.as_mut())?;
                    return Ok(core::mem::take(&mut cmd.out));
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // GetRandom / GetInfo / GetCertificates / Provision
    // ------------------------------------------------------------------

    /// One-call form of [`get_random_async`].
    ///
    /// # Errors
    ///
    /// See [`get_random_finish`].
    ///
    /// [`get_random_async`]: FapiContext::get_random_async
    /// [`get_random_finish`]: FapiContext::get_random_finish
    pub fn get_random(&mut self, num_bytes: usize, cb: &mut dyn Callbacks) -> Result<Vec<u8>> {
        self.get_random_async(num_bytes)?;
        self.run_to_completion(cb, FapiContext::get_random_finish)
    }

    /// Begins fetching `num_bytes` of TPM randomness.
    ///
    /// # Errors
    ///
    /// `BadValue` for zero bytes; `BadSequence` when a command is in
    /// flight.
    pub fn get_random_async(&mut self, num_bytes: usize) -> Result<()> {
        if num_bytes == 0 {
            return Err(Error::BadValue);
        }
        self.begin_command()?;
        let sessions = GetSessions::start(
            SessionFlags::GENEK | SessionFlags::SESSION1,
            SessionAttributes::ENCRYPT,
            SessionAttributes::empty(),
            self.keystore.as_mut(),
            self.profiles.default_name(),
        )?;
        self.command = Command::GetRandom(GetRandomCmd {
            state: RandomState::WaitForSession,
            num_bytes,
            data: Vec::new(),
            sessions,
        });
        Ok(())
    }

    /// Completes [`get_random_async`].
    ///
    /// # Errors
    ///
    /// `TryAgain` while suspended.
    ///
    /// [`get_random_async`]: FapiContext::get_random_async
    pub fn get_random_finish(&mut self, cb: &mut dyn Callbacks) -> Result<Vec<u8>> {
        let Command::GetRandom(_) = &self.command else {
            return Err(Error::BadSequence);
        };
        match self.get_random_step(cb) {
            Err(Error::TryAgain) => Err(Error::TryAgain),
            Err(err) => Err(self.command_error(err)),
            Ok(data) => {
                self.command = Command::Idle;
                Ok(data)
            }
        }
    }

    fn get_random_step(&mut self, cb: &mut dyn Callbacks) -> Result<Vec<u8>> {
        let FapiContext {
            esys,
            keystore,
            profiles,
            pool,
            command,
            ..
        } = self;
        let Command::GetRandom(cmd) = command else {
            return Err(Error::BadSequence);
        };
        loop {
            match cmd.state {
                RandomState::WaitForSession => {
                    cmd.sessions.finish(
                        esys.as_mut(),
                        keystore.as_mut(),
                        pool,
                        profiles.default_profile(),
                        cb,
                    )?;
                    let chunk = cmd.num_bytes.min(RANDOM_CHUNK);
                    esys.get_random_async(
                        pool.session1,
                        u16::try_from(chunk).map_err(|_| Error::BadValue)?,
                    )?;
                    cmd.state = RandomState::Sent;
                    return Err(Error::TryAgain);
                }
                RandomState::Sent => {
                    let bytes = esys.get_random_finish()?;
                    if bytes.len() > cmd.num_bytes {
                        log::error!("TPM returned too many bytes");
                        return Err(Error::BadValue);
                    }
                    cmd.num_bytes -= bytes.len();
                    cmd.data.extend(bytes);
                    if cmd.num_bytes > 0 {
                        let chunk = cmd.num_bytes.min(RANDOM_CHUNK);
                        esys.get_random_async(
                            pool.session1,
                            u16::try_from(chunk).map_err(|_| Error::BadValue)?,
                        )?;
                        return Err(Error::TryAgain);
                    }
                    cmd.state = RandomState::Cleanup;
                }
                RandomState::Cleanup => {
                    pool.cleanup_session(esys.as_mut())?;
                    return Ok(core::mem::take(&mut cmd.data));
                }
            }
        }
    }

    /// One-call form of [`get_info_async`].
    ///
    /// # Errors
    ///
    /// See [`get_info_finish`].
    ///
    /// [`get_info_async`]: FapiContext::get_info_async
    /// [`get_info_finish`]: FapiContext::get_info_finish
    pub fn get_info(
        &mut self,
        capability: Capability,
        property: u32,
        count: usize,
    ) -> Result<CapabilityData> {
        self.get_info_async(capability, property, count)?;
        self.run_to_completion(&mut crate::callbacks::NoCallbacks, |ctx, _| {
            ctx.get_info_finish()
        })
    }

    /// Begins a paginated capability query.
    ///
    /// # Errors
    ///
    /// `BadSequence` when a command is in flight.
    pub fn get_info_async(
        &mut self,
        capability: Capability,
        property: u32,
        count: usize,
    ) -> Result<()> {
        self.begin_command()?;
        self.command = Command::GetInfo(GetInfoCmd {
            fetch: CapabilityFetch::new(capability, property, count),
        });
        Ok(())
    }

    /// Completes [`get_info_async`], returning the accumulated data.
    ///
    /// # Errors
    ///
    /// `TryAgain` while a page is pending.
    ///
    /// [`get_info_async`]: FapiContext::get_info_async
    pub fn get_info_finish(&mut self) -> Result<CapabilityData> {
        let FapiContext { esys, command, .. } = self;
        let Command::GetInfo(cmd) = command else {
            return Err(Error::BadSequence);
        };
        match cmd.fetch.finish(esys.as_mut()) {
            Err(Error::TryAgain) => Err(Error::TryAgain),
            Err(err) => Err(self.command_error(err)),
            Ok(data) => {
                self.command = Command::Idle;
                Ok(data)
            }
        }
    }

    /// One-call form of [`get_certificates_async`].
    ///
    /// # Errors
    ///
    /// See [`get_certificates_finish`].
    ///
    /// [`get_certificates_async`]: FapiContext::get_certificates_async
    /// [`get_certificates_finish`]: FapiContext::get_certificates_finish
    pub fn get_certificates(&mut self, cb: &mut dyn Callbacks) -> Result<Vec<Vec<u8>>> {
        self.get_certificates_async()?;
        self.run_to_completion(cb, FapiContext::get_certificates_finish)
    }

    /// Begins scanning the TCG NV range for endorsement certificates.
    ///
    /// # Errors
    ///
    /// `BadSequence` when a command is in flight.
    pub fn get_certificates_async(&mut self) -> Result<()> {
        self.begin_command()?;
        self.command = Command::GetCertificates(GetCertCmd {
            scan: CertScan::new(
                MIN_EK_CERT_HANDLE,
                MAX_EK_CERT_HANDLE,
                self.profiles.default_profile().nv_buffer_max,
            ),
        });
        Ok(())
    }

    /// Completes [`get_certificates_async`].
    ///
    /// # Errors
    ///
    /// `TryAgain` while suspended.
    ///
    /// [`get_certificates_async`]: FapiContext::get_certificates_async
    pub fn get_certificates_finish(&mut self, cb: &mut dyn Callbacks) -> Result<Vec<Vec<u8>>> {
        let FapiContext {
            esys,
            pool,
            auth,
            command,
            ..
        } = self;
        let Command::GetCertificates(cmd) = command else {
            return Err(Error::BadSequence);
        };
        match cmd.scan.finish(esys.as_mut(), pool, auth, cb) {
            Err(Error::TryAgain) => Err(Error::TryAgain),
            Err(err) => Err(self.command_error(err)),
            Ok(certs) => {
                self.command = Command::Idle;
                Ok(certs)
            }
        }
    }

    /// One-call form of [`provision_async`].
    ///
    /// # Errors
    ///
    /// See [`provision_finish`].
    ///
    /// [`provision_async`]: FapiContext::provision_async
    /// [`provision_finish`]: FapiContext::provision_finish
    pub fn provision(&mut self, cb: &mut dyn Callbacks) -> Result<()> {
        self.provision_async()?;
        self.run_to_completion(cb, FapiContext::provision_finish)
    }

    /// Begins provisioning: the SRK and EK primaries are created per the
    /// default profile and their records stored.
    ///
    /// # Errors
    ///
    /// `BadSequence` when a command is in flight.
    pub fn provision_async(&mut self) -> Result<()> {
        self.begin_command()?;
        let profile = self.profiles.default_profile();
        let srk_public = srk_template(profile)?;
        let ek_public = ek_template(profile)?;
        self.command = Command::Provision(ProvisionCmd {
            state: ProvisionState::CreateSrk,
            srk_public,
            ek_public,
            srk_handle: EsysTr::NONE,
            ek_handle: EsysTr::NONE,
        });
        Ok(())
    }

    /// Completes [`provision_async`].
    ///
    /// # Errors
    ///
    /// `TryAgain` while suspended.
    ///
    /// [`provision_async`]: FapiContext::provision_async
    pub fn provision_finish(&mut self, cb: &mut dyn Callbacks) -> Result<()> {
        let Command::Provision(_) = &self.command else {
            return Err(Error::BadSequence);
        };
        match self.provision_step(cb) {
            Err(Error::TryAgain) => Err(Error::TryAgain),
            Err(err) => Err(self.command_error(err)),
            Ok(()) => {
                self.command = Command::Idle;
                Ok(())
            }
        }
    }

    fn provision_step(&mut self, _cb: &mut dyn Callbacks) -> Result<()> {
        let FapiContext {
            esys,
            keystore,
            profiles,
            pool,
            command,
            ..
        } = self;
        let Command::Provision(cmd) = command else {
            return Err(Error::BadSequence);
        };
        loop {
            match cmd.state {
                ProvisionState::CreateSrk => {
                    esys.create_primary_async(
                        Hierarchy::Owner.esys_handle(),
                        EsysTr::PASSWORD,
                        &Sensitive::default(),
                        &cmd.srk_public,
                    )?;
                    cmd.state = ProvisionState::WaitForSrk;
                    return Err(Error::TryAgain);
                }
                ProvisionState::WaitForSrk => {
                    let created = esys.create_primary_finish()?;
                    cmd.srk_handle = created.handle;
                    let key = KeyObject {
                        public: created.public,
                        private: Vec::new(),
                        serialization: None,
                        policy: None,
                        signing_scheme: SignScheme::default(),
                        description: Some("Storage root key".to_string()),
                        certificate: None,
                        app_data: None,
                        with_auth: false,
                        persistent_handle: 0,
                    };
                    let srk_path =
                        format!("{}/{}", profiles.default_name(), path::SRK_PATH);
                    keystore.store_async(&srk_path, &Object::key(key))?;
                    cmd.state = ProvisionState::StoreSrk;
                }
                ProvisionState::StoreSrk => {
                    keystore.store_finish()?;
                    esys.flush_context(cmd.srk_handle)?;
                    cmd.srk_handle = EsysTr::NONE;
                    cmd.state = ProvisionState::CreateEk;
                }
                ProvisionState::CreateEk => {
                    esys.create_primary_async(
                        Hierarchy::Endorsement.esys_handle(),
                        EsysTr::PASSWORD,
                        &Sensitive::default(),
                        &cmd.ek_public,
                    )?;
                    cmd.state = ProvisionState::WaitForEk;
                    return Err(Error::TryAgain);
                }
                ProvisionState::WaitForEk => {
                    let created = esys.create_primary_finish()?;
                    cmd.ek_handle = created.handle;
                    let key = KeyObject {
                        public: created.public,
                        private: Vec::new(),
                        serialization: None,
                        policy: None,
                        signing_scheme: SignScheme::default(),
                        description: Some("Endorsement key".to_string()),
                        certificate: None,
                        app_data: None,
                        with_auth: false,
                        persistent_handle: 0,
                    };
                    let ek_path = format!("{}/{}", profiles.default_name(), path::EK_PATH);
                    keystore.store_async(&ek_path, &Object::key(key))?;
                    cmd.state = ProvisionState::StoreEk;
                }
                ProvisionState::StoreEk => {
                    keystore.store_finish()?;
                    esys.flush_context(cmd.ek_handle)?;
                    cmd.ek_handle = EsysTr::NONE;
                    cmd.state = ProvisionState::StoreHierarchy(0);
                }
                ProvisionState::StoreHierarchy(i) => {
                    let hierarchy = PROVISIONED_HIERARCHIES[i];
                    let hierarchy_path =
                        format!("{}/{}", profiles.default_name(), hierarchy.segment());
                    keystore.store_async(&hierarchy_path, &Object::hierarchy(hierarchy))?;
                    cmd.state = ProvisionState::StoreHierarchyFinish(i);
                }
                ProvisionState::StoreHierarchyFinish(i) => {
                    keystore.store_finish()?;
                    cmd.state = if i + 1 < PROVISIONED_HIERARCHIES.len() {
                        ProvisionState::StoreHierarchy(i + 1)
                    } else {
                        ProvisionState::Cleanup
                    };
                }
                ProvisionState::Cleanup => {
                    pool.cleanup_session(esys.as_mut())?;
                    return Ok(());
                }
            }
        }
    }
}
