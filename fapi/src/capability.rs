// SPDX-License-Identifier: MIT

//! Capability retrieval and EK-certificate discovery.
//!
//! `GetCapability` is paginated by the TPM; the fetch machine accumulates
//! pages into one structure, appending kind-specifically and advancing
//! the property cursor past the last entry of each page. Certificate
//! discovery scans the TCG-reserved NV handle range and reads each index
//! with owner authorization over a password session.

use crate::error::{Error, Result};
use crate::esys::EsysContext;
use crate::nv::NvRead;
use crate::object::Object;
use crate::path::Hierarchy;
use crate::types::{Capability, EsysTr, PcrSelection, TpmHandle};

/// `TPM2_MAX_CAP_ALGS`
pub const MAX_CAP_ALGS: usize = 127;
/// `TPM2_MAX_CAP_HANDLES`
pub const MAX_CAP_HANDLES: usize = 254;
/// `TPM2_MAX_CAP_CC`
pub const MAX_CAP_CC: usize = 254;
/// `TPM2_NUM_PCR_BANKS`
pub const NUM_PCR_BANKS: usize = 16;
/// `TPM2_MAX_TPM_PROPERTIES`
pub const MAX_TPM_PROPERTIES: usize = 127;
/// `TPM2_MAX_PCR_PROPERTIES`
pub const MAX_PCR_PROPERTIES: usize = 127;
/// `TPM2_MAX_ECC_CURVES`
pub const MAX_ECC_CURVES: usize = 508;
/// `TPM2_MAX_PTT_PROPERTIES`
pub const MAX_VENDOR_PROPERTIES: usize = 127;

/// First NV index of the TCG EK-certificate range.
pub const MIN_EK_CERT_HANDLE: TpmHandle = 0x01C0_0000;
/// Last NV index of the TCG EK-certificate range.
pub const MAX_EK_CERT_HANDLE: TpmHandle = 0x01C0_7FFF;

/// `TPMS_ALG_PROPERTY`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlgProperty {
    pub alg: u16,
    pub properties: u32,
}

/// `TPMS_TAGGED_PROPERTY`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaggedProperty {
    pub property: u32,
    pub value: u32,
}

/// `TPMS_TAGGED_PCR_SELECT`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedPcrSelect {
    pub tag: u32,
    pub select: Vec<u8>,
}

/// One capability kind with its entries (`TPMU_CAPABILITIES`).
#[derive(Debug, Clone, PartialEq)]
pub enum CapabilityData {
    Algs(Vec<AlgProperty>),
    Handles(Vec<TpmHandle>),
    Commands(Vec<u32>),
    PpCommands(Vec<u32>),
    AuditCommands(Vec<u32>),
    Pcrs(Vec<PcrSelection>),
    TpmProperties(Vec<TaggedProperty>),
    PcrProperties(Vec<TaggedPcrSelect>),
    EccCurves(Vec<u16>),
    VendorProperties(Vec<u32>),
}

impl CapabilityData {
    /// The capability selector this data answers.
    #[must_use]
    pub fn kind(&self) -> Capability {
        match self {
            CapabilityData::Algs(_) => Capability::Algs,
            CapabilityData::Handles(_) => Capability::Handles,
            CapabilityData::Commands(_) => Capability::Commands,
            CapabilityData::PpCommands(_) => Capability::PpCommands,
            CapabilityData::AuditCommands(_) => Capability::AuditCommands,
            CapabilityData::Pcrs(_) => Capability::Pcrs,
            CapabilityData::TpmProperties(_) => Capability::TpmProperties,
            CapabilityData::PcrProperties(_) => Capability::PcrProperties,
            CapabilityData::EccCurves(_) => Capability::EccCurves,
            CapabilityData::VendorProperties(_) => Capability::VendorProperty,
        }
    }

    /// Number of accumulated entries.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            CapabilityData::Algs(v) => v.len(),
            CapabilityData::Handles(v) => v.len(),
            CapabilityData::Commands(v) | CapabilityData::PpCommands(v)
            | CapabilityData::AuditCommands(v) | CapabilityData::VendorProperties(v) => v.len(),
            CapabilityData::Pcrs(v) => v.len(),
            CapabilityData::TpmProperties(v) => v.len(),
            CapabilityData::PcrProperties(v) => v.len(),
            CapabilityData::EccCurves(v) => v.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The TPM-side bound of this capability's array.
    #[must_use]
    pub fn max_len(&self) -> usize {
        match self {
            CapabilityData::Algs(_) => MAX_CAP_ALGS,
            CapabilityData::Handles(_) => MAX_CAP_HANDLES,
            CapabilityData::Commands(_)
            | CapabilityData::PpCommands(_)
            | CapabilityData::AuditCommands(_) => MAX_CAP_CC,
            CapabilityData::Pcrs(_) => NUM_PCR_BANKS,
            CapabilityData::TpmProperties(_) => MAX_TPM_PROPERTIES,
            CapabilityData::PcrProperties(_) => MAX_PCR_PROPERTIES,
            CapabilityData::EccCurves(_) => MAX_ECC_CURVES,
            CapabilityData::VendorProperties(_) => MAX_VENDOR_PROPERTIES,
        }
    }

    /// Property selector of the last entry, for the next-page cursor.
    #[must_use]
    pub fn last_property(&self) -> u32 {
        match self {
            CapabilityData::Algs(v) => v.last().map_or(0, |p| u32::from(p.alg)),
            CapabilityData::Handles(v) => v.last().copied().unwrap_or(0),
            CapabilityData::Commands(v) => {
                // Only the command index bits form the cursor.
                v.last().copied().unwrap_or(0) & 0xFFFF
            }
            CapabilityData::PpCommands(v)
            | CapabilityData::AuditCommands(v)
            | CapabilityData::VendorProperties(v) => v.last().copied().unwrap_or(0),
            CapabilityData::Pcrs(v) => v.last().map_or(0, |s| u32::from(s.hash as u16)),
            CapabilityData::TpmProperties(v) => v.last().map_or(0, |p| p.property),
            CapabilityData::PcrProperties(v) => v.last().map_or(0, |p| p.tag),
            CapabilityData::EccCurves(v) => v.last().map_or(0, |c| u32::from(*c)),
        }
    }

    /// Appends another page of the same kind, bounded by [`max_len`].
    ///
    /// # Errors
    ///
    /// Fails with `GeneralFailure` when the kinds differ.
    ///
    /// [`max_len`]: CapabilityData::max_len
    pub fn append(&mut self, more: CapabilityData) -> Result<()> {
        fn merge<T>(dst: &mut Vec<T>, src: Vec<T>, max: usize) {
            let room = max.saturating_sub(dst.len());
            dst.extend(src.into_iter().take(room));
        }
        let max = self.max_len();
        match (self, more) {
            (CapabilityData::Algs(dst), CapabilityData::Algs(src)) => merge(dst, src, max),
            (CapabilityData::Handles(dst), CapabilityData::Handles(src)) => merge(dst, src, max),
            (CapabilityData::Commands(dst), CapabilityData::Commands(src)) => merge(dst, src, max),
            (CapabilityData::PpCommands(dst), CapabilityData::PpCommands(src)) => {
                merge(dst, src, max);
            }
            (CapabilityData::AuditCommands(dst), CapabilityData::AuditCommands(src)) => {
                merge(dst, src, max);
            }
            (CapabilityData::Pcrs(dst), CapabilityData::Pcrs(src)) => merge(dst, src, max),
            (CapabilityData::TpmProperties(dst), CapabilityData::TpmProperties(src)) => {
                merge(dst, src, max);
            }
            (CapabilityData::PcrProperties(dst), CapabilityData::PcrProperties(src)) => {
                merge(dst, src, max);
            }
            (CapabilityData::EccCurves(dst), CapabilityData::EccCurves(src)) => {
                merge(dst, src, max);
            }
            (CapabilityData::VendorProperties(dst), CapabilityData::VendorProperties(src)) => {
                merge(dst, src, max);
            }
            _ => {
                log::error!("capability kind changed between pages");
                return Err(Error::GeneralFailure);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchState {
    GetCapMore,
    WaitForCap,
}

/// The paginated capability fetch machine.
pub struct CapabilityFetch {
    capability: Capability,
    property: u32,
    count: usize,
    state: FetchState,
    accumulated: Option<CapabilityData>,
}

impl CapabilityFetch {
    /// Prepares a fetch of up to `count` entries starting at `property`.
    #[must_use]
    pub fn new(capability: Capability, property: u32, count: usize) -> CapabilityFetch {
        CapabilityFetch {
            capability,
            property,
            count,
            state: FetchState::GetCapMore,
            accumulated: None,
        }
    }

    /// Drives the fetch; returns the accumulated capability data.
    ///
    /// # Errors
    ///
    /// `TryAgain` while a page is pending.
    pub fn finish(&mut self, esys: &mut dyn EsysContext) -> Result<CapabilityData> {
        loop {
            match self.state {
                FetchState::GetCapMore => {
                    let have = self.accumulated.as_ref().map_or(0, CapabilityData::len);
                    let want = u32::try_from(self.count.saturating_sub(have))
                        .map_err(|_| Error::BadValue)?;
                    esys.get_capability_async(self.capability, self.property, want)?;
                    self.state = FetchState::WaitForCap;
                }
                FetchState::WaitForCap => {
                    let (more_data, fetched) = esys.get_capability_finish()?;
                    if fetched.kind() != self.capability {
                        log::error!(
                            "TPM returned {:?} for a {:?} query",
                            fetched.kind(),
                            self.capability
                        );
                        return Err(Error::GeneralFailure);
                    }

                    let accumulated = match self.accumulated.take() {
                        // The first page is reused as the accumulator.
                        None if !more_data => return Ok(fetched),
                        None => fetched,
                        Some(mut acc) => {
                            acc.append(fetched)?;
                            acc
                        }
                    };

                    self.property = accumulated.last_property() + 1;
                    let full = accumulated.len() >= self.count
                        || accumulated.len() >= accumulated.max_len();
                    if !more_data || full {
                        return Ok(accumulated);
                    }
                    self.accumulated = Some(accumulated);
                    self.state = FetchState::GetCapMore;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CertState {
    Init,
    WaitForGetCap,
    GetCertNv,
    GetCertNvFinish,
    ReadPublic,
    ReadCert,
}

/// Discovery of endorsement certificates in the reserved NV range.
pub struct GetCertificates {
    state: CertState,
    min_handle: TpmHandle,
    max_handle: TpmHandle,
    handles: Vec<TpmHandle>,
    index: usize,
    nv_buffer_max: usize,
    nv_cert_handle: EsysTr,
    read: Option<NvRead>,
    certs: Vec<Vec<u8>>,
}

impl GetCertificates {
    /// Prepares a scan of `[min_handle, max_handle]`.
    #[must_use]
    pub fn new(min_handle: TpmHandle, max_handle: TpmHandle, nv_buffer_max: usize) -> GetCertificates {
        GetCertificates {
            state: CertState::Init,
            min_handle,
            max_handle,
            handles: Vec::new(),
            index: 0,
            nv_buffer_max,
            nv_cert_handle: EsysTr::NONE,
            read: None,
            certs: Vec::new(),
        }
    }

    /// Drives the scan; returns one blob per discovered certificate.
    ///
    /// # Errors
    ///
    /// `TryAgain` while suspended.
    pub fn finish(
        &mut self,
        esys: &mut dyn EsysContext,
        pool: &mut crate::session::SessionPool,
        auth: &mut crate::auth::AuthSubsystem,
        cb: &mut dyn crate::callbacks::Callbacks,
    ) -> Result<Vec<Vec<u8>>> {
        loop {
            match self.state {
                CertState::Init => {
                    esys.get_capability_async(
                        Capability::Handles,
                        self.min_handle,
                        u32::try_from(MAX_CAP_HANDLES).map_err(|_| Error::BadValue)?,
                    )?;
                    self.state = CertState::WaitForGetCap;
                }
                CertState::WaitForGetCap => {
                    let (_, data) = esys.get_capability_finish()?;
                    let CapabilityData::Handles(handles) = data else {
                        return Err(Error::GeneralFailure);
                    };
                    self.handles = handles
                        .into_iter()
                        .filter(|h| *h <= self.max_handle)
                        .collect();
                    if self.handles.is_empty() {
                        return Ok(Vec::new());
                    }
                    self.state = CertState::GetCertNv;
                }
                CertState::GetCertNv => {
                    esys.tr_from_tpm_public_async(self.handles[self.index])?;
                    self.state = CertState::GetCertNvFinish;
                }
                CertState::GetCertNvFinish => {
                    self.nv_cert_handle = esys.tr_from_tpm_public_finish()?;
                    esys.nv_read_public_async(self.nv_cert_handle)?;
                    self.state = CertState::ReadPublic;
                }
                CertState::ReadPublic => {
                    // The public area tells the certificate's size.
                    let (public, _name) = esys.nv_read_public_finish()?;
                    self.read = Some(
                        NvRead::new(
                            self.nv_cert_handle,
                            Hierarchy::Owner.esys_handle(),
                            Object::hierarchy(Hierarchy::Owner),
                            "certificate",
                            0,
                            usize::from(public.data_size),
                            self.nv_buffer_max,
                        )
                        .with_session(EsysTr::PASSWORD),
                    );
                    self.state = CertState::ReadCert;
                }
                CertState::ReadCert => {
                    let read = self.read.as_mut().ok_or(Error::GeneralFailure)?;
                    let data = read.finish(esys, pool, auth, cb)?;
                    self.certs.push(data);
                    self.read = None;
                    self.index += 1;
                    if self.index == self.handles.len() {
                        return Ok(core::mem::take(&mut self.certs));
                    }
                    self.state = CertState::GetCertNv;
                }
            }
        }
    }
}
