// SPDX-License-Identifier: MIT

//! Keystore and policy-store adapter contracts.
//!
//! The engine only consumes the asynchronous load/store shape below; the
//! concrete persistence format behind it is not its concern. Reads fail
//! over from the user root to the system root; writes target the root
//! selected by the object's `system` flag. `MemoryStore` is the reference
//! adapter used by the test suite and the CLI demos.

use crate::error::{Error, Result};
use crate::object::Object;
use crate::policy::PolicyHarness;
use std::collections::HashMap;

/// Asynchronous object store for FAPI objects.
///
/// `load_async`/`store_async` begin an operation; the paired `_finish`
/// completes it, returning `TryAgain` until the backing I/O is ready. At
/// most one operation is pending per store.
pub trait Keystore {
    /// Blocks until pending store I/O can make progress.
    ///
    /// # Errors
    ///
    /// Fails with `IoError` when polling the backing descriptors fails.
    fn io_poll(&mut self) -> Result<()> {
        Ok(())
    }

    /// Begins reading the record at `path`.
    ///
    /// # Errors
    ///
    /// Fails with `BadPath` when no record exists.
    fn load_async(&mut self, path: &str) -> Result<()>;

    /// Completes a pending load.
    ///
    /// # Errors
    ///
    /// `TryAgain` until the read is complete; `IoError` on broken records.
    fn load_finish(&mut self) -> Result<Object>;

    /// Begins writing `object` to `path`.
    ///
    /// # Errors
    ///
    /// Fails with `IoError` when the write cannot be started.
    fn store_async(&mut self, path: &str, object: &Object) -> Result<()>;

    /// Completes a pending store.
    ///
    /// # Errors
    ///
    /// `TryAgain` until the write is complete.
    fn store_finish(&mut self) -> Result<()>;

    /// Fails fast when the record at `path` cannot be updated.
    ///
    /// # Errors
    ///
    /// `NvNotWriteable` or `IoError` depending on the backing store.
    fn check_writeable(&mut self, path: &str) -> Result<()>;

    /// Fails fast when creating at `path` would overwrite an object.
    ///
    /// # Errors
    ///
    /// `BadPath` when a record already exists.
    fn check_overwrite(&mut self, path: &str) -> Result<()>;
}

/// Asynchronous store for policy records; same shape as [`Keystore`].
pub trait PolicyStore {
    /// Begins reading the policy at `path`.
    ///
    /// # Errors
    ///
    /// Fails with `PolicyPathNotFound` when no policy exists.
    fn load_async(&mut self, path: &str) -> Result<()>;

    /// Completes a pending load.
    ///
    /// # Errors
    ///
    /// `TryAgain` until the read is complete; `BadTemplate` on records
    /// that do not parse as a policy.
    fn load_finish(&mut self) -> Result<PolicyHarness>;

    /// Begins writing `policy` to `path`.
    ///
    /// # Errors
    ///
    /// Fails with `IoError` when the write cannot be started.
    fn store_async(&mut self, path: &str, policy: &PolicyHarness) -> Result<()>;

    /// Completes a pending store.
    ///
    /// # Errors
    ///
    /// `TryAgain` until the write is complete.
    fn store_finish(&mut self) -> Result<()>;
}

enum Pending {
    None,
    Load(String),
    Store(String, String),
}

/// In-memory store backing both adapter traits.
///
/// Records are serialized JSON exactly as a directory-backed store would
/// hold them. A configurable stutter makes every `_finish` report
/// `TryAgain` a fixed number of times first, so the suspension edges of
/// the calling state machines get exercised.
pub struct MemoryStore {
    records: HashMap<String, String>,
    pending: Pending,
    stutter: u32,
    remaining_stutter: u32,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> MemoryStore {
        MemoryStore {
            records: HashMap::new(),
            pending: Pending::None,
            stutter: 0,
            remaining_stutter: 0,
        }
    }

    /// Makes every finish call suspend `count` times before completing.
    #[must_use]
    pub fn with_stutter(mut self, count: u32) -> MemoryStore {
        self.set_stutter(count);
        self
    }

    /// Reconfigures the per-finish suspension count.
    pub fn set_stutter(&mut self, count: u32) {
        self.stutter = count;
        self.remaining_stutter = count;
    }

    /// Raw record access for tests and tooling.
    #[must_use]
    pub fn record(&self, path: &str) -> Option<&str> {
        self.records.get(path).map(String::as_str)
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn stutter_step(&mut self) -> Result<()> {
        if self.remaining_stutter > 0 {
            self.remaining_stutter -= 1;
            return Err(Error::TryAgain);
        }
        self.remaining_stutter = self.stutter;
        Ok(())
    }

    fn begin(&mut self, pending: Pending) -> Result<()> {
        if !matches!(self.pending, Pending::None) {
            log::error!("store operation already pending");
            return Err(Error::IoError);
        }
        self.pending = pending;
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::new()
    }
}

impl Keystore for MemoryStore {
    fn load_async(&mut self, path: &str) -> Result<()> {
        if !self.records.contains_key(path) {
            log::debug!("no keystore record at {path}");
            return Err(Error::BadPath);
        }
        self.begin(Pending::Load(path.to_string()))
    }

    fn load_finish(&mut self) -> Result<Object> {
        self.stutter_step()?;
        let Pending::Load(path) = core::mem::replace(&mut self.pending, Pending::None) else {
            return Err(Error::IoError);
        };
        let record = self.records.get(&path).ok_or(Error::BadPath)?;
        serde_json::from_str(record).map_err(|err| {
            log::error!("broken record at {path}: {err}");
            Error::IoError
        })
    }

    fn store_async(&mut self, path: &str, object: &Object) -> Result<()> {
        let record = serde_json::to_string(object).map_err(|_| Error::IoError)?;
        self.begin(Pending::Store(path.to_string(), record))
    }

    fn store_finish(&mut self) -> Result<()> {
        self.stutter_step()?;
        let Pending::Store(path, record) = core::mem::replace(&mut self.pending, Pending::None)
        else {
            return Err(Error::IoError);
        };
        self.records.insert(path, record);
        Ok(())
    }

    fn check_writeable(&mut self, _path: &str) -> Result<()> {
        Ok(())
    }

    fn check_overwrite(&mut self, path: &str) -> Result<()> {
        if self.records.contains_key(path) {
            log::debug!("record at {path} would be overwritten");
            return Err(Error::BadPath);
        }
        Ok(())
    }
}

/// In-memory policy store mirroring [`MemoryStore`].
pub struct MemoryPolicyStore {
    records: HashMap<String, String>,
    pending: Pending,
}

impl MemoryPolicyStore {
    #[must_use]
    pub fn new() -> MemoryPolicyStore {
        MemoryPolicyStore {
            records: HashMap::new(),
            pending: Pending::None,
        }
    }

    /// Registers a policy record, bypassing the async path.
    ///
    /// # Errors
    ///
    /// Fails with `IoError` when the policy cannot be serialized.
    pub fn put(&mut self, path: &str, policy: &PolicyHarness) -> Result<()> {
        let record = serde_json::to_string(policy).map_err(|_| Error::IoError)?;
        self.records.insert(path.to_string(), record);
        Ok(())
    }

    /// Raw record access for tests and tooling.
    #[must_use]
    pub fn record(&self, path: &str) -> Option<&str> {
        self.records.get(path).map(String::as_str)
    }
}

impl Default for MemoryPolicyStore {
    fn default() -> Self {
        MemoryPolicyStore::new()
    }
}

impl PolicyStore for MemoryPolicyStore {
    fn load_async(&mut self, path: &str) -> Result<()> {
        if !self.records.contains_key(path) {
            log::debug!("no policy record at {path}");
            return Err(Error::PolicyPathNotFound);
        }
        self.pending = Pending::Load(path.to_string());
        Ok(())
    }

    fn load_finish(&mut self) -> Result<PolicyHarness> {
        let Pending::Load(path) = core::mem::replace(&mut self.pending, Pending::None) else {
            return Err(Error::IoError);
        };
        let record = self.records.get(&path).ok_or(Error::PolicyPathNotFound)?;
        serde_json::from_str(record).map_err(|err| {
            log::error!("broken policy at {path}: {err}");
            Error::BadTemplate
        })
    }

    fn store_async(&mut self, path: &str, policy: &PolicyHarness) -> Result<()> {
        let record = serde_json::to_string(policy).map_err(|_| Error::IoError)?;
        self.pending = Pending::Store(path.to_string(), record);
        Ok(())
    }

    fn store_finish(&mut self) -> Result<()> {
        let Pending::Store(path, record) = core::mem::replace(&mut self.pending, Pending::None)
        else {
            return Err(Error::IoError);
        };
        self.records.insert(path, record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Keystore, MemoryStore};
    use crate::error::Error;
    use crate::object::{NvObject, NvPublicArea, Object};
    use crate::types::{HashAlg, NvAttributes};

    fn nv_object() -> Object {
        Object::nv(NvObject {
            public: NvPublicArea {
                nv_index: 0x0180_0001,
                name_alg: HashAlg::Sha256,
                attributes: NvAttributes::AUTHREAD | NvAttributes::AUTHWRITE,
                auth_policy: Vec::new(),
                data_size: 64,
            },
            policy: None,
            description: Some("note".to_string()),
            app_data: None,
            event_log: None,
            serialization: None,
            with_auth: false,
        })
    }

    #[test]
    fn store_then_load() {
        let mut store = MemoryStore::new();
        store.store_async("nv/Owner/note", &nv_object()).unwrap();
        store.store_finish().unwrap();

        store.load_async("nv/Owner/note").unwrap();
        let object = store.load_finish().unwrap();
        assert_eq!(object.description(), Some("note"));
    }

    #[test]
    fn missing_record_is_bad_path() {
        let mut store = MemoryStore::new();
        assert_eq!(store.load_async("nv/Owner/none"), Err(Error::BadPath));
    }

    #[test]
    fn stutter_suspends_before_completion() {
        let mut store = MemoryStore::new().with_stutter(2);
        store.store_async("nv/Owner/note", &nv_object()).unwrap();
        assert_eq!(store.store_finish(), Err(Error::TryAgain));
        assert_eq!(store.store_finish(), Err(Error::TryAgain));
        store.store_finish().unwrap();
        assert!(store.record("nv/Owner/note").is_some());
    }

    #[test]
    fn overwrite_check() {
        let mut store = MemoryStore::new();
        store.check_overwrite("nv/Owner/note").unwrap();
        store.store_async("nv/Owner/note", &nv_object()).unwrap();
        store.store_finish().unwrap();
        assert_eq!(store.check_overwrite("nv/Owner/note"), Err(Error::BadPath));
    }
}
