// SPDX-License-Identifier: MIT

//! The application capability interface.
//!
//! Commands that need the application's help, such as a password prompt,
//! a branch decision or an external signature, receive an implementation of
//! [`Callbacks`] by reference at each step. The engine never stores the
//! capability object. Every method has a refusing default so applications
//! only implement what their policies actually use.

use crate::error::{Error, Result};
use crate::object::{NvPublicArea, PublicArea};
use crate::types::{EsysTr, HashAlg};

/// TPM bindings of an object authorized for use inside a policy element.
#[derive(Debug, Clone, Copy)]
pub struct AuthorizedObject {
    /// Handle of the referenced object itself.
    pub object: EsysTr,
    /// Handle providing the authorization (hierarchy or the object).
    pub auth_handle: EsysTr,
    /// Session carrying the authorization.
    pub session: EsysTr,
}

/// Hooks the engine invokes on behalf of the application.
pub trait Callbacks {
    /// Prompts for the auth value of the object at `path`.
    ///
    /// # Errors
    ///
    /// `AuthorizationUnknown` when the application cannot supply one.
    fn auth(&mut self, path: &str, description: &str) -> Result<String> {
        let _ = (path, description);
        Err(Error::AuthorizationUnknown)
    }

    /// Selects a branch of a `PolicyOR` by index into `branches`.
    ///
    /// # Errors
    ///
    /// `AuthorizationUnknown` when no selector is available.
    fn branch_select(&mut self, branches: &[String]) -> Result<usize> {
        let _ = branches;
        Err(Error::AuthorizationUnknown)
    }

    /// Signs `message` with the key matching `key_public`, returning the
    /// signature in TPM wire form.
    ///
    /// # Errors
    ///
    /// `AuthorizationUnknown` when no signer is available.
    fn sign(&mut self, key_public: &PublicArea, hash_alg: HashAlg, message: &[u8]) -> Result<Vec<u8>> {
        let _ = (key_public, hash_alg, message);
        Err(Error::AuthorizationUnknown)
    }

    /// Produces a signature over an approved policy digest for
    /// `PolicyAuthorize`.
    ///
    /// # Errors
    ///
    /// `AuthorizationUnknown` when no authorizer is available.
    fn authorize_policy(
        &mut self,
        key_public: &PublicArea,
        hash_alg: HashAlg,
        approved_policy: &[u8],
    ) -> Result<Vec<u8>> {
        let _ = (key_public, hash_alg, approved_policy);
        Err(Error::AuthorizationUnknown)
    }

    /// Acknowledges a `PolicyAuthorizeNV` element before the NV index is
    /// consulted.
    ///
    /// # Errors
    ///
    /// Implementations may veto with any error.
    fn authorize_nv(&mut self, nv_public: &NvPublicArea, hash_alg: HashAlg) -> Result<()> {
        let _ = (nv_public, hash_alg);
        Ok(())
    }

    /// Runs a `PolicyAction` side effect.
    ///
    /// # Errors
    ///
    /// `AuthorizationUnknown` when no action handler is available.
    fn action(&mut self, action: &str) -> Result<()> {
        let _ = action;
        Err(Error::AuthorizationUnknown)
    }

    /// Resolves the TPM name of the object at `path` for policy
    /// instantiation.
    ///
    /// # Errors
    ///
    /// `PolicyPathNotFound` when the path cannot be resolved.
    fn object_name(&mut self, path: &str) -> Result<Vec<u8>> {
        let _ = path;
        Err(Error::PolicyPathNotFound)
    }

    /// Resolves the public area of the key at `path`.
    ///
    /// # Errors
    ///
    /// `PolicyPathNotFound` when the path cannot be resolved.
    fn key_public(&mut self, path: &str) -> Result<PublicArea> {
        let _ = path;
        Err(Error::PolicyPathNotFound)
    }

    /// Resolves the NV public area of the index at `path`.
    ///
    /// # Errors
    ///
    /// `PolicyPathNotFound` when the path cannot be resolved.
    fn nv_public(&mut self, path: &str) -> Result<NvPublicArea> {
        let _ = path;
        Err(Error::PolicyPathNotFound)
    }

    /// Reads the current value of a PCR in the given bank.
    ///
    /// # Errors
    ///
    /// `NotImplemented` when no PCR source is available.
    fn pcr_read(&mut self, pcr: u32, bank: HashAlg) -> Result<Vec<u8>> {
        let _ = (pcr, bank);
        Err(Error::NotImplemented)
    }

    /// Loads and authorizes the object with the given TPM name so a
    /// `PolicySecret`, `PolicyNV` or `PolicyAuthorizeNV` element can
    /// reference it.
    ///
    /// # Errors
    ///
    /// `AuthorizationUnknown` when the name cannot be resolved.
    fn authorize_object_by_name(&mut self, name: &[u8]) -> Result<AuthorizedObject> {
        let _ = name;
        Err(Error::AuthorizationUnknown)
    }

    /// Name of the object a `PolicyDuplicationSelect` element applies to.
    ///
    /// # Errors
    ///
    /// `AuthorizationUnknown` when the name cannot be supplied.
    fn duplication_name(&mut self) -> Result<Vec<u8>> {
        Err(Error::AuthorizationUnknown)
    }
}

/// A capability that refuses everything; handy for commands that never
/// reach a callback.
pub struct NoCallbacks;

impl Callbacks for NoCallbacks {}
