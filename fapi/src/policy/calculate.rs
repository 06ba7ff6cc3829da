// SPDX-License-Identifier: MIT

//! The policy calculator.
//!
//! Calculation is pure with respect to the TPM: path references inside the
//! tree are first instantiated through the application callbacks, then the
//! element list is folded into an authorization digest with the update
//! formulae of the TPM 2.0 specification. Results are memoized per hash
//! algorithm inside the harness.

use super::{PcrValue, PolicyElement, PolicyHarness};
use crate::callbacks::Callbacks;
use crate::crypto;
use crate::error::{Error, Result};
use crate::types::{
    marshal_pcr_selection_list, put_u16, put_u32, CommandCode, ComparisonOp, HashAlg, PcrSelection,
};

/// The all-zero initial policy digest.
#[must_use]
pub fn zero_digest(hash_alg: HashAlg) -> Vec<u8> {
    vec![0; hash_alg.digest_size()]
}

/// One policy digest update: `H(old || parts…)`.
fn update(hash_alg: HashAlg, old: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>> {
    let mut seq = crypto::HashSequence::start(hash_alg)?;
    seq.update(old);
    for part in parts {
        seq.update(part);
    }
    Ok(seq.finish())
}

fn cc(code: CommandCode) -> [u8; 4] {
    (code as u32).to_be_bytes()
}

/// Hashed argument block shared by `PolicyNV` and `PolicyCounterTimer`.
fn operand_args(
    hash_alg: HashAlg,
    operand_b: &[u8],
    offset: u16,
    operation: ComparisonOp,
) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(operand_b.len() + 4);
    buf.extend(operand_b);
    put_u16(&mut buf, offset);
    put_u16(&mut buf, operation as u16);
    crypto::hash(hash_alg, &buf)
}

/// Composite PCR digest plus the selection list covering `pcrs`.
///
/// # Errors
///
/// Fails with `BadValue` when a PCR entry carries no digest for the bank.
pub fn compute_pcr_digest(
    pcrs: &[PcrValue],
    hash_alg: HashAlg,
) -> Result<(Vec<PcrSelection>, Vec<u8>)> {
    let mut seq = crypto::HashSequence::start(hash_alg)?;
    let mut banks: Vec<(HashAlg, Vec<u32>)> = Vec::new();
    for value in pcrs {
        if value.digest.is_empty() {
            return Err(Error::BadValue);
        }
        seq.update(&value.digest);
        match banks.iter_mut().find(|(bank, _)| *bank == value.hash_alg) {
            Some((_, list)) => list.push(value.pcr),
            None => banks.push((value.hash_alg, vec![value.pcr])),
        }
    }
    let selection = banks
        .into_iter()
        .map(|(bank, list)| PcrSelection::from_pcrs(bank, &list))
        .collect();
    Ok((selection, seq.finish()))
}

/// Resolves every path reference inside the element list via callbacks,
/// recursing into `PolicyOR` branches.
///
/// # Errors
///
/// Propagates lookup failures (`PolicyPathNotFound` and friends).
pub fn instantiate(
    elements: &mut [PolicyElement],
    hash_alg: HashAlg,
    cb: &mut dyn Callbacks,
) -> Result<()> {
    for element in elements {
        match element {
            PolicyElement::PolicyOr { branches } => {
                for branch in branches.iter_mut() {
                    instantiate(&mut branch.policy, hash_alg, cb)?;
                }
            }
            PolicyElement::PolicySigned {
                key_path,
                key_public,
                ..
            }
            | PolicyElement::PolicyAuthorize {
                key_path,
                key_public,
                ..
            } => {
                if key_public.is_none() {
                    let path = key_path.as_ref().ok_or(Error::BadTemplate)?;
                    *key_public = Some(cb.key_public(path)?);
                }
            }
            PolicyElement::PolicySecret {
                object_path,
                object_name,
                ..
            } => {
                if object_name.is_empty() {
                    let path = object_path.as_ref().ok_or(Error::BadTemplate)?;
                    *object_name = cb.object_name(path)?;
                }
            }
            PolicyElement::PolicyAuthorizeNv { nv_path, nv_public }
            | PolicyElement::PolicyNv {
                nv_path, nv_public, ..
            } => {
                if nv_public.is_none() {
                    let path = nv_path.as_ref().ok_or(Error::BadTemplate)?;
                    *nv_public = Some(cb.nv_public(path)?);
                }
            }
            PolicyElement::PolicyDuplicationSelect {
                new_parent_path,
                new_parent_public,
                new_parent_name,
                ..
            } => {
                if new_parent_public.is_none() {
                    if let Some(path) = new_parent_path.as_ref() {
                        *new_parent_public = Some(cb.key_public(path)?);
                    }
                }
                if new_parent_name.is_empty() {
                    let public = new_parent_public.as_ref().ok_or(Error::BadTemplate)?;
                    *new_parent_name = public.name()?;
                }
            }
            PolicyElement::PolicyPcr { pcrs } => {
                for value in pcrs.iter_mut() {
                    if value.digest.is_empty() {
                        value.digest = cb.pcr_read(value.pcr, value.hash_alg)?;
                    }
                }
            }
            PolicyElement::PolicyNameHash {
                object_paths,
                name_hash,
            } => {
                if name_hash.is_empty() {
                    if object_paths.is_empty() {
                        return Err(Error::BadTemplate);
                    }
                    let mut seq = crypto::HashSequence::start(hash_alg)?;
                    for path in object_paths.iter() {
                        seq.update(&cb.object_name(path)?);
                    }
                    *name_hash = seq.finish();
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Folds one element into the running digest. `PolicyOR` branches must
/// already carry their digests for `hash_alg`.
///
/// # Errors
///
/// Fails with `BadTemplate` on uninstantiated references and `BadValue`
/// on missing branch digests.
pub fn fold_element(hash_alg: HashAlg, old: &[u8], element: &PolicyElement) -> Result<Vec<u8>> {
    match element {
        PolicyElement::PolicyOr { branches } => {
            if branches.is_empty() || branches.len() > 8 {
                return Err(Error::BadValue);
            }
            let or_cc = cc(CommandCode::PolicyOr);
            let mut parts: Vec<&[u8]> = vec![&or_cc];
            for branch in branches {
                parts.push(
                    branch
                        .policy_digests
                        .get(hash_alg)
                        .ok_or(Error::BadValue)?,
                );
            }
            update(hash_alg, old, &parts)
        }
        PolicyElement::PolicyPcr { pcrs } => {
            let (selection, pcr_digest) = compute_pcr_digest(pcrs, hash_alg)?;
            let wire = marshal_pcr_selection_list(&selection);
            update(hash_alg, old, &[&cc(CommandCode::PolicyPcr), &wire, &pcr_digest])
        }
        PolicyElement::PolicySigned {
            key_public,
            policy_ref,
            ..
        } => {
            let name = key_public.as_ref().ok_or(Error::BadTemplate)?.name()?;
            update(
                hash_alg,
                old,
                &[&cc(CommandCode::PolicySigned), &name, policy_ref],
            )
        }
        PolicyElement::PolicySecret {
            object_name,
            policy_ref,
            ..
        } => {
            if object_name.is_empty() {
                return Err(Error::BadTemplate);
            }
            update(
                hash_alg,
                old,
                &[&cc(CommandCode::PolicySecret), object_name, policy_ref],
            )
        }
        PolicyElement::PolicyAuthorize {
            key_public,
            policy_ref,
            ..
        } => {
            // PolicyAuthorize replaces the running digest.
            let name = key_public.as_ref().ok_or(Error::BadTemplate)?.name()?;
            update(
                hash_alg,
                &zero_digest(hash_alg),
                &[&cc(CommandCode::PolicyAuthorize), &name, policy_ref],
            )
        }
        PolicyElement::PolicyAuthorizeNv { nv_public, .. } => {
            // Like PolicyAuthorize, this element replaces the digest.
            let name = nv_public.as_ref().ok_or(Error::BadTemplate)?.name()?;
            update(
                hash_alg,
                &zero_digest(hash_alg),
                &[&cc(CommandCode::PolicyAuthorizeNv), &name],
            )
        }
        PolicyElement::PolicyNv {
            nv_public,
            operand_b,
            offset,
            operation,
            ..
        } => {
            let name = nv_public.as_ref().ok_or(Error::BadTemplate)?.name()?;
            let args = operand_args(hash_alg, operand_b, *offset, *operation)?;
            update(hash_alg, old, &[&cc(CommandCode::PolicyNv), &args, &name])
        }
        PolicyElement::PolicyDuplicationSelect {
            object_name,
            new_parent_name,
            include_object,
            ..
        } => {
            if new_parent_name.is_empty() {
                return Err(Error::BadTemplate);
            }
            let include = [u8::from(*include_object)];
            if *include_object {
                update(
                    hash_alg,
                    old,
                    &[
                        &cc(CommandCode::PolicyDuplicationSelect),
                        object_name,
                        new_parent_name,
                        &include,
                    ],
                )
            } else {
                update(
                    hash_alg,
                    old,
                    &[
                        &cc(CommandCode::PolicyDuplicationSelect),
                        new_parent_name,
                        &include,
                    ],
                )
            }
        }
        PolicyElement::PolicyLocality { locality } => update(
            hash_alg,
            old,
            &[&cc(CommandCode::PolicyLocality), &[*locality]],
        ),
        PolicyElement::PolicyCommandCode { code } => {
            let mut wire = Vec::with_capacity(4);
            put_u32(&mut wire, *code as u32);
            update(hash_alg, old, &[&cc(CommandCode::PolicyCommandCode), &wire])
        }
        PolicyElement::PolicyCounterTimer {
            operand_b,
            offset,
            operation,
        } => {
            let args = operand_args(hash_alg, operand_b, *offset, *operation)?;
            update(hash_alg, old, &[&cc(CommandCode::PolicyCounterTimer), &args])
        }
        PolicyElement::PolicyNvWritten { written_set } => update(
            hash_alg,
            old,
            &[&cc(CommandCode::PolicyNvWritten), &[u8::from(*written_set)]],
        ),
        PolicyElement::PolicyNameHash { name_hash, .. } => {
            if name_hash.is_empty() {
                return Err(Error::BadTemplate);
            }
            update(hash_alg, old, &[&cc(CommandCode::PolicyNameHash), name_hash])
        }
        PolicyElement::PolicyCpHash { cp_hash } => {
            update(hash_alg, old, &[&cc(CommandCode::PolicyCpHash), cp_hash])
        }
        // PolicyPassword folds with the PolicyAuthValue command code; only
        // the session flag differs at execution time.
        PolicyElement::PolicyAuthValue | PolicyElement::PolicyPassword => {
            update(hash_alg, old, &[&cc(CommandCode::PolicyAuthValue)])
        }
        PolicyElement::PolicyPhysicalPresence => {
            update(hash_alg, old, &[&cc(CommandCode::PolicyPhysicalPresence)])
        }
        // No TPM command, no digest contribution.
        PolicyElement::PolicyAction { .. } => Ok(old.to_vec()),
    }
}

fn fold_elements(elements: &mut [PolicyElement], hash_alg: HashAlg) -> Result<Vec<u8>> {
    let mut digest = zero_digest(hash_alg);
    for element in elements.iter_mut() {
        if let PolicyElement::PolicyOr { branches } = element {
            for branch in branches.iter_mut() {
                if branch.policy_digests.get(hash_alg).is_none() {
                    let branch_digest = fold_elements(&mut branch.policy, hash_alg)?;
                    branch.policy_digests.set(hash_alg, branch_digest);
                }
            }
        }
        digest = fold_element(hash_alg, &digest, element)?;
    }
    Ok(digest)
}

/// Calculates the harness digest under `hash_alg`, instantiating path
/// references first. A digest already present for the algorithm is
/// returned unchanged, so repeated calculation neither recomputes nor
/// duplicates table entries.
///
/// # Errors
///
/// Propagates instantiation and hashing failures.
pub fn calculate(
    harness: &mut PolicyHarness,
    hash_alg: HashAlg,
    cb: &mut dyn Callbacks,
) -> Result<Vec<u8>> {
    instantiate(&mut harness.policy, hash_alg, cb)?;

    if let Some(digest) = harness.policy_digests.get(hash_alg) {
        log::debug!("policy digest for {hash_alg:?} already calculated");
        return Ok(digest.to_vec());
    }

    let digest = fold_elements(&mut harness.policy, hash_alg)?;
    harness.policy_digests.set(hash_alg, digest.clone());
    Ok(digest)
}
