// SPDX-License-Identifier: MIT

//! The path resolver.
//!
//! Logical paths are slash-delimited. The leading segment may name an
//! explicit crypto profile (`P_<name>`); the following segment names a
//! hierarchy, either directly (`HS`, `HE`, `HP`, `HN`, `LOCKOUT`, matched
//! case-insensitively) or implied by a well-known key name (`EK` lives
//! under `HE`; `SRK`, `SDK`, `UNK` and `UDK` under `HS`). NV and policy
//! paths are recognized by their first segment. On disk, policy paths use
//! `.` instead of `/` as the delimiter.

use crate::error::{Error, Result};
use crate::types::{EsysTr, TpmHandle};

/// Delimiter of logical paths.
pub const FILE_DELIM: char = '/';
/// Delimiter of policy paths on disk.
pub const POLICY_DELIM: char = '.';

/// First segment of NV paths.
pub const NV_PATH: &str = "nv";
/// First segment of policy paths.
pub const POLICY_PATH: &str = "policy";
/// First segment of external public key paths.
pub const EXT_PATH: &str = "ext";

/// Relative path of the storage root key below a profile directory.
pub const SRK_PATH: &str = "HS/SRK";
/// Relative path of the endorsement key below a profile directory.
pub const EK_PATH: &str = "HE/EK";

/// A TPM authorization hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hierarchy {
    /// `/HS`, the storage (owner) hierarchy.
    Owner,
    /// `/HE`, the endorsement hierarchy.
    Endorsement,
    /// `/HP`, the platform hierarchy.
    Platform,
    /// `/HN`, the null hierarchy.
    Null,
    /// `/LOCKOUT`.
    Lockout,
}

impl Hierarchy {
    /// Parses a hierarchy path segment, case-insensitively.
    #[must_use]
    pub fn from_segment(segment: &str) -> Option<Hierarchy> {
        match segment.to_ascii_uppercase().as_str() {
            "HS" => Some(Hierarchy::Owner),
            "HE" => Some(Hierarchy::Endorsement),
            "HP" => Some(Hierarchy::Platform),
            "HN" => Some(Hierarchy::Null),
            "LOCKOUT" => Some(Hierarchy::Lockout),
            _ => None,
        }
    }

    /// The path segment naming this hierarchy.
    #[must_use]
    pub fn segment(self) -> &'static str {
        match self {
            Hierarchy::Owner => "HS",
            Hierarchy::Endorsement => "HE",
            Hierarchy::Platform => "HP",
            Hierarchy::Null => "HN",
            Hierarchy::Lockout => "LOCKOUT",
        }
    }

    /// The reserved ESYS handle authorizing this hierarchy.
    #[must_use]
    pub fn esys_handle(self) -> EsysTr {
        match self {
            Hierarchy::Owner => EsysTr::RH_OWNER,
            Hierarchy::Endorsement => EsysTr::RH_ENDORSEMENT,
            Hierarchy::Platform => EsysTr::RH_PLATFORM,
            Hierarchy::Null => EsysTr::RH_NULL,
            Hierarchy::Lockout => EsysTr::RH_LOCKOUT,
        }
    }
}

/// Splits a logical path into its non-empty segments.
#[must_use]
pub fn split_path(path: &str) -> Vec<String> {
    path.split(FILE_DELIM)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Joins the first `n` segments of a path list.
#[must_use]
pub fn path_string_n(segments: &[String], n: usize) -> String {
    segments[..n.min(segments.len())].join(&FILE_DELIM.to_string())
}

/// Joins a full path list.
#[must_use]
pub fn path_string(segments: &[String]) -> String {
    path_string_n(segments, segments.len())
}

/// Whether the first segment of `path` equals `tag` (case-insensitive, an
/// optional leading delimiter is ignored).
#[must_use]
pub fn path_type_p(path: &str, tag: &str) -> bool {
    let trimmed = path.strip_prefix(FILE_DELIM).unwrap_or(path);
    match trimmed.split_once(FILE_DELIM) {
        Some((first, _)) => first.eq_ignore_ascii_case(tag),
        None => trimmed.eq_ignore_ascii_case(tag),
    }
}

/// Whether `path` names a bare hierarchy, optionally below a profile
/// directory.
#[must_use]
pub fn hierarchy_path_p(path: &str) -> bool {
    let mut segments = split_path(path);
    if segments.first().is_some_and(|s| s.starts_with("P_")) {
        segments.remove(0);
    }
    segments.len() == 1 && Hierarchy::from_segment(&segments[0]).is_some()
}

/// The hierarchy named by a bare hierarchy path.
///
/// # Errors
///
/// Fails with `BadPath` unless `hierarchy_path_p` holds for `path`.
pub fn hierarchy_of(path: &str) -> Result<Hierarchy> {
    let mut segments = split_path(path);
    if segments.first().is_some_and(|s| s.starts_with("P_")) {
        segments.remove(0);
    }
    match segments.as_slice() {
        [segment] => Hierarchy::from_segment(segment).ok_or(Error::BadPath),
        _ => Err(Error::BadPath),
    }
}

/// Strips the store root from an absolute file path and collapses doubled
/// delimiters, yielding the logical path.
///
/// Whichever root matches is stripped, longest first, so nested store
/// directories cannot shadow each other.
#[must_use]
pub fn canonicalize(path: &str, user_root: &str, system_root: &str) -> String {
    let mut roots = [user_root, system_root];
    roots.sort_by_key(|r| core::cmp::Reverse(r.len()));

    let mut rest = path;
    for root in roots {
        if !root.is_empty() {
            if let Some(stripped) = rest.strip_prefix(root) {
                rest = stripped;
                break;
            }
        }
    }

    let mut out = String::with_capacity(rest.len() + 1);
    for segment in rest.split(FILE_DELIM).filter(|s| !s.is_empty()) {
        out.push(FILE_DELIM);
        out.push_str(segment);
    }
    if out.is_empty() {
        out.push(FILE_DELIM);
    }
    out
}

/// Expands a key path into its explicit form
/// `[profile, hierarchy, segment…]`.
///
/// # Errors
///
/// Fails with `BadValue` when no key segment remains after expansion.
pub fn explicit_key_path(default_profile: &str, path: &str) -> Result<Vec<String>> {
    let segments = split_path(path);
    let mut iter = segments.into_iter().peekable();

    let profile = match iter.peek() {
        Some(first) if first.starts_with("P_") => iter.next().ok_or(Error::BadValue)?,
        _ => default_profile.to_string(),
    };

    let hierarchy = match iter.peek() {
        None => return Err(Error::BadValue),
        Some(first) => {
            if let Some(h) = Hierarchy::from_segment(first) {
                iter.next();
                h.segment().to_string()
            } else if first == "EK" {
                Hierarchy::Endorsement.segment().to_string()
            } else {
                // SRK, SDK, UNK, UDK and free-form keys live under the
                // storage hierarchy.
                Hierarchy::Owner.segment().to_string()
            }
        }
    };

    let mut result = vec![profile, hierarchy];
    let rest: Vec<String> = iter.collect();
    if rest.is_empty() {
        return Err(Error::BadValue);
    }
    result.extend(rest);
    Ok(result)
}

/// Base NV index of the category named by an NV path.
///
/// The bases follow the TCG registry of reserved NV index ranges.
///
/// # Errors
///
/// Fails with `BadPath` for paths outside `/nv/<category>/…`.
pub fn nv_start_index(path: &str) -> Result<TpmHandle> {
    let segments = split_path(path);
    if segments.len() < 2 || segments[0] != NV_PATH {
        return Err(Error::BadPath);
    }
    match segments[1].as_str() {
        "TPM" => Ok(0x0100_0000),
        "Platform" => Ok(0x0140_0000),
        "Owner" => Ok(0x0180_0000),
        "Endorsement_Certificate" => Ok(0x01C0_0000),
        "Component_OEM" => Ok(0x01C1_0000),
        "TPM_OEM" => Ok(0x01C2_0000),
        "Platform_OEM" => Ok(0x01C3_0000),
        "PC-Client" => Ok(0x01C4_0000),
        "Server" => Ok(0x01C5_0000),
        "Virtualized_Platform" => Ok(0x01C6_0000),
        "MPWG" => Ok(0x01C7_0000),
        "Platform_Certificate" => Ok(0x01C8_0000),
        "Embedded" => Ok(0x01C9_0000),
        _ => Err(Error::BadPath),
    }
}

/// Maps a logical path to its on-disk relative form. Policy paths switch
/// to the `.` delimiter.
#[must_use]
pub fn to_disk_path(path: &str) -> String {
    let rel = path.strip_prefix(FILE_DELIM).unwrap_or(path);
    if path_type_p(path, POLICY_PATH) {
        rel.replace(FILE_DELIM, &POLICY_DELIM.to_string())
    } else {
        rel.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::{
        canonicalize, explicit_key_path, hierarchy_of, hierarchy_path_p, nv_start_index,
        path_string_n, path_type_p, split_path, to_disk_path, Hierarchy,
    };
    use crate::error::Error;

    #[test]
    fn split_drops_empty_segments() {
        assert_eq!(split_path("/HS//SRK/key"), ["HS", "SRK", "key"]);
    }

    #[test]
    fn prefix_join() {
        let segments = split_path("P_RSA/HS/SRK/key");
        assert_eq!(path_string_n(&segments, 2), "P_RSA/HS");
        assert_eq!(path_string_n(&segments, 9), "P_RSA/HS/SRK/key");
    }

    #[test]
    fn type_predicate() {
        assert!(path_type_p("/nv/Owner/data", "nv"));
        assert!(path_type_p("policy/pol_signed", "policy"));
        assert!(!path_type_p("/HS/SRK", "nv"));
    }

    #[test]
    fn hierarchy_detection() {
        assert!(hierarchy_path_p("/HS"));
        assert!(hierarchy_path_p("P_ECC/hn"));
        assert!(hierarchy_path_p("/LOCKOUT"));
        assert!(!hierarchy_path_p("/HS/SRK"));
        assert!(!hierarchy_path_p("/HX"));
        assert_eq!(hierarchy_of("/he"), Ok(Hierarchy::Endorsement));
        assert_eq!(hierarchy_of("/HS/SRK"), Err(Error::BadPath));
    }

    #[test]
    fn canonicalize_strips_roots_longest_first() {
        let user = "/home/user/.tpm2/keystore";
        let system = "/home/user/.tpm2";
        let p = canonicalize("/home/user/.tpm2/keystore/HS/SRK", user, system);
        assert_eq!(p, "/HS/SRK");
    }

    #[test]
    fn canonicalize_is_idempotent() {
        let user = "/var/user";
        let system = "/var/system";
        for raw in ["/var/user//HS//SRK/key/", "/HS/SRK/key", "HS/SRK/key"] {
            let once = canonicalize(raw, user, system);
            let twice = canonicalize(&once, user, system);
            assert_eq!(once, twice);
            assert_eq!(twice, "/HS/SRK/key");
        }
    }

    #[test]
    fn explicit_path_expansion() {
        assert_eq!(
            explicit_key_path("P_RSA", "HS/SRK/mykey").unwrap(),
            ["P_RSA", "HS", "SRK", "mykey"]
        );
        assert_eq!(
            explicit_key_path("P_RSA", "/SRK/mykey").unwrap(),
            ["P_RSA", "HS", "SRK", "mykey"]
        );
        assert_eq!(
            explicit_key_path("P_RSA", "/EK").unwrap(),
            ["P_RSA", "HE", "EK"]
        );
        assert_eq!(
            explicit_key_path("P_RSA", "P_ECC/HE/EK").unwrap(),
            ["P_ECC", "HE", "EK"]
        );
        assert_eq!(explicit_key_path("P_RSA", "/HS"), Err(Error::BadValue));
    }

    #[test]
    fn nv_bases() {
        assert_eq!(nv_start_index("/nv/TPM/x").unwrap(), 0x0100_0000);
        assert_eq!(nv_start_index("/nv/Owner/x").unwrap(), 0x0180_0000);
        assert_eq!(
            nv_start_index("/nv/Endorsement_Certificate/x").unwrap(),
            0x01C0_0000
        );
        assert_eq!(nv_start_index("/HS/SRK"), Err(Error::BadPath));
        assert_eq!(nv_start_index("/nv/Unknown/x"), Err(Error::BadPath));
    }

    #[test]
    fn policy_paths_use_dot_on_disk() {
        assert_eq!(to_disk_path("/policy/pol_signed"), "policy.pol_signed");
        assert_eq!(to_disk_path("/nv/Owner/data"), "nv/Owner/data");
    }
}
