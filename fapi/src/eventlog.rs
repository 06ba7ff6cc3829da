// SPDX-License-Identifier: MIT

//! The NV extend event log.
//!
//! Extendable NV indices carry a JSON event log: an array of event
//! records, one per successful extend. Older stores may hold a single
//! event as a bare object instead of a one-element array; reads coerce
//! that form and report it as deprecated.

use crate::crypto;
use crate::error::{Error, Result};
use crate::types::{HashAlg, PcrSelection};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event type tag of extend events produced by this engine.
pub const EVENT_TYPE_TAG: &str = "tss2";

/// One digest entry of an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDigest {
    pub hash_alg: HashAlg,
    #[serde(with = "hex")]
    pub digest: Vec<u8>,
}

/// One entry of the extend event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// 1-based position in the log.
    pub recnum: u64,
    /// The extended NV index, in the role of a PCR.
    pub pcr: u32,
    pub digests: Vec<EventDigest>,
    #[serde(rename = "type")]
    pub event_type: String,
    /// The raw data that was extended.
    #[serde(with = "hex")]
    pub data: Vec<u8>,
    /// Caller-supplied JSON describing the event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<Value>,
}

/// Parses an event log into a sequence of raw events.
///
/// # Errors
///
/// Fails with `BadValue` when the text is not valid JSON.
pub fn parse_log(text: Option<&str>) -> Result<Vec<Value>> {
    let Some(text) = text else {
        return Ok(Vec::new());
    };
    let value: Value = serde_json::from_str(text).map_err(|err| {
        log::error!("broken event log: {err}");
        Error::BadValue
    })?;
    match value {
        Value::Array(events) => Ok(events),
        single => {
            log::warn!("deprecated event log encoding: singleton instead of array");
            Ok(vec![single])
        }
    }
}

/// Appends `event` to the serialized log, assigning its record number.
///
/// # Errors
///
/// Fails with `BadValue` on broken log text.
pub fn append_event(text: Option<&str>, event: &mut Event) -> Result<String> {
    let mut events = parse_log(text)?;
    event.recnum = events.len() as u64 + 1;
    let value = serde_json::to_value(&*event).map_err(|_| Error::BadValue)?;
    events.push(value);
    serde_json::to_string_pretty(&Value::Array(events)).map_err(|_| Error::BadValue)
}

/// The PCR bank selection and composite digest carried by a quote
/// attestation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteInfo {
    pub hash_alg: HashAlg,
    pub pcr_selection: Vec<PcrSelection>,
    #[serde(with = "hex")]
    pub pcr_digest: Vec<u8>,
}

/// Folds one event into a virtual PCR: `vpcr = H(vpcr || digest)` with
/// the event's digest for `bank`.
///
/// # Errors
///
/// Fails with `BadValue` when the event carries no digest for the bank.
pub fn extend_vpcr(vpcr: &mut Vec<u8>, bank: HashAlg, event: &Event) -> Result<()> {
    let Some(entry) = event.digests.iter().find(|d| d.hash_alg == bank) else {
        log::error!("no digest for bank {bank:?} in event {}", event.recnum);
        return Err(Error::BadValue);
    };
    let mut data = core::mem::take(vpcr);
    data.extend(&entry.digest);
    *vpcr = crypto::hash(bank, &data)?;
    Ok(())
}

/// Replays an event log against the banks a quote selected and returns
/// the composite digest over the resulting virtual PCRs.
///
/// # Errors
///
/// Fails with `BadValue` on broken events.
pub fn calculate_pcr_digest(events: &[Value], quote: &QuoteInfo) -> Result<Vec<u8>> {
    // One virtual PCR per selected (bank, register), all starting at
    // zero, in selection order.
    let mut vpcrs: Vec<(HashAlg, u32, Vec<u8>)> = Vec::new();
    for selection in &quote.pcr_selection {
        for (octet, bits) in selection.select.iter().enumerate() {
            for bit in 0..8 {
                if bits & (1 << bit) != 0 {
                    let pcr = u32::try_from(octet * 8 + bit).map_err(|_| Error::BadValue)?;
                    vpcrs.push((
                        selection.hash,
                        pcr,
                        vec![0; selection.hash.digest_size()],
                    ));
                }
            }
        }
    }

    for raw in events {
        let event: Event = serde_json::from_value(raw.clone()).map_err(|err| {
            log::error!("broken event record: {err}");
            Error::BadValue
        })?;
        for (bank, pcr, vpcr) in &mut vpcrs {
            if *pcr == event.pcr && event.digests.iter().any(|d| d.hash_alg == *bank) {
                extend_vpcr(vpcr, *bank, &event)?;
            }
        }
    }

    let mut seq = crypto::HashSequence::start(quote.hash_alg)?;
    for (_, _, vpcr) in &vpcrs {
        seq.update(vpcr);
    }
    Ok(seq.finish())
}

/// Checks that replaying `events` reproduces the digest inside the
/// quote.
///
/// # Errors
///
/// Fails with `SignatureVerificationFailed` on a digest mismatch.
pub fn verify_quote_digest(events: &[Value], quote: &QuoteInfo) -> Result<()> {
    let digest = calculate_pcr_digest(events, quote)?;
    if digest != quote.pcr_digest {
        log::error!("event log does not reproduce the quoted PCR digest");
        return Err(Error::SignatureVerificationFailed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{append_event, parse_log, Event, EventDigest, EVENT_TYPE_TAG};
    use crate::types::HashAlg;

    fn event(data: &[u8]) -> Event {
        Event {
            recnum: 0,
            pcr: 0x0180_0003,
            digests: vec![EventDigest {
                hash_alg: HashAlg::Sha256,
                digest: vec![0x11; 32],
            }],
            event_type: EVENT_TYPE_TAG.to_string(),
            data: data.to_vec(),
            event: None,
        }
    }

    #[test]
    fn empty_log_starts_at_one() {
        let mut first = event(b"abc");
        let text = append_event(None, &mut first).unwrap();
        assert_eq!(first.recnum, 1);

        let events = parse_log(Some(&text)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["recnum"], 1);
        assert_eq!(events[0]["pcr"], 0x0180_0003);
    }

    #[test]
    fn second_event_increments_recnum() {
        let mut first = event(b"a");
        let text = append_event(None, &mut first).unwrap();
        let mut second = event(b"b");
        let text = append_event(Some(&text), &mut second).unwrap();
        assert_eq!(second.recnum, 2);
        assert_eq!(parse_log(Some(&text)).unwrap().len(), 2);
    }

    #[test]
    fn singleton_log_is_coerced() {
        let mut first = event(b"a");
        first.recnum = 1;
        let singleton = serde_json::to_string(&first).unwrap();
        let events = parse_log(Some(&singleton)).unwrap();
        assert_eq!(events.len(), 1);

        let mut second = event(b"b");
        append_event(Some(&singleton), &mut second).unwrap();
        assert_eq!(second.recnum, 2);
    }

    #[test]
    fn quote_replay_matches_extension() {
        use super::{calculate_pcr_digest, verify_quote_digest, QuoteInfo};
        use crate::crypto;
        use crate::types::PcrSelection;

        let digest = crypto::hash(HashAlg::Sha256, b"abc").unwrap();
        let entry = Event {
            recnum: 1,
            pcr: 16,
            digests: vec![EventDigest {
                hash_alg: HashAlg::Sha256,
                digest: digest.clone(),
            }],
            event_type: EVENT_TYPE_TAG.to_string(),
            data: b"abc".to_vec(),
            event: None,
        };
        let events = vec![serde_json::to_value(&entry).unwrap()];

        // vpcr = H(0^32 || digest); quoted digest = H(vpcr).
        let mut concat = vec![0u8; 32];
        concat.extend(&digest);
        let vpcr = crypto::hash(HashAlg::Sha256, &concat).unwrap();
        let expected = crypto::hash(HashAlg::Sha256, &vpcr).unwrap();

        let quote = QuoteInfo {
            hash_alg: HashAlg::Sha256,
            pcr_selection: vec![PcrSelection::from_pcrs(HashAlg::Sha256, &[16])],
            pcr_digest: expected.clone(),
        };
        assert_eq!(calculate_pcr_digest(&events, &quote).unwrap(), expected);
        verify_quote_digest(&events, &quote).unwrap();

        let wrong = QuoteInfo {
            pcr_digest: vec![0; 32],
            ..quote
        };
        assert_eq!(
            verify_quote_digest(&events, &wrong),
            Err(crate::error::Error::SignatureVerificationFailed)
        );
    }
}
