// SPDX-License-Identifier: MIT

//! NV engine integration: round-trips, chunking, the extend pipeline and
//! the authorization retry edge, all against the software TPM.

mod common;

use common::{fixture, fixture_with_buffer, TestCallbacks};
use tpm2_fapi::crypto;
use tpm2_fapi::error::Error;
use tpm2_fapi::types::HashAlg;

const NOTE_PATH: &str = "/nv/Owner/note";
const EXTLOG_PATH: &str = "/nv/Owner/extlog";

#[test]
fn nv_write_read_round_trip() {
    let mut f = fixture();
    let mut cb = TestCallbacks::default();
    f.ctx.provision(&mut cb).unwrap();
    f.ctx
        .create_nv(NOTE_PATH, "noda", Some(64), None, None, &mut cb)
        .unwrap();

    let mut data = b"hello".to_vec();
    data.resize(64, 0);
    f.ctx.nv_write(NOTE_PATH, &data, &mut cb).unwrap();

    let read = f.ctx.nv_read(NOTE_PATH, &mut cb).unwrap();
    assert_eq!(read, data);

    // The stored record carries the WRITTEN attribute.
    let store = f.store.borrow();
    let record: serde_json::Value =
        serde_json::from_str(store.record("nv/Owner/note").unwrap()).unwrap();
    let attributes = record["public"]["attributes"].as_u64().unwrap();
    assert_ne!(attributes & 0x2000_0000, 0);
}

#[test]
fn nv_write_chunks_to_buffer_max() {
    let mut f = fixture_with_buffer(16);
    let mut cb = TestCallbacks::default();
    f.ctx.provision(&mut cb).unwrap();
    f.ctx
        .create_nv(NOTE_PATH, "noda", Some(64), None, None, &mut cb)
        .unwrap();

    let data: Vec<u8> = (0u8..64).collect();
    f.ctx.nv_write(NOTE_PATH, &data, &mut cb).unwrap();
    assert_eq!(f.probe.borrow().nv_write_calls, 4);

    let read = f.ctx.nv_read(NOTE_PATH, &mut cb).unwrap();
    assert_eq!(read, data);
    assert_eq!(f.probe.borrow().nv_read_calls, 4);
}

#[test]
fn nv_write_beyond_declared_size_is_rejected() {
    let mut f = fixture();
    let mut cb = TestCallbacks::default();
    f.ctx.provision(&mut cb).unwrap();
    f.ctx
        .create_nv(NOTE_PATH, "noda", Some(64), None, None, &mut cb)
        .unwrap();

    let data = vec![1; 65];
    assert_eq!(
        f.ctx.nv_write(NOTE_PATH, &data, &mut cb),
        Err(Error::NvExceeded)
    );
    // The context is usable again after the failed command.
    f.ctx.nv_write(NOTE_PATH, &[1; 64], &mut cb).unwrap();
}

#[test]
fn nv_extend_known_vector() {
    let mut f = fixture();
    let mut cb = TestCallbacks::default();
    f.ctx.provision(&mut cb).unwrap();
    f.ctx
        .create_nv(EXTLOG_PATH, "pcr,noda", None, None, None, &mut cb)
        .unwrap();

    f.ctx
        .nv_extend(
            EXTLOG_PATH,
            b"abc",
            Some(serde_json::json!({"origin": "test"})),
            &mut cb,
        )
        .unwrap();

    // Stored value: H(0^32 || SHA-256("abc")).
    let inner = crypto::hash(HashAlg::Sha256, b"abc").unwrap();
    assert_eq!(
        hex::encode(&inner),
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
    let mut concat = vec![0u8; 32];
    concat.extend(&inner);
    let expected = crypto::hash(HashAlg::Sha256, &concat).unwrap();

    let index = 0x0180_0001;
    assert_eq!(f.probe.borrow().nv_data[&index], expected);

    // Exactly one event with recnum 1 was appended.
    let store = f.store.borrow();
    let record: serde_json::Value =
        serde_json::from_str(store.record("nv/Owner/extlog").unwrap()).unwrap();
    let log: serde_json::Value =
        serde_json::from_str(record["event_log"].as_str().unwrap()).unwrap();
    let events = log.as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["recnum"], 1);
    assert_eq!(events[0]["pcr"], index);
    assert_eq!(events[0]["digests"][0]["hash_alg"], "Sha256");
    assert_eq!(events[0]["digests"][0]["digest"], hex::encode(&inner));
    assert_eq!(events[0]["event"]["origin"], "test");
    assert_eq!(f.probe.borrow().extend_calls, 1);
}

#[test]
fn second_extend_increments_recnum() {
    let mut f = fixture();
    let mut cb = TestCallbacks::default();
    f.ctx.provision(&mut cb).unwrap();
    f.ctx
        .create_nv(EXTLOG_PATH, "pcr,noda", None, None, None, &mut cb)
        .unwrap();

    f.ctx.nv_extend(EXTLOG_PATH, b"abc", None, &mut cb).unwrap();
    f.ctx.nv_extend(EXTLOG_PATH, b"def", None, &mut cb).unwrap();

    let store = f.store.borrow();
    let record: serde_json::Value =
        serde_json::from_str(store.record("nv/Owner/extlog").unwrap()).unwrap();
    let log: serde_json::Value =
        serde_json::from_str(record["event_log"].as_str().unwrap()).unwrap();
    let events = log.as_array().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1]["recnum"], 2);
}

#[test]
fn oversized_extend_is_rejected() {
    let mut f = fixture();
    let mut cb = TestCallbacks::default();
    f.ctx.provision(&mut cb).unwrap();
    f.ctx
        .create_nv(EXTLOG_PATH, "pcr,noda", None, None, None, &mut cb)
        .unwrap();

    let data = vec![0xAA; 1024];
    assert_eq!(
        f.ctx.nv_extend(EXTLOG_PATH, &data, None, &mut cb),
        Err(Error::BadValue)
    );
}

#[test]
fn bad_auth_is_retried_with_prompted_password() {
    let mut f = fixture();
    let mut cb = TestCallbacks {
        password: Some("secret".to_string()),
        ..TestCallbacks::default()
    };
    f.ctx.provision(&mut cb).unwrap();
    f.ctx
        .create_nv(NOTE_PATH, "noda", Some(64), None, None, &mut cb)
        .unwrap();

    // The TPM side wants an auth value the record knows nothing about.
    f.probe
        .borrow_mut()
        .expected_nv_auth
        .insert(0x0180_0001, b"secret".to_vec());

    f.ctx.nv_write(NOTE_PATH, &[7; 64], &mut cb).unwrap();
    assert_eq!(*cb.auth_prompts.borrow(), 1);
}

#[test]
fn second_async_while_in_flight_is_bad_sequence() {
    let mut f = fixture();
    let mut cb = TestCallbacks::default();
    f.ctx.provision(&mut cb).unwrap();
    f.ctx
        .create_nv(NOTE_PATH, "noda", Some(64), None, None, &mut cb)
        .unwrap();

    f.ctx.nv_write_async(NOTE_PATH, &[3; 64]).unwrap();
    assert_eq!(f.ctx.nv_read_async(NOTE_PATH), Err(Error::BadSequence));
    assert!(f.ctx.busy());

    // The in-flight write still runs to completion.
    loop {
        match f.ctx.nv_write_finish(&mut cb) {
            Err(Error::TryAgain) => {}
            other => {
                other.unwrap();
                break;
            }
        }
    }
    assert!(!f.ctx.busy());
    assert_eq!(f.ctx.nv_read(NOTE_PATH, &mut cb).unwrap(), vec![3; 64]);
}

#[test]
fn repeated_finish_in_suspension_returns_try_again() {
    let mut f = fixture();
    let mut cb = TestCallbacks::default();
    f.ctx.provision(&mut cb).unwrap();
    f.ctx
        .create_nv(NOTE_PATH, "noda", Some(64), None, None, &mut cb)
        .unwrap();

    // Stall the keystore so the command parks in a suspension state.
    f.store.borrow_mut().set_stutter(3);
    f.ctx.nv_write_async(NOTE_PATH, &[9; 64]).unwrap();
    assert_eq!(f.ctx.nv_write_finish(&mut cb), Err(Error::TryAgain));
    assert_eq!(f.ctx.nv_write_finish(&mut cb), Err(Error::TryAgain));
    f.store.borrow_mut().set_stutter(0);
    loop {
        match f.ctx.nv_write_finish(&mut cb) {
            Err(Error::TryAgain) => {}
            other => {
                other.unwrap();
                break;
            }
        }
    }
}

#[test]
fn handles_are_flushed_after_commands() {
    let mut f = fixture();
    let mut cb = TestCallbacks::default();
    f.ctx.provision(&mut cb).unwrap();
    f.ctx
        .create_nv(NOTE_PATH, "noda", Some(64), None, None, &mut cb)
        .unwrap();
    f.ctx.nv_write(NOTE_PATH, &[5; 64], &mut cb).unwrap();
    assert_eq!(f.probe.borrow().live_handles, 0);
}
