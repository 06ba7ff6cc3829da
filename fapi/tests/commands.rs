// SPDX-License-Identifier: MIT

//! Command-surface integration: provisioning, descriptions, app data,
//! signing, symmetric encryption, randomness, capability pagination and
//! certificate discovery.

mod common;

use common::{fixture, fixture_from, SoftTpm, TestCallbacks};
use tpm2_fapi::capability::{AlgProperty, CapabilityData};
use tpm2_fapi::error::Error;
use tpm2_fapi::types::Capability;

#[test]
fn provision_stores_primary_records() {
    let mut f = fixture();
    let mut cb = TestCallbacks::default();
    f.ctx.provision(&mut cb).unwrap();

    let store = f.store.borrow();
    assert!(store.record("P_RSA2048SHA256/HS/SRK").is_some());
    assert!(store.record("P_RSA2048SHA256/HE/EK").is_some());
    assert!(store.record("P_RSA2048SHA256/HS").is_some());
    drop(store);

    // Bare hierarchy paths resolve to the provisioned records.
    assert_eq!(f.ctx.get_description("/HS").unwrap(), None);

    assert_eq!(
        f.ctx.get_description("/HS/SRK").unwrap().as_deref(),
        Some("Storage root key")
    );
    assert_eq!(f.probe.borrow().live_handles, 0);
}

#[test]
fn set_then_get_description() {
    let mut f = fixture();
    let mut cb = TestCallbacks::default();
    f.ctx.provision(&mut cb).unwrap();
    f.ctx
        .create_key("/HS/SRK/signing", "sign", None, None, &mut cb)
        .unwrap();

    assert_eq!(f.ctx.get_description("/HS/SRK/signing").unwrap(), None);
    f.ctx
        .set_description("/HS/SRK/signing", Some("my key"))
        .unwrap();
    assert_eq!(
        f.ctx.get_description("/HS/SRK/signing").unwrap().as_deref(),
        Some("my key")
    );
}

#[test]
fn set_then_get_app_data() {
    let mut f = fixture();
    let mut cb = TestCallbacks::default();
    f.ctx.provision(&mut cb).unwrap();
    f.ctx
        .create_key("/HS/SRK/signing", "sign", None, None, &mut cb)
        .unwrap();

    let blob = vec![0xDE, 0xAD, 0xBE, 0xEF];
    f.ctx.set_app_data("/HS/SRK/signing", Some(&blob)).unwrap();
    assert_eq!(
        f.ctx.get_app_data("/HS/SRK/signing").unwrap(),
        Some(blob)
    );

    f.ctx.set_app_data("/HS/SRK/signing", None).unwrap();
    assert_eq!(f.ctx.get_app_data("/HS/SRK/signing").unwrap(), None);
}

#[test]
fn sign_with_created_key() {
    let mut f = fixture();
    let mut cb = TestCallbacks::default();
    f.ctx.provision(&mut cb).unwrap();
    f.ctx
        .create_key("/HS/SRK/signing", "sign,noda", None, None, &mut cb)
        .unwrap();

    let digest = [0x42; 32];
    let signature = f.ctx.sign("/HS/SRK/signing", &digest, &mut cb).unwrap();
    assert_eq!(&signature[..4], b"sig:");
    assert_eq!(&signature[4..], &digest[..]);
    assert_eq!(f.probe.borrow().sign_calls, 1);
    assert_eq!(f.probe.borrow().live_handles, 0);
}

#[test]
fn sign_rejects_mismatched_digest_size() {
    let mut f = fixture();
    let mut cb = TestCallbacks::default();
    f.ctx.provision(&mut cb).unwrap();
    f.ctx
        .create_key("/HS/SRK/signing", "sign", None, None, &mut cb)
        .unwrap();

    assert_eq!(
        f.ctx.sign("/HS/SRK/signing", &[0x42; 20], &mut cb),
        Err(Error::BadValue)
    );
    assert!(!f.ctx.busy());
}

#[test]
fn create_key_rejects_long_password() {
    let mut f = fixture();
    let long = "x".repeat(65);
    assert_eq!(
        f.ctx
            .create_key_async("/HS/SRK/k", "sign", None, Some(&long)),
        Err(Error::BadValue)
    );
    assert!(!f.ctx.busy());
}

#[test]
fn encrypt_decrypt_round_trip() {
    let mut f = fixture();
    let mut cb = TestCallbacks::default();
    f.ctx.provision(&mut cb).unwrap();
    f.ctx
        .create_key("/HS/SRK/symkey", "decrypt", None, None, &mut cb)
        .unwrap();

    let plain = b"attack at dawn".to_vec();
    let cipher = f.ctx.encrypt("/HS/SRK/symkey", &plain, &mut cb).unwrap();
    assert_ne!(cipher, plain);
    let back = f.ctx.decrypt("/HS/SRK/symkey", &cipher, &mut cb).unwrap();
    assert_eq!(back, plain);
}

#[test]
fn get_random_accumulates() {
    let mut f = fixture();
    let mut cb = TestCallbacks::default();
    f.ctx.provision(&mut cb).unwrap();

    let bytes = f.ctx.get_random(100, &mut cb).unwrap();
    assert_eq!(bytes.len(), 100);
    assert_eq!(f.ctx.get_random_async(0), Err(Error::BadValue));
}

#[test]
fn capability_pages_are_accumulated() {
    let (mut tpm, probe) = SoftTpm::new();
    tpm.cap_pages.push_back((
        true,
        CapabilityData::Algs(vec![
            AlgProperty {
                alg: 0x0001,
                properties: 0,
            },
            AlgProperty {
                alg: 0x0004,
                properties: 0,
            },
        ]),
    ));
    tpm.cap_pages.push_back((
        false,
        CapabilityData::Algs(vec![AlgProperty {
            alg: 0x000B,
            properties: 0,
        }]),
    ));
    let mut f = fixture_from(tpm, probe, 1024);

    let data = f.ctx.get_info(Capability::Algs, 0, 10).unwrap();
    let CapabilityData::Algs(algs) = data else {
        panic!("wrong capability kind");
    };
    assert_eq!(algs.len(), 3);
    assert_eq!(algs[2].alg, 0x000B);
}

#[test]
fn full_accumulator_stops_despite_more_data() {
    let (mut tpm, probe) = SoftTpm::new();
    tpm.cap_pages.push_back((
        true,
        CapabilityData::Algs(vec![
            AlgProperty {
                alg: 0x0001,
                properties: 0,
            },
            AlgProperty {
                alg: 0x0004,
                properties: 0,
            },
        ]),
    ));
    let mut f = fixture_from(tpm, probe, 1024);

    // Two entries satisfy the request even though the TPM reports more.
    let data = f.ctx.get_info(Capability::Algs, 0, 2).unwrap();
    let CapabilityData::Algs(algs) = data else {
        panic!("wrong capability kind");
    };
    assert_eq!(algs.len(), 2);
}

#[test]
fn certificates_are_discovered_in_the_reserved_range() {
    let mut f = fixture();
    let mut cb = TestCallbacks::default();
    f.ctx.provision(&mut cb).unwrap();

    // A certificate blob in the TCG range, padded to the NV size.
    f.ctx
        .create_nv(
            "/nv/Endorsement_Certificate/cert0",
            "noda",
            Some(32),
            None,
            None,
            &mut cb,
        )
        .unwrap();
    let mut cert = b"-----CERT-----".to_vec();
    cert.resize(32, 0);
    f.ctx
        .nv_write("/nv/Endorsement_Certificate/cert0", &cert, &mut cb)
        .unwrap();

    let certs = f.ctx.get_certificates(&mut cb).unwrap();
    assert_eq!(certs.len(), 1);
    assert_eq!(certs[0], cert);
}

#[test]
fn finish_without_matching_command_is_bad_sequence() {
    let mut f = fixture();
    let mut cb = TestCallbacks::default();
    assert_eq!(f.ctx.get_description_finish(), Err(Error::BadSequence));
    assert_eq!(f.ctx.nv_write_finish(&mut cb), Err(Error::BadSequence));

    f.ctx.provision(&mut cb).unwrap();
    f.ctx.get_description_async("/HS/SRK").unwrap();
    // A finish of a different command does not disturb the running one.
    assert_eq!(f.ctx.nv_write_finish(&mut cb), Err(Error::BadSequence));
    f.ctx.get_description_finish().unwrap();
}
