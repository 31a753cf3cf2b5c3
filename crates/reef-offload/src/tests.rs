//! End-to-end scenarios for the reef-offload crate.

use std::sync::Arc;
use std::time::Duration;

use crate::channel::{MockChannel, MockReply};
use crate::config::{CodingConfiguration, ConfigTable, OffloadConfig, keys};
use crate::engine::OffloadEngine;
use crate::error::{ChannelError, CoderError};
use crate::policy::FallbackPolicy;
use crate::software::{ReedSolomonCoder, SoftwareCoder};
use crate::{OffloadDecoder, OffloadEncoder};

const CELL_512K: usize = 512 * 1024;
const TIMEOUT: Duration = Duration::from_secs(5);

/// Generate deterministic, non-repeating test data.
fn test_data(size: usize, seed: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity(size);
    let mut state: u32 = 0xDEAD_BEEF ^ seed;
    for _ in 0..size {
        state = state.wrapping_mul(1103515245).wrapping_add(12345);
        data.push((state >> 16) as u8);
    }
    data
}

fn coding(k: usize, p: usize) -> CodingConfiguration {
    CodingConfiguration::new(k, p).unwrap()
}

fn software(k: usize, p: usize) -> Arc<dyn SoftwareCoder> {
    Arc::new(ReedSolomonCoder::new(k, p))
}

/// All `k + p` units of a stripe of random data.
fn stripe(k: usize, p: usize, cell_length: usize) -> Vec<Vec<u8>> {
    let data: Vec<Vec<u8>> = (0..k).map(|i| test_data(cell_length, i as u32)).collect();
    let mut parity = vec![vec![0u8; cell_length]; p];
    let inputs: Vec<&[u8]> = data.iter().map(Vec::as_slice).collect();
    let mut outs: Vec<&mut [u8]> = parity.iter_mut().map(Vec::as_mut_slice).collect();
    ReedSolomonCoder::new(k, p).encode(&inputs, &mut outs).unwrap();
    data.into_iter().chain(parity).collect()
}

fn without(units: &[Vec<u8>], missing: &[usize]) -> Vec<Option<Vec<u8>>> {
    units
        .iter()
        .enumerate()
        .map(|(i, u)| (!missing.contains(&i)).then(|| u.clone()))
        .collect()
}

fn as_inputs(units: &[Option<Vec<u8>>]) -> Vec<Option<&[u8]>> {
    units.iter().map(|u| u.as_deref()).collect()
}

// -----------------------------------------------------------------------
// Encode
// -----------------------------------------------------------------------

#[tokio::test]
#[ntest::timeout(30000)]
async fn test_encode_offloaded_through_mock() {
    let mock = MockChannel::new(MockReply::ParityPrefix { parity_units: 2 });
    let stats = mock.stats();
    let mut encoder = OffloadEncoder::with_channel(coding(3, 2), Box::new(mock), TIMEOUT, software(3, 2));
    assert!(encoder.policy().should_offload(CELL_512K));

    let data: Vec<Vec<u8>> = (0..3).map(|i| test_data(CELL_512K, i)).collect();
    let inputs: Vec<&[u8]> = data.iter().map(Vec::as_slice).collect();
    let mut parity = vec![vec![0xaau8; CELL_512K]; 2];
    let mut outs: Vec<&mut [u8]> = parity.iter_mut().map(Vec::as_mut_slice).collect();

    encoder.encode(&inputs, &mut outs).await.unwrap();
    // The mock answers with the leading cells of the packed input.
    assert_eq!(parity[0], data[0]);
    assert_eq!(parity[1], data[1]);
    assert_eq!((stats.sends(), stats.receives()), (1, 1));
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn test_encode_compute_mock_matches_software() {
    let engine = OffloadEngine::new(coding(6, 3));
    let mut encoder = OffloadEncoder::with_channel(
        coding(6, 3),
        Box::new(MockChannel::new(MockReply::Compute(engine))),
        TIMEOUT,
        software(6, 3),
    );

    let cell = 256 * 1024;
    let units = stripe(6, 3, cell);
    let inputs: Vec<&[u8]> = units[..6].iter().map(Vec::as_slice).collect();
    let mut parity = vec![vec![0u8; cell]; 3];
    let mut outs: Vec<&mut [u8]> = parity.iter_mut().map(Vec::as_mut_slice).collect();
    encoder.encode(&inputs, &mut outs).await.unwrap();
    assert_eq!(parity.as_slice(), &units[6..]);
}

#[tokio::test]
async fn test_below_threshold_never_touches_channel() {
    let mock = MockChannel::loopback();
    let stats = mock.stats();
    let mut encoder = OffloadEncoder::with_channel(coding(3, 2), Box::new(mock), TIMEOUT, software(3, 2));

    // Aligned but under 512 KiB, then over but misaligned.
    for cell in [4096, CELL_512K + 2] {
        let units = stripe(3, 2, cell);
        let inputs: Vec<&[u8]> = units[..3].iter().map(Vec::as_slice).collect();
        let mut parity = vec![vec![0u8; cell]; 2];
        let mut outs: Vec<&mut [u8]> = parity.iter_mut().map(Vec::as_mut_slice).collect();
        encoder.encode(&inputs, &mut outs).await.unwrap();
        assert_eq!(parity.as_slice(), &units[3..]);
    }
    assert_eq!(stats.calls(), 0);
}

#[tokio::test]
async fn test_disabled_offload_codes_locally() {
    let table = ConfigTable::new()
        .with(keys::ENABLED, false)
        .with(keys::RECEIVE_TIMEOUT_MILLIS, 100i64);
    let config = OffloadConfig::from_source(&table).unwrap();
    let mut encoder = OffloadEncoder::new(coding(3, 2), &config, software(3, 2))
        .await
        .unwrap();
    assert_eq!(encoder.endpoint(), None);
    assert!(!encoder.policy().should_offload(CELL_512K));

    let units = stripe(3, 2, CELL_512K);
    let inputs: Vec<&[u8]> = units[..3].iter().map(Vec::as_slice).collect();
    let mut parity = vec![vec![0u8; CELL_512K]; 2];
    let mut outs: Vec<&mut [u8]> = parity.iter_mut().map(Vec::as_mut_slice).collect();
    encoder.encode(&inputs, &mut outs).await.unwrap();
    assert_eq!(parity.as_slice(), &units[3..]);
}

#[tokio::test]
async fn test_mock_mode_from_config() {
    let table = ConfigTable::new().with(keys::MOCK, true);
    let config = OffloadConfig::from_source(&table).unwrap();
    let encoder = OffloadEncoder::new(coding(3, 2), &config, software(3, 2))
        .await
        .unwrap();
    assert_eq!(encoder.endpoint(), Some("mock"));
}

// -----------------------------------------------------------------------
// Decode
// -----------------------------------------------------------------------

#[tokio::test]
#[ntest::timeout(30000)]
async fn test_decode_single_erasure_loopback() {
    let units = stripe(3, 2, CELL_512K);

    for erased in 0..5 {
        let mut decoder = OffloadDecoder::with_channel(
            coding(3, 2),
            Box::new(MockChannel::loopback()),
            TIMEOUT,
            software(3, 2),
        );
        let present = without(&units, &[erased]);
        let inputs = as_inputs(&present);
        let valid: Vec<usize> = (0..5).filter(|&i| i != erased).collect();

        let mut out = vec![0u8; CELL_512K];
        let mut outs = vec![out.as_mut_slice()];
        decoder.decode(&inputs, &[erased], &mut outs).await.unwrap();
        // Loopback returns the first selected input.
        assert_eq!(out, units[valid[0]], "erased unit {erased}");
    }
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn test_decode_single_erasure_recovers_content() {
    let units = stripe(3, 2, CELL_512K);
    let mock = MockChannel::new(MockReply::Compute(OffloadEngine::new(coding(3, 2))));
    let stats = mock.stats();
    let mut decoder = OffloadDecoder::with_channel(coding(3, 2), Box::new(mock), TIMEOUT, software(3, 2));

    for erased in 0..5 {
        let present = without(&units, &[erased]);
        let inputs = as_inputs(&present);
        let mut out = vec![0u8; CELL_512K];
        let mut outs = vec![out.as_mut_slice()];
        decoder.decode(&inputs, &[erased], &mut outs).await.unwrap();
        assert_eq!(out, units[erased], "erased unit {erased}");
    }
    assert_eq!(stats.sends(), 5);
}

#[tokio::test]
#[ntest::timeout(30000)]
async fn test_decode_double_erasure_in_caller_order() {
    let cell = 256 * 1024;
    let units = stripe(6, 3, cell);
    let mut decoder = OffloadDecoder::with_channel(
        coding(6, 3),
        Box::new(MockChannel::new(MockReply::Compute(OffloadEngine::new(coding(6, 3))))),
        TIMEOUT,
        software(6, 3),
    );

    for erased in [[7, 2], [0, 8], [5, 4]] {
        let present = without(&units, &erased);
        let inputs = as_inputs(&present);
        let mut first = vec![0u8; cell];
        let mut second = vec![0u8; cell];
        let mut outs = vec![first.as_mut_slice(), second.as_mut_slice()];
        decoder.decode(&inputs, &erased, &mut outs).await.unwrap();
        assert_eq!(first, units[erased[0]], "erased {erased:?}");
        assert_eq!(second, units[erased[1]], "erased {erased:?}");
    }
}

#[tokio::test]
async fn test_decode_too_few_units_is_invalid_state() {
    let units = stripe(3, 2, CELL_512K);
    let mock = MockChannel::loopback();
    let stats = mock.stats();
    let mut decoder = OffloadDecoder::with_channel(coding(3, 2), Box::new(mock), TIMEOUT, software(3, 2));

    let present = without(&units, &[0, 1, 4]);
    let inputs = as_inputs(&present);
    let mut a = vec![0u8; CELL_512K];
    let mut b = vec![0u8; CELL_512K];
    let mut c = vec![0u8; CELL_512K];
    let mut outs = vec![a.as_mut_slice(), b.as_mut_slice(), c.as_mut_slice()];
    let err = decoder.decode(&inputs, &[0, 1, 4], &mut outs).await.unwrap_err();
    assert!(matches!(err, CoderError::InvalidState(_)), "got {err:?}");
    assert_eq!(stats.calls(), 0);
}

#[tokio::test]
async fn test_decode_below_threshold_uses_software() {
    let units = stripe(3, 2, 1024);
    let mock = MockChannel::loopback();
    let stats = mock.stats();
    let mut decoder = OffloadDecoder::with_channel(coding(3, 2), Box::new(mock), TIMEOUT, software(3, 2));

    let present = without(&units, &[1, 3]);
    let inputs = as_inputs(&present);
    let mut for_3 = vec![0u8; 1024];
    let mut for_1 = vec![0u8; 1024];
    let mut outs = vec![for_3.as_mut_slice(), for_1.as_mut_slice()];
    decoder.decode(&inputs, &[3, 1], &mut outs).await.unwrap();
    assert_eq!(for_1, units[1]);
    assert_eq!(for_3, units[3]);
    assert_eq!(stats.calls(), 0);
}

#[tokio::test]
async fn test_pattern_cache_reuse_and_invalidation() {
    let cell = 64;
    let units = stripe(3, 2, cell);
    let mut decoder = OffloadDecoder::with_channel(
        coding(3, 2),
        Box::new(MockChannel::new(MockReply::Compute(OffloadEngine::new(coding(3, 2))))),
        TIMEOUT,
        software(3, 2),
    )
    .with_policy(FallbackPolicy::with_threshold(64, true));

    assert_eq!(decode_one(&mut decoder, &units, &[2], 2).await, 0);
    assert_eq!(decode_one(&mut decoder, &units, &[2], 2).await, 1);
    // Same erasure, different missing set: a new key.
    assert_eq!(decode_one(&mut decoder, &units, &[2, 4], 2).await, 1);
    assert_eq!(decode_one(&mut decoder, &units, &[2, 4], 2).await, 2);
    assert_eq!(decode_one(&mut decoder, &units, &[0], 0).await, 2);
}

/// Decode one erased unit and return the decoder's cache hit count.
async fn decode_one(
    decoder: &mut OffloadDecoder,
    units: &[Vec<u8>],
    missing: &[usize],
    erased: usize,
) -> u64 {
    let present = without(units, missing);
    let inputs = as_inputs(&present);
    let mut out = vec![0u8; units[0].len()];
    let mut outs = vec![out.as_mut_slice()];
    decoder.decode(&inputs, &[erased], &mut outs).await.unwrap();
    assert_eq!(out, units[erased]);
    decoder.pattern_cache_hits()
}

// -----------------------------------------------------------------------
// Channel failures
// -----------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_timeout_surfaces_and_outputs_are_cleared() {
    let mut encoder = OffloadEncoder::with_channel(
        coding(3, 2),
        Box::new(MockChannel::new(MockReply::Silent)),
        Duration::from_millis(500),
        software(3, 2),
    )
    .with_policy(FallbackPolicy::with_threshold(64, true));

    let data: Vec<Vec<u8>> = (0..3).map(|i| test_data(64, i)).collect();
    let inputs: Vec<&[u8]> = data.iter().map(Vec::as_slice).collect();
    let mut parity = vec![vec![0xffu8; 64]; 2];
    let mut outs: Vec<&mut [u8]> = parity.iter_mut().map(Vec::as_mut_slice).collect();

    for _ in 0..2 {
        let err = encoder.encode(&inputs, &mut outs).await.unwrap_err();
        assert!(
            matches!(err, CoderError::Channel(ChannelError::Timeout(t)) if t == Duration::from_millis(500)),
            "got {err:?}"
        );
    }
    drop(outs);
    assert!(parity.iter().all(|cell| cell.iter().all(|&b| b == 0)));
}

#[tokio::test]
async fn test_disconnected_channel_fails_call() {
    let mut encoder = OffloadEncoder::with_channel(
        coding(3, 2),
        Box::new(MockChannel::new(MockReply::Disconnected)),
        TIMEOUT,
        software(3, 2),
    )
    .with_policy(FallbackPolicy::with_threshold(64, true));

    let data = [vec![1u8; 64], vec![2u8; 64], vec![3u8; 64]];
    let inputs: Vec<&[u8]> = data.iter().map(Vec::as_slice).collect();
    let mut parity = vec![vec![0u8; 64]; 2];
    let mut outs: Vec<&mut [u8]> = parity.iter_mut().map(Vec::as_mut_slice).collect();
    assert!(matches!(
        encoder.encode(&inputs, &mut outs).await,
        Err(CoderError::Channel(ChannelError::NotConnected(_)))
    ));
}

#[tokio::test]
async fn test_short_reply() {
    // One cell back where two are needed.
    let mut encoder = OffloadEncoder::with_channel(
        coding(3, 2),
        Box::new(MockChannel::new(MockReply::ParityPrefix { parity_units: 1 })),
        TIMEOUT,
        software(3, 2),
    )
    .with_policy(FallbackPolicy::with_threshold(64, true));

    let data = [vec![1u8; 64], vec![2u8; 64], vec![3u8; 64]];
    let inputs: Vec<&[u8]> = data.iter().map(Vec::as_slice).collect();
    let mut parity = vec![vec![0u8; 64]; 2];
    let mut outs: Vec<&mut [u8]> = parity.iter_mut().map(Vec::as_mut_slice).collect();
    match encoder.encode(&inputs, &mut outs).await {
        Err(CoderError::ShortReply { expected, got }) => assert_eq!((expected, got), (128, 64)),
        other => panic!("expected ShortReply, got {other:?}"),
    }
}

#[test]
fn test_unsupported_configuration_rejected() {
    assert!(CodingConfiguration::new(10, 4).is_err());
    assert!(CodingConfiguration::new(14, 4).is_err());
}
