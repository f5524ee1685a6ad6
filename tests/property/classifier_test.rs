// tests/property/classifier_test.rs

//! Properties of first-byte classification.

use pmproxy::core::protocol::{
    HTTP_METHOD_INITIALS, PCP_MARKER, Protocol, RESP_SIGILS, TLS_RECORD_TYPES, classify,
};
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 512,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_classify_agrees_with_marker_sets(byte in any::<u8>()) {
        let expected = if byte == PCP_MARKER {
            Some(Protocol::PCP)
        } else if HTTP_METHOD_INITIALS.contains(&byte) {
            Some(Protocol::HTTP)
        } else if RESP_SIGILS.contains(&byte) {
            Some(Protocol::REDIS)
        } else if TLS_RECORD_TYPES.contains(&byte) {
            Some(Protocol::SECURE)
        } else {
            None
        };
        prop_assert_eq!(classify(byte), expected);
    }

    #[test]
    fn test_classify_yields_a_single_bit(byte in any::<u8>()) {
        if let Some(protocol) = classify(byte) {
            prop_assert_eq!(protocol.bits().count_ones(), 1);
        }
    }
}
