//! Property-based codec tests.
//!
//! Uses proptest to verify:
//! 1. Random text never causes a panic in `decode_server` (returns `Err` gracefully).
//! 2. Any server-issued message id survives the wire boundary as a confirmed id,
//!    while any provisional id keeps its discriminant.
//! 3. Timestamps decode identically from integer and RFC 3339 form.

use haggle_proto::codec;
use haggle_proto::message::{MessageId, ProvisionalId, Timestamp};
use proptest::prelude::*;
use uuid::Uuid;

proptest! {
    #[test]
    fn decode_server_never_panics(text in ".{0,512}") {
        let _ = codec::decode_server(&text);
    }

    #[test]
    fn decode_server_never_panics_on_framed_noise(
        event in "[a-z_]{1,24}",
        data in ".{0,128}",
    ) {
        let text = format!(r#"{{"event":"{event}","data":{data}}}"#);
        let _ = codec::decode_server(&text);
    }

    #[test]
    fn server_ids_are_confirmed(raw in "[0-9a-f]{8,24}") {
        prop_assert_eq!(MessageId::from_wire(&raw), MessageId::Confirmed(raw.clone()));
    }

    #[test]
    fn provisional_ids_keep_discriminant(n in any::<u128>()) {
        let id = ProvisionalId::from_uuid(Uuid::from_u128(n));
        prop_assert_eq!(MessageId::from_wire(&id.to_string()), MessageId::Provisional(id));
    }

    #[test]
    fn timestamps_decode_from_both_forms(secs in 0i64..4_000_000_000, millis in 0u32..1000) {
        let dt = chrono::DateTime::from_timestamp(secs, millis * 1_000_000).unwrap();
        let iso = format!("\"{}\"", dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true));
        let from_iso: Timestamp = serde_json::from_str(&iso).unwrap();
        let expected = u64::try_from(secs).unwrap() * 1000 + u64::from(millis);
        prop_assert_eq!(from_iso.as_millis(), expected);
        let from_int: Timestamp = serde_json::from_str(&expected.to_string()).unwrap();
        prop_assert_eq!(from_int, from_iso);
    }
}
