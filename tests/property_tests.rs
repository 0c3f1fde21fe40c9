use bb84_protocol::{
    Basis, MessageHeader, MessageType,
    core::{
        crypto::cipher::{bits_to_hex, hex_to_bits, text_to_bits, xor_bits, bits_to_text},
        message::{Envelope, Frame, WireMessage, payload::SampleBits},
        quantum::{
            photon,
            reconciliation::{extract_key_bits, find_matching_positions, remove_sample_bits, sample_positions},
        },
    },
};
use proptest::prelude::*;
use rand::{SeedableRng, rngs::StdRng};

// Strategy for generating message types
fn message_types() -> impl Strategy<Value = MessageType> {
    prop_oneof![
        Just(MessageType::Chat),
        Just(MessageType::ExchangeInit),
        Just(MessageType::PhotonBatch),
        Just(MessageType::BasisBatch),
        Just(MessageType::MatchPositions),
        Just(MessageType::SampleBits),
        Just(MessageType::KeyComplete),
        Just(MessageType::Abort),
        Just(MessageType::KeyRotateRequest),
        Just(MessageType::EveToggle),
        Just(MessageType::Disconnect),
        Just(MessageType::Error)
    ]
}

// Strategy for generating bit sequences
fn bits(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(0u8..=1, 0..max_len)
}

// Strategy for generating equal-length basis pairs
fn basis_pairs() -> impl Strategy<Value = (Vec<Basis>, Vec<Basis>)> {
    prop::collection::vec((any::<bool>(), any::<bool>()), 0..256).prop_map(|pairs| {
        let to_basis = |diagonal: bool| if diagonal { Basis::Diagonal } else { Basis::Rectilinear };
        pairs.into_iter().map(|(a, b)| (to_basis(a), to_basis(b))).unzip()
    })
}

proptest! {
    #[test]
    fn test_header_round_trip(msg_type in message_types(), len in any::<u32>(), seq in any::<i32>()) {
        let header = MessageHeader::new(msg_type, len, seq);
        prop_assert_eq!(MessageHeader::from_bytes(&header.to_bytes()).unwrap(), header);
    }

    #[test]
    fn test_unknown_types_rejected(tag in any::<u8>()) {
        let bytes = [tag, 0, 0, 0, 0, 0, 0, 0, 1];
        prop_assert_eq!(MessageHeader::from_bytes(&bytes).is_ok(), MessageType::from_u8(tag).is_some());
    }

    #[test]
    fn test_frame_survives_the_wire(sample in bits(512), seq in 1i32..i32::MAX) {
        let message = WireMessage::SampleBits(SampleBits { exchange_id: "e".into(), bits: sample });
        let mut wire = Vec::new();
        message.to_frame(seq, 1 << 20).unwrap().write(&mut wire).unwrap();

        let frame = Frame::read(&mut wire.as_slice(), 1 << 20).unwrap();
        let envelope = Envelope::from_frame(&frame).unwrap();
        prop_assert_eq!(envelope.sequence, seq);
        prop_assert_eq!(envelope.message, message);
    }

    #[test]
    fn test_matching_positions_are_exact((a, b) in basis_pairs()) {
        let positions = find_matching_positions(&a, &b).unwrap();
        prop_assert!(positions.windows(2).all(|w| w[0] < w[1]));
        prop_assert_eq!(positions.len(), a.iter().zip(&b).filter(|(x, y)| x == y).count());
        prop_assert!(positions.iter().all(|&i| a[i] == b[i]));
    }

    #[test]
    fn test_same_basis_keys_agree(sent in bits(256), seed in any::<u64>()) {
        let mut rng = StdRng::seed_from_u64(seed);
        let bases = photon::random_bases_with(sent.len(), &mut rng);
        let photons = photon::encode_all(&sent, &bases).unwrap();
        let measured = photon::measure_all_with(&photons, &bases, &mut rng).unwrap();
        prop_assert_eq!(measured, sent);
    }

    #[test]
    fn test_sampling_invariants(key in bits(300), fraction in 0.01f64..0.99, seed in any::<u64>()) {
        let mut rng = StdRng::seed_from_u64(seed);
        let positions = sample_positions(key.len(), fraction, &mut rng);

        let expected = if key.is_empty() { 0 } else { ((key.len() as f64 * fraction).floor() as usize).clamp(1, key.len()) };
        prop_assert_eq!(positions.len(), expected);
        prop_assert!(positions.windows(2).all(|w| w[0] < w[1]));

        let sample = extract_key_bits(&key, &positions).unwrap();
        let rest = remove_sample_bits(&key, &positions);
        prop_assert_eq!(sample.len() + rest.len(), key.len());
    }

    #[test]
    fn test_pad_round_trip(text in ".{0,64}", pad_seed in any::<u64>()) {
        let message = text_to_bits(&text);
        let mut rng = StdRng::seed_from_u64(pad_seed);
        let pad = photon::random_bits_with(message.len(), &mut rng);

        let ciphertext = hex_to_bits(&bits_to_hex(&xor_bits(&message, &pad))).unwrap();
        prop_assert_eq!(bits_to_text(&xor_bits(&ciphertext, &pad)).unwrap(), text);
    }
}
