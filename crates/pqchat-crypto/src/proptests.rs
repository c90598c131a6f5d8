#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::aead::Nonce;
    use crate::envelope::build_envelope;
    use crate::hybrid::HybridCipher;
    use crate::identity::Identity;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn test_hybrid_round_trip(plaintext in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let cipher = HybridCipher::default_suite();
            let pair = cipher.kem().generate_keypair().unwrap();
            let sealed = cipher.encapsulate_and_seal(&pair.public_key, &plaintext).unwrap();
            let opened = cipher
                .open_sealed(&sealed.kem_ciphertext, &sealed.aead_ciphertext, &sealed.nonce, &pair.secret_key)
                .unwrap();
            prop_assert_eq!(opened.as_slice(), plaintext.as_slice());
        }

        #[test]
        fn test_flipped_aead_bit_is_rejected(
            plaintext in proptest::collection::vec(any::<u8>(), 1..256),
            position in any::<usize>(),
            bit in 0u8..8,
        ) {
            let cipher = HybridCipher::default_suite();
            let pair = cipher.kem().generate_keypair().unwrap();
            let sealed = cipher.encapsulate_and_seal(&pair.public_key, &plaintext).unwrap();

            let mut tampered = sealed.aead_ciphertext.clone();
            let index = position % tampered.len();
            tampered[index] ^= 1 << bit;

            let result = cipher.open_sealed(&sealed.kem_ciphertext, &tampered, &sealed.nonce, &pair.secret_key);
            prop_assert!(result.is_err());
            prop_assert!(result.unwrap_err().is_undecryptable());
        }

        #[test]
        fn test_flipped_kem_bit_is_rejected(
            plaintext in proptest::collection::vec(any::<u8>(), 1..256),
            position in any::<usize>(),
            bit in 0u8..8,
        ) {
            let cipher = HybridCipher::default_suite();
            let pair = cipher.kem().generate_keypair().unwrap();
            let sealed = cipher.encapsulate_and_seal(&pair.public_key, &plaintext).unwrap();

            let mut tampered = sealed.kem_ciphertext.clone();
            let index = position % tampered.len();
            tampered[index] ^= 1 << bit;

            let result = cipher.open_sealed(&tampered, &sealed.aead_ciphertext, &sealed.nonce, &pair.secret_key);
            prop_assert!(result.is_err());
        }

        #[test]
        fn test_flipped_nonce_bit_is_rejected(position in 0usize..12, bit in 0u8..8) {
            let cipher = HybridCipher::default_suite();
            let pair = cipher.kem().generate_keypair().unwrap();
            let sealed = cipher.encapsulate_and_seal(&pair.public_key, b"hello").unwrap();

            let mut bytes = *sealed.nonce.as_bytes();
            bytes[position] ^= 1 << bit;
            let nonce = Nonce::from_bytes(bytes);

            let result = cipher.open_sealed(&sealed.kem_ciphertext, &sealed.aead_ciphertext, &nonce, &pair.secret_key);
            prop_assert!(result.is_err());
        }

        #[test]
        fn test_envelope_copies_open_for_both_parties(text in "\\PC{0,200}") {
            let cipher = HybridCipher::default_suite();
            let alice = Identity::parse("alice").unwrap();
            let bob = Identity::parse("bob").unwrap();
            let ka = cipher.kem().generate_keypair().unwrap();
            let kb = cipher.kem().generate_keypair().unwrap();

            let env = build_envelope(&cipher, &alice, &bob, text.as_bytes(), &ka.public_key, &kb.public_key).unwrap();
            let for_bob = env.open_for(&cipher, &bob, &kb.secret_key).unwrap();
            prop_assert_eq!(for_bob.as_slice(), text.as_bytes());
            let for_alice = env.open_for(&cipher, &alice, &ka.secret_key).unwrap();
            prop_assert_eq!(for_alice.as_slice(), text.as_bytes());
        }
    }
}
