//! Property tests for local key custody and message rendering

use proptest::prelude::*;
use tempfile::TempDir;

use pqchat_crypto::{HybridCipher, Identity};

use crate::keystore::{FileSecretStorage, KeyStore};
use crate::session::{MessageBody, MessageView, UNDECRYPTABLE_PLACEHOLDER};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Any identity string maps to a key file directly inside the key directory.
    #[test]
    fn prop_key_files_stay_in_directory(name in "\\PC{1,64}") {
        prop_assume!(!name.trim().is_empty());
        let identity = Identity::parse(name).unwrap();
        let temp = TempDir::new().unwrap();
        let store = KeyStore::new(
            FileSecretStorage::new(temp.path().to_path_buf()),
            HybridCipher::default_suite(),
        );

        store.generate(&identity).unwrap();
        prop_assert!(store.has_key(&identity));

        let entries: Vec<_> = std::fs::read_dir(temp.path()).unwrap().collect();
        prop_assert_eq!(entries.len(), 1);
    }

    /// Import only accepts artifacts of the configured secret key length.
    #[test]
    fn prop_import_rejects_wrong_length(len in 0usize..4096) {
        let store = KeyStore::ephemeral(HybridCipher::default_suite());
        let expected = store.cipher().kem().secret_key_len();
        prop_assume!(len != expected);

        let alice = Identity::parse("alice").unwrap();
        let artifact = pqchat_crypto::SecretKey::from_bytes(vec![7u8; len]).to_base64();
        prop_assert!(store.import(&alice, &artifact).is_err());
        prop_assert!(!store.has_key(&alice));
    }

    /// Text bodies render verbatim; only undecryptable bodies use the placeholder.
    #[test]
    fn prop_display_text(text in "\\PC{0,128}") {
        let view = MessageView {
            id: uuid::Uuid::nil(),
            sender: Identity::parse("alice").unwrap(),
            receiver: Identity::parse("bob").unwrap(),
            timestamp: chrono::Utc::now(),
            outgoing: false,
            body: MessageBody::Text(text.clone()),
        };
        prop_assert_eq!(view.display_text(), text.as_str());

        let hidden = MessageView { body: MessageBody::Undecryptable, ..view };
        prop_assert_eq!(hidden.display_text(), UNDECRYPTABLE_PLACEHOLDER);
    }
}
