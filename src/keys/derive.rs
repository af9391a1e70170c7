//! Key derivation pipeline.
//!
//! ```text
//! secure_boot_key ─┐
//! tsec_key ────────┴─> keyblob_key_XX ─> keyblob_XX ─> master_kek_XX (0..5)
//! tsec_root_key ──────────────────────────────────────> master_kek_XX (6..)
//! mariko_kek ─────────────────────────────────────────> master_kek_XX (fallback)
//!                                    master_kek_XX ─> master_key_XX
//! master_key_XX ─> key_area_key_*_XX, titlekek_XX, package2_key_XX
//! master_key_00 ─> header_key, sd_card_*_key
//! keyblob_key_00 ─> device_key ─> save_mac_key, bis_key_XX
//! ```
//!
//! Every stage only runs when all of its inputs are known, and writes its
//! output slot in a single assignment. Running [`KeySet::derive_keys`] again
//! after importing more keys fills in whatever became derivable.
//!
//! A legacy keyblob whose CMAC does not match is still decrypted and used;
//! the mismatch is only logged. This mirrors how homebrew tooling treats
//! test-signed keyblobs.

use super::{AesKey, AesXtsKey, KEYBLOB_GENERATIONS, KaekIndex, KeySet, Keyblob, MAX_KEY_GENERATION};
use crate::crypto::aes::{cmac, ctr_transform, ecb_decrypt_block};

/// `generate_kek` as used by the system's `GenerateAesKek`/`GenerateAesKey`
/// services.
///
/// ```text
/// kek    = ECB⁻¹(kek_seed) under key
/// srckek = ECB⁻¹(src) under kek
/// result = ECB⁻¹(key_seed) under srckek, or srckek without a key seed
/// ```
pub fn generate_kek(key: &[u8; 16], src: &[u8; 16], kek_seed: &[u8; 16], key_seed: Option<&[u8; 16]>) -> [u8; 16] {
    let kek = ecb_decrypt_block(key, kek_seed);
    let src_kek = ecb_decrypt_block(&kek, src);
    match key_seed {
        Some(seed) => ecb_decrypt_block(&src_kek, seed),
        None => src_kek,
    }
}

fn unwrap_xts_key(kek: &[u8; 16], src: &[u8; 32]) -> AesXtsKey {
    let mut out = [0u8; 32];
    let (lo, hi) = src.split_at(16);
    let (Ok(lo), Ok(hi)) = (<&[u8; 16]>::try_from(lo), <&[u8; 16]>::try_from(hi)) else {
        return AesXtsKey::default();
    };
    out[..16].copy_from_slice(&ecb_decrypt_block(kek, lo));
    out[16..].copy_from_slice(&ecb_decrypt_block(kek, hi));
    AesXtsKey::new(out)
}

fn known_count(keys: &[AesKey]) -> usize {
    keys.iter().filter(|k| !k.is_empty()).count()
}

impl KeySet {
    /// Run the whole derivation pipeline.
    pub fn derive_keys(&mut self) {
        self.derive_keyblob_keys();
        self.decrypt_keyblobs();
        self.derive_master_keks();
        self.derive_master_keys();
        self.derive_per_console_keys();
        self.derive_per_generation_keys();
        self.derive_header_key();
        self.derive_sd_card_keys();

        tracing::debug!(
            master_keys = known_count(&self.master_keys),
            titlekeks = known_count(&self.titlekeks),
            header_key = !self.header_key.is_empty(),
            "derived keys"
        );
    }

    fn derive_keyblob_keys(&mut self) {
        let (Some(sbk), Some(tsec)) = (self.secure_boot_key.get(), self.tsec_key.get()) else {
            return;
        };
        for i in 0..KEYBLOB_GENERATIONS {
            let Some(src) = self.keyblob_key_sources[i].get() else {
                continue;
            };
            let key = ecb_decrypt_block(sbk, &ecb_decrypt_block(tsec, src));
            self.keyblob_keys[i] = AesKey::new(key);
            if let Some(mac_src) = self.keyblob_mac_key_source.get() {
                self.keyblob_mac_keys[i] = AesKey::new(ecb_decrypt_block(&key, mac_src));
            }
        }
    }

    fn decrypt_keyblobs(&mut self) {
        for i in 0..KEYBLOB_GENERATIONS {
            let (Some(key), Some(mac_key), Some(enc)) = (
                self.keyblob_keys[i].get(),
                self.keyblob_mac_keys[i].get(),
                self.encrypted_keyblobs[i].get(),
            ) else {
                continue;
            };

            let expected = &enc[..0x10];
            if cmac(mac_key, &enc[0x10..]) != *expected {
                tracing::warn!(generation = i, "keyblob MAC mismatch, using decrypted keyblob anyway");
            }

            let mut counter = [0u8; 16];
            counter.copy_from_slice(&enc[0x10..0x20]);
            let mut blob = [0u8; 0x90];
            blob.copy_from_slice(&enc[0x20..]);
            ctr_transform(key, &counter, &mut blob);
            self.keyblobs[i] = Keyblob::new(blob);
        }
    }

    fn derive_master_keks(&mut self) {
        for i in 0..KEYBLOB_GENERATIONS {
            let Some(blob) = self.keyblobs[i].get() else {
                continue;
            };
            let mut kek = [0u8; 16];
            kek.copy_from_slice(&blob[..0x10]);
            let mut package1_key = [0u8; 16];
            package1_key.copy_from_slice(&blob[0x80..0x90]);
            self.master_keks[i] = AesKey::new(kek);
            self.package1_keys[i] = AesKey::new(package1_key);
        }

        for i in KEYBLOB_GENERATIONS..MAX_KEY_GENERATION {
            let (Some(root), Some(src)) = (
                self.tsec_root_keys[i - KEYBLOB_GENERATIONS].get(),
                self.master_kek_sources[i].get(),
            ) else {
                continue;
            };
            self.master_keks[i] = AesKey::new(ecb_decrypt_block(root, src));
        }

        let Some(mariko_kek) = self.mariko_kek.get() else {
            return;
        };
        for i in 0..MAX_KEY_GENERATION {
            if !self.master_keks[i].is_empty() {
                continue;
            }
            if let Some(src) = self.mariko_master_kek_sources[i].get() {
                self.master_keks[i] = AesKey::new(ecb_decrypt_block(mariko_kek, src));
            }
        }
    }

    fn derive_master_keys(&mut self) {
        let Some(src) = self.master_key_source.get() else {
            return;
        };
        for i in 0..MAX_KEY_GENERATION {
            if let Some(kek) = self.master_keks[i].get() {
                self.master_keys[i] = AesKey::new(ecb_decrypt_block(kek, src));
            }
        }
    }

    fn derive_per_console_keys(&mut self) {
        if let (Some(src), Some(kb)) = (self.per_console_key_source.get(), self.keyblob_keys[0].get()) {
            self.device_key = AesKey::new(ecb_decrypt_block(kb, src));
        }

        let (Some(device_key), Some(kek_gen)) = (self.device_key.get(), self.aes_kek_generation_source.get()) else {
            return;
        };

        if let (Some(kek_src), Some(key_src)) = (self.save_mac_kek_source.get(), self.save_mac_key_source.get()) {
            let kek = generate_kek(device_key, kek_src, kek_gen, None);
            self.save_mac_key = AesKey::new(ecb_decrypt_block(&kek, key_src));
        }

        let (Some(bis_kek_src), Some(key_gen), Some(retail)) = (
            self.bis_kek_source.get(),
            self.aes_key_generation_source.get(),
            self.retail_specific_aes_key_source.get(),
        ) else {
            return;
        };

        // bis_key_source_03 is identical to _02 on retail units.
        let mut sources = self.bis_key_sources;
        if sources[3].is_empty() {
            sources[3] = sources[2];
        }

        let retail_kek = ecb_decrypt_block(device_key, retail);
        let bis_kek = generate_kek(device_key, bis_kek_src, kek_gen, Some(key_gen));
        for (i, src) in sources.iter().enumerate() {
            let Some(src) = src.get() else {
                continue;
            };
            let kek = if i == 0 { &retail_kek } else { &bis_kek };
            self.bis_keys[i] = unwrap_xts_key(kek, src);
        }
    }

    fn derive_per_generation_keys(&mut self) {
        let kek_gen = self.aes_kek_generation_source.get().copied();
        let key_gen = self.aes_key_generation_source.get().copied();

        for i in 0..MAX_KEY_GENERATION {
            let Some(master_key) = self.master_keys[i].get().copied() else {
                continue;
            };

            if let (Some(kek_gen), Some(key_gen)) = (&kek_gen, &key_gen) {
                for index in [KaekIndex::Application, KaekIndex::Ocean, KaekIndex::System] {
                    let k = index as usize;
                    if let Some(src) = self.key_area_key_sources[k].get() {
                        let key = generate_kek(&master_key, src, kek_gen, Some(key_gen));
                        self.key_area_keys[k][i] = AesKey::new(key);
                    }
                }
            }

            if let Some(src) = self.titlekek_source.get() {
                self.titlekeks[i] = AesKey::new(ecb_decrypt_block(&master_key, src));
            }
            if let Some(src) = self.package2_key_source.get() {
                self.package2_keys[i] = AesKey::new(ecb_decrypt_block(&master_key, src));
            }
        }
    }

    fn derive_header_key(&mut self) {
        let (Some(mk0), Some(kek_src), Some(key_src), Some(kek_gen), Some(key_gen)) = (
            self.master_keys[0].get(),
            self.header_kek_source.get(),
            self.header_key_source.get(),
            self.aes_kek_generation_source.get(),
            self.aes_key_generation_source.get(),
        ) else {
            return;
        };
        let header_kek = generate_kek(mk0, kek_src, kek_gen, Some(key_gen));
        self.header_key = unwrap_xts_key(&header_kek, key_src);
    }

    fn derive_sd_card_keys(&mut self) {
        let (Some(mk0), Some(kek_src), Some(kek_gen), Some(key_gen), Some(seed)) = (
            self.master_keys[0].get(),
            self.sd_card_kek_source.get(),
            self.aes_kek_generation_source.get(),
            self.aes_key_generation_source.get(),
            self.sd_seed.get(),
        ) else {
            return;
        };
        let sd_kek = generate_kek(mk0, kek_src, kek_gen, Some(key_gen));
        for k in 0..self.sd_card_key_sources.len() {
            let Some(src) = self.sd_card_key_sources[k].get() else {
                continue;
            };
            let mut mixed = *src;
            for (i, b) in mixed.iter_mut().enumerate() {
                *b ^= seed[i & 0xF];
            }
            self.sd_card_keys[k] = unwrap_xts_key(&sd_kek, &mixed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::aes::ecb_encrypt_block;
    use crate::keys::file::write_keys;
    use crate::keys::{EncryptedKeyblob, SdKeyType};
    use tracing_test::traced_test;

    fn pattern<const N: usize>(seed: u8) -> [u8; N] {
        core::array::from_fn(|i| seed.wrapping_mul(37).wrapping_add((i as u8).wrapping_mul(11)))
    }

    fn seeded_keyset() -> KeySet {
        let mut keys = KeySet::new();
        keys.secure_boot_key.0 = pattern(1);
        keys.tsec_key.0 = pattern(2);
        for i in 0..KEYBLOB_GENERATIONS {
            keys.keyblob_key_sources[i].0 = pattern(10 + i as u8);
        }
        keys.keyblob_mac_key_source.0 = pattern(3);
        keys.encrypted_keyblobs[0] = EncryptedKeyblob::new(pattern(4));
        keys.tsec_root_keys[0].0 = pattern(5);
        keys.master_kek_sources[6].0 = pattern(6);
        keys.master_key_source.0 = pattern(7);
        keys.aes_kek_generation_source.0 = pattern(8);
        keys.aes_key_generation_source.0 = pattern(9);
        keys.key_area_key_sources[0].0 = pattern(20);
        keys.key_area_key_sources[1].0 = pattern(21);
        keys.key_area_key_sources[2].0 = pattern(22);
        keys.titlekek_source.0 = pattern(23);
        keys.package2_key_source.0 = pattern(24);
        keys.header_kek_source.0 = pattern(25);
        keys.header_key_source.0 = pattern(26);
        keys.sd_card_kek_source.0 = pattern(27);
        keys.sd_card_key_sources[SdKeyType::Nca as usize].0 = pattern(28);
        keys.sd_seed.0 = pattern(29);
        keys.per_console_key_source.0 = pattern(30);
        keys.retail_specific_aes_key_source.0 = pattern(31);
        keys.bis_kek_source.0 = pattern(32);
        keys.bis_key_sources[0].0 = pattern(33);
        keys.bis_key_sources[2].0 = pattern(34);
        keys.save_mac_kek_source.0 = pattern(35);
        keys.save_mac_key_source.0 = pattern(36);
        keys
    }

    fn dump(keys: &KeySet) -> String {
        let mut out = Vec::new();
        write_keys(keys, &mut out, true).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn derivation_is_idempotent() {
        let mut keys = seeded_keyset();
        keys.derive_keys();
        let first = dump(&keys);
        keys.derive_keys();
        assert_eq!(first, dump(&keys));

        assert!(!keys.master_keys[0].is_empty());
        assert!(!keys.master_keys[6].is_empty());
        assert!(keys.master_keys[1].is_empty());
        assert!(!keys.header_key.is_empty());
        assert!(!keys.titlekeks[6].is_empty());
        assert!(!keys.key_area_keys[2][0].is_empty());
        assert!(!keys.sd_card_keys[SdKeyType::Nca as usize].is_empty());
        assert!(keys.sd_card_keys[SdKeyType::Save as usize].is_empty());
        // bis_key_source_03 falls back to _02.
        assert_eq!(keys.bis_keys[3], keys.bis_keys[2]);
        assert!(!keys.bis_keys[0].is_empty());
        assert!(keys.bis_keys[1].is_empty());
        // Sources are never modified by derivation.
        assert_eq!(keys.sd_card_key_sources[SdKeyType::Nca as usize].0, pattern::<32>(28));
    }

    #[test]
    fn header_key_follows_generate_kek_chain() {
        let mut keys = KeySet::new();
        keys.master_keys[0].0 = pattern(40);
        keys.header_kek_source.0 = pattern(41);
        keys.header_key_source.0 = pattern(42);
        keys.aes_kek_generation_source.0 = pattern(43);
        keys.aes_key_generation_source.0 = pattern(44);
        keys.derive_keys();

        let kek = ecb_decrypt_block(&keys.master_keys[0].0, &keys.aes_kek_generation_source.0);
        let src_kek = ecb_decrypt_block(&kek, &keys.header_kek_source.0);
        let header_kek = ecb_decrypt_block(&src_kek, &keys.aes_key_generation_source.0);

        let mut lo = [0u8; 16];
        lo.copy_from_slice(&keys.header_key_source.0[..16]);
        assert_eq!(keys.header_key.0[..16], ecb_decrypt_block(&header_kek, &lo));
    }

    #[test]
    fn missing_inputs_leave_slots_unknown() {
        let mut keys = KeySet::new();
        keys.master_key_source.0 = pattern(1);
        keys.titlekek_source.0 = pattern(2);
        keys.derive_keys();
        assert!(keys.master_keys.iter().all(AesKey::is_empty));
        assert!(keys.titlekeks.iter().all(AesKey::is_empty));
        assert!(keys.header_key.is_empty());

        // An imported master key is enough for the per-generation stage.
        keys.master_keys[3].0 = pattern(3);
        keys.derive_keys();
        assert_eq!(
            keys.titlekeks[3].0,
            ecb_decrypt_block(&keys.master_keys[3].0, &keys.titlekek_source.0)
        );
    }

    fn keyblob_fixture(tamper: bool) -> (KeySet, [u8; 0x90]) {
        let mut keys = KeySet::new();
        keys.secure_boot_key.0 = pattern(1);
        keys.tsec_key.0 = pattern(2);
        keys.keyblob_key_sources[0].0 = pattern(3);
        keys.keyblob_mac_key_source.0 = pattern(4);

        let keyblob_key = ecb_decrypt_block(
            &keys.secure_boot_key.0,
            &ecb_decrypt_block(&keys.tsec_key.0, &keys.keyblob_key_sources[0].0),
        );
        let mac_key = ecb_decrypt_block(&keyblob_key, &keys.keyblob_mac_key_source.0);

        let plain: [u8; 0x90] = pattern(5);
        let counter: [u8; 16] = pattern(6);
        let mut enc = [0u8; 0xB0];
        enc[0x10..0x20].copy_from_slice(&counter);
        enc[0x20..].copy_from_slice(&plain);
        ctr_transform(&keyblob_key, &counter, &mut enc[0x20..]);
        let mac = cmac(&mac_key, &enc[0x10..]);
        enc[..0x10].copy_from_slice(&mac);
        if tamper {
            enc[0] ^= 0xFF;
        }
        keys.encrypted_keyblobs[0] = EncryptedKeyblob::new(enc);
        (keys, plain)
    }

    #[test]
    #[traced_test]
    fn keyblob_decrypts_and_yields_master_kek() {
        let (mut keys, plain) = keyblob_fixture(false);
        keys.derive_keys();
        assert_eq!(keys.keyblobs[0].0, plain);
        assert_eq!(keys.master_keks[0].0[..], plain[..0x10]);
        assert_eq!(keys.package1_keys[0].0[..], plain[0x80..0x90]);
        assert!(!logs_contain("keyblob MAC mismatch"));
    }

    #[test]
    #[traced_test]
    fn keyblob_mac_mismatch_warns_and_continues() {
        let (mut keys, plain) = keyblob_fixture(true);
        keys.derive_keys();
        assert!(logs_contain("keyblob MAC mismatch"));
        assert_eq!(keys.keyblobs[0].0, plain);
    }

    #[test]
    fn mariko_fills_unknown_master_keks_only() {
        let mut keys = KeySet::new();
        keys.mariko_kek.0 = pattern(1);
        keys.mariko_master_kek_sources[7].0 = pattern(2);
        keys.mariko_master_kek_sources[6].0 = pattern(3);
        keys.tsec_root_keys[0].0 = pattern(4);
        keys.master_kek_sources[6].0 = pattern(5);
        keys.derive_keys();

        assert_eq!(keys.master_keks[6].0, ecb_decrypt_block(&pattern(4), &pattern(5)));
        assert_eq!(keys.master_keks[7].0, ecb_decrypt_block(&pattern(1), &pattern(2)));
    }

    #[test]
    fn generate_kek_without_key_seed_stops_at_source_kek() {
        let key = pattern(1);
        let src = pattern(2);
        let seed = pattern(3);
        let kek = generate_kek(&key, &src, &seed, None);
        let back = ecb_encrypt_block(&ecb_decrypt_block(&key, &seed), &kek);
        assert_eq!(back, src);
    }
}
