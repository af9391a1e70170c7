//! Key file import and export.
//!
//! ## `prod.keys`
//! ```text
//! ; comment
//! header_key        = 0123...   (hex, length must match the slot)
//! master_key_00,0123...         (comma also separates)
//! ```
//!
//! ## `title.keys`
//! ```text
//! <rights id, 32 hex> = <encrypted title key, 32 hex>
//! ```
//! `,` and `|` are accepted in place of `=`.

use std::io::{BufRead, BufReader, Read, Write};

use super::{KEY_TABLE, KeyPurpose, KeySet, RightsId, lookup_key_name};
use crate::Result;
use crate::utils::decode_hex_n;

/// Outcome of importing a key file. Rejected lines never abort the import.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KeyFileReport {
    /// Number of slots populated.
    pub loaded: usize,
    /// Names that do not correspond to any slot.
    pub unknown: Vec<String>,
    /// Names whose value was not hex of the slot's length.
    pub bad_length: Vec<String>,
}

/// A rejected `title.keys` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleKeyLineError {
    /// 1-based line number.
    pub line: usize,
    pub message: String,
}

/// Outcome of importing a title-key file.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TitleKeyReport {
    pub loaded: usize,
    pub rejected: Vec<TitleKeyLineError>,
}

fn content(line: &str) -> Option<&str> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
        None
    } else {
        Some(line)
    }
}

impl KeySet {
    /// Load keys from a `prod.keys`-style reader.
    ///
    /// Unknown names and values of the wrong length are logged, recorded in
    /// the returned report and skipped.
    pub fn load_prod_keys<R: Read>(&mut self, reader: R) -> Result<KeyFileReport> {
        let mut report = KeyFileReport::default();
        for line in BufReader::new(reader).lines() {
            let line = line?;
            let Some(line) = content(&line) else {
                continue;
            };
            let Some((name, value)) = line.split_once(['=', ',']) else {
                tracing::warn!(line, "key file line has no separator");
                continue;
            };
            let name = name.trim();
            let value = value.trim();

            let Some((info, index)) = lookup_key_name(name) else {
                tracing::warn!(name, "unknown key");
                report.unknown.push(name.to_string());
                continue;
            };
            let bytes = match hex::decode(value) {
                Ok(b) if b.len() == info.len => b,
                _ => {
                    tracing::warn!(name, expected = info.len, "key has the wrong length");
                    report.bad_length.push(name.to_string());
                    continue;
                }
            };
            if let Some(slot) = self.slot_mut(info.id, index) {
                slot.copy_from_slice(&bytes);
                report.loaded += 1;
            }
        }
        tracing::debug!(
            loaded = report.loaded,
            unknown = report.unknown.len(),
            bad_length = report.bad_length.len(),
            "imported key file"
        );
        Ok(report)
    }

    /// Load encrypted title keys from a `title.keys`-style reader.
    pub fn load_title_keys<R: Read>(&mut self, reader: R) -> Result<TitleKeyReport> {
        let mut report = TitleKeyReport::default();
        for (i, line) in BufReader::new(reader).lines().enumerate() {
            let line = line?;
            let Some(line) = content(&line) else {
                continue;
            };
            match parse_title_key_line(line) {
                Ok((rights_id, key)) => {
                    self.add_title_key(rights_id, key);
                    report.loaded += 1;
                }
                Err(message) => {
                    tracing::warn!(line = i + 1, %message, "rejected title key line");
                    report.rejected.push(TitleKeyLineError { line: i + 1, message });
                }
            }
        }
        Ok(report)
    }
}

fn parse_title_key_line(line: &str) -> std::result::Result<(RightsId, [u8; 16]), String> {
    let (rights, key) = line
        .split_once([',', '=', '|'])
        .ok_or_else(|| "missing separator between rights ID and title key".to_string())?;
    let rights_id = decode_hex_n::<16>(rights)
        .ok_or_else(|| format!("rights ID `{}` is not 16 bytes of hex", rights.trim()))?;
    let key = decode_hex_n::<16>(key)
        .ok_or_else(|| format!("title key `{}` is not 16 bytes of hex", key.trim()))?;
    Ok((rights_id, key))
}

/// Write every known slot in key-file form.
///
/// Device-unique keys are omitted unless `include_unique` is set.
pub fn write_keys<W: Write>(keys: &KeySet, mut w: W, include_unique: bool) -> Result<()> {
    for info in KEY_TABLE {
        if info.purpose == KeyPurpose::DeviceUnique && !include_unique {
            continue;
        }
        for index in 0..info.count.unwrap_or(1) {
            let Some(bytes) = keys.slot(info.id, index) else {
                continue;
            };
            if crate::utils::is_zero(bytes) {
                continue;
            }
            let name = match info.count {
                Some(_) => format!("{}_{index:02x}", info.name),
                None => info.name.to_string(),
            };
            writeln!(w, "{name} = {}", hex::encode_upper(bytes))?;
        }
    }
    Ok(())
}

/// Write the title-key dictionary, sorted by rights ID.
pub fn write_title_keys<W: Write>(keys: &KeySet, mut w: W) -> Result<()> {
    let mut entries: Vec<_> = keys.title_keys.iter().collect();
    entries.sort_by_key(|(rights_id, _)| **rights_id);
    for (rights_id, key) in entries {
        writeln!(w, "{} = {}", hex::encode_upper(rights_id), hex::encode_upper(key.0))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn prod_keys_report_unknown_and_bad_length() {
        let text = "\
; comment
# another comment
header_key = 00112233445566778899AABBCCDDEEFF00112233445566778899AABBCCDDEEFF
master_key_00,0123456789abcdef0123456789abcdef
titlekek_01 = 00
not_a_key = 00112233445566778899aabbccddeeff
";
        let mut keys = KeySet::new();
        let report = keys.load_prod_keys(text.as_bytes()).unwrap();
        assert_eq!(report.loaded, 2);
        assert_eq!(report.unknown, vec!["not_a_key".to_string()]);
        assert_eq!(report.bad_length, vec!["titlekek_01".to_string()]);
        assert_eq!(keys.header_key.0[0x1F], 0xFF);
        assert_eq!(keys.master_keys[0].0[0], 0x01);
        assert!(logs_contain("unknown key"));
    }

    #[test]
    fn title_keys_accept_all_separators_and_name_bad_field() {
        let text = "\
01000000000000000000000000000000=000102030405060708090a0b0c0d0e0f
02000000000000000000000000000000,101112131415161718191a1b1c1d1e1f
03000000000000000000000000000000|202122232425262728292a2b2c2d2e2f
0400 = 202122232425262728292a2b2c2d2e2f
05000000000000000000000000000000 = zz
";
        let mut keys = KeySet::new();
        let report = keys.load_title_keys(text.as_bytes()).unwrap();
        assert_eq!(report.loaded, 3);
        assert_eq!(report.rejected.len(), 2);
        assert_eq!(report.rejected[0].line, 4);
        assert!(report.rejected[0].message.contains("rights ID"));
        assert!(report.rejected[1].message.contains("title key"));

        let mut rid = [0u8; 16];
        rid[0] = 3;
        assert_eq!(keys.title_key(&rid).unwrap()[0], 0x20);
    }

    #[test]
    fn write_keys_round_trips_and_hides_unique() {
        let mut keys = KeySet::new();
        keys.master_keys[2].0 = [0x42; 16];
        keys.header_key.0 = [0x11; 32];
        keys.sd_seed.0 = [0x99; 16];

        let mut out = Vec::new();
        write_keys(&keys, &mut out, false).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("master_key_02 = 4242"));
        assert!(!text.contains("sd_seed"));

        let mut reloaded = KeySet::new();
        let report = reloaded.load_prod_keys(text.as_bytes()).unwrap();
        assert_eq!(report.loaded, 2);
        assert_eq!(reloaded.master_keys[2], keys.master_keys[2]);
        assert_eq!(reloaded.header_key, keys.header_key);

        let mut out = Vec::new();
        write_keys(&keys, &mut out, true).unwrap();
        assert!(String::from_utf8(out).unwrap().contains("sd_seed = 9999"));
    }
}
