use std::env;
use std::fs::File;
use std::path::PathBuf;

use nxvault::formats::nca::{Nca, SectionFs};
use nxvault::keys::default_keys_dir;
use nxvault::{KeySet, Result, Storage};

fn main() -> Result<()> {
    let path = env::args().nth(1).unwrap_or_else(|| "program.nca".into());
    let keys_dir = default_keys_dir().unwrap_or_else(|| PathBuf::from("."));

    let mut keys = KeySet::new();
    let report = keys.load_prod_keys(File::open(keys_dir.join("prod.keys"))?)?;
    if let Ok(title_keys) = File::open(keys_dir.join("title.keys")) {
        keys.load_title_keys(title_keys)?;
    }
    keys.derive_keys();
    println!("loaded {} keys ({} unknown)", report.loaded, report.unknown.len());

    let nca = Nca::open(&keys, Storage::from_reader(File::open(&path)?)?)?;
    println!("program id: {:016X}", nca.header.program_id);
    println!("content type: {:?}", nca.header.content_type);
    println!("key generation: {}", nca.header.key_generation);
    println!("header signature: {:?}", nca.verify_header_signature(&keys)?);

    for index in 0..4 {
        let Some((entry, fs)) = nca.header.section(index) else {
            continue;
        };
        println!(
            "section {index}: {:#x}..{:#x} {:?} {:?} {:?}",
            entry.start(),
            entry.end(),
            fs.fs_type,
            fs.encryption_type,
            fs.hash_type
        );
        if !nca.can_open_section(index) {
            println!("  cannot be opened with the loaded keys");
            continue;
        }
        match nca.open_fs(index)? {
            SectionFs::Partition(pfs) => {
                for file in pfs.files() {
                    println!("  {} ({:#x} bytes)", file.name, file.size);
                }
            }
            SectionFs::RomFs(romfs) => println!("  {} files", romfs.files().count()),
        }
        println!("  verification: {:?}", nca.verify_section(index)?);
    }

    Ok(())
}
