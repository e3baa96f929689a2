use anyhow::{bail, Context};
use clap::Parser;
use core::convert::Infallible;
use microkvs::{Bank, ListEntry, Store};

/// Maintenance tool for a flash image holding the two banks of a store,
/// concatenated left-then-right in one flat file.
#[derive(Parser)]
struct Kvtool {
    /// Log slots to use when formatting a fresh bank.
    #[clap(short, long, default_value_t = 128)]
    log_size: u32,

    #[clap(subcommand)]
    cmd: Cmd,

    image_file: std::path::PathBuf,
}

#[derive(Parser)]
enum Cmd {
    /// Print bank selection, version, and free space.
    State,
    /// List every key in the active bank's log.
    List,
    Read {
        key: String,
    },
    Write {
        key: String,
        value: String,
    },
    /// Write a tombstone, hiding the key until the next compaction.
    Delete {
        key: String,
    },
    Compact,
    WipeInactive,
    WipeAll,
}

fn main() -> Result<(), anyhow::Error> {
    let args = Kvtool::parse();

    let image = std::fs::read(&args.image_file)
        .with_context(|| format!("opening image file {}", args.image_file.display()))?;
    if image.is_empty() || image.len() % 2 != 0 {
        bail!("image file must hold two equal-sized banks");
    }
    let half = image.len() / 2;
    let left = FileBank {
        data: image[..half].to_vec(),
    };
    let right = FileBank {
        data: image[half..].to_vec(),
    };

    let mut store = Store::new(left, right, args.log_size)
        .map_err(|e| anyhow::anyhow!("could not mount: {e:?}"))?;

    match args.cmd {
        Cmd::State => {
            println!(
                "active bank:      {}",
                if store.is_left_bank_active() { "left" } else { "right" }
            );
            println!("header version:   {}", store.bank_header_version());
            println!(
                "log entries:      {} used / {} total",
                store.log_capacity() - store.free_log_entries(),
                store.log_capacity()
            );
            println!(
                "data space:       {} free / {} total",
                store.free_data_space(),
                store.data_capacity()
            );
        }
        Cmd::List => {
            let mut list = [ListEntry::EMPTY; 128];
            let count = store.enum_objects(&mut list);
            for entry in &list[..count] {
                println!(
                    "{:<16}  {:>6} bytes  {} rev(s)",
                    String::from_utf8_lossy(entry.name()),
                    entry.size,
                    entry.revs
                );
            }
            println!("{count} object(s)");
        }
        Cmd::Read { key } => match store.find_object(key.as_bytes()) {
            Some(entry) => {
                let mut value = vec![0; entry.len.get() as usize];
                let _ = store.read_object(key.as_bytes(), &mut value);
                println!("{}", pretty_hex::pretty_hex(&value));
            }
            None => println!("not found"),
        },
        Cmd::Write { key, value } => {
            match store.store_object(key.as_bytes(), value.as_bytes()) {
                Ok(()) => println!("ok"),
                Err(microkvs::Error::NoSpace) => println!("no space"),
                Err(e) => println!("error: {e:?}"),
            }
        }
        Cmd::Delete { key } => match store.store_object(key.as_bytes(), &[]) {
            Ok(()) => println!("ok"),
            Err(e) => println!("error: {e:?}"),
        },
        Cmd::Compact => {
            store
                .compact()
                .map_err(|e| anyhow::anyhow!("compaction failed: {e:?}"))?;
            println!(
                "done, version {} in the {} bank",
                store.bank_header_version(),
                if store.is_left_bank_active() { "left" } else { "right" }
            );
        }
        Cmd::WipeInactive => {
            store
                .wipe_inactive()
                .map_err(|e| anyhow::anyhow!("wipe failed: {e:?}"))?;
            println!("inactive bank erased");
        }
        Cmd::WipeAll => {
            store
                .wipe_all()
                .map_err(|e| anyhow::anyhow!("wipe failed: {e:?}"))?;
            println!("both banks erased and reformatted");
        }
    }

    let (left, right) = store.into_banks();
    let mut out = left.data;
    out.extend_from_slice(&right.data);
    std::fs::write(&args.image_file, &out)
        .with_context(|| format!("writing image file {}", args.image_file.display()))?;

    Ok(())
}

/// One bank of the image, staged in RAM and flushed back on exit. Mirrors
/// NOR behavior: erase sets 0xFF, programming only clears bits.
struct FileBank {
    data: Vec<u8>,
}

impl Bank for FileBank {
    type Error = Infallible;

    fn size(&self) -> u32 {
        self.data.len() as u32
    }

    fn erase(&mut self) -> Result<(), Infallible> {
        self.data.fill(0xFF);
        Ok(())
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), Infallible> {
        let off = offset as usize;
        for (cell, &b) in self.data[off..off + data.len()].iter_mut().zip(data) {
            *cell &= b;
        }
        Ok(())
    }

    fn read(&self, offset: u32, dest: &mut [u8]) {
        let off = offset as usize;
        dest.copy_from_slice(&self.data[off..off + dest.len()]);
    }
}
