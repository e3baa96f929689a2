// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use core::mem::size_of;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use zerocopy::{AsBytes, FromBytes, Unaligned};

//////////////////////////////////////////////////////////////////////////////
// Convenience wrappers for zerocopy.

pub fn cast_prefix<T>(bytes: &[u8]) -> (&T, &[u8])
    where T: FromBytes + Unaligned,
{
    let (lv, rest) = zerocopy::LayoutVerified::<_, T>::new_unaligned_from_prefix(bytes)
        .expect("type does not fit in buffer");
    (lv.into_ref(), rest)
}

//////////////////////////////////////////////////////////////////////////////
// Compile-time configuration.

/// Smallest aligned unit of bytes the underlying flash accepts in a single
/// program operation. Byte-writable parts use the default of 1; parts with
/// wider program words select one of the `write-block-*` cargo features.
#[cfg(feature = "write-block-32")]
pub const WRITE_BLOCK: usize = 32;
#[cfg(all(feature = "write-block-16", not(feature = "write-block-32")))]
pub const WRITE_BLOCK: usize = 16;
#[cfg(all(
    feature = "write-block-8",
    not(any(feature = "write-block-16", feature = "write-block-32"))
))]
pub const WRITE_BLOCK: usize = 8;
#[cfg(not(any(
    feature = "write-block-8",
    feature = "write-block-16",
    feature = "write-block-32"
)))]
pub const WRITE_BLOCK: usize = 1;

/// Size of an object key on media. Keys are stored 0x00-padded to exactly
/// this many bytes; longer names are truncated. Always a whole multiple of
/// `WRITE_BLOCK` so the key can be programmed in a single aligned write.
pub const NAMELEN: usize = if WRITE_BLOCK > 16 { WRITE_BLOCK } else { 16 };

/// Bytes of a `LogEntry` covered by the header CRC: key, start, len.
pub const HEADER_CRC_BYTES: usize = NAMELEN + 8;

const ENTRY_BYTES: usize = NAMELEN + 16;

/// Trailing padding that rounds a `LogEntry` to a multiple of `WRITE_BLOCK`.
pub const ENTRY_PAD: usize = (WRITE_BLOCK - ENTRY_BYTES % WRITE_BLOCK) % WRITE_BLOCK;

/// On-media size of one log slot.
pub const ENTRY_SIZE: usize = ENTRY_BYTES + ENTRY_PAD;

/// On-media footprint of the bank header, rounded up to `WRITE_BLOCK` so the
/// log array that follows it starts on a programmable boundary.
pub const HEADER_SIZE: usize =
    (size_of::<BankHeader>() + WRITE_BLOCK - 1) / WRITE_BLOCK * WRITE_BLOCK;

const _: () = assert!(size_of::<LogEntry>() == ENTRY_SIZE);
const _: () = assert!(NAMELEN % WRITE_BLOCK == 0);

/// Rounds `val` up to the next multiple of `WRITE_BLOCK` (identity when
/// already aligned).
pub fn round_up_to_write_block(val: u32) -> u32 {
    let block = WRITE_BLOCK as u64;
    let rounded = (val as u64 + block - 1) / block * block;
    rounded.min(u32::MAX as u64) as u32
}

/// Canonical on-media form of an object name: truncated to `NAMELEN` bytes,
/// 0x00-padded, never NUL-terminated.
pub fn canonical_key(name: &[u8]) -> [u8; NAMELEN] {
    let mut key = [0u8; NAMELEN];
    let n = name.len().min(NAMELEN);
    key[..n].copy_from_slice(&name[..n]);
    key
}

//////////////////////////////////////////////////////////////////////////////
// At-rest layout.

/// Shorthand for a `u32` in little-endian representation.
type U32LE = zerocopy::U32<byteorder::LittleEndian>;

/// Header written to the start of a bank.
///
/// During compaction this is written _last_, in a single call, so that a
/// bank only carries a valid header once every record it holds is complete.
/// The fields are laid out in commit order: an interrupted header write
/// leaves `log_size` (or `version`) erased and the header reads as invalid.
#[derive(Copy, Clone, Debug, FromBytes, AsBytes, Unaligned, Eq, PartialEq)]
#[repr(C)]
pub struct BankHeader {
    /// Magic number (`MAGIC`) distinguishing a committed bank from erased
    /// or arbitrary data.
    pub magic: U32LE,
    /// Monotonic counter bumped by one on every compaction; the bank with
    /// the greater version wins at mount. `0xFFFF_FFFF` is never valid.
    pub version: U32LE,
    /// Number of log slots in this bank's log array.
    pub log_size: U32LE,
}

impl BankHeader {
    /// Bits we expect to find in the `magic` field.
    pub const MAGIC: u32 = 0xC0DE_F00D;
    /// Log sizes above this are rejected as torn or corrupt headers.
    pub const MAX_LOG_SIZE: u32 = 0x8000_0000;

    /// Screens the header fields against static ranges. A torn header
    /// (interrupted compaction) fails this because its later fields still
    /// read erased.
    pub fn is_valid(&self) -> bool {
        self.magic.get() == Self::MAGIC && self.log_size.get() <= Self::MAX_LOG_SIZE
    }
}

/// A single slot in a bank's log array.
///
/// Slots are written in two steps: everything after the key first (which
/// reserves the slot), then the key (which commits the record). A record
/// whose key is still erased fails its header CRC and is skipped by every
/// reader, which is what makes a power cut between the two steps harmless.
#[derive(Copy, Clone, Debug, FromBytes, AsBytes, Unaligned, Eq, PartialEq)]
#[repr(C)]
pub struct LogEntry {
    /// Object name, 0x00-padded. All-0xFF is reserved (indistinguishable
    /// from an unwritten slot).
    pub key: [u8; NAMELEN],
    /// Byte offset of the payload from the start of the bank.
    /// `0xFFFF_FFFF` means the slot was never written.
    pub start: U32LE,
    /// Payload length. 0 marks a tombstone; `0xFFFF_FFFF` means unwritten.
    pub len: U32LE,
    /// CRC of the `len` payload bytes.
    pub crc: U32LE,
    /// CRC over `key || start || len`. 0 is accepted as "not yet computed"
    /// for compatibility with records written by earlier layouts; any other
    /// value must match.
    pub header_crc: U32LE,
    /// Padding to round the slot to a write-block boundary; kept erased.
    pub pad: [u8; ENTRY_PAD],
}

impl LogEntry {
    /// Field value of a never-programmed word.
    pub const UNWRITTEN: u32 = 0xFFFF_FFFF;

    /// Builds a complete entry for `key` with its header CRC filled in.
    pub fn new(key: [u8; NAMELEN], start: u32, len: u32, data_crc: u32) -> Self {
        let mut entry = Self {
            key,
            start: start.into(),
            len: len.into(),
            crc: data_crc.into(),
            header_crc: 0.into(),
            pad: [0xFF; ENTRY_PAD],
        };
        entry.header_crc = entry.expected_header_crc().into();
        entry
    }

    /// True for a slot that was never written: both `start` and `len` still
    /// read erased. The scanner treats the first such slot as the end of
    /// the log.
    pub fn is_blank(&self) -> bool {
        self.start.get() == Self::UNWRITTEN && self.len.get() == Self::UNWRITTEN
    }

    /// Compute the _expected_ header CRC given the current field values.
    pub fn expected_header_crc(&self) -> u32 {
        media_crc(&self.as_bytes()[..HEADER_CRC_BYTES])
    }

    /// Checks the stored header CRC, honoring the 0 = "absent" convention.
    pub fn header_crc_ok(&self) -> bool {
        let stored = self.header_crc.get();
        stored == 0 || stored == self.expected_header_crc()
    }

    /// A zero-length record; hides its key from readers.
    pub fn is_tombstone(&self) -> bool {
        self.len.get() == 0
    }

    /// Verifies that the payload lies entirely within a bank of `size`
    /// bytes. Guards every dereference of `start`/`len` taken from media.
    pub fn payload_in_bounds(&self, size: u32) -> bool {
        self.start
            .get()
            .checked_add(self.len.get())
            .map_or(false, |end| end <= size)
    }
}

//////////////////////////////////////////////////////////////////////////////
// CRC.

/// The store checksum: the CRC-32/ISO-HDLC update loop (polynomial
/// 0xEDB88320, reflected), with the final register byte-reversed and then
/// inverted -- equivalently, the standard checksum byte-swapped. Hardware
/// CRC engines may substitute for this only if they reproduce the exact
/// 32-bit value.
pub fn media_crc(bytes: &[u8]) -> u32 {
    let algo = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
    algo.checksum(bytes).swap_bytes()
}

//////////////////////////////////////////////////////////////////////////////
// Flash bank interface.

/// Identifies one of the two banks making up a store.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    /// Given a side, get the _other_ one.
    pub fn other(self) -> Self {
        match self {
            Self::Left => Self::Right,
            Self::Right => Self::Left,
        }
    }
}

/// Trait describing a single erasable flash bank for the purposes of the
/// store.
///
/// A bank is a contiguous region that erases to 0xFF, accepts programs only
/// at `WRITE_BLOCK`-aligned offsets and lengths onto currently-erased
/// bytes, and is memory-mapped (or otherwise cheaply readable) for loads.
/// The two banks of a store are owned exclusively by it; no other code may
/// program or erase any byte of either.
pub trait Bank {
    /// Error type produced by program and erase operations.
    type Error;

    /// Total number of bytes in the bank.
    fn size(&self) -> u32;

    /// Erases the entire bank to 0xFF. May take tens of milliseconds.
    /// Drivers on ECC-capable parts must clear latched fault state after a
    /// successful erase.
    fn erase(&mut self) -> Result<(), Self::Error>;

    /// Programs `data` at `offset`. Both must be multiples of
    /// `WRITE_BLOCK`, and the target region must currently read erased.
    /// Within a single call bytes commit in order; a failed call may leave
    /// a prefix programmed. Drivers on ECC-capable parts must clear latched
    /// fault state after a successful program.
    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), Self::Error>;

    /// Copies `dest.len()` bytes starting at `offset` out of the bank.
    ///
    /// Reads from mapped flash cannot fail; corruption is caught by CRC
    /// validation, and uncorrectable ECC faults arrive through the fault
    /// shim rather than a return value. Implementations backed by mapped
    /// flash must use volatile loads so the access is neither elided nor
    /// duplicated around a possible fault.
    fn read(&self, offset: u32, dest: &mut [u8]);

    /// Returns the address of an uncorrectable ECC fault latched by the
    /// hardware since the last call, clearing the latch. Parts without
    /// flash ECC inherit this no-op.
    fn ecc_fault(&self) -> Option<u32> {
        None
    }

    /// Computes the store checksum (see [`media_crc`]) over a range of the
    /// bank. Drivers may override this with a hardware engine provided the
    /// result is bit-exact.
    fn crc(&self, offset: u32, len: u32) -> u32 {
        let algo = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
        let mut digest = algo.digest();
        let mut chunk = [0u8; 32];
        let mut at = offset;
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(chunk.len() as u32) as usize;
            self.read(at, &mut chunk[..n]);
            digest.update(&chunk[..n]);
            at += n as u32;
            remaining -= n as u32;
        }
        digest.finalize().swap_bytes()
    }

    /// Compares `data.len()` bytes starting at `offset` against `data`.
    ///
    /// This is a "pushed compare" so that directly-mapped drivers can avoid
    /// staging the whole range through RAM. The default implementation
    /// streams through a small buffer.
    fn compare(&self, offset: u32, data: &[u8]) -> bool {
        let mut chunk = [0u8; 32];
        let mut at = offset;
        let mut data = data;
        while !data.is_empty() {
            let n = data.len().min(chunk.len());
            self.read(at, &mut chunk[..n]);
            if chunk[..n] != data[..n] {
                return false;
            }
            at += n as u32;
            data = &data[n..];
        }
        true
    }

    /// Checks that `len` bytes starting at `offset` all read erased.
    fn is_blank(&self, offset: u32, len: u32) -> bool {
        let mut chunk = [0u8; 32];
        let mut at = offset;
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(chunk.len() as u32) as usize;
            self.read(at, &mut chunk[..n]);
            if chunk[..n].iter().any(|&b| b != 0xFF) {
                return false;
            }
            at += n as u32;
            remaining -= n as u32;
        }
        true
    }
}

//////////////////////////////////////////////////////////////////////////////
// Fault shim.

/// Volatile record of an uncorrectable ECC fault raised asynchronously by a
/// bus-fault or NMI handler while the store was reading flash.
///
/// The handler calls [`EccFault::raise`] and returns past the faulting
/// load; whatever value the load produced is discarded, because every
/// read-validating pass in the store consults and clears this flag after
/// its flash accesses.
pub struct EccFault {
    flagged: AtomicBool,
    addr: AtomicU32,
    pc: AtomicU32,
}

/// Snapshot of a consumed fault.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct EccFaultInfo {
    pub addr: u32,
    pub pc: u32,
}

impl EccFault {
    pub const fn new() -> Self {
        Self {
            flagged: AtomicBool::new(false),
            addr: AtomicU32::new(0),
            pc: AtomicU32::new(0),
        }
    }

    /// Records a fault. Async-signal-safe: touches only the three atomics.
    pub fn raise(&self, addr: u32, pc: u32) {
        self.addr.store(addr, Ordering::Relaxed);
        self.pc.store(pc, Ordering::Relaxed);
        self.flagged.store(true, Ordering::Release);
    }

    /// Consumes the flag, returning the fault details if one was pending.
    ///
    /// Plain load-then-store rather than a swap: the store runs single
    /// threaded and the only concurrent writer is a same-core fault
    /// handler, so staying CAS-free keeps this usable on cores without
    /// atomic read-modify-write.
    pub fn take(&self) -> Option<EccFaultInfo> {
        if self.flagged.load(Ordering::Acquire) {
            self.flagged.store(false, Ordering::Relaxed);
            Some(EccFaultInfo {
                addr: self.addr.load(Ordering::Relaxed),
                pc: self.pc.load(Ordering::Relaxed),
            })
        } else {
            None
        }
    }

    pub fn clear(&self) {
        self.flagged.store(false, Ordering::Relaxed);
    }
}

/// Folds a driver-latched fault into the shared flag and consumes whatever
/// is pending. Called after every batch of validating reads.
pub(crate) fn ecc_poll<B: Bank>(bank: &B, fault: &EccFault) -> Option<EccFaultInfo> {
    if let Some(addr) = bank.ecc_fault() {
        fault.raise(addr, 0);
    }
    fault.take()
}

//////////////////////////////////////////////////////////////////////////////
// Single-bank operations: slot access, scanning, formatting.

/// Byte offset of log slot `slot` from the start of the bank.
pub fn slot_offset(slot: u32) -> u32 {
    HEADER_SIZE as u32 + slot * ENTRY_SIZE as u32
}

/// First byte past the log array: the lowest offset the data region may
/// occupy (unrounded).
pub fn data_floor(log_size: u32) -> u32 {
    let raw = HEADER_SIZE as u64 + log_size as u64 * ENTRY_SIZE as u64;
    raw.min(u32::MAX as u64) as u32
}

/// Number of log slots that physically fit in a bank of `size` bytes. Used
/// to clamp a header's claimed log size before trusting it for cursors.
pub fn slots_that_fit(size: u32) -> u32 {
    size.saturating_sub(HEADER_SIZE as u32) / ENTRY_SIZE as u32
}

/// Reads the bank header out of mapped flash.
pub fn read_header<B: Bank>(bank: &B) -> BankHeader {
    let mut buf = [0u8; size_of::<BankHeader>()];
    bank.read(0, &mut buf);
    *cast_prefix::<BankHeader>(&buf).0
}

/// Reads log slot `slot` out of mapped flash.
pub fn read_slot<B: Bank>(bank: &B, slot: u32) -> LogEntry {
    let mut buf = [0u8; ENTRY_SIZE];
    bank.read(slot_offset(slot), &mut buf);
    *cast_prefix::<LogEntry>(&buf).0
}

/// Programs everything after the key of `entry` into slot `slot`,
/// reserving it. The slot's key bytes stay erased, so until [`commit_key`]
/// runs the record fails header-CRC validation and every scan skips it.
pub fn reserve_slot<B: Bank>(bank: &mut B, slot: u32, entry: &LogEntry) -> Result<(), B::Error> {
    bank.write(
        slot_offset(slot) + NAMELEN as u32,
        &entry.as_bytes()[NAMELEN..],
    )
}

/// Programs the key of `entry` into slot `slot`, committing the record.
pub fn commit_key<B: Bank>(bank: &mut B, slot: u32, entry: &LogEntry) -> Result<(), B::Error> {
    bank.write(slot_offset(slot), &entry.as_bytes()[..NAMELEN])
}

/// Programs a complete entry into slot `slot` in one call. Only used
/// against a bank whose header has not been committed yet (compaction
/// destinations), where key-last ordering does not matter.
pub fn write_slot<B: Bank>(bank: &mut B, slot: u32, entry: &LogEntry) -> Result<(), B::Error> {
    bank.write(slot_offset(slot), entry.as_bytes())
}

/// Programs `data` at `offset`, padding the final partial write block with
/// 0xFF (which programs no bits) so every issued write honors the driver's
/// alignment contract.
pub fn write_padded<B: Bank>(bank: &mut B, offset: u32, data: &[u8]) -> Result<(), B::Error> {
    let whole = data.len() - data.len() % WRITE_BLOCK;
    let (head, tail) = data.split_at(whole);
    if !head.is_empty() {
        bank.write(offset, head)?;
    }
    if !tail.is_empty() {
        let mut block = [0xFFu8; WRITE_BLOCK];
        block[..tail.len()].copy_from_slice(tail);
        bank.write(offset + whole as u32, &block)?;
    }
    Ok(())
}

/// Writes a bank header as a single aligned program operation. The padding
/// bytes beyond the 12-byte header are written as 0xFF.
pub fn write_header<B: Bank>(bank: &mut B, version: u32, log_size: u32) -> Result<(), B::Error> {
    let header = BankHeader {
        magic: BankHeader::MAGIC.into(),
        version: version.into(),
        log_size: log_size.into(),
    };
    let mut buf = [0xFFu8; HEADER_SIZE];
    buf[..size_of::<BankHeader>()].copy_from_slice(header.as_bytes());
    bank.write(0, &buf)
}

/// Erases `bank` and gives it a fresh header. Used when mounting a blank
/// chip; compaction writes its destination header separately, after the
/// copy.
pub fn format_bank<B: Bank>(bank: &mut B, version: u32, log_size: u32) -> Result<(), B::Error> {
    bank.erase()?;
    write_header(bank, version, log_size)
}

/// Copies `len` payload bytes from one bank to another through a small RAM
/// buffer, padding the final partial block.
pub fn copy_payload<S: Bank, D: Bank>(
    src: &S,
    from: u32,
    len: u32,
    dst: &mut D,
    to: u32,
) -> Result<(), D::Error> {
    let mut chunk = [0xFFu8; 64];
    let mut from = from;
    let mut to = to;
    let mut remaining = len;
    while remaining > 0 {
        let n = remaining.min(chunk.len() as u32) as usize;
        src.read(from, &mut chunk[..n]);
        let padded = (n + WRITE_BLOCK - 1) / WRITE_BLOCK * WRITE_BLOCK;
        for b in &mut chunk[n..padded] {
            *b = 0xFF;
        }
        dst.write(to, &chunk[..padded])?;
        from += n as u32;
        to += n as u32;
        remaining -= n as u32;
    }
    Ok(())
}

/// Result of walking a bank's log for its free-space cursors.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LogScan {
    /// Index of the first never-written slot, or `log_size` if every slot
    /// is populated.
    pub first_free_slot: u32,
    /// Offset of the first free data byte, rounded up to a write-block
    /// boundary.
    pub first_free_data: u32,
}

/// Walks the log of `bank` to find the first free slot and the first free
/// data byte.
///
/// The whole log up to the first blank slot is examined, not just the
/// tail, so that torn or corrupt entries still account for the data bytes
/// behind them: the data cursor derives from the last entry that passes
/// header validation, and anything skipped is unreachable junk the
/// writer's blank probe steps over.
pub fn scan_log<B: Bank>(bank: &B, log_size: u32, fault: &EccFault) -> LogScan {
    let size = bank.size();
    let mut first_free_slot = log_size;
    let mut last_valid: Option<LogEntry> = None;

    let _ = ecc_poll(bank, fault);
    for slot in 0..log_size {
        let entry = read_slot(bank, slot);

        if entry.is_blank() {
            first_free_slot = slot;
            break;
        }

        if let Some(f) = ecc_poll(bank, fault) {
            warn!(
                "kvs: scan: uncorrectable ECC fault at {:#x} (pc {:#x})",
                f.addr, f.pc
            );
            continue;
        }

        if !entry.header_crc_ok() {
            continue;
        }
        if !entry.payload_in_bounds(size) {
            continue;
        }

        last_valid = Some(entry);
    }

    let floor = round_up_to_write_block(data_floor(log_size));
    let first_free_data = match last_valid {
        Some(entry) => round_up_to_write_block(entry.start.get() + entry.len.get()).max(floor),
        None => floor,
    };

    LogScan {
        first_free_slot,
        first_free_data,
    }
}

//////////////////////////////////////////////////////////////////////////////
// RAM-backed test double.
