#![cfg_attr(not(test), no_std)]

mod fmt;
pub mod low_level;

use core::mem::size_of;
use zerocopy::{AsBytes, FromBytes};

use crate::low_level::{
    canonical_key, commit_key, copy_payload, data_floor, ecc_poll, format_bank, read_header,
    read_slot, reserve_slot, round_up_to_write_block, scan_log, slot_offset, slots_that_fit,
    write_header, write_slot, write_padded, EccFault,
};

pub use crate::low_level::{Bank, EccFaultInfo, LogEntry, Side, NAMELEN, WRITE_BLOCK};

// Flash program operations can fail transiently on some parts (e.g.
// STM32L431 errata 2.2.10), so every store gets a fixed number of tries.
const STORE_ATTEMPTS: usize = 5;

// Keys recently copied during compaction, remembered to short-circuit the
// duplicate scan of the destination log.
const COMPACT_CACHE: usize = 16;

/// Errors surfaced by mutating store operations. Lookups are infallible:
/// a missing or unrecoverably corrupted object simply reads as absent.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Error<E> {
    /// Even after a compaction there is no room for the payload or its
    /// log slot.
    NoSpace,
    /// Readback after a write did not match the source bytes.
    VerifyMismatch,
    /// The driver reported a program or erase failure.
    Bank(E),
}

impl<E> From<E> for Error<E> {
    fn from(e: E) -> Self {
        Self::Bank(e)
    }
}

/// One row of an [`Store::enum_objects`] listing.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ListEntry {
    /// Canonical key, 0x00-padded.
    pub key: [u8; NAMELEN],
    /// Size of the most recent copy of the object.
    pub size: u32,
    /// Number of copies (including the current one) in the active bank's
    /// log, tombstones included.
    pub revs: u32,
}

impl ListEntry {
    pub const EMPTY: Self = Self {
        key: [0; NAMELEN],
        size: 0,
        revs: 0,
    };

    /// The key with its 0x00 padding stripped, for printing.
    pub fn name(&self) -> &[u8] {
        let end = self.key.iter().position(|&b| b == 0).unwrap_or(NAMELEN);
        &self.key[..end]
    }
}

/// An object name formatted into a fixed `NAMELEN` buffer, for building
/// `port{n}`-style keys without allocation. Output beyond `NAMELEN` bytes
/// is silently dropped, matching the canonicalization rule for long names.
pub struct KeyBuf {
    buf: [u8; NAMELEN],
    len: usize,
}

impl KeyBuf {
    pub fn format(args: core::fmt::Arguments<'_>) -> Self {
        let mut key = Self {
            buf: [0; NAMELEN],
            len: 0,
        };
        let _ = core::fmt::Write::write_fmt(&mut key, args);
        key
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl core::fmt::Write for KeyBuf {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let n = s.len().min(NAMELEN - self.len);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

/// A key-value store over a pair of flash banks.
///
/// Exactly one bank is "active" at a time: it services all reads and
/// receives new records until it fills, at which point a compaction copies
/// the live records into the other bank and switches over. The free-space
/// cursors live here in RAM and are re-derived from the log on every mount.
pub struct Store<B: Bank> {
    left: B,
    right: B,
    active: Side,
    default_log_size: u32,
    log_size: u32,
    version: u32,
    first_free_log_entry: u32,
    first_free_data: u32,
    fault: EccFault,
}

impl<B: Bank> Store<B> {
    /// Mounts a store over `left` and `right`. If neither bank carries a
    /// valid header (a blank chip, or one wiped by [`Store::wipe_all`]),
    /// the left bank is formatted with `default_log_size` log slots.
    pub fn new(left: B, right: B, default_log_size: u32) -> Result<Self, Error<B::Error>> {
        let mut store = Self {
            left,
            right,
            active: Side::Left,
            default_log_size,
            log_size: 0,
            version: 0,
            first_free_log_entry: 0,
            first_free_data: 0,
            fault: EccFault::new(),
        };
        store.select_bank()?;
        store.rescan();
        Ok(store)
    }

    /// Gives the banks back, e.g. to remount.
    pub fn into_banks(self) -> (B, B) {
        (self.left, self.right)
    }

    fn bank(&self, side: Side) -> &B {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    fn bank_mut(&mut self, side: Side) -> &mut B {
        match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        }
    }

    /// Reads one bank's header and screens it, treating an ECC fault
    /// during the read as "not valid".
    fn checked_header(&self, side: Side) -> (low_level::BankHeader, bool) {
        let bank = self.bank(side);
        let _ = ecc_poll(bank, &self.fault);
        let header = read_header(bank);
        let mut ok = header.is_valid();
        if let Some(f) = ecc_poll(bank, &self.fault) {
            warn!(
                "kvs: header read: uncorrectable ECC fault at {:#x} (pc {:#x})",
                f.addr, f.pc
            );
            ok = false;
        }
        (header, ok)
    }

    /// Decides which bank is active, formatting the left bank if neither
    /// qualifies.
    fn select_bank(&mut self) -> Result<(), Error<B::Error>> {
        let (lh, l_ok) = self.checked_header(Side::Left);
        let (rh, r_ok) = self.checked_header(Side::Right);

        self.active = match (l_ok, r_ok) {
            (false, false) => {
                debug!("kvs: no valid bank header, formatting left bank");
                format_bank(&mut self.left, 0, self.default_log_size)?;
                Side::Left
            }
            (true, false) => Side::Left,
            (false, true) => Side::Right,
            (true, true) => {
                // Greater version wins; a half-written version word can
                // only read 0xFFFFFFFF, which never wins. Ties go right.
                if lh.version.get() > rh.version.get() && lh.version.get() != 0xFFFF_FFFF {
                    Side::Left
                } else {
                    Side::Right
                }
            }
        };
        Ok(())
    }

    /// Re-derives the cached header fields and free-space cursors from the
    /// active bank.
    fn rescan(&mut self) {
        let bank = self.bank(self.active);
        let header = read_header(bank);
        let bank_size = bank.size();
        let version = header.version.get();
        let log_size = header.log_size.get().min(slots_that_fit(bank_size));
        let bank = self.bank(self.active);
        let scan = scan_log(bank, log_size, &self.fault);
        self.version = version;
        self.log_size = log_size;
        self.first_free_log_entry = scan.first_free_slot;
        self.first_free_data = scan.first_free_data;
        debug!(
            "kvs: mounted, version {}, {} log entries used, data cursor {:#x}",
            self.version, self.first_free_log_entry, self.first_free_data
        );
    }

    /// Finds the latest valid record for `name` in the active bank.
    ///
    /// Returns `None` for a key that was never stored, whose only copies
    /// are corrupt, or whose latest copy is a tombstone.
    pub fn find_object(&self, name: &[u8]) -> Option<LogEntry> {
        let key = canonical_key(name);
        let bank = self.bank(self.active);
        let size = bank.size();
        let _ = ecc_poll(bank, &self.fault);

        let mut best: Option<LogEntry> = None;
        for slot in 0..self.log_size {
            let entry = read_slot(bank, slot);

            // A blank start word means this slot was never written, so
            // whatever we have found by now is all there is to find.
            if entry.start.get() == LogEntry::UNWRITTEN {
                break;
            }

            let valid = entry.key == key
                && entry.header_crc_ok()
                && entry.payload_in_bounds(size)
                && bank.crc(entry.start.get(), entry.len.get()) == entry.crc.get();
            if let Some(f) = ecc_poll(bank, &self.fault) {
                warn!(
                    "kvs: lookup: uncorrectable ECC fault at {:#x} (pc {:#x})",
                    f.addr, f.pc
                );
                continue;
            }

            if valid {
                best = Some(entry);
            }
            // On a data CRC mismatch we fall back to whatever older copy
            // already won.
        }

        match best {
            Some(entry) if entry.is_tombstone() => None,
            other => other,
        }
    }

    /// Copies an object into `buf`, returning how many bytes were copied.
    /// An object larger than `buf` is silently truncated.
    pub fn read_object(&self, name: &[u8], buf: &mut [u8]) -> Option<usize> {
        let entry = self.find_object(name)?;
        let n = (entry.len.get() as usize).min(buf.len());
        self.bank(self.active).read(entry.start.get(), &mut buf[..n]);
        Some(n)
    }

    /// Reads a plain-data value, returning `default` when the object is
    /// absent or its stored size does not match `T`.
    pub fn read_value<T>(&self, name: &[u8], default: T) -> T
    where
        T: FromBytes + AsBytes,
    {
        if let Some(entry) = self.find_object(name) {
            if entry.len.get() as usize == size_of::<T>() {
                let mut value = T::new_zeroed();
                self.bank(self.active)
                    .read(entry.start.get(), value.as_bytes_mut());
                return value;
            }
        }
        default
    }

    /// Writes a new record for `name`, superseding any previous one.
    ///
    /// A zero-length `data` writes a tombstone, hiding the key from
    /// readers without consuming data space. On failure the store still
    /// holds the previous version of the key (or nothing, for a first
    /// store).
    pub fn store_object(&mut self, name: &[u8], data: &[u8]) -> Result<(), Error<B::Error>> {
        let mut result = Ok(());
        for _ in 0..STORE_ATTEMPTS {
            result = self.store_object_internal(name, data);
            if result.is_ok() {
                return result;
            }
        }
        result
    }

    fn store_object_internal(&mut self, name: &[u8], data: &[u8]) -> Result<(), Error<B::Error>> {
        self.fault.clear();
        let key = canonical_key(name);
        let len = u32::try_from(data.len()).map_err(|_| Error::NoSpace)?;

        // Make room first, compacting at most once for data and once for
        // log slots.
        if self.free_data_space() < len {
            self.compact()?;
            if self.free_data_space() < len {
                return Err(Error::NoSpace);
            }
        }
        if self.free_log_entries() < 1 {
            self.compact()?;
            if self.free_log_entries() < 1 {
                return Err(Error::NoSpace);
            }
        }

        // Find a fully blank landing zone for the payload. A previous
        // aborted write can leave junk above the scanner's cursor; step
        // over it one write block at a time.
        let mut start = self.first_free_data;
        if len != 0 {
            while !self.bank(self.active).is_blank(start, len) {
                self.first_free_data = round_up_to_write_block(self.first_free_data + 1);
                start = self.first_free_data;
                if self.free_data_space() < len {
                    self.compact()?;
                    // The cursors now describe the other bank; give up on
                    // this attempt and let the retry loop start over.
                    return Err(Error::NoSpace);
                }
            }
        }

        let data_crc = low_level::media_crc(data);
        let slot = self.first_free_log_entry;
        let entry = LogEntry::new(key, start, len, data_crc);

        // Reserve the slot by writing everything except the key. If power
        // fails from here on, the blank key makes the stored header CRC
        // unmatchable and every scan skips the slot.
        self.first_free_log_entry += 1;
        reserve_slot(self.bank_mut(self.active), slot, &entry)?;

        if len != 0 {
            self.first_free_data = round_up_to_write_block(start + len);
            write_padded(self.bank_mut(self.active), start, data)?;
            if !self.bank(self.active).compare(start, data) {
                return Err(Error::VerifyMismatch);
            }
        }

        // Key last: this is what commits the record.
        commit_key(self.bank_mut(self.active), slot, &entry)?;
        if !self.bank(self.active).compare(slot_offset(slot), &key) {
            return Err(Error::VerifyMismatch);
        }

        Ok(())
    }

    /// Writes `current` only if it differs from what the store already
    /// holds: an existing equal record, or no record when `current` equals
    /// `default`, skips the write entirely (and the flash wear that goes
    /// with it).
    pub fn store_object_if_necessary(
        &mut self,
        name: &[u8],
        current: &[u8],
        default: &[u8],
    ) -> Result<(), Error<B::Error>> {
        match self.find_object(name) {
            Some(entry) => {
                if entry.len.get() as usize == current.len()
                    && self.bank(self.active).compare(entry.start.get(), current)
                {
                    return Ok(());
                }
            }
            None => {
                if current == default {
                    return Ok(());
                }
            }
        }
        self.store_object(name, current)
    }

    /// Typed flavor of [`Store::store_object_if_necessary`] for plain-data
    /// values.
    pub fn store_value_if_necessary<T>(
        &mut self,
        name: &[u8],
        current: T,
        default: T,
    ) -> Result<(), Error<B::Error>>
    where
        T: AsBytes,
    {
        self.store_object_if_necessary(name, current.as_bytes(), default.as_bytes())
    }

    /// Enumerates the distinct keys in the active bank's log, in
    /// lexicographic key order.
    ///
    /// This reports presence-in-log, not resolved visibility: a key whose
    /// latest record is a tombstone still appears (with `size` 0) until a
    /// compaction drops it. Returns the number of entries written to
    /// `out`.
    pub fn enum_objects(&self, out: &mut [ListEntry]) -> usize {
        let bank = self.bank(self.active);
        let size = bank.size();
        let _ = ecc_poll(bank, &self.fault);
        let mut count = 0;

        'scan: for slot in 0..self.log_size {
            let entry = read_slot(bank, slot);
            if entry.start.get() == LogEntry::UNWRITTEN {
                break;
            }

            let valid = entry.header_crc_ok()
                && entry.payload_in_bounds(size)
                && bank.crc(entry.start.get(), entry.len.get()) == entry.crc.get();
            if let Some(f) = ecc_poll(bank, &self.fault) {
                warn!(
                    "kvs: enumerate: uncorrectable ECC fault at {:#x} (pc {:#x})",
                    f.addr, f.pc
                );
                continue;
            }
            if !valid {
                continue;
            }

            for seen in out[..count].iter_mut() {
                if seen.key == entry.key {
                    seen.size = entry.len.get();
                    seen.revs += 1;
                    continue 'scan;
                }
            }
            if count == out.len() {
                break;
            }
            out[count] = ListEntry {
                key: entry.key,
                size: entry.len.get(),
                revs: 1,
            };
            count += 1;
        }

        out[..count].sort_unstable_by(|a, b| a.key.cmp(&b.key));
        count
    }

    /// Copies every live record into the inactive bank and switches over,
    /// reclaiming the space held by superseded copies and tombstones.
    ///
    /// The destination header is written last: until it lands, a crash at
    /// any point leaves the source bank as the one selected on the next
    /// mount, with nothing changed.
    pub fn compact(&mut self) -> Result<(), Error<B::Error>> {
        self.fault.clear();
        let src_side = self.active;
        let src_version = self.version;
        let default_log_size = self.default_log_size;
        let first_used = self.first_free_log_entry;

        debug!(
            "kvs: compacting, version {} -> {}",
            src_version,
            src_version.wrapping_add(1)
        );

        let fault = &self.fault;
        let (src, dst) = match src_side {
            Side::Left => (&self.left, &mut self.right),
            Side::Right => (&self.right, &mut self.left),
        };
        let src_size = src.size();
        let dst_size = dst.size();

        dst.erase()?;

        let mut next_log: u32 = 0;
        let mut next_data = round_up_to_write_block(data_floor(default_log_size));

        // The blank key (all 0xFF) is reserved, so seeding the ring with
        // it can never shadow a real key.
        let mut ring = [[0xFFu8; NAMELEN]; COMPACT_CACHE];
        let mut next_ring = 0;

        // Newest first, so the first copy of each key we meet is the live
        // one and everything older is a duplicate.
        for slot in (0..first_used).rev() {
            let entry = read_slot(src, slot);
            if let Some(f) = ecc_poll(src, fault) {
                warn!(
                    "kvs: compact: uncorrectable ECC fault at {:#x} (pc {:#x})",
                    f.addr, f.pc
                );
                continue;
            }

            if ring.iter().any(|k| *k == entry.key) {
                continue;
            }

            // Not in the ring; the ring is only a cache, so fall back to
            // scanning what has already been written to the destination.
            let mut already_copied = false;
            for copied in 0..next_log {
                let out = read_slot(&*dst, copied);
                let matches = out.key == entry.key;
                if ecc_poll(&*dst, fault).is_some() {
                    // A fault makes the key non-matching.
                    continue;
                }
                if matches {
                    already_copied = true;
                    break;
                }
            }
            if already_copied {
                continue;
            }

            let valid = entry.header_crc_ok()
                && entry.payload_in_bounds(src_size)
                && src.crc(entry.start.get(), entry.len.get()) == entry.crc.get();
            if let Some(f) = ecc_poll(src, fault) {
                warn!(
                    "kvs: compact: uncorrectable ECC fault at {:#x} (pc {:#x})",
                    f.addr, f.pc
                );
                continue;
            }
            if !valid {
                continue;
            }

            // Tombstones are dropped here; live records move with a fresh
            // start offset and a recomputed header CRC.
            if !entry.is_tombstone() {
                copy_payload(src, entry.start.get(), entry.len.get(), dst, next_data)?;
                let fresh = LogEntry::new(entry.key, next_data, entry.len.get(), entry.crc.get());
                write_slot(dst, next_log, &fresh)?;
                next_data = round_up_to_write_block(next_data + entry.len.get());
                next_log += 1;
            }

            ring[next_ring] = entry.key;
            next_ring = (next_ring + 1) % ring.len();
        }

        // Commit point: a valid header with a greater version makes the
        // destination the bank every future mount selects.
        write_header(dst, src_version.wrapping_add(1), default_log_size)?;

        self.active = src_side.other();
        self.version = src_version.wrapping_add(1);
        self.log_size = default_log_size.min(slots_that_fit(dst_size));
        self.first_free_log_entry = next_log;
        self.first_free_data = next_data;
        Ok(())
    }

    /// Erases the inactive bank. Compacting and then wiping the inactive
    /// bank keeps every current object but destroys all superseded
    /// content.
    pub fn wipe_inactive(&mut self) -> Result<(), Error<B::Error>> {
        let side = self.active.other();
        self.bank_mut(side).erase()?;
        Ok(())
    }

    /// Erases both banks and reformats, destroying every object. For
    /// factory resets and decommissioning.
    pub fn wipe_all(&mut self) -> Result<(), Error<B::Error>> {
        self.left.erase()?;
        self.right.erase()?;
        self.select_bank()?;
        self.rescan();
        Ok(())
    }

    /// Asynchronous ECC fault hook. Call from the bus-fault or NMI handler
    /// when an uncorrectable error is raised by a load from either bank's
    /// mapped range, then resume past the faulting instruction; the value
    /// it produced will be discarded.
    pub fn on_uncorrectable_ecc_fault(&self, flash_addr: u32, pc: u32) {
        self.fault.raise(flash_addr, pc);
    }

    /// Number of log slots in the active bank still available for use.
    pub fn free_log_entries(&self) -> u32 {
        self.log_size.saturating_sub(self.first_free_log_entry)
    }

    /// Number of data bytes in the active bank still available for use.
    pub fn free_data_space(&self) -> u32 {
        self.bank(self.active)
            .size()
            .saturating_sub(self.first_free_data)
    }

    /// Number of log slots in the active bank, used and unused.
    pub fn log_capacity(&self) -> u32 {
        self.log_size
    }

    /// Total number of bytes in the active bank: header, log, and data.
    pub fn block_size(&self) -> u32 {
        self.bank(self.active).size()
    }

    /// Total space allocated to data in the active bank, used and unused.
    pub fn data_capacity(&self) -> u32 {
        self.block_size().saturating_sub(data_floor(self.log_size))
    }

    /// Version counter from the active bank's header.
    pub fn bank_header_version(&self) -> u32 {
        self.version
    }

    pub fn is_left_bank_active(&self) -> bool {
        self.active == Side::Left
    }

    pub fn is_right_bank_active(&self) -> bool {
        self.active == Side::Right
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::low_level::testbank::FakeBank;
    use crate::low_level::{ENTRY_SIZE, HEADER_SIZE};

    const BANK_SIZE: usize = 32768;
    const LOG_SIZE: u32 = 128;

    fn fresh_store() -> Store<FakeBank> {
        let (left, right, _power) = FakeBank::pair(BANK_SIZE);
        Store::new(left, right, LOG_SIZE).expect("mount should succeed")
    }

    fn read_back(store: &Store<FakeBank>, name: &str) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; 2048];
        let n = store.read_object(name.as_bytes(), &mut buf)?;
        buf.truncate(n);
        Some(buf)
    }

    fn remount(store: Store<FakeBank>) -> Store<FakeBank> {
        let (left, right) = store.into_banks();
        Store::new(left, right, LOG_SIZE).expect("remount should succeed")
    }

    #[test]
    fn fresh_mount_formats_left_bank() {
        let store = fresh_store();
        assert!(store.is_left_bank_active());
        assert!(!store.is_right_bank_active());
        assert_eq!(store.bank_header_version(), 0);
        assert_eq!(store.log_capacity(), LOG_SIZE);
        assert_eq!(store.free_log_entries(), LOG_SIZE);
        assert_eq!(
            store.free_data_space(),
            BANK_SIZE as u32
                - low_level::round_up_to_write_block(
                    (HEADER_SIZE + LOG_SIZE as usize * ENTRY_SIZE) as u32
                )
        );
        assert_eq!(
            store.data_capacity(),
            BANK_SIZE as u32 - (HEADER_SIZE + LOG_SIZE as usize * ENTRY_SIZE) as u32
        );
    }

    #[test]
    fn store_then_read_round_trip() {
        let mut store = fresh_store();
        store.store_object(b"OHAI", b"hello world").unwrap();
        assert_eq!(read_back(&store, "OHAI").as_deref(), Some(&b"hello world"[..]));
        assert_eq!(store.free_log_entries(), LOG_SIZE - 1);
    }

    #[test]
    fn latest_version_wins() {
        let mut store = fresh_store();
        store.store_object(b"OHAI", b"hello world").unwrap();
        store.store_object(b"shibe", b"lolcat").unwrap();
        store.store_object(b"OHAI", b"i herd u leik mudkipz").unwrap();

        assert_eq!(read_back(&store, "shibe").as_deref(), Some(&b"lolcat"[..]));
        assert_eq!(
            read_back(&store, "OHAI").as_deref(),
            Some(&b"i herd u leik mudkipz"[..])
        );
    }

    #[test]
    fn missing_key_reads_as_absent() {
        let store = fresh_store();
        assert!(store.find_object(b"nope").is_none());
        let mut buf = [0u8; 8];
        assert_eq!(store.read_object(b"nope", &mut buf), None);
    }

    #[test]
    fn long_and_short_names_canonicalize() {
        let mut store = fresh_store();
        // Longer than NAMELEN: gets truncated on store...
        store
            .store_object(b"exactly_16_chars_plus_extra", b"value")
            .unwrap();
        // ...so the truncated form finds it.
        assert_eq!(
            read_back(&store, "exactly_16_chars").as_deref(),
            Some(&b"value"[..])
        );
    }

    #[test]
    fn read_truncates_silently() {
        let mut store = fresh_store();
        store.store_object(b"big", b"0123456789").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(store.read_object(b"big", &mut buf), Some(4));
        assert_eq!(&buf, b"0123");
    }

    #[test]
    fn tombstone_hides_key_until_compaction() {
        let mut store = fresh_store();
        store.store_object(b"gone", b"xyz").unwrap();
        store.store_object(b"gone", b"").unwrap();

        assert!(store.find_object(b"gone").is_none());

        // Enumeration reports presence-in-log, not visibility.
        let mut list = [ListEntry::EMPTY; 4];
        assert_eq!(store.enum_objects(&mut list), 1);
        assert_eq!(list[0].name(), b"gone");
        assert_eq!(list[0].size, 0);
        assert_eq!(list[0].revs, 2);

        // Compaction drops the tombstone entirely.
        store.compact().unwrap();
        assert_eq!(store.enum_objects(&mut list), 0);
        assert_eq!(store.free_log_entries(), LOG_SIZE);
        assert!(store.find_object(b"gone").is_none());
    }

    #[test]
    fn enum_objects_sorted_with_revs() {
        let mut store = fresh_store();
        store.store_object(b"zeta", b"zz").unwrap();
        store.store_object(b"alpha", b"a").unwrap();
        store.store_object(b"mid", b"mmm").unwrap();
        store.store_object(b"alpha", b"aaaa").unwrap();

        let mut list = [ListEntry::EMPTY; 8];
        let count = store.enum_objects(&mut list);
        assert_eq!(count, 3);
        assert_eq!(list[0].name(), b"alpha");
        assert_eq!(list[0].size, 4);
        assert_eq!(list[0].revs, 2);
        assert_eq!(list[1].name(), b"mid");
        assert_eq!(list[2].name(), b"zeta");
    }

    #[test]
    fn enum_objects_respects_capacity() {
        let mut store = fresh_store();
        store.store_object(b"a", b"1").unwrap();
        store.store_object(b"b", b"2").unwrap();
        store.store_object(b"c", b"3").unwrap();

        let mut list = [ListEntry::EMPTY; 2];
        assert_eq!(store.enum_objects(&mut list), 2);
    }

    #[test]
    fn store_if_necessary_skips_redundant_writes() {
        let mut store = fresh_store();
        store.store_object(b"mode", b"fast").unwrap();
        let entries = store.free_log_entries();
        let data = store.free_data_space();

        // Same value already stored: no write.
        store
            .store_object_if_necessary(b"mode", b"fast", b"slow")
            .unwrap();
        assert_eq!(store.free_log_entries(), entries);
        assert_eq!(store.free_data_space(), data);

        // Absent, but equal to the default: no write.
        store
            .store_object_if_necessary(b"other", b"slow", b"slow")
            .unwrap();
        assert!(store.find_object(b"other").is_none());
        assert_eq!(store.free_log_entries(), entries);

        // Changed: writes.
        store
            .store_object_if_necessary(b"mode", b"slow", b"slow")
            .unwrap();
        assert_eq!(read_back(&store, "mode").as_deref(), Some(&b"slow"[..]));
        assert_eq!(store.free_log_entries(), entries - 1);
    }

    #[test]
    fn typed_values_round_trip() {
        let mut store = fresh_store();
        assert_eq!(store.read_value(b"count", 7u32), 7);

        // Equal to the default while absent: nothing written.
        store.store_value_if_necessary(b"count", 7u32, 7u32).unwrap();
        assert!(store.find_object(b"count").is_none());

        store.store_value_if_necessary(b"count", 9u32, 7u32).unwrap();
        assert_eq!(store.read_value(b"count", 7u32), 9);

        // A size mismatch falls back to the default.
        assert_eq!(store.read_value(b"count", 0u16), 0);
    }

    #[test]
    fn key_buf_formats_and_truncates() {
        let key = KeyBuf::format(format_args!("port{}", 3));
        assert_eq!(key.as_bytes(), b"port3");

        let long = KeyBuf::format(format_args!("{:_<40}", "x"));
        assert_eq!(long.as_bytes().len(), NAMELEN);

        let mut store = fresh_store();
        store.store_object(key.as_bytes(), b"up").unwrap();
        assert_eq!(read_back(&store, "port3").as_deref(), Some(&b"up"[..]));
    }

    #[test]
    fn compact_switches_banks_and_preserves_objects() {
        let mut store = fresh_store();
        store.store_object(b"OHAI", b"hello world").unwrap();
        store.store_object(b"shibe", b"lolcat").unwrap();
        store.store_object(b"OHAI", b"i herd u leik mudkipz").unwrap();
        store.store_object(b"shibe", b"ceiling cat is watching").unwrap();
        store
            .store_object(b"monorail", b"basement cat attacks!!!1!1!")
            .unwrap();

        store.compact().unwrap();

        assert!(store.is_right_bank_active());
        assert_eq!(store.bank_header_version(), 1);
        assert_eq!(store.free_log_entries(), LOG_SIZE - 3);
        assert_eq!(
            read_back(&store, "OHAI").as_deref(),
            Some(&b"i herd u leik mudkipz"[..])
        );
        assert_eq!(
            read_back(&store, "shibe").as_deref(),
            Some(&b"ceiling cat is watching"[..])
        );
        assert_eq!(
            read_back(&store, "monorail").as_deref(),
            Some(&b"basement cat attacks!!!1!1!"[..])
        );
    }

    #[test]
    fn compact_twice_returns_to_left() {
        let mut store = fresh_store();
        store.store_object(b"key", b"value").unwrap();

        store.compact().unwrap();
        store.compact().unwrap();

        assert!(store.is_left_bank_active());
        assert_eq!(store.bank_header_version(), 2);
        assert_eq!(read_back(&store, "key").as_deref(), Some(&b"value"[..]));
    }

    #[test]
    fn auto_compaction_when_data_fills() {
        let mut store = fresh_store();
        store.store_object(b"OHAI", b"hello world").unwrap();
        store.store_object(b"shibe", b"lolcat").unwrap();
        store
            .store_object(b"monorail", b"basement cat attacks!!!1!1!")
            .unwrap();

        let mut i = 0u8;
        while store.is_left_bank_active() {
            i = i.wrapping_add(1);
            store.store_object(b"OHAI", &[i; 1000]).unwrap();
            assert!(i < 100, "compaction never fired");
        }

        assert_eq!(store.bank_header_version(), 1);
        assert_eq!(read_back(&store, "OHAI").as_deref(), Some(&[i; 1000][..]));
        assert_eq!(read_back(&store, "shibe").as_deref(), Some(&b"lolcat"[..]));
        assert_eq!(
            read_back(&store, "monorail").as_deref(),
            Some(&b"basement cat attacks!!!1!1!"[..])
        );

        // The compaction collapsed the key history to three live records,
        // and the store that triggered it appended one more.
        assert_eq!(store.free_log_entries(), LOG_SIZE - 4);
        let mut list = [ListEntry::EMPTY; 8];
        assert_eq!(store.enum_objects(&mut list), 3);
    }

    #[test]
    fn auto_compaction_when_log_fills() {
        let mut store = fresh_store();
        for i in 0..200u32 {
            store.store_object(b"counter", &i.to_le_bytes()).unwrap();
        }
        assert!(store.bank_header_version() >= 1);
        assert_eq!(
            read_back(&store, "counter").as_deref(),
            Some(&199u32.to_le_bytes()[..])
        );
    }

    #[test]
    fn oversized_store_fails_cleanly() {
        let mut store = fresh_store();
        let big = vec![0xAB; BANK_SIZE];
        assert_eq!(store.store_object(b"big", &big), Err(Error::NoSpace));

        // The store is still usable afterwards.
        store.store_object(b"small", b"ok").unwrap();
        assert_eq!(read_back(&store, "small").as_deref(), Some(&b"ok"[..]));
    }

    #[test]
    fn remount_rebuilds_cursors() {
        let mut store = fresh_store();
        store.store_object(b"a", b"1").unwrap();
        store.store_object(b"b", b"22").unwrap();
        store.store_object(b"a", b"333").unwrap();

        let entries = store.free_log_entries();
        let data = store.free_data_space();
        let version = store.bank_header_version();

        let store = remount(store);
        assert!(store.is_left_bank_active());
        assert_eq!(store.free_log_entries(), entries);
        assert_eq!(store.free_data_space(), data);
        assert_eq!(store.bank_header_version(), version);
        assert_eq!(read_back(&store, "a").as_deref(), Some(&b"333"[..]));
        assert_eq!(read_back(&store, "b").as_deref(), Some(&b"22"[..]));
    }

    #[test]
    fn crash_during_store_preserves_prior_value() {
        let v1 = b"first value";
        let v2 = b"second value!!";
        // Entry tail, payload, key: every byte of the second store is a
        // candidate power-cut point.
        let total = (ENTRY_SIZE - NAMELEN) + v2.len() + NAMELEN;

        for cut in 0..total {
            let (left, right, power) = FakeBank::pair(BANK_SIZE);
            let mut store = Store::new(left, right, LOG_SIZE).unwrap();
            store.store_object(b"key", v1).unwrap();

            power.set(Some(cut));
            assert!(store.store_object(b"key", v2).is_err(), "cut at {}", cut);
            power.set(None);

            let store = remount(store);
            assert_eq!(
                read_back(&store, "key").as_deref(),
                Some(&v1[..]),
                "cut at {}",
                cut
            );
        }
    }

    #[test]
    fn crash_during_first_store_reads_as_absent() {
        let value = b"never committed";
        let total = (ENTRY_SIZE - NAMELEN) + value.len() + NAMELEN;

        for cut in 0..total {
            let (left, right, power) = FakeBank::pair(BANK_SIZE);
            let mut store = Store::new(left, right, LOG_SIZE).unwrap();

            power.set(Some(cut));
            assert!(store.store_object(b"key", value).is_err(), "cut at {}", cut);
            power.set(None);

            let store = remount(store);
            assert!(store.find_object(b"key").is_none(), "cut at {}", cut);
        }
    }

    #[test]
    fn crash_during_compact_preserves_state() {
        // Sweep the cut point across every write compaction issues,
        // including partial destination headers; a few points past the end
        // exercise the success path too.
        for cut in 0..200 {
            let (left, right, power) = FakeBank::pair(BANK_SIZE);
            let mut store = Store::new(left, right, LOG_SIZE).unwrap();
            store.store_object(b"OHAI", b"hello world").unwrap();
            store.store_object(b"shibe", b"lolcat").unwrap();
            store.store_object(b"monorail", b"third one").unwrap();

            power.set(Some(cut));
            let result = store.compact();
            power.set(None);

            let store = remount(store);
            if result.is_ok() {
                assert!(store.is_right_bank_active(), "cut at {}", cut);
                assert_eq!(store.bank_header_version(), 1, "cut at {}", cut);
            } else {
                assert!(store.is_left_bank_active(), "cut at {}", cut);
                assert_eq!(store.bank_header_version(), 0, "cut at {}", cut);
            }
            assert_eq!(
                read_back(&store, "OHAI").as_deref(),
                Some(&b"hello world"[..]),
                "cut at {}",
                cut
            );
            assert_eq!(
                read_back(&store, "shibe").as_deref(),
                Some(&b"lolcat"[..]),
                "cut at {}",
                cut
            );
            assert_eq!(
                read_back(&store, "monorail").as_deref(),
                Some(&b"third one"[..]),
                "cut at {}",
                cut
            );
        }
    }

    #[test]
    fn wipe_inactive_preserves_active_bank() {
        let mut store = fresh_store();
        store.store_object(b"keep", b"me").unwrap();
        store.compact().unwrap();
        assert!(store.is_right_bank_active());

        store.wipe_inactive().unwrap();

        let (left, right) = store.into_banks();
        assert!(left.bytes().iter().all(|&b| b == 0xFF));

        let store = Store::new(left, right, LOG_SIZE).unwrap();
        assert!(store.is_right_bank_active());
        assert_eq!(store.bank_header_version(), 1);
        assert_eq!(read_back(&store, "keep").as_deref(), Some(&b"me"[..]));
    }

    #[test]
    fn wipe_all_resets_the_store() {
        let mut store = fresh_store();
        store.store_object(b"secret", b"hunter2").unwrap();
        store.compact().unwrap();

        store.wipe_all().unwrap();

        assert!(store.is_left_bank_active());
        assert_eq!(store.bank_header_version(), 0);
        assert!(store.find_object(b"secret").is_none());
        assert_eq!(store.free_log_entries(), LOG_SIZE);
    }

    #[test]
    fn ecc_fault_falls_back_to_prior_version() {
        let (left, right, _power) = FakeBank::pair(BANK_SIZE);
        let poison = left.poison_handle();
        let mut store = Store::new(left, right, LOG_SIZE).unwrap();

        store.store_object(b"key", b"old").unwrap();
        store.store_object(b"key", b"new").unwrap();
        assert_eq!(read_back(&store, "key").as_deref(), Some(&b"new"[..]));

        // Poison the newest payload: validating it raises a fault, so the
        // lookup falls back to the older committed copy.
        let entry = store.find_object(b"key").unwrap();
        poison
            .borrow_mut()
            .push((entry.start.get(), entry.len.get()));
        assert_eq!(read_back(&store, "key").as_deref(), Some(&b"old"[..]));

        // The flag is consumed each pass, so the result is stable.
        assert_eq!(read_back(&store, "key").as_deref(), Some(&b"old"[..]));
    }

    #[test]
    fn ecc_fault_on_active_header_selects_other_bank() {
        let (left, right, _power) = FakeBank::pair(BANK_SIZE);
        let poison = right.poison_handle();
        let mut store = Store::new(left, right, LOG_SIZE).unwrap();

        store.store_object(b"key", b"old").unwrap();
        store.compact().unwrap();
        store.store_object(b"key", b"new").unwrap();
        assert!(store.is_right_bank_active());

        // The active (right) header now faults on read; mount must fall
        // back to the stale left bank.
        poison.borrow_mut().push((0, HEADER_SIZE as u32));
        let store = remount(store);
        assert!(store.is_left_bank_active());
        assert_eq!(read_back(&store, "key").as_deref(), Some(&b"old"[..]));
    }

    #[test]
    fn async_fault_hook_is_consumed_by_next_lookup() {
        let mut store = fresh_store();
        store.store_object(b"key", b"value").unwrap();

        // A fault raised outside any store read is consulted, cleared,
        // and does not poison subsequent lookups.
        store.on_uncorrectable_ecc_fault(0x0800_0100, 0x2000_1234);
        assert_eq!(read_back(&store, "key").as_deref(), Some(&b"value"[..]));
        assert_eq!(read_back(&store, "key").as_deref(), Some(&b"value"[..]));
    }
}
