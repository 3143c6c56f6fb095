//! Non-volatile variable store.
//!
//! EEPROM emulation over the two topmost flash pages. Variables are 16-bit
//! values appended as 4-byte records (key, value) to the active page; when
//! the page fills up the latest value of every key is transferred to the
//! other page and the old page is erased. All operations have a bounded
//! worst case and are callable from interrupt context.

use openrmc_proto::board::{NvKey, NvStatus};
use stm32f1xx_hal::flash::{FlashSize, FlashWriter, Parts, SectorSize};

/// Flash page size.
const PAGE_SIZE: u32 = 1024;

/// Offsets of the two store pages from the start of flash (last two pages
/// of the 128 KiB part, kept out of the program image by the linker
/// script).
const PAGE_OFFSETS: [u32; 2] = [0x1f800, 0x1fc00];

/// Page status marker: written to the first record slot of the active page.
const PAGE_VALID: u16 = 0x0000;

/// Erased flash word.
const ERASED: u16 = 0xffff;

/// Record size in bytes: 16-bit key followed by 16-bit value.
const RECORD_SIZE: u32 = 4;

fn key_id(key: NvKey) -> u16 {
    match key {
        NvKey::Reset => 0x0001,
        NvKey::WatchdogStatus => 0x0002,
    }
}

static KEYS: &[NvKey] = &[NvKey::Reset, NvKey::WatchdogStatus];

/// Variable store over two flash pages.
pub struct NvStore {
    flash: Parts,
    active: usize,
}

impl NvStore {
    /// Opens the store, formatting the pages on first use.
    pub fn new(mut flash: Parts) -> Result<Self, NvStatus> {
        let active = {
            let writer = Self::writer_for(&mut flash);
            match (page_valid(&writer, 0), page_valid(&writer, 1)) {
                (true, false) => Some(0),
                (false, true) => Some(1),
                // First use or interrupted transfer; re-format below.
                (true, true) | (false, false) => None,
            }
        };

        let mut store = Self { flash, active: active.unwrap_or(0) };
        if active.is_none() {
            defmt::info!("formatting non-volatile store");
            store.format()?;
        }
        Ok(store)
    }

    fn writer_for(flash: &mut Parts) -> FlashWriter {
        flash.writer(SectorSize::Sz1K, FlashSize::Sz128K)
    }

    fn format(&mut self) -> Result<(), NvStatus> {
        let mut writer = Self::writer_for(&mut self.flash);
        for page in 0..2 {
            writer.erase(PAGE_OFFSETS[page], PAGE_SIZE as usize).map_err(|_| NvStatus::NoValidPage)?;
        }
        mark_valid(&mut writer, 0)?;
        self.active = 0;
        Ok(())
    }

    /// Reads the latest value of a variable.
    pub fn read(&mut self, key: NvKey) -> Option<u16> {
        let active = self.active;
        let writer = Self::writer_for(&mut self.flash);
        read_page(&writer, active, key_id(key))
    }

    /// Writes a variable, transferring to the other page when full.
    pub fn write(&mut self, key: NvKey, value: u16) -> NvStatus {
        let active = self.active;
        let mut writer = Self::writer_for(&mut self.flash);

        match append(&mut writer, active, key_id(key), value) {
            NvStatus::PageFull => (),
            status => return status,
        }

        // Transfer the latest value of every key to the spare page.
        let spare = 1 - active;
        if writer.erase(PAGE_OFFSETS[spare], PAGE_SIZE as usize).is_err() {
            return NvStatus::NoValidPage;
        }
        for &other in KEYS {
            let transferred =
                if other == key { Some(value) } else { read_page(&writer, active, key_id(other)) };
            if let Some(v) = transferred {
                match append(&mut writer, spare, key_id(other), v) {
                    NvStatus::Ok => (),
                    status => return status,
                }
            }
        }
        if let Err(status) = mark_valid(&mut writer, spare) {
            return status;
        }
        if writer.erase(PAGE_OFFSETS[active], PAGE_SIZE as usize).is_err() {
            return NvStatus::NoValidPage;
        }

        self.active = spare;
        NvStatus::Ok
    }
}

fn read_u16(writer: &FlashWriter, offset: u32) -> Option<u16> {
    let data = writer.read(offset, 2).ok()?;
    Some(u16::from_le_bytes([data[0], data[1]]))
}

fn page_valid(writer: &FlashWriter, page: usize) -> bool {
    read_u16(writer, PAGE_OFFSETS[page]) == Some(PAGE_VALID)
}

fn mark_valid(writer: &mut FlashWriter, page: usize) -> Result<(), NvStatus> {
    writer.write(PAGE_OFFSETS[page], &PAGE_VALID.to_le_bytes()).map_err(|_| NvStatus::NoValidPage)
}

/// Scans the page for the latest record of the key.
fn read_page(writer: &FlashWriter, page: usize, id: u16) -> Option<u16> {
    let base = PAGE_OFFSETS[page];
    let mut latest = None;
    let mut offset = base + RECORD_SIZE;
    while offset < base + PAGE_SIZE {
        match read_u16(writer, offset) {
            Some(k) if k == ERASED => break,
            Some(k) if k == id => latest = read_u16(writer, offset + 2),
            Some(_) => (),
            None => return None,
        }
        offset += RECORD_SIZE;
    }
    latest
}

/// Appends a record to the first erased slot of the page.
fn append(writer: &mut FlashWriter, page: usize, id: u16, value: u16) -> NvStatus {
    let base = PAGE_OFFSETS[page];
    let mut offset = base + RECORD_SIZE;
    while offset < base + PAGE_SIZE {
        match read_u16(writer, offset) {
            Some(k) if k == ERASED => {
                let mut record = [0; 4];
                record[..2].copy_from_slice(&id.to_le_bytes());
                record[2..].copy_from_slice(&value.to_le_bytes());
                match writer.write(offset, &record) {
                    Ok(()) => return NvStatus::Ok,
                    Err(_) => return NvStatus::NoValidPage,
                }
            }
            Some(_) => offset += RECORD_SIZE,
            None => return NvStatus::NoValidPage,
        }
    }
    NvStatus::PageFull
}
