//! Streaming MBR/EBR decoder.
//!
//! The decoder is fed each slot as it passes through the pipeline and picks
//! the sectors it needs out of it: the MBR at offset 0, then every EBR of
//! the extended-partition chain. It never asks for data behind the stream.

use std::fmt;

use serde::Serialize;
use tracing::{debug, warn};

use crate::settings::SECTOR_SIZE;

const SECTOR: u64 = SECTOR_SIZE as u64;
const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];
const PRIMARY_TABLE: usize = 446;
const CHAIN_ENTRY: usize = 462;
const ENTRY_SIZE: usize = 16;
const FIRST_LOGICAL: u32 = 5;

pub fn is_extended(type_code: u8) -> bool {
    matches!(type_code, 0x05 | 0x0F | 0x85)
}

/// A decoded partition. Offsets are in bytes; `end` is the offset of the
/// partition's last sector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Partition {
    pub label: String,
    pub bootable: bool,
    pub start: u64,
    pub end: u64,
    pub type_code: u8,
}

/// Partition table row in 512-byte sectors, ready for printing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionEntry {
    pub label: String,
    pub bootable: bool,
    pub start_block: u64,
    pub end_block: u64,
    pub length_block: u64,
    pub type_code: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DecoderState {
    /// Waiting for the sector at this byte offset.
    Pending(u64),
    Resolved,
    Failed(String),
}

/// Where an offset falls relative to the decoded partitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Inside(String),
    UnallocatedAfter(String),
    UnallocatedBefore(String),
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Classification::Inside(label) => f.write_str(label),
            Classification::UnallocatedAfter(label) => write!(f, "unallocated after {label}"),
            Classification::UnallocatedBefore(label) => write!(f, "unallocated before {label}"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RawEntry {
    bootable: bool,
    type_code: u8,
    start_sector: u64,
    sectors: u64,
}

impl RawEntry {
    fn parse(entry: &[u8]) -> Self {
        let le32 = |b: &[u8]| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as u64;
        Self {
            bootable: entry[0] == 0x80,
            type_code: entry[4],
            start_sector: le32(&entry[8..12]),
            sectors: le32(&entry[12..16]),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PartitionDecoder {
    device: String,
    partitions: Vec<Partition>,
    state: DecoderState,
    /// First sector of the extended partition; chain pointers are relative to it.
    extended_base: u64,
    next_label: u32,
}

impl PartitionDecoder {
    pub fn new(device_label: impl Into<String>) -> Self {
        Self {
            device: device_label.into(),
            partitions: Vec::new(),
            state: DecoderState::Pending(0),
            extended_base: 0,
            next_label: FIRST_LOGICAL,
        }
    }

    pub fn state(&self) -> &DecoderState {
        &self.state
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, DecoderState::Failed(_))
    }

    pub fn next_required_offset(&self) -> Option<u64> {
        match self.state {
            DecoderState::Pending(offset) => Some(offset),
            _ => None,
        }
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    /// Decodes every pending sector that lies entirely inside `window`,
    /// whose first byte is at `window_start` in the source.
    pub fn observe(&mut self, window: &[u8], window_start: u64) {
        while let DecoderState::Pending(needed) = self.state {
            if needed < window_start {
                self.fail(format!("sector at byte {needed} was not observed"));
                return;
            }
            let window_end = window_start + window.len() as u64;
            if needed + SECTOR > window_end {
                return;
            }
            let rel = (needed - window_start) as usize;
            self.decode_sector(&window[rel..rel + SECTOR_SIZE], needed);
        }
    }

    fn decode_sector(&mut self, sector: &[u8], at: u64) {
        if sector[SECTOR_SIZE - 2..] != BOOT_SIGNATURE {
            self.fail(format!("missing boot signature in sector {}", at / SECTOR));
            return;
        }
        if at == 0 {
            self.decode_mbr(sector);
        } else {
            self.decode_ebr(sector, at / SECTOR);
        }
    }

    fn decode_mbr(&mut self, sector: &[u8]) {
        let mut extended = None;
        for slot in 0..4 {
            let at = PRIMARY_TABLE + slot * ENTRY_SIZE;
            let entry = RawEntry::parse(&sector[at..at + ENTRY_SIZE]);
            if entry.type_code == 0 {
                break;
            }
            self.push(entry, entry.start_sector, slot as u32 + 1);
            if is_extended(entry.type_code) && extended.is_none() {
                extended = Some(entry.start_sector);
            }
        }

        match extended {
            Some(0) => self.fail("extended partition starts at sector 0".into()),
            Some(base) => {
                debug!(base, "Extended partition found, following EBR chain");
                self.extended_base = base;
                self.state = DecoderState::Pending(base * SECTOR);
            }
            None => self.state = DecoderState::Resolved,
        }
    }

    fn decode_ebr(&mut self, sector: &[u8], ebr_sector: u64) {
        let logical = RawEntry::parse(&sector[PRIMARY_TABLE..PRIMARY_TABLE + ENTRY_SIZE]);
        if logical.type_code == 0 {
            self.state = DecoderState::Resolved;
            return;
        }
        let label = self.next_label;
        self.next_label += 1;
        self.push(logical, ebr_sector + logical.start_sector, label);

        let chain = RawEntry::parse(&sector[CHAIN_ENTRY..CHAIN_ENTRY + ENTRY_SIZE]);
        if !is_extended(chain.type_code) {
            self.state = DecoderState::Resolved;
            return;
        }
        let next = self.extended_base + chain.start_sector;
        if next <= ebr_sector {
            self.fail(format!(
                "EBR chain points backwards from sector {ebr_sector} to {next}"
            ));
            return;
        }
        self.state = DecoderState::Pending(next * SECTOR);
    }

    fn push(&mut self, entry: RawEntry, start_sector: u64, number: u32) {
        let last_sector = (start_sector + entry.sectors).saturating_sub(1).max(start_sector);
        let partition = Partition {
            label: format!("{}{number}", self.device),
            bootable: entry.bootable,
            start: start_sector * SECTOR,
            end: last_sector * SECTOR,
            type_code: entry.type_code,
        };
        debug!(
            label = %partition.label,
            start = partition.start,
            end = partition.end,
            type_code = partition.type_code,
            "Partition decoded"
        );
        self.partitions.push(partition);
    }

    fn fail(&mut self, reason: String) {
        warn!(%reason, "Partition table decoding disabled");
        self.state = DecoderState::Failed(reason);
    }

    /// Labels `offset`. Logical partitions are preferred over the extended
    /// container that holds them. `None` when decoding failed or nothing is
    /// known yet.
    pub fn classify(&self, offset: u64) -> Option<Classification> {
        if self.is_failed() || self.partitions.is_empty() {
            return None;
        }

        if let Some(p) = self
            .partitions
            .iter()
            .rev()
            .find(|p| p.start <= offset && offset <= p.end)
        {
            return Some(Classification::Inside(p.label.clone()));
        }

        let preceding = self
            .partitions
            .iter()
            .filter(|p| p.end < offset)
            .max_by_key(|p| p.end);
        match preceding {
            Some(p) => Some(Classification::UnallocatedAfter(p.label.clone())),
            None => self
                .partitions
                .iter()
                .min_by_key(|p| p.start)
                .map(|p| Classification::UnallocatedBefore(p.label.clone())),
        }
    }

    pub fn snapshot(&self) -> Vec<PartitionEntry> {
        self.partitions
            .iter()
            .map(|p| PartitionEntry {
                label: p.label.clone(),
                bootable: p.bootable,
                start_block: p.start / SECTOR,
                end_block: p.end / SECTOR,
                length_block: (p.end - p.start) / SECTOR + 1,
                type_code: p.type_code,
            })
            .collect()
    }
}

/// Human-readable name of an MBR partition type code.
pub fn partition_type_name(code: u8) -> Option<&'static str> {
    let name = match code {
        0x00 => "Empty partition",
        0x01 => "FAT12",
        0x02 => "XENIX root",
        0x03 => "XENIX usr",
        0x04 => "FAT16 with less than 65536 sectors (32 MB)",
        0x05 => "Extended partition with CHS addressing",
        0x06 => "FAT16 with 65536 or more sectors",
        0x07 => "HPFS or NTFS or exFAT",
        0x08 => "AIX",
        0x09 => "AIX bootable",
        0x0A => "OS/2 Boot Manager",
        0x0B => "FAT32 with CHS addressing",
        0x0C => "FAT32 with LBA",
        0x0E => "FAT16 with LBA",
        0x0F => "Extended partition with LBA",
        0x11 => "Hidden FAT12",
        0x12 => "Compaq diagnostics (FAT) or another OEM partition",
        0x14 => "Hidden FAT16",
        0x17 => "Hidden HPFS or hidden NTFS",
        0x1B => "Hidden FAT32",
        0x1C => "Hidden FAT32 with LBA",
        0x1D => "Hidden FAT16 with LBA",
        0x20 => "Windows Mobile update XIP",
        0x23 => "Windows Mobile boot XIP",
        0x25 => "Windows Mobile IMGFS",
        0x27 => "Windows recovery partition (hidden NTFS)",
        0x3C => "PqRP (PartitionMagic in progress)",
        0x64 => "NetWare File System 286",
        0x65 => "NetWare File System 386",
        0x78 => "XOSL bootloader filesystem",
        0x80 => "Old Minix file system",
        0x81 => "MINIX file system",
        0x82 => "Linux swap space or Solaris",
        0x83 => "Native Linux file system",
        0x84 => "Hibernation (suspend to disk, S2D)",
        0x85 => "Linux extended",
        0x86 => "Legacy FT FAT16",
        0x87 => "Legacy FT NTFS",
        0x88 => "Linux plaintext",
        0x89 => "Linux LVM",
        0x8B => "Legacy FT FAT32",
        0x8C => "Legacy FT FAT32 with LBA",
        0xA0 => "Diagnostic partition for HP laptops",
        0xA5 => "BSD slice",
        0xDE => "Dell diagnostic partition",
        0xEB => "BFS (BeOS or Haiku)",
        0xEE => "EFI protective MBR",
        0xEF => "EFI System partition",
        0xFB => "VMware VMFS",
        0xFC => "VMware VMKCORE",
        0xFD => "Linux RAID auto",
        0xFE => "IBM IML partition",
        _ => return None,
    };
    Some(name)
}
