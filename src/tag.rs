//! Block codec for sectorized contactless memory cards.
//!
//! A card's memory is divided into sectors of four 16-byte blocks; the last
//! block of every sector is the trailer holding the access keys and is never
//! written by this codec. [`write_buffer`] and [`read_buffer`] map an
//! arbitrary byte buffer onto the three usable data blocks of consecutive
//! sectors, authenticating each block access with key A.
//!
//! Reader hardware is reached through the [`CardReader`] trait so the codec
//! can be exercised against [`MemoryCard`] without a physical reader.

use std::collections::{HashMap, HashSet};

use tracing::{debug, trace};

use crate::{Error, Result};

/// Bytes per physical block on the classic card families.
pub const BLOCK_SIZE: usize = 16;

/// Bytes per write chunk on the light (Ultralight) card family.
pub const LIGHT_CHUNK_SIZE: usize = 4;

/// Usable data blocks per sector; the fourth block is the trailer.
pub const DATA_BLOCKS_PER_SECTOR: u8 = 3;

// ============================================================================
// Card Types
// ============================================================================

/// 6-byte sector authentication key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardKey(pub [u8; 6]);

impl CardKey {
    /// The well-known factory default key, used for both key slots A and B.
    pub const DEFAULT: CardKey = CardKey([0xFF; 6]);
}

impl Default for CardKey {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Chip family reported by a presented card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipFamily {
    MifareMini,
    Mifare1k,
    Mifare4k,
    MifareUltralight,
    Unknown,
}

impl ChipFamily {
    /// Whether the session accepts this family for read/write handling.
    pub fn supported(self) -> bool {
        matches!(
            self,
            ChipFamily::MifareMini | ChipFamily::Mifare1k | ChipFamily::Mifare4k
        )
    }

    /// Write granularity: the light family takes four 4-byte chunks per
    /// 16-byte logical block, everything else takes the block whole.
    pub fn write_chunk_len(self) -> usize {
        match self {
            ChipFamily::MifareUltralight => LIGHT_CHUNK_SIZE,
            _ => BLOCK_SIZE,
        }
    }
}

/// A sector/relative-block pair addressing one physical block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAddress {
    pub sector: u8,
    pub relative_block: u8,
}

impl BlockAddress {
    pub fn new(sector: u8, relative_block: u8) -> Self {
        Self {
            sector,
            relative_block,
        }
    }

    /// Address of the `chunk_index`th data chunk of a buffer laid out from
    /// `start_sector`, skipping every sector's trailer block.
    pub fn for_chunk(start_sector: u8, chunk_index: usize) -> Self {
        Self {
            sector: start_sector + (chunk_index as u8 / DATA_BLOCKS_PER_SECTOR),
            relative_block: chunk_index as u8 % DATA_BLOCKS_PER_SECTOR,
        }
    }

    /// Absolute block number on the card.
    pub fn absolute(self) -> u8 {
        self.sector * 4 + self.relative_block
    }
}

/// Identity and family of a card selected on the reader.
#[derive(Debug, Clone)]
pub struct DetectedCard {
    pub uid: Vec<u8>,
    pub family: ChipFamily,
}

// ============================================================================
// Reader Interface
// ============================================================================

/// Access to a card reader and the card currently selected on it.
///
/// Implementations wrap the reader hardware; [`MemoryCard`] provides an
/// in-memory implementation for tests and demos.
pub trait CardReader {
    /// Probe for a newly presented card and select it.
    ///
    /// Returns `None` when no new card is on the reader. This is the common
    /// idle path and must be cheap.
    fn detect(&mut self) -> Option<DetectedCard>;

    /// Chip family of the currently selected card.
    fn family(&self) -> ChipFamily;

    /// Authenticate the sector containing `absolute_block` with key A.
    fn authenticate(&mut self, absolute_block: u8, key: &CardKey) -> Result<()>;

    /// Read one 16-byte block.
    fn read(&mut self, absolute_block: u8) -> Result<[u8; BLOCK_SIZE]>;

    /// Write `data` at `absolute_block`; `data` is 16 bytes for the classic
    /// families or one 4-byte chunk for the light family.
    fn write(&mut self, absolute_block: u8, data: &[u8]) -> Result<()>;

    /// Halt the selected card and stop reader-side crypto so the card can be
    /// re-presented or removed.
    fn halt(&mut self);
}

// ============================================================================
// Codec
// ============================================================================

/// Write `buffer` onto the card starting at `start_sector`, three data blocks
/// per sector. The final chunk is zero-padded so card content beyond the
/// buffer's end is deterministically cleared.
///
/// Partial writes are possible: a failure aborts the operation but blocks
/// already written are not rolled back.
pub fn write_buffer(
    reader: &mut impl CardReader,
    start_sector: u8,
    buffer: &[u8],
    key: &CardKey,
) -> Result<()> {
    let chunks = buffer.len() / BLOCK_SIZE + 1;

    for i in 0..chunks {
        let mut content = [0u8; BLOCK_SIZE];
        let offset = i * BLOCK_SIZE;
        let take = (buffer.len() - offset).min(BLOCK_SIZE);
        content[..take].copy_from_slice(&buffer[offset..offset + take]);

        let block = BlockAddress::for_chunk(start_sector, i);
        trace!(
            sector = block.sector,
            block = block.relative_block,
            len = take,
            "writing chunk"
        );
        write_block(reader, block, &content, key)?;
    }

    Ok(())
}

/// Read `len` bytes from the card starting at `start_sector`.
///
/// The result is zero-initialized before population: a trailing partial
/// chunk is never fetched from the card and reads back as zeros, as do any
/// blocks left unread by an aborted operation.
pub fn read_buffer(
    reader: &mut impl CardReader,
    start_sector: u8,
    len: usize,
    key: &CardKey,
) -> Result<Vec<u8>> {
    let mut out = vec![0u8; len];

    for i in 0..len / BLOCK_SIZE {
        let block = BlockAddress::for_chunk(start_sector, i);
        trace!(
            sector = block.sector,
            block = block.relative_block,
            "reading chunk"
        );
        let data = read_block(reader, block, key)?;
        out[i * BLOCK_SIZE..(i + 1) * BLOCK_SIZE].copy_from_slice(&data);
    }

    Ok(out)
}

/// Write one zero-padded 16-byte block, refusing trailer blocks before any
/// hardware access.
pub fn write_block(
    reader: &mut impl CardReader,
    block: BlockAddress,
    content: &[u8; BLOCK_SIZE],
    key: &CardKey,
) -> Result<()> {
    if block.relative_block > 3 {
        return Err(Error::InvalidBlockNumber(block.relative_block));
    }

    let absolute = block.absolute();
    if absolute > 2 && (absolute + 1) % 4 == 0 {
        debug!(block = absolute, "refusing write to trailer block");
        return Err(Error::TrailerBlockWrite(absolute));
    }

    reader
        .authenticate(absolute, key)
        .map_err(|e| auth_failure(absolute, e))?;

    // Light cards take the block as four 4-byte chunks; the driver owns the
    // page fan-out behind the shared block address.
    let chunk_len = reader.family().write_chunk_len();
    for chunk in content.chunks(chunk_len) {
        reader.write(absolute, chunk).map_err(|e| {
            debug!(block = absolute, error = %e, "block write failed");
            Error::WriteFailure(absolute)
        })?;
    }

    Ok(())
}

/// Authenticate and read one 16-byte block.
pub fn read_block(
    reader: &mut impl CardReader,
    block: BlockAddress,
    key: &CardKey,
) -> Result<[u8; BLOCK_SIZE]> {
    if block.relative_block > 3 {
        return Err(Error::InvalidBlockNumber(block.relative_block));
    }

    let absolute = block.absolute();
    reader
        .authenticate(absolute, key)
        .map_err(|e| auth_failure(absolute, e))?;

    reader.read(absolute).map_err(|e| {
        debug!(block = absolute, error = %e, "block read failed");
        Error::ReadFailure(absolute)
    })
}

fn auth_failure(absolute: u8, cause: Error) -> Error {
    debug!(block = absolute, error = %cause, "authentication failed");
    Error::AuthenticationFailure(absolute)
}

// ============================================================================
// In-Memory Card
// ============================================================================

/// An in-memory card plus reader, used by the test-suite and demos.
///
/// The card is "presented" with [`MemoryCard::present`] and detected at most
/// once per presentation. Sector authentication succeeds with the factory
/// default key unless the sector was denied via [`MemoryCard::deny_sector`].
/// For the light family, successive 4-byte writes fill consecutive slots of
/// the addressed block, modelling the driver's page fan-out.
pub struct MemoryCard {
    uid: Vec<u8>,
    family: ChipFamily,
    blocks: Vec<[u8; BLOCK_SIZE]>,
    present: bool,
    denied_sectors: HashSet<u8>,
    light_slots: HashMap<u8, usize>,
    auth_calls: usize,
}

impl MemoryCard {
    /// A 1K classic card: 16 sectors of 4 blocks.
    pub fn classic_1k(uid: &[u8]) -> Self {
        Self::with_family(uid, ChipFamily::Mifare1k, 64)
    }

    pub fn with_family(uid: &[u8], family: ChipFamily, block_count: usize) -> Self {
        Self {
            uid: uid.to_vec(),
            family,
            blocks: vec![[0u8; BLOCK_SIZE]; block_count],
            present: false,
            denied_sectors: HashSet::new(),
            light_slots: HashMap::new(),
            auth_calls: 0,
        }
    }

    /// Place the card on the reader; the next [`CardReader::detect`] call
    /// will select it.
    pub fn present(&mut self) {
        self.present = true;
    }

    /// Make authentication fail for every block of `sector`.
    pub fn deny_sector(&mut self, sector: u8) {
        self.denied_sectors.insert(sector);
    }

    /// Number of authentication attempts seen so far.
    pub fn auth_calls(&self) -> usize {
        self.auth_calls
    }

    /// Raw content of one block, for inspection.
    pub fn block(&self, absolute_block: u8) -> &[u8; BLOCK_SIZE] {
        &self.blocks[absolute_block as usize]
    }
}

impl CardReader for MemoryCard {
    fn detect(&mut self) -> Option<DetectedCard> {
        if !self.present {
            return None;
        }
        self.present = false;
        Some(DetectedCard {
            uid: self.uid.clone(),
            family: self.family,
        })
    }

    fn family(&self) -> ChipFamily {
        self.family
    }

    fn authenticate(&mut self, absolute_block: u8, key: &CardKey) -> Result<()> {
        self.auth_calls += 1;
        if self.denied_sectors.contains(&(absolute_block / 4)) || *key != CardKey::DEFAULT {
            return Err(Error::AuthenticationFailure(absolute_block));
        }
        Ok(())
    }

    fn read(&mut self, absolute_block: u8) -> Result<[u8; BLOCK_SIZE]> {
        self.blocks
            .get(absolute_block as usize)
            .copied()
            .ok_or(Error::ReadFailure(absolute_block))
    }

    fn write(&mut self, absolute_block: u8, data: &[u8]) -> Result<()> {
        let block = self
            .blocks
            .get_mut(absolute_block as usize)
            .ok_or(Error::WriteFailure(absolute_block))?;

        match data.len() {
            BLOCK_SIZE => {
                block.copy_from_slice(data);
                Ok(())
            }
            LIGHT_CHUNK_SIZE => {
                let slot = self.light_slots.entry(absolute_block).or_insert(0);
                let offset = *slot * LIGHT_CHUNK_SIZE;
                block[offset..offset + LIGHT_CHUNK_SIZE].copy_from_slice(data);
                *slot = (*slot + 1) % (BLOCK_SIZE / LIGHT_CHUNK_SIZE);
                Ok(())
            }
            _ => Err(Error::WriteFailure(absolute_block)),
        }
    }

    fn halt(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_addressing_skips_trailers() {
        // Three data chunks per sector, the fourth block being the trailer.
        assert_eq!(BlockAddress::for_chunk(1, 0), BlockAddress::new(1, 0));
        assert_eq!(BlockAddress::for_chunk(1, 2), BlockAddress::new(1, 2));
        assert_eq!(BlockAddress::for_chunk(1, 3), BlockAddress::new(2, 0));
        assert_eq!(BlockAddress::for_chunk(1, 7), BlockAddress::new(3, 1));
    }

    #[test]
    fn round_trip_zero_pads_to_requested_length() {
        let mut card = MemoryCard::classic_1k(&[0xDE, 0xAD]);
        let payload = b"LOCATION 000E58AABBCC";
        write_buffer(&mut card, 1, payload, &CardKey::DEFAULT).unwrap();

        let read = read_buffer(&mut card, 1, 32, &CardKey::DEFAULT).unwrap();
        assert_eq!(&read[..payload.len()], payload);
        assert!(read[payload.len()..].iter().all(|&b| b == 0));
    }

    #[test]
    fn twenty_one_bytes_span_two_blocks_of_sector() {
        let mut card = MemoryCard::classic_1k(&[1]);
        write_buffer(&mut card, 1, b"LOCATION 000E58AABBCC", &CardKey::DEFAULT).unwrap();

        // Sector 1 starts at absolute block 4.
        assert_eq!(card.block(4), b"LOCATION 000E58A");
        assert_eq!(&card.block(5)[..5], b"ABBCC");
        assert!(card.block(5)[5..].iter().all(|&b| b == 0));
    }

    #[test]
    fn write_clears_residue_past_buffer_end() {
        let mut card = MemoryCard::classic_1k(&[1]);
        write_buffer(&mut card, 1, &[0xAA; 32], &CardKey::DEFAULT).unwrap();
        write_buffer(&mut card, 1, b"STOP", &CardKey::DEFAULT).unwrap();

        assert_eq!(&card.block(4)[..4], b"STOP");
        assert!(card.block(4)[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn exact_multiple_writes_one_trailing_zero_block() {
        let mut card = MemoryCard::classic_1k(&[1]);
        write_buffer(&mut card, 1, &[0x11; 16], &CardKey::DEFAULT).unwrap();

        assert_eq!(card.block(4), &[0x11; 16]);
        assert_eq!(card.block(5), &[0u8; 16]);
    }

    #[test]
    fn trailer_write_fails_without_touching_hardware() {
        let mut card = MemoryCard::classic_1k(&[1]);
        let err = write_block(
            &mut card,
            BlockAddress::new(1, 3),
            &[0u8; BLOCK_SIZE],
            &CardKey::DEFAULT,
        )
        .unwrap_err();

        assert!(matches!(err, Error::TrailerBlockWrite(7)));
        assert_eq!(card.auth_calls(), 0);
    }

    #[test]
    fn relative_block_out_of_range_is_rejected() {
        let mut card = MemoryCard::classic_1k(&[1]);
        let err = write_block(
            &mut card,
            BlockAddress::new(0, 4),
            &[0u8; BLOCK_SIZE],
            &CardKey::DEFAULT,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidBlockNumber(4)));

        let err = read_block(&mut card, BlockAddress::new(0, 4), &CardKey::DEFAULT).unwrap_err();
        assert!(matches!(err, Error::InvalidBlockNumber(4)));
    }

    #[test]
    fn auth_failure_aborts_but_keeps_earlier_sectors() {
        let mut card = MemoryCard::classic_1k(&[1]);
        card.deny_sector(2);

        // 52 bytes need four chunks: three in sector 1, one in sector 2.
        let err = write_buffer(&mut card, 1, &[0x22; 52], &CardKey::DEFAULT).unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailure(8)));

        // Sector 1 was written before the abort and stays written.
        assert_eq!(card.block(4), &[0x22; 16]);
        assert_eq!(card.block(6), &[0x22; 16]);
        assert_eq!(card.block(8), &[0u8; 16]);
    }

    #[test]
    fn read_of_denied_sector_reports_auth_failure() {
        let mut card = MemoryCard::classic_1k(&[1]);
        card.deny_sector(1);
        let err = read_buffer(&mut card, 1, 16, &CardKey::DEFAULT).unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailure(4)));
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let mut card = MemoryCard::classic_1k(&[1]);
        let key = CardKey([0x00; 6]);
        let err = write_buffer(&mut card, 1, b"STOP", &key).unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailure(4)));
    }

    #[test]
    fn light_family_round_trips_through_chunked_writes() {
        let mut card = MemoryCard::with_family(&[2], ChipFamily::MifareUltralight, 16);
        let payload = b"PLAY spotify:track:abc";
        write_buffer(&mut card, 1, payload, &CardKey::DEFAULT).unwrap();

        let read = read_buffer(&mut card, 1, 32, &CardKey::DEFAULT).unwrap();
        assert_eq!(&read[..payload.len()], payload);
    }

    #[test]
    fn blank_region_reads_as_zeros() {
        let mut card = MemoryCard::classic_1k(&[1]);
        let read = read_buffer(&mut card, 3, 48, &CardKey::DEFAULT).unwrap();
        assert_eq!(read, vec![0u8; 48]);
    }
}
