//! Incremental OGG page reader and packet reassembly.
//!
//! Bytes arrive in arbitrary slices from the network, so the reader keeps a
//! byte buffer and only hands out pages once they are complete.

use bytes::{Buf, BytesMut};

use crate::error::{AudioError, Result};

const CAPTURE_PATTERN: &[u8; 4] = b"OggS";
const HEADER_LEN: usize = 27;
const MAX_SEGMENT: u8 = 255;

pub const FLAG_CONTINUED: u8 = 0x01;
pub const FLAG_BOS: u8 = 0x02;
pub const FLAG_EOS: u8 = 0x04;

/// CRC-32 as used by OGG: polynomial 0x04C11DB7, no reflection, zero init.
const CRC_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut r = (i as u32) << 24;
        let mut bit = 0;
        while bit < 8 {
            r = if r & 0x8000_0000 != 0 {
                (r << 1) ^ 0x04C1_1DB7
            } else {
                r << 1
            };
            bit += 1;
        }
        table[i] = r;
        i += 1;
    }
    table
};

pub fn crc32(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |crc, &b| {
        (crc << 8) ^ CRC_TABLE[((crc >> 24) as u8 ^ b) as usize]
    })
}

/// One OGG page with its payload already split into lacing segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub flags: u8,
    /// -1 when no packet finishes on this page.
    pub granule_position: i64,
    pub serial: u32,
    pub sequence: u32,
    pub segments: Vec<u8>,
    pub payload: Vec<u8>,
}

impl Page {
    pub fn is_continued(&self) -> bool {
        self.flags & FLAG_CONTINUED != 0
    }

    pub fn is_bos(&self) -> bool {
        self.flags & FLAG_BOS != 0
    }

    pub fn is_eos(&self) -> bool {
        self.flags & FLAG_EOS != 0
    }

    /// Build a page holding whole packets. Each packet is laced completely,
    /// so the page never ends on a continued packet.
    pub fn with_packets(
        flags: u8,
        granule_position: i64,
        serial: u32,
        sequence: u32,
        packets: &[&[u8]],
    ) -> Self {
        let mut segments = Vec::new();
        let mut payload = Vec::new();
        for packet in packets {
            let mut remaining = packet.len();
            while remaining >= MAX_SEGMENT as usize {
                segments.push(MAX_SEGMENT);
                remaining -= MAX_SEGMENT as usize;
            }
            segments.push(remaining as u8);
            payload.extend_from_slice(packet);
        }
        Self {
            flags,
            granule_position,
            serial,
            sequence,
            segments,
            payload,
        }
    }

    /// Serialise with a freshly computed checksum.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.segments.len() + self.payload.len());
        out.extend_from_slice(CAPTURE_PATTERN);
        out.push(0);
        out.push(self.flags);
        out.extend_from_slice(&self.granule_position.to_le_bytes());
        out.extend_from_slice(&self.serial.to_le_bytes());
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out.extend_from_slice(&[0, 0, 0, 0]);
        out.push(self.segments.len() as u8);
        out.extend_from_slice(&self.segments);
        out.extend_from_slice(&self.payload);
        let crc = crc32(&out);
        out[22..26].copy_from_slice(&crc.to_le_bytes());
        out
    }
}

/// Splits a byte stream into pages.
#[derive(Default)]
pub struct PageReader {
    buffer: BytesMut,
}

impl PageReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes received but not yet part of a complete page.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Next complete page, `None` if more bytes are needed.
    pub fn next_page(&mut self) -> Result<Option<Page>> {
        let available = self.buffer.len();
        let probe = available.min(CAPTURE_PATTERN.len());
        if self.buffer[..probe] != CAPTURE_PATTERN[..probe] {
            return Err(AudioError::Decode(
                "lost OGG sync: expected capture pattern".into(),
            ));
        }
        if available < HEADER_LEN {
            return Ok(None);
        }
        let version = self.buffer[4];
        if version != 0 {
            return Err(AudioError::UnsupportedFormat(format!(
                "OGG stream structure version {}",
                version
            )));
        }
        let segment_count = self.buffer[26] as usize;
        if available < HEADER_LEN + segment_count {
            return Ok(None);
        }
        let segments = self.buffer[HEADER_LEN..HEADER_LEN + segment_count].to_vec();
        let body_len: usize = segments.iter().map(|&s| s as usize).sum();
        let page_len = HEADER_LEN + segment_count + body_len;
        if available < page_len {
            return Ok(None);
        }

        let raw = self.buffer.split_to(page_len);
        let stored_crc = u32::from_le_bytes([raw[22], raw[23], raw[24], raw[25]]);
        let mut check = raw.to_vec();
        check[22..26].fill(0);
        if crc32(&check) != stored_crc {
            return Err(AudioError::Decode(format!(
                "OGG page checksum mismatch (stored {:08x})",
                stored_crc
            )));
        }

        let mut header = &raw[5..HEADER_LEN];
        let flags = header.get_u8();
        let granule_position = header.get_i64_le();
        let serial = header.get_u32_le();
        let sequence = header.get_u32_le();
        let payload = raw[HEADER_LEN + segment_count..].to_vec();

        Ok(Some(Page {
            flags,
            granule_position,
            serial,
            sequence,
            segments,
            payload,
        }))
    }
}

/// A packet completed on a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub data: Vec<u8>,
    /// Granule position of the page, attached to the last packet ending on it.
    pub granule_position: Option<i64>,
    /// The packet ends on the final page of the logical stream.
    pub last_in_stream: bool,
}

/// Rebuilds packets that may span several pages.
#[derive(Default)]
pub struct PacketAssembler {
    partial: Vec<u8>,
    serial: Option<u32>,
    next_sequence: Option<u32>,
    /// Set after a gap so the continuation of a lost packet is skipped.
    skip_continuation: bool,
}

impl PacketAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// A packet is cut off mid-way.
    pub fn has_partial(&self) -> bool {
        !self.partial.is_empty()
    }

    pub fn push_page(&mut self, page: &Page) -> Result<Vec<Packet>> {
        match self.serial {
            None => self.serial = Some(page.serial),
            Some(serial) if serial != page.serial => {
                return Err(AudioError::UnsupportedFormat(format!(
                    "multiplexed or chained OGG stream (serial {:08x} after {:08x})",
                    page.serial, serial
                )));
            }
            Some(_) => {}
        }

        if let Some(expected) = self.next_sequence {
            if page.sequence != expected {
                log::warn!(
                    "OGG page sequence gap: expected {}, got {}; dropping partial packet",
                    expected,
                    page.sequence
                );
                self.partial.clear();
                self.skip_continuation = true;
            }
        }
        self.next_sequence = Some(page.sequence.wrapping_add(1));

        if !page.is_continued() {
            if !self.partial.is_empty() {
                log::warn!("OGG packet left unfinished by a new page, discarding");
                self.partial.clear();
            }
            self.skip_continuation = false;
        }

        let mut packets = Vec::new();
        let mut offset = 0usize;
        let mut skipping = page.is_continued() && self.skip_continuation;
        for &lace in &page.segments {
            let end = offset + lace as usize;
            if !skipping {
                self.partial.extend_from_slice(&page.payload[offset..end]);
            }
            offset = end;
            if lace < MAX_SEGMENT {
                if skipping {
                    skipping = false;
                    self.skip_continuation = false;
                } else {
                    packets.push(Packet {
                        data: std::mem::take(&mut self.partial),
                        granule_position: None,
                        last_in_stream: false,
                    });
                }
            }
        }

        if let Some(last) = packets.last_mut() {
            if page.granule_position >= 0 {
                last.granule_position = Some(page.granule_position);
            }
            last.last_in_stream = page.is_eos();
        }
        Ok(packets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(flags: u8, granule: i64, seq: u32, packets: &[&[u8]]) -> Page {
        Page::with_packets(flags, granule, 7, seq, packets)
    }

    #[test]
    fn crc_matches_reference_vector() {
        // Known value for the OGG CRC variant.
        assert_eq!(crc32(b"123456789"), 0x89A1_897F);
    }

    #[test]
    fn page_round_trips_through_reader_in_small_slices() {
        let original = page(FLAG_BOS, 0, 0, &[b"OpusHead-ish", &[9u8; 300]]);
        let bytes = original.to_bytes();
        let mut reader = PageReader::new();
        for piece in bytes.chunks(5) {
            assert!(reader.next_page().unwrap().is_none());
            reader.push(piece);
        }
        let read = reader.next_page().unwrap().unwrap();
        assert_eq!(read, original);
        assert_eq!(reader.buffered(), 0);
        assert!(reader.next_page().unwrap().is_none());
    }

    #[test]
    fn corrupt_checksum_is_a_decode_error() {
        let mut bytes = page(0, 10, 1, &[b"abc"]).to_bytes();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let mut reader = PageReader::new();
        reader.push(&bytes);
        assert!(matches!(reader.next_page(), Err(AudioError::Decode(_))));
    }

    #[test]
    fn garbage_instead_of_capture_pattern_is_fatal() {
        let mut reader = PageReader::new();
        reader.push(b"RIFF....WAVE");
        assert!(matches!(reader.next_page(), Err(AudioError::Decode(_))));
    }

    #[test]
    fn packets_spanning_pages_are_reassembled() {
        let big = vec![3u8; 600];
        let whole = page(0, 100, 0, &[&big]);
        // Split the laced packet across two pages by hand.
        let first = Page {
            flags: 0,
            granule_position: -1,
            serial: 7,
            sequence: 0,
            segments: vec![255, 255],
            payload: big[..510].to_vec(),
        };
        let second = Page {
            flags: FLAG_CONTINUED | FLAG_EOS,
            granule_position: 100,
            serial: 7,
            sequence: 1,
            segments: vec![whole.segments[2]],
            payload: big[510..].to_vec(),
        };
        let mut asm = PacketAssembler::new();
        assert!(asm.push_page(&first).unwrap().is_empty());
        assert!(asm.has_partial());
        let packets = asm.push_page(&second).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].data, big);
        assert_eq!(packets[0].granule_position, Some(100));
        assert!(packets[0].last_in_stream);
    }

    #[test]
    fn granule_attaches_to_last_packet_on_page() {
        let mut asm = PacketAssembler::new();
        let packets = asm
            .push_page(&page(0, 1920, 0, &[b"a", b"b"]))
            .unwrap();
        assert_eq!(packets[0].granule_position, None);
        assert_eq!(packets[1].granule_position, Some(1920));
    }

    #[test]
    fn sequence_gap_discards_the_lost_continuation() {
        let mut asm = PacketAssembler::new();
        asm.push_page(&Page {
            flags: 0,
            granule_position: -1,
            serial: 7,
            sequence: 0,
            segments: vec![255],
            payload: vec![1; 255],
        })
        .unwrap();
        // Page 1 lost; page 2 starts with the tail of some packet.
        let packets = asm
            .push_page(&Page {
                flags: FLAG_CONTINUED,
                granule_position: 500,
                serial: 7,
                sequence: 2,
                segments: vec![10, 3],
                payload: [vec![2; 10], vec![5; 3]].concat(),
            })
            .unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].data, vec![5; 3]);
    }

    #[test]
    fn second_logical_stream_is_unsupported() {
        let mut asm = PacketAssembler::new();
        asm.push_page(&page(FLAG_BOS, 0, 0, &[b"x"])).unwrap();
        let other = Page::with_packets(FLAG_BOS, 0, 8, 0, &[b"y"]);
        assert!(matches!(
            asm.push_page(&other),
            Err(AudioError::UnsupportedFormat(_))
        ));
    }
}
