//! Velo/Vita binary stream format of the X6-1000M.
//!
//! Both directions of sample data, the capture file written by the board's logger and the
//! playback file it plays from, use the same two-level packet format:
//!
//! - **Velo packets** are the outer, transport-level framing. A 4-word header gives the packet
//!   size in 32-bit words (24-bit little-endian) and the peripheral id (8 bits), followed by three
//!   reserved words. Payloads are at most [`VELO_PACKET_SIZE`] bytes and do not respect Vita
//!   packet boundaries.
//! - **Vita packets** live in the concatenated Velo payloads. A 7-word header holds the IF word
//!   (little-endian 16-bit size in words, 2-bit TSI, 2-bit TSF, 4-bit packet count and a constant
//!   `0b00011100`), the stream id word (16-bit stream id, 16-bit destination mask), two reserved
//!   words and the timestamps. The header is followed by up to [`VITA_PACKET_SIZE`] bytes of
//!   little-endian 16-bit samples, optional padding, and a trailer word recording the padding.
//!
//! Packet counts run modulo 16 over all streams together.
//!
//! [`parse_velo_stream`] turns a capture into one sample vector per stream, keyed the way the
//! board documentation names streams (`"0x100"` for stream 256). [`rawbin_to_velo`] packs sample
//! streams into a playback file.

use indexmap::IndexMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::*;
use crate::utils::*;

/// Largest Vita payload, in bytes.
pub const VITA_PACKET_SIZE: usize = 0xF000 * 4;
/// Largest Velo payload, in bytes.
pub const VELO_PACKET_SIZE: usize = 0x10000 * 4;

pub const VELO_HEADER_WORDS: usize = 4;
pub const VITA_HEADER_WORDS: usize = 7;
const WORD: usize = 4;
const IF_WORD_CONST: u8 = 0b0001_1100;
// Upper byte of the 20-bit trailer constant 0x0F000, as laid out in the last three bytes
const TRAILER_CONST: [u8; 2] = [0xF0, 0x00];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VeloHeader {
    /// Whole packet size, header included, in words
    pub packet_size: u32,
    pub peripheral_id: u8,
}

impl VeloHeader {
    pub fn to_bytes(&self) -> [u8; VELO_HEADER_WORDS * WORD] {
        let mut bytes = [0u8; VELO_HEADER_WORDS * WORD];
        bytes[..3].copy_from_slice(&self.packet_size.to_le_bytes()[..3]);
        bytes[3] = self.peripheral_id;
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < VELO_HEADER_WORDS * WORD {
            return Err(Error::Stream(format!(
                "truncated Velo header ({} bytes)",
                bytes.len()
            )));
        }
        Ok(Self {
            packet_size: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]),
            peripheral_id: bytes[3],
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VitaHeader {
    /// Whole packet size, header and trailer included, in words
    pub packet_size: u16,
    pub tsi: u8,
    pub tsf: u8,
    pub packet_count: u8,
    pub stream_id: u16,
    pub dest_mask: u16,
    pub timestamp: (u32, u64),
}

impl VitaHeader {
    pub fn to_bytes(&self) -> [u8; VITA_HEADER_WORDS * WORD] {
        let mut bytes = [0u8; VITA_HEADER_WORDS * WORD];
        bytes[0..2].copy_from_slice(&self.packet_size.to_le_bytes());
        bytes[2] = (self.tsi & 0b11) << 6 | (self.tsf & 0b11) << 4 | (self.packet_count & 0x0F);
        bytes[3] = IF_WORD_CONST;
        bytes[4..6].copy_from_slice(&self.stream_id.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.dest_mask.to_le_bytes());
        // bytes 8..12 reserved
        bytes[12..16].copy_from_slice(&[0x00, 0x00, 0x03, 0x00]);
        bytes[16..20].copy_from_slice(&self.timestamp.0.to_le_bytes());
        bytes[20..28].copy_from_slice(&self.timestamp.1.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < VITA_HEADER_WORDS * WORD {
            return Err(Error::Stream(format!(
                "truncated Vita header ({} bytes)",
                bytes.len()
            )));
        }
        if bytes[3] != IF_WORD_CONST {
            log::debug!("unexpected Vita IF word constant {:#010b}", bytes[3]);
        }
        let mut ts_int = [0u8; 4];
        ts_int.copy_from_slice(&bytes[16..20]);
        let mut ts_frac = [0u8; 8];
        ts_frac.copy_from_slice(&bytes[20..28]);
        Ok(Self {
            packet_size: u16::from_le_bytes([bytes[0], bytes[1]]),
            tsi: bytes[2] >> 6,
            tsf: (bytes[2] >> 4) & 0b11,
            packet_count: bytes[2] & 0x0F,
            stream_id: u16::from_le_bytes([bytes[4], bytes[5]]),
            dest_mask: u16::from_le_bytes([bytes[6], bytes[7]]),
            timestamp: (u32::from_le_bytes(ts_int), u64::from_le_bytes(ts_frac)),
        })
    }
}

fn vita_trailer(padding: u8) -> [u8; WORD] {
    [0x00, (padding & 0x0F) << 4, TRAILER_CONST[0], TRAILER_CONST[1]]
}

/// One Vita datagram under construction.
pub struct VitaPacket<'a> {
    data: &'a [u8],
    pub stream_id: u16,
    pub dest_mask: u16,
    pub timestamp: (u32, u64),
    pub tsi: u8,
    pub tsf: u8,
    pub packet_count: u8,
}

impl<'a> VitaPacket<'a> {
    pub fn new(data: &'a [u8], stream_id: u16) -> Self {
        Self {
            data,
            stream_id,
            dest_mask: 1,
            timestamp: (0, 0),
            tsi: 3,
            tsf: 3,
            packet_count: 0,
        }
    }

    /// Bytes of padding needed to end the payload on a word boundary.
    pub fn padding(&self) -> usize {
        (WORD - self.data.len() % WORD) % WORD
    }

    pub fn datagram(&self) -> Vec<u8> {
        let padding = self.padding();
        let data_words = (self.data.len() + padding) / WORD;
        let header = VitaHeader {
            packet_size: (VITA_HEADER_WORDS + data_words + 1) as u16,
            tsi: self.tsi,
            tsf: self.tsf,
            packet_count: self.packet_count,
            stream_id: self.stream_id,
            dest_mask: self.dest_mask,
            timestamp: self.timestamp,
        };
        let mut out = Vec::with_capacity((VITA_HEADER_WORDS + data_words + 1) * WORD);
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(self.data);
        out.resize(out.len() + padding, 0);
        out.extend_from_slice(&vita_trailer(padding as u8));
        out
    }
}

/// Buffers Vita datagrams and writes them out in Velo packets of at most [`VELO_PACKET_SIZE`].
pub struct VeloVitaPacker<W: Write> {
    out: W,
    buffer: Vec<u8>,
    peripheral_id: u8,
}

impl<W: Write> VeloVitaPacker<W> {
    pub fn new(out: W, peripheral_id: u8) -> Self {
        Self {
            out,
            buffer: Vec::new(),
            peripheral_id,
        }
    }

    pub fn pack(&mut self, packet: &VitaPacket) -> Result<()> {
        self.buffer.extend(packet.datagram());
        while self.buffer.len() >= VELO_PACKET_SIZE {
            self.write_packet(VELO_PACKET_SIZE)?;
        }
        Ok(())
    }

    fn write_packet(&mut self, size: usize) -> Result<()> {
        let header = VeloHeader {
            packet_size: (VELO_HEADER_WORDS + size / WORD) as u32,
            peripheral_id: self.peripheral_id,
        };
        self.out.write_all(&header.to_bytes())?;
        self.out.write_all(&self.buffer[..size])?;
        self.buffer.drain(..size);
        Ok(())
    }

    /// Writes out what is left in the buffer and returns the underlying writer.
    pub fn finish(mut self) -> Result<W> {
        while !self.buffer.is_empty() {
            let size = self.buffer.len().min(VELO_PACKET_SIZE);
            self.write_packet(size)?;
        }
        self.out.flush()?;
        Ok(self.out)
    }
}

/// Concatenates the payloads of consecutive Velo packets, dropping their headers.
pub fn strip_velo_headers(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut payload = Vec::with_capacity(bytes.len());
    let mut pos = 0;
    while pos < bytes.len() {
        let header = VeloHeader::from_bytes(&bytes[pos..])?;
        if (header.packet_size as usize) < VELO_HEADER_WORDS {
            return Err(Error::Stream(format!(
                "Velo packet at byte {} declares {} words",
                pos, header.packet_size
            )));
        }
        pos += VELO_HEADER_WORDS * WORD;
        let n_bytes = WORD * (header.packet_size as usize - VELO_HEADER_WORDS);
        log::debug!("Reading new Velo packet containing {} bytes.", n_bytes);
        let end = (pos + n_bytes).min(bytes.len());
        payload.extend_from_slice(&bytes[pos..end]);
        pos = end;
    }
    Ok(payload)
}

/// Splits concatenated Vita datagrams into `(stream_id, data)` pairs, padding removed.
///
/// Count mismatches are reported as warnings only. A truncated final packet is dropped.
pub fn packetize_vita_stream(bytes: &[u8]) -> Result<Vec<(u16, &[u8])>> {
    let mut packets = Vec::new();
    let mut next_count = 0u8;
    let mut pos = 0;
    while pos < bytes.len() {
        let header = VitaHeader::from_bytes(&bytes[pos..])?;
        log::debug!(
            "Reading new Vita packet on stream {:#X} with size {} and count {}",
            header.stream_id,
            header.packet_size,
            header.packet_count
        );
        if header.packet_count != next_count {
            log::warn!(
                "Packet count {} in stream {:#X} didn't match expected {}. Is this really a Vita stream?",
                header.packet_count,
                header.stream_id,
                next_count
            );
        }
        next_count = (next_count + 1) % 16;

        let packet_words = header.packet_size as usize;
        if packet_words < VITA_HEADER_WORDS + 1 {
            return Err(Error::Stream(format!(
                "Vita packet at byte {} declares {} words",
                pos, packet_words
            )));
        }
        let start = pos + VITA_HEADER_WORDS * WORD;
        let end = pos + packet_words * WORD;
        if end > bytes.len() {
            log::warn!(
                "Vita packet on stream {:#X} is truncated ({} of {} bytes); dropping it",
                header.stream_id,
                bytes.len() - pos,
                packet_words * WORD
            );
            break;
        }
        let trailer = &bytes[end - WORD..end];
        let padding = (trailer[1] >> 4) as usize;
        let data_end = (end - WORD).saturating_sub(padding).max(start);
        packets.push((header.stream_id, &bytes[start..data_end]));
        pos = end;
    }
    Ok(packets)
}

/// Hex stream name as used by the board documentation, e.g. `"0x100"`.
pub fn stream_name(stream_id: u16) -> String {
    format!("{:#x}", stream_id)
}

pub fn parse_stream_name(name: &str) -> Result<u16> {
    let id = parse_int(name)?;
    u16::try_from(id).map_err(|_| Error::parse("stream id", name))
}

fn bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Decodes an in-memory Velo stream; see [`parse_velo_stream`].
pub fn parse_velo_bytes(bytes: &[u8]) -> Result<IndexMap<String, Vec<i16>>> {
    let payload = strip_velo_headers(bytes)?;
    let mut streams: IndexMap<u16, Vec<u8>> = IndexMap::new();
    for (stream_id, data) in packetize_vita_stream(&payload)? {
        streams.entry(stream_id).or_default().extend_from_slice(data);
    }
    Ok(streams
        .into_iter()
        .map(|(id, data)| (stream_name(id), bytes_to_samples(&data)))
        .collect())
}

/// Reads a capture file and returns the samples of every Vita stream it carries, in order of
/// first appearance, keyed by hex stream name.
pub fn parse_velo_stream(stream_file: &Path) -> Result<IndexMap<String, Vec<i16>>> {
    let mut timer = TickTimer::new();
    let bytes = fs::read(stream_file)?;
    let streams = parse_velo_bytes(&bytes)?;
    timer.tick_log(&format!("parse {}", stream_file.display()));
    Ok(streams)
}

/// Packs sample streams into Velo/Vita form and writes them to `out`.
///
/// Streams are visited round-robin, one [`VITA_PACKET_SIZE`] chunk at a time. The packet count
/// advances on every visit, including visits to streams that have already run out.
pub fn rawbin_to_velo_writer<W: Write>(
    out: W,
    streams: &IndexMap<String, Vec<i16>>,
    peripheral_id: u8,
) -> Result<W> {
    let mut packer = VeloVitaPacker::new(out, peripheral_id);
    let sources: Vec<(u16, Vec<u8>)> = streams
        .iter()
        .map(|(name, samples)| Ok((parse_stream_name(name)?, samples_to_bytes(samples))))
        .collect::<Result<_>>()?;
    let mut offsets = vec![0usize; sources.len()];
    let mut eof = vec![false; sources.len()];

    let mut packet_count = 0u8;
    'outer: while !sources.is_empty() {
        for (idx, (stream_id, bytes)) in sources.iter().enumerate() {
            let count = packet_count;
            packet_count = (packet_count + 1) % 16;
            if eof[idx] {
                continue;
            }
            let start = offsets[idx];
            let end = (start + VITA_PACKET_SIZE).min(bytes.len());
            if start == end {
                eof[idx] = true;
                if eof.iter().all(|&e| e) {
                    break 'outer;
                }
                continue;
            }
            let mut packet = VitaPacket::new(&bytes[start..end], *stream_id);
            packet.packet_count = count;
            packer.pack(&packet)?;
            offsets[idx] = end;
        }
    }
    packer.finish()
}

/// Writes a playback file at `velo_file` from sample streams keyed by hex stream name.
pub fn rawbin_to_velo(
    velo_file: &Path,
    streams: &IndexMap<String, Vec<i16>>,
    peripheral_id: u8,
) -> Result<()> {
    let out = BufWriter::new(File::create(velo_file)?);
    rawbin_to_velo_writer(out, streams, peripheral_id)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let velo = VeloHeader {
            packet_size: 0x10004,
            peripheral_id: 7,
        };
        assert_eq!(&velo.to_bytes()[..4], &[0x04, 0x00, 0x01, 0x07]);
        assert_eq!(VeloHeader::from_bytes(&velo.to_bytes()).unwrap(), velo);

        let vita = VitaHeader {
            packet_size: 9,
            tsi: 3,
            tsf: 3,
            packet_count: 5,
            stream_id: 0x100,
            dest_mask: 1,
            timestamp: (0, 0),
        };
        let bytes = vita.to_bytes();
        assert_eq!(&bytes[..8], &[0x09, 0x00, 0xF5, 0x1C, 0x00, 0x01, 0x01, 0x00]);
        assert_eq!(VitaHeader::from_bytes(&bytes).unwrap(), vita);
    }

    #[test]
    fn odd_payload_is_padded() {
        let data = [1u8, 0, 2, 0, 3, 0];
        let packet = VitaPacket::new(&data, 0x101);
        assert_eq!(packet.padding(), 2);
        let datagram = packet.datagram();
        assert_eq!(datagram.len(), (7 + 2 + 1) * 4);
        let packets = packetize_vita_stream(&datagram).unwrap();
        assert_eq!(packets, vec![(0x101, &data[..])]);
    }
}
