//! Base-format CAN frame codec
//!
//! Converts a frame (11-bit ID, DLC, payload) to the bit sequence a node
//! drives on the bus and back. The layout is the classic base frame with the
//! CRC and ACK fields removed:
//!
//! ```text
//! SOF(1) | ID(11) | DLC(4) | DATA(DLC * 8) | EOF(7)
//! ```
//!
//! Every field is written MSB-first. After concatenation the sequence is
//! bit-stuffed: after five identical wire bits the complementary bit is
//! inserted, so no resolved run ever reaches six bits unless something on the
//! bus went wrong.

use crate::types::{Bit, BitSequence, DecodeError, Result, SimError};
use rand::Rng;
use std::fmt;

/// Largest base-format identifier (11 bits)
pub const MAX_ID: u16 = 0x7FF;

/// Largest classic CAN payload length
pub const MAX_DLC: u8 = 8;

/// Run length after which a stuff bit is inserted
pub const STUFF_RUN: usize = 5;

const ID_BITS: usize = 11;
const DLC_BITS: usize = 4;
const EOF_BITS: usize = 7;
const EOF_PATTERN: u32 = 0b111_1111;

/// Length of the shortest valid unstuffed frame (SOF + ID + DLC + EOF)
pub const MIN_FRAME_BITS: usize = 1 + ID_BITS + DLC_BITS + EOF_BITS;

/// Offset of the DLC field in the unstuffed sequence
const DLC_START: usize = 1 + ID_BITS;
/// Offset of the data field in the unstuffed sequence
const DATA_START: usize = DLC_START + DLC_BITS;

/// An immutable CAN base frame
///
/// Equality and hashing cover ID, DLC and data only; SOF and EOF are fixed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Frame {
    id: u16,
    dlc: u8,
    data: Vec<u8>,
}

impl Frame {
    /// Create a frame, validating the ID range and that DLC matches the data
    pub fn new(id: u16, dlc: u8, data: Vec<u8>) -> Result<Self> {
        if id > MAX_ID {
            return Err(SimError::InvalidFrame(format!(
                "ID 0x{:X} exceeds 11 bits",
                id
            )));
        }
        if dlc > MAX_DLC {
            return Err(SimError::InvalidFrame(format!("DLC {} exceeds {}", dlc, MAX_DLC)));
        }
        if data.len() != dlc as usize {
            return Err(SimError::InvalidFrame(format!(
                "DLC {} does not match payload length {}",
                dlc,
                data.len()
            )));
        }
        Ok(Self { id, dlc, data })
    }

    /// Create a frame whose DLC is taken from the payload length
    pub fn with_data(id: u16, data: Vec<u8>) -> Result<Self> {
        let dlc = u8::try_from(data.len()).unwrap_or(u8::MAX);
        Self::new(id, dlc, data)
    }

    /// Generate a random frame with a payload of 1 to `max_dlc` bytes
    pub fn random<R: Rng + ?Sized>(rng: &mut R, max_dlc: u8) -> Self {
        let max_dlc = max_dlc.clamp(1, MAX_DLC);
        let id = rng.gen_range(0..=MAX_ID);
        let dlc = rng.gen_range(1..=max_dlc);
        let data = (0..dlc).map(|_| rng.gen::<u8>()).collect();
        Self { id, dlc, data }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn dlc(&self) -> u8 {
        self.dlc
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Field layout before stuffing
    pub fn raw_bits(&self) -> BitSequence {
        let mut bits = Vec::with_capacity(MIN_FRAME_BITS + self.data.len() * 8);
        bits.push(Bit::Dominant); // SOF
        push_field(&mut bits, self.id as u32, ID_BITS);
        push_field(&mut bits, self.dlc as u32, DLC_BITS);
        for byte in &self.data {
            push_field(&mut bits, *byte as u32, 8);
        }
        push_field(&mut bits, EOF_PATTERN, EOF_BITS);
        bits
    }

    /// Bit sequence driven on the bus (stuffed)
    pub fn encode(&self) -> BitSequence {
        stuff(&self.raw_bits())
    }

    /// Number of leading stuffed bits covering SOF and the identifier
    ///
    /// Indices below this value belong to the arbitration field; a node that
    /// reads a dominant bit where it offered a recessive one there has lost
    /// arbitration rather than hit a bit error.
    pub fn arbitration_end(&self) -> usize {
        let raw = self.raw_bits();
        stuff(&raw[..DLC_START]).len()
    }

    /// Rebuild a frame from a stuffed bit sequence
    ///
    /// Malformed input is reported as a [`DecodeError`]; observers on the bus
    /// routinely see partial or garbled sequences, so this never panics.
    pub fn decode(bits: &[Bit]) -> std::result::Result<Frame, DecodeError> {
        let bits = unstuff(bits);

        if bits.len() < MIN_FRAME_BITS {
            return Err(DecodeError::TooShort {
                len: bits.len(),
                min: MIN_FRAME_BITS,
            });
        }

        let id = read_field(&bits, 1, ID_BITS) as u16;
        let dlc = read_field(&bits, DLC_START, DLC_BITS) as u8;
        if dlc > MAX_DLC {
            return Err(DecodeError::InvalidDlc(dlc));
        }

        let eof_start = DATA_START + dlc as usize * 8;
        let expected = eof_start + EOF_BITS;
        if bits.len() < expected {
            return Err(DecodeError::Truncated {
                len: bits.len(),
                expected,
            });
        }

        let data = (0..dlc as usize)
            .map(|i| read_field(&bits, DATA_START + i * 8, 8) as u8)
            .collect();

        let eof = read_field(&bits, eof_start, EOF_BITS);
        if eof != EOF_PATTERN {
            return Err(DecodeError::InvalidEof(eof as u8));
        }

        Ok(Frame { id, dlc, data })
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Frame(ID=0x{:03X}, DLC={}, Data={:?})",
            self.id, self.dlc, self.data
        )
    }
}

/// Insert a complementary bit after every run of five identical bits
///
/// The inserted bit starts a new run, so stuffing can recur right after it.
pub fn stuff(bits: &[Bit]) -> BitSequence {
    let mut out = Vec::with_capacity(bits.len() + bits.len() / STUFF_RUN);
    let mut last: Option<Bit> = None;
    let mut run = 0;

    for &bit in bits {
        out.push(bit);
        if last == Some(bit) {
            run += 1;
        } else {
            last = Some(bit);
            run = 1;
        }

        if run == STUFF_RUN {
            let stuffed = bit.complement();
            out.push(stuffed);
            last = Some(stuffed);
            run = 1;
        }
    }

    out
}

/// Drop the bit following every run of five identical bits
pub fn unstuff(bits: &[Bit]) -> BitSequence {
    let mut out = Vec::with_capacity(bits.len());
    let mut last: Option<Bit> = None;
    let mut run = 0;

    for &bit in bits {
        if run == STUFF_RUN {
            // Stuff bit: not part of the payload, but it starts the next run
            last = Some(bit);
            run = 1;
            continue;
        }

        if last == Some(bit) {
            run += 1;
        } else {
            last = Some(bit);
            run = 1;
        }
        out.push(bit);
    }

    out
}

/// Length of the longest run of identical bits
pub fn longest_run(bits: &[Bit]) -> usize {
    let mut longest = 0;
    let mut run = 0;
    let mut last = None;
    for &bit in bits {
        if last == Some(bit) {
            run += 1;
        } else {
            last = Some(bit);
            run = 1;
        }
        longest = longest.max(run);
    }
    longest
}

/// Append `width` bits of `value`, MSB first
fn push_field(bits: &mut BitSequence, value: u32, width: usize) {
    for shift in (0..width).rev() {
        bits.push(Bit::from((value >> shift) & 1 == 1));
    }
}

/// Read `width` bits starting at `start`, MSB first
fn read_field(bits: &[Bit], start: usize, width: usize) -> u32 {
    bits[start..start + width]
        .iter()
        .fold(0, |acc, bit| (acc << 1) | bit.as_u8() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{bits_from_str, bits_to_string};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_alternating_id_frame_round_trip() {
        let frame = Frame::new(0b01010101010, 2, vec![255, 255]).unwrap();
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.id(), 0b01010101010);
        assert_eq!(decoded.dlc(), 2);
        assert_eq!(decoded.data(), &[255, 255]);
    }

    #[test]
    fn test_round_trip_random_frames() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let frame = Frame::random(&mut rng, MAX_DLC);
            assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
        }
    }

    #[test]
    fn test_round_trip_extremes() {
        let frames = [
            Frame::new(0, 0, vec![]).unwrap(),
            Frame::new(MAX_ID, 0, vec![]).unwrap(),
            Frame::new(0, 8, vec![0; 8]).unwrap(),
            Frame::new(MAX_ID, 8, vec![0xFF; 8]).unwrap(),
        ];
        for frame in frames {
            assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
        }
    }

    #[test]
    fn test_encode_never_has_six_identical_bits() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..500 {
            let frame = Frame::random(&mut rng, MAX_DLC);
            assert!(longest_run(&frame.encode()) <= STUFF_RUN, "{}", frame);
        }
        let all_zero = Frame::new(0, 8, vec![0; 8]).unwrap();
        assert!(longest_run(&all_zero.encode()) <= STUFF_RUN);
        let all_one = Frame::new(MAX_ID, 8, vec![0xFF; 8]).unwrap();
        assert!(longest_run(&all_one.encode()) <= STUFF_RUN);
    }

    #[test]
    fn test_stuffed_bit_starts_new_run() {
        // SOF + ID + DLC are sixteen zeros, EOF is seven ones
        let frame = Frame::new(0, 0, vec![]).unwrap();
        assert_eq!(
            bits_to_string(&frame.encode()),
            "000001000001000001011111011"
        );
    }

    #[test]
    fn test_unstuff_inverts_stuff() {
        let raw = bits_from_str("1111100000111110");
        let stuffed = stuff(&raw);
        assert_eq!(bits_to_string(&stuffed), "1111100000101111100");
        assert_eq!(unstuff(&stuffed), raw);
    }

    #[test]
    fn test_arbitration_end() {
        let frame = Frame::new(0, 0, vec![]).unwrap();
        // 12 raw bits (SOF + ID) plus two stuff bits
        assert_eq!(frame.arbitration_end(), 14);

        let frame = Frame::new(0b01010101010, 2, vec![255, 255]).unwrap();
        assert_eq!(frame.arbitration_end(), 12);
    }

    #[test]
    fn test_invalid_frames_rejected() {
        assert!(Frame::new(0x800, 0, vec![]).is_err());
        assert!(Frame::new(0x100, 9, vec![0; 9]).is_err());
        assert!(Frame::new(0x100, 2, vec![1]).is_err());
        assert!(Frame::with_data(0x100, vec![1, 2, 3]).is_ok());
    }

    #[test]
    fn test_decode_too_short() {
        let result = Frame::decode(&bits_from_str("0000"));
        assert_eq!(result, Err(DecodeError::TooShort { len: 4, min: MIN_FRAME_BITS }));
        assert!(Frame::decode(&[]).is_err());
    }

    #[test]
    fn test_decode_invalid_dlc() {
        // SOF, ID 0x555, DLC 15, EOF
        let mut raw = bits_from_str("0");
        raw.extend(bits_from_str("10101010101"));
        raw.extend(bits_from_str("1111"));
        raw.extend(bits_from_str("1111111"));
        assert_eq!(Frame::decode(&stuff(&raw)), Err(DecodeError::InvalidDlc(15)));
    }

    #[test]
    fn test_decode_invalid_eof() {
        let frame = Frame::new(0x123, 1, vec![0xA5]).unwrap();
        let mut raw = frame.raw_bits();
        let last = raw.len() - 1;
        raw[last] = Bit::Dominant;
        assert_eq!(Frame::decode(&stuff(&raw)), Err(DecodeError::InvalidEof(0b1111110)));
    }

    #[test]
    fn test_decode_truncated_payload() {
        let frame = Frame::new(0x123, 4, vec![1, 2, 3, 4]).unwrap();
        let raw = frame.raw_bits();
        let cut = &raw[..MIN_FRAME_BITS + 8];
        assert!(matches!(
            Frame::decode(&stuff(cut)),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn test_equality_ignores_framing() {
        let a = Frame::new(0x10, 1, vec![7]).unwrap();
        let b = Frame::decode(&a.encode()).unwrap();
        let c = Frame::new(0x10, 1, vec![8]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
