//! 3GPP TS 27.010 basic-mode frame encode/decode.
//!
//! Frame layout: `0xF9 ADDR CTRL LEN[…] INFO… FCS 0xF9`. `LEN` uses the
//! 7-bit EA-extended encoding (bit 0 of each length byte is the
//! extension bit; it's set on the last length byte).

use crc::{Algorithm, Crc};

pub const FLAG: u8 = 0xF9;

/// CRC-8/ROHC: poly `0x07` reflected, init `0xff`, no xorout -- the correct
/// instantiation of 27.010 Annex A's FCS.
const ROHC: Algorithm<u8> = Algorithm {
    width: 8,
    poly: 0x07,
    init: 0xff,
    refin: true,
    refout: true,
    xorout: 0x00,
    check: 0xd0,
    residue: 0x00,
};

pub const FCS: Crc<u8> = Crc::<u8>::new(&ROHC);

/// The six control-field types basic mode uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameType {
    Sabm,
    Ua,
    Disc,
    Uih,
    Msc,
    /// Unrecognized control byte; the frame's FCS may still be valid, but
    /// the multiplexer doesn't know what to do with it.
    Unknown(u8),
}

impl FrameType {
    const SABM: u8 = 0x2F;
    const UA: u8 = 0x63;
    const DISC: u8 = 0x43;
    const UIH: u8 = 0xEF;
    // Poll/final bit (0x10) is ignored for classification.
    const PF_MASK: u8 = !0x10;

    fn from_ctrl(ctrl: u8) -> Self {
        match ctrl & Self::PF_MASK {
            Self::SABM => FrameType::Sabm,
            Self::UA => FrameType::Ua,
            Self::DISC => FrameType::Disc,
            Self::UIH => FrameType::Uih,
            other => FrameType::Unknown(other),
        }
    }

    fn ctrl_byte(self) -> u8 {
        match self {
            FrameType::Sabm => Self::SABM | 0x10,
            FrameType::Ua => Self::UA | 0x10,
            FrameType::Disc => Self::DISC | 0x10,
            FrameType::Uih => Self::UIH,
            FrameType::Msc => Self::UIH,
            FrameType::Unknown(c) => c,
        }
    }
}

/// A decoded frame header plus a view of its payload still sitting in the
/// caller's scan buffer.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub channel: u8,
    pub kind: FrameType,
    pub payload: &'a [u8],
}

/// Computes the address byte: channel number in bits 7:2, command/response
/// bit in bit 1, EA bit (always 1 for a single address byte) in bit 0.
pub fn addr_byte(channel: u8, command: bool) -> u8 {
    (channel << 2) | ((command as u8) << 1) | 0x01
}

fn channel_of(addr: u8) -> u8 {
    addr >> 2
}

/// Encodes a frame into `out`, returning the number of bytes written, or
/// `None` if it doesn't fit. FCS covers ADDR+CTRL (+LEN for non-UIH frames),
/// the asymmetric coverage 27.010 specifies for UIH versus other frame
/// types.
pub fn encode(out: &mut [u8], channel: u8, kind: FrameType, command: bool, payload: &[u8]) -> Option<usize> {
    let mut len_bytes = [0u8; 2];
    let len_n = encode_len(payload.len(), &mut len_bytes);

    let total = 1 + 1 + 1 + len_n + payload.len() + 1 + 1;
    if out.len() < total {
        return None;
    }

    let addr = addr_byte(channel, command);
    let ctrl = kind.ctrl_byte();

    let mut i = 0;
    out[i] = FLAG;
    i += 1;
    out[i] = addr;
    i += 1;
    out[i] = ctrl;
    i += 1;
    out[i..i + len_n].copy_from_slice(&len_bytes[..len_n]);
    i += len_n;
    let info_start = i;
    out[i..i + payload.len()].copy_from_slice(payload);
    i += payload.len();

    let fcs_span_end = if matches!(kind, FrameType::Uih | FrameType::Msc) { 3 } else { info_start };
    let fcs = FCS.checksum(&out[1..fcs_span_end]);
    out[i] = fcs;
    i += 1;
    out[i] = FLAG;
    i += 1;
    Some(i)
}

fn encode_len(len: usize, out: &mut [u8; 2]) -> usize {
    if len < 128 {
        out[0] = ((len as u8) << 1) | 0x01;
        1
    } else {
        // Two-byte EA length: low 7 bits first (extension bit clear), then
        // the remaining bits with the extension bit set.
        out[0] = ((len as u8 & 0x7f) << 1) & !0x01;
        out[1] = (((len >> 7) as u8) << 1) | 0x01;
        2
    }
}

/// Attempts to decode one complete frame starting at `buf[0]`. Returns the
/// decoded frame and the number of bytes it consumed, or `None` if `buf`
/// doesn't yet contain a complete frame (the caller should wait for more
/// bytes). A frame with a bad FCS is reported via `Err` so the caller can
/// count it and resynchronize past the bad frame.
pub fn decode(buf: &[u8]) -> Result<Option<(Frame<'_>, usize)>, usize> {
    let Some(start) = buf.iter().position(|&b| b == FLAG) else { return Ok(None) };
    if buf.len() < start + 4 {
        return Ok(None);
    }
    let addr = buf[start + 1];
    let ctrl = buf[start + 2];
    let kind = FrameType::from_ctrl(ctrl);

    let (len, len_n) = match decode_len(&buf[start + 3..]) {
        Some(v) => v,
        None => return Ok(None),
    };

    let info_start = start + 3 + len_n;
    let needed = info_start + len + 2;
    if buf.len() < needed {
        return Ok(None);
    }
    if buf[needed - 1] != FLAG {
        // Resynchronize: drop just the opening flag and retry from there.
        return Err(start + 1);
    }

    let fcs_span_end = if matches!(kind, FrameType::Uih) { start + 3 } else { info_start };
    let expected = FCS.checksum(&buf[start + 1..fcs_span_end]);
    let actual = buf[needed - 2];
    if expected != actual {
        return Err(needed);
    }

    let payload = &buf[info_start..info_start + len];
    Ok(Some((Frame { channel: channel_of(addr), kind, payload }, needed - start)))
}

fn decode_len(buf: &[u8]) -> Option<(usize, usize)> {
    let b0 = *buf.first()?;
    if b0 & 0x01 != 0 {
        Some(((b0 >> 1) as usize, 1))
    } else {
        let b1 = *buf.get(1)?;
        let len = ((b0 >> 1) as usize) | ((b1 >> 1) as usize) << 7;
        Some((len, 2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode_uih_roundtrips() {
        let mut buf = [0u8; 64];
        let n = encode(&mut buf, 1, FrameType::Uih, true, b"AT+CSQ\r").unwrap();
        let (frame, consumed) = decode(&buf[..n]).unwrap().unwrap();
        assert_eq!(consumed, n);
        assert_eq!(frame.channel, 1);
        assert_eq!(frame.kind, FrameType::Uih);
        assert_eq!(frame.payload, b"AT+CSQ\r");
    }

    #[test]
    fn sabm_and_ua_carry_empty_payload() {
        let mut buf = [0u8; 16];
        let n = encode(&mut buf, 0, FrameType::Sabm, true, &[]).unwrap();
        let (frame, _) = decode(&buf[..n]).unwrap().unwrap();
        assert_eq!(frame.kind, FrameType::Sabm);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn corrupted_fcs_is_rejected() {
        let mut buf = [0u8; 64];
        let n = encode(&mut buf, 1, FrameType::Uih, true, b"hello").unwrap();
        buf[n - 2] ^= 0xff; // flip the FCS byte
        assert!(decode(&buf[..n]).is_err());
    }

    #[test]
    fn incomplete_frame_reports_none_not_error() {
        let mut buf = [0u8; 64];
        let n = encode(&mut buf, 1, FrameType::Uih, true, b"partial-frame-body").unwrap();
        assert!(decode(&buf[..n - 3]).unwrap().is_none());
    }

    #[test]
    fn msc_encodes_as_uih_on_its_channel() {
        // MSC shares UIH's control byte: a decoder tells them
        // apart by channel number, not by this crate's `FrameType::Msc`.
        let mut buf = [0u8; 16];
        let n = encode(&mut buf, 0, FrameType::Msc, true, &[addr_byte(1, true), 0x03]).unwrap();
        let (frame, _) = decode(&buf[..n]).unwrap().unwrap();
        assert_eq!(frame.kind, FrameType::Uih);
        assert_eq!(frame.channel, 0);
        assert_eq!(frame.payload[1], 0x03);
    }

    #[test]
    fn long_payload_uses_two_byte_length() {
        let payload = [0x42u8; 200];
        let mut buf = [0u8; 256];
        let n = encode(&mut buf, 2, FrameType::Uih, true, &payload).unwrap();
        let (frame, consumed) = decode(&buf[..n]).unwrap().unwrap();
        assert_eq!(consumed, n);
        assert_eq!(frame.payload.len(), 200);
    }
}
