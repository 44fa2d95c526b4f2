//! Incremental RFC 6455 frame decoder.
//!
//! [`FrameDecoder`] is a byte-driven state machine: it never blocks, never
//! performs I/O, and can be fed a socket read of any size (including one byte
//! at a time). Completed frames are dispatched internally and surface as
//! [`Event`]s:
//!
//! ```text
//! HeaderByte1 ─► HeaderByte2 ─┬─► ShortLength ─┐
//!                             ├─► LongLength ──┤
//!                             └────────────────┴─► Mask ─► Payload ─► dispatch
//!                                                  (skipped when unmasked,
//!                                                   payload skipped when empty)
//! ```
//!
//! After every dispatched frame the decoder returns to
//! [`DecoderState::AwaitingHeaderByte1`]. Fragment reassembly state lives
//! across frames only while a fragmented message is open.

use super::close::CloseFrame;
use super::error::ProtocolError;
use super::frame::{
    Frame, Message, Opcode, FIN_BIT, LEN16_MARKER, LEN64_MARKER, LEN7_MASK, MASK_BIT,
    OPCODE_MASK, RSV_BITS,
};
use crate::constants::{MAX_CONTROL_PAYLOAD, MAX_PAYLOAD_BYTES};

/// Decoder position within the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    /// Expecting FIN/RSV/opcode.
    AwaitingHeaderByte1,
    /// Expecting MASK/len7.
    AwaitingHeaderByte2,
    /// Expecting the 2-byte extended length.
    AwaitingShortLength,
    /// Expecting the 8-byte extended length.
    AwaitingLongLength,
    /// Expecting the 4-byte mask key.
    AwaitingMask,
    /// Expecting payload bytes.
    AwaitingPayload,
}

/// Something the connection owner must act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A complete (possibly reassembled) data message.
    Message(Message),
    /// Ping received; the owner answers with a Pong carrying this payload.
    Ping(Vec<u8>),
    /// Pong received.
    Pong(Vec<u8>),
    /// Close received, already normalized for echoing.
    Close(CloseFrame),
}

/// Streaming UTF-8 validator that tolerates code points split across inputs.
///
/// Holds at most three bytes of an incomplete sequence between calls.
#[derive(Debug, Default, Clone)]
pub struct Utf8Stream {
    pending: Vec<u8>,
}

impl Utf8Stream {
    /// Validate `input` and append the decoded text to `out`.
    ///
    /// A trailing incomplete sequence is held back until the next call.
    pub fn decode(&mut self, mut input: &[u8], out: &mut String) -> Result<(), ProtocolError> {
        // Complete a code point left over from the previous fragment.
        while !self.pending.is_empty() {
            let Some((&byte, rest)) = input.split_first() else {
                return Ok(());
            };
            input = rest;
            self.pending.push(byte);
            match std::str::from_utf8(&self.pending) {
                Ok(ch) => {
                    out.push_str(ch);
                    self.pending.clear();
                }
                Err(e) if e.error_len().is_some() => return Err(ProtocolError::InvalidUtf8Payload),
                Err(_) => {}
            }
        }

        match std::str::from_utf8(input) {
            Ok(text) => out.push_str(text),
            Err(e) if e.error_len().is_some() => return Err(ProtocolError::InvalidUtf8Payload),
            Err(e) => {
                let (valid, tail) = input.split_at(e.valid_up_to());
                out.push_str(
                    std::str::from_utf8(valid).map_err(|_| ProtocolError::InvalidUtf8Payload)?,
                );
                self.pending.extend_from_slice(tail);
            }
        }
        Ok(())
    }

    /// End of input: any held-back bytes are a truncated code point.
    pub fn finish(&mut self) -> Result<(), ProtocolError> {
        if self.pending.is_empty() {
            Ok(())
        } else {
            self.pending.clear();
            Err(ProtocolError::InvalidUtf8Payload)
        }
    }

    /// Whether a partial code point is being held.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Reassembly buffer for an open fragmented message.
#[derive(Debug)]
enum Fragment {
    Text { text: String, utf8: Utf8Stream },
    Binary(Vec<u8>),
}

impl Fragment {
    fn len(&self) -> usize {
        match self {
            Self::Text { text, utf8 } => text.len() + utf8.pending.len(),
            Self::Binary(data) => data.len(),
        }
    }

    fn append(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        match self {
            Self::Text { text, utf8 } => utf8.decode(payload, text),
            Self::Binary(data) => {
                data.extend_from_slice(payload);
                Ok(())
            }
        }
    }

    fn finish(self) -> Result<Message, ProtocolError> {
        match self {
            Self::Text { text, mut utf8 } => {
                utf8.finish()?;
                Ok(Message::Text(text))
            }
            Self::Binary(data) => Ok(Message::Binary(data)),
        }
    }
}

/// Incremental WebSocket frame decoder for one connection.
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecoderState,
    fin: bool,
    opcode: Opcode,
    masked: bool,
    mask: [u8; 4],
    mask_read: usize,
    length: u64,
    length_buf: [u8; 8],
    length_read: usize,
    payload: Vec<u8>,
    fragment: Option<Fragment>,
    max_payload: usize,
}

impl FrameDecoder {
    /// Create a decoder with the default 32 MiB payload cap.
    pub fn new() -> Self {
        Self::with_max_payload(MAX_PAYLOAD_BYTES)
    }

    /// Create a decoder with a custom payload cap.
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            state: DecoderState::AwaitingHeaderByte1,
            fin: false,
            opcode: Opcode::Continuation,
            masked: false,
            mask: [0; 4],
            mask_read: 0,
            length: 0,
            length_buf: [0; 8],
            length_read: 0,
            payload: Vec::new(),
            fragment: None,
            max_payload,
        }
    }

    /// Current position within the frame being decoded.
    #[must_use]
    pub fn state(&self) -> DecoderState {
        self.state
    }

    /// Whether a fragmented message is currently open.
    #[must_use]
    pub fn fragment_active(&self) -> bool {
        self.fragment.is_some()
    }

    /// Feed a buffer of bytes, appending the events it completes to `out`.
    ///
    /// Events decoded before a protocol error stay in `out`, so a caller can
    /// dispatch them before tearing the connection down. Decoding stops after
    /// a Close event; bytes following it are ignored, as a peer may not send
    /// data after closing.
    pub fn feed(&mut self, bytes: &[u8], out: &mut Vec<Event>) -> Result<(), ProtocolError> {
        let mut pos = 0;

        while pos < bytes.len() {
            let event = if self.state == DecoderState::AwaitingPayload {
                // Bulk path: take as much of the payload as this buffer holds.
                let remaining = (self.length as usize) - self.payload.len();
                let take = remaining.min(bytes.len() - pos);
                let start = self.payload.len();
                self.payload.extend_from_slice(&bytes[pos..pos + take]);
                if self.masked {
                    let mask = self.mask;
                    for (i, byte) in self.payload[start..].iter_mut().enumerate() {
                        *byte ^= mask[(start + i) % 4];
                    }
                }
                pos += take;
                if self.payload.len() as u64 == self.length {
                    self.complete_frame()?
                } else {
                    None
                }
            } else {
                let byte = bytes[pos];
                pos += 1;
                self.push_byte(byte)?
            };

            if let Some(event) = event {
                let closing = matches!(event, Event::Close(_));
                out.push(event);
                if closing {
                    break;
                }
            }
        }

        Ok(())
    }

    /// Advance the state machine by a single byte.
    pub fn push_byte(&mut self, byte: u8) -> Result<Option<Event>, ProtocolError> {
        match self.state {
            DecoderState::AwaitingHeaderByte1 => {
                self.parse_header_byte1(byte)?;
                Ok(None)
            }
            DecoderState::AwaitingHeaderByte2 => self.parse_header_byte2(byte),
            DecoderState::AwaitingShortLength => {
                self.length_buf[self.length_read] = byte;
                self.length_read += 1;
                if self.length_read < 2 {
                    return Ok(None);
                }
                self.length = u64::from(u16::from_be_bytes([self.length_buf[0], self.length_buf[1]]));
                self.after_length()
            }
            DecoderState::AwaitingLongLength => {
                self.length_buf[self.length_read] = byte;
                self.length_read += 1;
                if self.length_read < 8 {
                    return Ok(None);
                }
                self.length = u64::from_be_bytes(self.length_buf);
                self.after_length()
            }
            DecoderState::AwaitingMask => {
                self.mask[self.mask_read] = byte;
                self.mask_read += 1;
                if self.mask_read < 4 {
                    return Ok(None);
                }
                if self.length == 0 {
                    return self.complete_frame();
                }
                self.state = DecoderState::AwaitingPayload;
                Ok(None)
            }
            DecoderState::AwaitingPayload => {
                let index = self.payload.len();
                let byte = if self.masked {
                    byte ^ self.mask[index % 4]
                } else {
                    byte
                };
                self.payload.push(byte);
                if self.payload.len() as u64 == self.length {
                    return self.complete_frame();
                }
                Ok(None)
            }
        }
    }

    fn parse_header_byte1(&mut self, byte: u8) -> Result<(), ProtocolError> {
        if byte & RSV_BITS != 0 {
            return Err(ProtocolError::RsvBit);
        }
        self.fin = byte & FIN_BIT != 0;
        self.opcode = Opcode::try_from(byte & OPCODE_MASK)?;
        if self.opcode.is_control() && !self.fin {
            return Err(ProtocolError::FragmentedControlFrame);
        }

        self.masked = false;
        self.mask_read = 0;
        self.length = 0;
        self.length_read = 0;
        self.payload = Vec::new();
        self.state = DecoderState::AwaitingHeaderByte2;
        Ok(())
    }

    fn parse_header_byte2(&mut self, byte: u8) -> Result<Option<Event>, ProtocolError> {
        self.masked = byte & MASK_BIT != 0;
        let len7 = byte & LEN7_MASK;

        if self.opcode.is_control() && usize::from(len7) > MAX_CONTROL_PAYLOAD {
            return Err(ProtocolError::ControlFrameOverLimit);
        }

        match len7 {
            LEN16_MARKER => {
                self.state = DecoderState::AwaitingShortLength;
                Ok(None)
            }
            LEN64_MARKER => {
                self.state = DecoderState::AwaitingLongLength;
                Ok(None)
            }
            short => {
                self.length = u64::from(short);
                self.after_length()
            }
        }
    }

    /// Length is known: move on to the mask, the payload, or dispatch.
    fn after_length(&mut self) -> Result<Option<Event>, ProtocolError> {
        if self.length >= self.max_payload as u64 {
            return Err(ProtocolError::ExceedSize("Payload"));
        }
        let buffered = self.fragment.as_ref().map_or(0, Fragment::len) as u64;
        if self.opcode == Opcode::Continuation && buffered + self.length >= self.max_payload as u64 {
            return Err(ProtocolError::ExceedSize("Message"));
        }

        if self.masked {
            self.state = DecoderState::AwaitingMask;
            return Ok(None);
        }
        if self.length == 0 {
            return self.complete_frame();
        }
        self.payload.reserve(self.length as usize);
        self.state = DecoderState::AwaitingPayload;
        Ok(None)
    }

    /// Package the in-flight frame, reset for the next header, and dispatch.
    fn complete_frame(&mut self) -> Result<Option<Event>, ProtocolError> {
        let frame = Frame {
            fin: self.fin,
            opcode: self.opcode,
            mask_key: self.masked.then_some(self.mask),
            payload: std::mem::take(&mut self.payload),
        };
        self.state = DecoderState::AwaitingHeaderByte1;
        self.handle_packet(frame)
    }

    fn handle_packet(&mut self, frame: Frame) -> Result<Option<Event>, ProtocolError> {
        match frame.opcode {
            Opcode::Close => Ok(Some(Event::Close(CloseFrame::parse(&frame.payload)))),
            Opcode::Ping => Ok(Some(Event::Ping(frame.payload))),
            Opcode::Pong => Ok(Some(Event::Pong(frame.payload))),
            Opcode::Continuation => {
                let fragment = self
                    .fragment
                    .as_mut()
                    .ok_or(ProtocolError::FragmentProtocol)?;
                fragment.append(&frame.payload)?;
                if !frame.fin {
                    return Ok(None);
                }
                let fragment = self.fragment.take().ok_or(ProtocolError::FragmentProtocol)?;
                Ok(Some(Event::Message(fragment.finish()?)))
            }
            Opcode::Text | Opcode::Binary => {
                if self.fragment.is_some() {
                    return Err(ProtocolError::FragmentProtocol);
                }
                if frame.fin {
                    let message = match frame.opcode {
                        Opcode::Text => Message::Text(
                            String::from_utf8(frame.payload)
                                .map_err(|_| ProtocolError::InvalidUtf8Payload)?,
                        ),
                        _ => Message::Binary(frame.payload),
                    };
                    return Ok(Some(Event::Message(message)));
                }

                let mut fragment = match frame.opcode {
                    Opcode::Text => Fragment::Text {
                        text: String::new(),
                        utf8: Utf8Stream::default(),
                    },
                    _ => Fragment::Binary(Vec::new()),
                };
                fragment.append(&frame.payload)?;
                self.fragment = Some(fragment);
                Ok(None)
            }
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::close::CloseCode;
    use crate::protocol::frame::{encode_frame, encode_masked_frame};

    const KEY: [u8; 4] = [0x12, 0x34, 0x56, 0x78];

    fn decode_all(bytes: &[u8]) -> Result<Vec<Event>, ProtocolError> {
        let mut events = Vec::new();
        FrameDecoder::new().feed(bytes, &mut events)?;
        Ok(events)
    }

    fn byte_at_a_time(decoder: &mut FrameDecoder, bytes: &[u8]) -> Result<Vec<Event>, ProtocolError> {
        let mut events = Vec::new();
        for &byte in bytes {
            if let Some(event) = decoder.push_byte(byte)? {
                events.push(event);
            }
        }
        Ok(events)
    }

    #[test]
    fn test_unfragmented_text_round_trip() {
        let wire = encode_frame(true, Opcode::Text, "hello".as_bytes());
        let events = decode_all(&wire).unwrap();
        assert_eq!(events, vec![Event::Message(Message::Text("hello".into()))]);
    }

    #[test]
    fn test_unfragmented_binary_round_trip() {
        let payload: Vec<u8> = (0..=255).collect();
        let wire = encode_frame(true, Opcode::Binary, &payload);
        let events = decode_all(&wire).unwrap();
        assert_eq!(events, vec![Event::Message(Message::Binary(payload))]);
    }

    #[test]
    fn test_length_forms_decode_to_same_length() {
        for len in [0usize, 1, 125, 126, 127, 65535, 65536, 100_000] {
            let payload = vec![0xA5u8; len];
            let wire = encode_masked_frame(true, Opcode::Binary, KEY, &payload);
            let events = decode_all(&wire).unwrap();
            match &events[..] {
                [Event::Message(Message::Binary(data))] => assert_eq!(data.len(), len),
                other => panic!("len {len}: unexpected events {other:?}"),
            }
        }
    }

    #[test]
    fn test_masked_payload_recovered() {
        let payload = b"console input \x1b[A".to_vec();
        let wire = encode_masked_frame(true, Opcode::Binary, KEY, &payload);
        // Payload on the wire is XORed with key[i % 4].
        for (i, byte) in wire[6..].iter().enumerate() {
            assert_eq!(*byte, payload[i] ^ KEY[i % 4]);
        }
        let events = decode_all(&wire).unwrap();
        assert_eq!(events, vec![Event::Message(Message::Binary(payload))]);
    }

    #[test]
    fn test_byte_at_a_time_matches_bulk() {
        let wire = encode_masked_frame(true, Opcode::Text, KEY, "byte by byte".as_bytes());
        let mut decoder = FrameDecoder::new();
        let events = byte_at_a_time(&mut decoder, &wire).unwrap();
        assert_eq!(events, decode_all(&wire).unwrap());
        assert_eq!(decoder.state(), DecoderState::AwaitingHeaderByte1);
    }

    #[test]
    fn test_state_transitions() {
        let wire = encode_masked_frame(true, Opcode::Binary, KEY, &[9u8; 200]);
        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.state(), DecoderState::AwaitingHeaderByte1);
        decoder.push_byte(wire[0]).unwrap();
        assert_eq!(decoder.state(), DecoderState::AwaitingHeaderByte2);
        decoder.push_byte(wire[1]).unwrap();
        assert_eq!(decoder.state(), DecoderState::AwaitingShortLength);
        decoder.push_byte(wire[2]).unwrap();
        decoder.push_byte(wire[3]).unwrap();
        assert_eq!(decoder.state(), DecoderState::AwaitingMask);
        for &b in &wire[4..8] {
            decoder.push_byte(b).unwrap();
        }
        assert_eq!(decoder.state(), DecoderState::AwaitingPayload);
    }

    #[test]
    fn test_empty_unmasked_frame_dispatches_immediately() {
        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.push_byte(0x82).unwrap(), None);
        assert_eq!(
            decoder.push_byte(0x00).unwrap(),
            Some(Event::Message(Message::Binary(Vec::new())))
        );
    }

    #[test]
    fn test_multiple_frames_in_single_feed() {
        let mut wire = encode_masked_frame(true, Opcode::Text, KEY, b"one");
        wire.extend(encode_masked_frame(true, Opcode::Binary, KEY, b"two"));
        wire.extend(encode_masked_frame(true, Opcode::Ping, KEY, b"p"));
        let events = decode_all(&wire).unwrap();
        assert_eq!(
            events,
            vec![
                Event::Message(Message::Text("one".into())),
                Event::Message(Message::Binary(b"two".to_vec())),
                Event::Ping(b"p".to_vec()),
            ]
        );
    }

    fn fragment_wire(opcode: Opcode, pieces: &[&[u8]]) -> Vec<u8> {
        let mut wire = Vec::new();
        let last = pieces.len() - 1;
        for (i, piece) in pieces.iter().enumerate() {
            let op = if i == 0 { opcode } else { Opcode::Continuation };
            wire.extend(encode_masked_frame(i == last, op, KEY, piece));
        }
        wire
    }

    #[test]
    fn test_fragmented_text_splits_multibyte_utf8() {
        let text = "héllo wörld ✓ 𝄞";
        let bytes = text.as_bytes();
        // Cut inside the 2-byte é, the 3-byte ✓ and the 4-byte 𝄞.
        let cuts = [2usize, 15, 20, bytes.len()];
        let mut pieces: Vec<&[u8]> = Vec::new();
        let mut start = 0;
        for cut in cuts {
            pieces.push(&bytes[start..cut]);
            start = cut;
        }
        let events = decode_all(&fragment_wire(Opcode::Text, &pieces)).unwrap();
        assert_eq!(events, vec![Event::Message(Message::Text(text.into()))]);
    }

    #[test]
    fn test_fragmented_equals_unfragmented() {
        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        for k in 1..=5usize {
            let size = payload.len().div_ceil(k);
            let pieces: Vec<&[u8]> = payload.chunks(size).collect();
            let fragmented = decode_all(&fragment_wire(Opcode::Binary, &pieces)).unwrap();
            let whole = decode_all(&encode_masked_frame(true, Opcode::Binary, KEY, &payload)).unwrap();
            assert_eq!(fragmented, whole, "k = {k}");
        }
    }

    #[test]
    fn test_ping_mid_fragment_does_not_disturb_sequence() {
        let mut wire = encode_masked_frame(false, Opcode::Text, KEY, b"hel");
        wire.extend(encode_masked_frame(true, Opcode::Ping, KEY, b"are you there"));
        wire.extend(encode_masked_frame(true, Opcode::Continuation, KEY, b"lo"));

        let mut decoder = FrameDecoder::new();
        let mut events = Vec::new();
        decoder.feed(&wire, &mut events).unwrap();
        assert_eq!(
            events,
            vec![
                Event::Ping(b"are you there".to_vec()),
                Event::Message(Message::Text("hello".into())),
            ]
        );
        assert!(!decoder.fragment_active());
    }

    #[test]
    fn test_close_status_1000_and_9999() {
        let wire = encode_masked_frame(true, Opcode::Close, KEY, &1000u16.to_be_bytes());
        assert_eq!(
            decode_all(&wire).unwrap(),
            vec![Event::Close(CloseFrame::new(CloseCode::Normal, ""))]
        );

        let wire = encode_masked_frame(true, Opcode::Close, KEY, &9999u16.to_be_bytes());
        assert_eq!(
            decode_all(&wire).unwrap(),
            vec![Event::Close(CloseFrame::new(CloseCode::Protocol, ""))]
        );
    }

    #[test]
    fn test_bytes_after_close_ignored() {
        let mut wire = encode_masked_frame(true, Opcode::Close, KEY, &[]);
        wire.push(0xF0); // would be an RSV error
        let events = decode_all(&wire).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_rsv_bit_rejected() {
        assert_eq!(decode_all(&[0xC1, 0x80]), Err(ProtocolError::RsvBit));
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        assert_eq!(
            decode_all(&[0x83, 0x80]),
            Err(ProtocolError::UnknownOpcode(0x3))
        );
    }

    #[test]
    fn test_ping_over_125_rejected() {
        let wire = encode_masked_frame(true, Opcode::Ping, KEY, &[0u8; 126]);
        assert_eq!(decode_all(&wire), Err(ProtocolError::ControlFrameOverLimit));
    }

    #[test]
    fn test_fragmented_ping_rejected() {
        let wire = encode_masked_frame(false, Opcode::Ping, KEY, b"x");
        assert_eq!(decode_all(&wire), Err(ProtocolError::FragmentedControlFrame));
    }

    #[test]
    fn test_continuation_without_start_rejected() {
        let wire = encode_masked_frame(true, Opcode::Continuation, KEY, b"orphan");
        assert_eq!(decode_all(&wire), Err(ProtocolError::FragmentProtocol));
        let wire = encode_masked_frame(false, Opcode::Continuation, KEY, b"orphan");
        assert_eq!(decode_all(&wire), Err(ProtocolError::FragmentProtocol));
    }

    #[test]
    fn test_new_sequence_while_active_rejected() {
        let mut wire = encode_masked_frame(false, Opcode::Binary, KEY, b"a");
        wire.extend(encode_masked_frame(false, Opcode::Text, KEY, b"b"));
        assert_eq!(decode_all(&wire), Err(ProtocolError::FragmentProtocol));

        let mut wire = encode_masked_frame(false, Opcode::Binary, KEY, b"a");
        wire.extend(encode_masked_frame(true, Opcode::Binary, KEY, b"b"));
        assert_eq!(decode_all(&wire), Err(ProtocolError::FragmentProtocol));
    }

    #[test]
    fn test_invalid_utf8_text_rejected() {
        let wire = encode_masked_frame(true, Opcode::Text, KEY, &[0x68, 0xff, 0x69]);
        assert_eq!(decode_all(&wire), Err(ProtocolError::InvalidUtf8Payload));
    }

    #[test]
    fn test_truncated_utf8_at_final_fragment_rejected() {
        // "é" is 0xC3 0xA9; the sequence ends after 0xC3.
        let wire = fragment_wire(Opcode::Text, &[b"ab", &[0xC3]]);
        assert_eq!(decode_all(&wire), Err(ProtocolError::InvalidUtf8Payload));
    }

    #[test]
    fn test_invalid_utf8_in_middle_fragment_fails_fast() {
        let mut wire = encode_masked_frame(false, Opcode::Text, KEY, b"ok");
        wire.extend(encode_masked_frame(false, Opcode::Continuation, KEY, &[0xC3, 0x28]));
        assert_eq!(decode_all(&wire), Err(ProtocolError::InvalidUtf8Payload));
    }

    #[test]
    fn test_payload_over_cap_rejected() {
        let mut decoder = FrameDecoder::with_max_payload(1024);
        let wire = encode_masked_frame(true, Opcode::Binary, KEY, &[0u8; 1024]);
        assert_eq!(
            decoder.feed(&wire, &mut Vec::new()),
            Err(ProtocolError::ExceedSize("Payload"))
        );

        let mut decoder = FrameDecoder::with_max_payload(1024);
        let wire = encode_masked_frame(true, Opcode::Binary, KEY, &[0u8; 1023]);
        assert!(decoder.feed(&wire, &mut Vec::new()).is_ok());
    }

    #[test]
    fn test_reassembled_message_over_cap_rejected() {
        let mut decoder = FrameDecoder::with_max_payload(1024);
        let mut wire = encode_masked_frame(false, Opcode::Binary, KEY, &[0u8; 600]);
        wire.extend(encode_masked_frame(true, Opcode::Continuation, KEY, &[0u8; 600]));
        assert_eq!(
            decoder.feed(&wire, &mut Vec::new()),
            Err(ProtocolError::ExceedSize("Message"))
        );
    }

    #[test]
    fn test_events_before_error_are_kept() {
        let mut wire = encode_masked_frame(true, Opcode::Text, KEY, b"hello");
        wire.extend(encode_masked_frame(true, Opcode::Ping, KEY, b"p"));
        wire.extend_from_slice(&[0xC1, 0x80]);

        let mut events = Vec::new();
        let result = FrameDecoder::new().feed(&wire, &mut events);
        assert_eq!(result, Err(ProtocolError::RsvBit));
        assert_eq!(
            events,
            vec![
                Event::Message(Message::Text("hello".into())),
                Event::Ping(b"p".to_vec()),
            ]
        );
    }

    #[test]
    fn test_huge_declared_length_rejected_before_payload() {
        // 127 marker with a 2^40 length, masked.
        let mut wire = vec![0x82, 0xFF];
        wire.extend_from_slice(&(1u64 << 40).to_be_bytes());
        assert_eq!(decode_all(&wire), Err(ProtocolError::ExceedSize("Payload")));
    }

    #[test]
    fn test_utf8_stream_holds_partial_code_point() {
        let mut stream = Utf8Stream::default();
        let mut out = String::new();
        let check = "✓".as_bytes();
        stream.decode(&check[..1], &mut out).unwrap();
        assert!(stream.has_pending());
        assert!(out.is_empty());
        stream.decode(&check[1..2], &mut out).unwrap();
        stream.decode(&check[2..], &mut out).unwrap();
        assert_eq!(out, "✓");
        assert!(stream.finish().is_ok());
    }
}
