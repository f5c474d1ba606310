//! Length-prefixed framing for the game protocol.
//!
//! Wire format: `[u32 LE payload length][u32 LE packet id][payload]`
//!
//! A stream that fails framing is never resynchronized. [`FrameDecoder`]
//! drops its buffer and refuses further input once an error is seen.

use crate::error::{ProtocolError, ProtocolResult};
use crate::packets::{Packet, PacketRegistry, MAX_FRAME_PAYLOAD};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;

/// Length of the frame header.
pub const HEADER_LEN: usize = 8;

/// One undecoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub packet_id: u32,
    pub payload: Bytes,
}

impl Frame {
    /// Decode the payload with the codec registered for this id.
    pub fn decode(&self, registry: &PacketRegistry) -> ProtocolResult<Packet> {
        let info = registry
            .lookup(self.packet_id)
            .ok_or(ProtocolError::UnknownPacket(self.packet_id))?;
        (info.decode)(&self.payload)
    }
}

/// Outcome of a single decode attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Frame(Frame),
    NeedMoreData,
}

/// Try to split one frame off the front of `buf`.
///
/// `NeedMoreData` leaves `buf` untouched. An error means the stream is
/// corrupt; the caller must drop the connection.
pub fn decode_frame(registry: &PacketRegistry, buf: &mut BytesMut) -> ProtocolResult<Decoded> {
    if buf.len() < HEADER_LEN {
        return Ok(Decoded::NeedMoreData);
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let id = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);

    if len > MAX_FRAME_PAYLOAD {
        return Err(ProtocolError::FrameLength(len as i64));
    }
    let info = registry.lookup(id).ok_or(ProtocolError::UnknownPacket(id))?;
    let len = len as usize;
    if len > info.max_size {
        return Err(ProtocolError::PacketTooLarge {
            id,
            name: info.name,
            len,
            max: info.max_size,
        });
    }

    if buf.len() < HEADER_LEN + len {
        return Ok(Decoded::NeedMoreData);
    }

    buf.advance(HEADER_LEN);
    let payload = buf.split_to(len).freeze();
    Ok(Decoded::Frame(Frame {
        packet_id: id,
        payload,
    }))
}

/// Append the framed encoding of `packet` to `buf`.
pub fn encode_into(
    registry: &PacketRegistry,
    packet: &Packet,
    buf: &mut BytesMut,
) -> ProtocolResult<()> {
    let id = packet.id();
    let info = registry.lookup(id).ok_or(ProtocolError::UnknownPacket(id))?;

    let start = buf.len();
    buf.put_u32_le(0);
    buf.put_u32_le(id);
    if let Err(e) = (info.encode)(packet, buf) {
        buf.truncate(start);
        return Err(e);
    }

    let len = buf.len() - start - HEADER_LEN;
    if len > info.max_size {
        buf.truncate(start);
        return Err(ProtocolError::PacketTooLarge {
            id,
            name: info.name,
            len,
            max: info.max_size,
        });
    }
    buf[start..start + 4].copy_from_slice(&(len as u32).to_le_bytes());
    Ok(())
}

/// Encode `packet` into a fresh frame.
pub fn encode(registry: &PacketRegistry, packet: &Packet) -> ProtocolResult<Bytes> {
    let mut buf = BytesMut::new();
    encode_into(registry, packet, &mut buf)?;
    Ok(buf.freeze())
}

/// Streaming decoder: accumulates bytes and yields complete frames.
///
/// One decoder per connection direction. It is not shared between tasks.
#[derive(Debug)]
pub struct FrameDecoder {
    registry: Arc<PacketRegistry>,
    buffer: BytesMut,
    poisoned: bool,
}

impl FrameDecoder {
    pub fn new(registry: Arc<PacketRegistry>) -> Self {
        Self {
            registry,
            buffer: BytesMut::new(),
            poisoned: false,
        }
    }

    /// Append received bytes.
    pub fn feed(&mut self, data: &[u8]) -> ProtocolResult<()> {
        if self.poisoned {
            return Err(ProtocolError::Poisoned);
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    /// Next complete frame, or `None` when more bytes are needed.
    pub fn next_frame(&mut self) -> ProtocolResult<Option<Frame>> {
        if self.poisoned {
            return Err(ProtocolError::Poisoned);
        }
        match decode_frame(&self.registry, &mut self.buffer) {
            Ok(Decoded::Frame(frame)) => Ok(Some(frame)),
            Ok(Decoded::NeedMoreData) => Ok(None),
            Err(e) => Err(self.poison(e)),
        }
    }

    /// Next complete frame decoded into a packet.
    pub fn next_packet(&mut self) -> ProtocolResult<Option<Packet>> {
        let Some(frame) = self.next_frame()? else {
            return Ok(None);
        };
        match frame.decode(&self.registry) {
            Ok(packet) => Ok(Some(packet)),
            Err(e) => Err(self.poison(e)),
        }
    }

    /// Decode every complete packet currently buffered.
    pub fn decode_all(&mut self) -> ProtocolResult<Vec<Packet>> {
        let mut packets = Vec::new();
        while let Some(packet) = self.next_packet()? {
            packets.push(packet);
        }
        Ok(packets)
    }

    /// Number of buffered bytes not yet returned as frames.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.poisoned = false;
    }

    fn poison(&mut self, err: ProtocolError) -> ProtocolError {
        self.buffer.clear();
        self.poisoned = true;
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packets::{ChatMessage, Disconnect, DisconnectType, PasswordAccepted, Ping};

    fn registry() -> Arc<PacketRegistry> {
        Arc::new(PacketRegistry::standard())
    }

    fn header(len: u32, id: u32) -> Vec<u8> {
        let mut out = len.to_le_bytes().to_vec();
        out.extend_from_slice(&id.to_le_bytes());
        out
    }

    #[test]
    fn seven_bytes_need_more_data() {
        let mut buf = BytesMut::from(&header(0, 16)[..7]);
        assert_eq!(
            decode_frame(&registry(), &mut buf).unwrap(),
            Decoded::NeedMoreData
        );
        assert_eq!(buf.len(), 7);
    }

    #[test]
    fn empty_payload_frame() {
        let mut buf = BytesMut::from(&header(0, 16)[..]);
        let decoded = decode_frame(&registry(), &mut buf).unwrap();
        assert_eq!(
            decoded,
            Decoded::Frame(Frame {
                packet_id: 16,
                payload: Bytes::new()
            })
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_payload_leaves_buffer_untouched() {
        let mut raw = header(10, 211);
        raw.extend_from_slice(&[0; 4]);
        let mut buf = BytesMut::from(&raw[..]);
        assert_eq!(
            decode_frame(&registry(), &mut buf).unwrap(),
            Decoded::NeedMoreData
        );
        assert_eq!(&buf[..], &raw[..]);
    }

    #[test]
    fn one_over_registry_max_is_invalid() {
        let mut raw = header(30, 2);
        raw.extend_from_slice(&[0; 30]);
        let mut buf = BytesMut::from(&raw[..]);
        let err = decode_frame(&registry(), &mut buf).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::PacketTooLarge {
                id: 2,
                name: "Ping",
                len: 30,
                max: 29
            }
        );
    }

    #[test]
    fn length_over_ceiling_is_invalid() {
        let mut buf = BytesMut::from(&header(MAX_FRAME_PAYLOAD + 1, 210)[..]);
        assert!(matches!(
            decode_frame(&registry(), &mut buf),
            Err(ProtocolError::FrameLength(_))
        ));
    }

    #[test]
    fn unknown_id_is_invalid() {
        let mut buf = BytesMut::from(&header(0, 9999)[..]);
        assert_eq!(
            decode_frame(&registry(), &mut buf).unwrap_err(),
            ProtocolError::UnknownPacket(9999)
        );
    }

    #[test]
    fn encode_then_stream_decode_in_pieces() {
        let reg = registry();
        let chat = Packet::ChatMessage(ChatMessage {
            message: Some("hello there".into()),
        });
        let ping = Packet::Ping(Ping {
            id: 7,
            time_secs: Some(1_700_000_000),
            ..Default::default()
        });
        let mut wire = BytesMut::new();
        encode_into(&reg, &chat, &mut wire).unwrap();
        encode_into(&reg, &ping, &mut wire).unwrap();

        let mut decoder = FrameDecoder::new(reg);
        let mut out = Vec::new();
        for chunk in wire.chunks(3) {
            decoder.feed(chunk).unwrap();
            out.extend(decoder.decode_all().unwrap());
        }
        assert_eq!(out, vec![chat, ping]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn header_carries_length_and_id() {
        let reg = registry();
        let frame = encode(&reg, &Packet::PasswordAccepted(PasswordAccepted {})).unwrap();
        assert_eq!(&frame[..], &header(0, 16)[..]);

        let frame = encode(
            &reg,
            &Packet::Disconnect(Disconnect {
                disconnect_type: DisconnectType::Disconnect,
                reason: Some("bye".into()),
            }),
        )
        .unwrap();
        let len = u32::from_le_bytes(frame[..4].try_into().unwrap()) as usize;
        assert_eq!(len, frame.len() - HEADER_LEN);
        assert_eq!(u32::from_le_bytes(frame[4..8].try_into().unwrap()), 1);
    }

    #[test]
    fn corrupt_payload_poisons_decoder() {
        let reg = registry();
        let mut raw = header(6, 1);
        // enum index 9 is out of range for DisconnectType
        raw.extend_from_slice(&[0, 9, 0xFF, 0xFF, 0xFF, 0xFF]);
        raw.extend_from_slice(&header(0, 16));

        let mut decoder = FrameDecoder::new(reg);
        decoder.feed(&raw).unwrap();
        assert_eq!(
            decoder.next_packet(),
            Err(ProtocolError::InvalidEnum {
                field: "disconnect_type",
                index: 9
            })
        );
        assert!(decoder.is_poisoned());
        assert_eq!(decoder.pending(), 0);
        assert_eq!(decoder.feed(&[0]), Err(ProtocolError::Poisoned));
        assert_eq!(decoder.next_frame(), Err(ProtocolError::Poisoned));

        decoder.reset();
        decoder.feed(&header(0, 16)).unwrap();
        assert_eq!(
            decoder.next_packet().unwrap(),
            Some(Packet::PasswordAccepted(PasswordAccepted {}))
        );
    }

    #[test]
    fn oversized_encode_rejected() {
        let reg = registry();
        let chat = Packet::ChatMessage(ChatMessage {
            message: Some("x".repeat(4_096_001)),
        });
        let mut buf = BytesMut::new();
        assert!(encode_into(&reg, &chat, &mut buf).is_err());
        assert!(buf.is_empty());
    }
}
