use std::io;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// Minecraft Java edition framing: every packet is a VarInt-prefixed blob
// whose first field is a VarInt packet id. Vanilla handshakes are tiny
// (<300 bytes), but modded clients append extra data; 32 KiB is ample
// while still bounding memory for a single unauthenticated read.
const MAX_PACKET_LENGTH: usize = 32 * 1024;

pub(crate) const HANDSHAKE_PACKET_ID: i32 = 0;
pub(crate) const DISCONNECT_PACKET_ID: i32 = 0;

// Handshake intention: 1 is a status ping, 2 is a login.
pub(crate) const NEXT_STEP_LOGIN: i32 = 2;

// The requested hostname is an identifier of at most 255 bytes.
const MAX_SERVER_ADDRESS_LENGTH: usize = 255;

fn invalid_data(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_string())
}

fn encode_varint(mut value: i32, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7F) as u8;
        value = ((value as u32) >> 7) as i32;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

async fn read_varint<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<i32> {
    let mut value = 0i32;
    let mut shift = 0u32;
    loop {
        let byte = reader.read_u8().await?;
        value |= i32::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift >= 35 {
            return Err(invalid_data("VarInt is too long"));
        }
    }
}

// Cursor over a packet body.
struct Decoder<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> Decoder<'a> {
    fn new(buffer: &'a [u8]) -> Self {
        Decoder {
            buffer,
            position: 0,
        }
    }

    fn varint(&mut self) -> io::Result<i32> {
        let mut value = 0i32;
        let mut shift = 0u32;
        loop {
            let Some(byte) = self.buffer.get(self.position).copied() else {
                return Err(invalid_data("unexpected end of packet in VarInt"));
            };
            self.position += 1;
            value |= i32::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift >= 35 {
                return Err(invalid_data("VarInt is too long"));
            }
        }
    }

    fn string(&mut self, max_length: usize) -> io::Result<String> {
        let length = self.varint()?;
        if length < 0 {
            return Err(invalid_data("negative string length"));
        }
        let length = length as usize;
        if length > max_length {
            return Err(invalid_data("string is too long"));
        }
        let Some(bytes) = self
            .buffer
            .get(self.position..self.position + length)
        else {
            return Err(invalid_data("string length out of bounds"));
        };
        self.position += length;
        String::from_utf8(bytes.to_vec()).map_err(|_| invalid_data("string is not UTF-8"))
    }

    fn unsigned_short(&mut self) -> io::Result<u16> {
        let Some(bytes) = self.buffer.get(self.position..self.position + 2) else {
            return Err(invalid_data("unexpected end of packet in UnsignedShort"));
        };
        self.position += 2;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }
}

fn encode_string(value: &str, out: &mut Vec<u8>) {
    encode_varint(value.len() as i32, out);
    out.extend_from_slice(value.as_bytes());
}

// One framed packet: id plus opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Packet {
    pub(crate) id: i32,
    pub(crate) body: Vec<u8>,
}

impl Packet {
    // Reads a single length-prefixed packet off the wire.
    pub(crate) async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Packet> {
        let length = read_varint(reader).await?;
        if length < 0 {
            return Err(invalid_data("negative packet length"));
        }
        let length = length as usize;
        if length > MAX_PACKET_LENGTH {
            return Err(invalid_data("packet is too large"));
        }
        let mut payload = vec![0u8; length];
        reader.read_exact(&mut payload).await?;
        let mut decoder = Decoder::new(&payload);
        let id = decoder.varint()?;
        Ok(Packet {
            id,
            body: payload[decoder.position..].to_vec(),
        })
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::new();
        encode_varint(self.id, &mut frame);
        frame.extend_from_slice(&self.body);
        let mut out = Vec::with_capacity(frame.len() + 5);
        encode_varint(frame.len() as i32, &mut out);
        out.extend_from_slice(&frame);
        out
    }

    pub(crate) async fn write<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.encode()).await?;
        writer.flush().await
    }
}

// The first packet of every Java edition connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Handshake {
    pub(crate) protocol_version: i32,
    pub(crate) server_address: String,
    pub(crate) server_port: u16,
    pub(crate) next_step: i32,
}

impl Handshake {
    pub(crate) fn decode(packet: &Packet) -> io::Result<Handshake> {
        if packet.id != HANDSHAKE_PACKET_ID {
            return Err(invalid_data("not a handshake packet"));
        }
        let mut decoder = Decoder::new(&packet.body);
        let protocol_version = decoder.varint()?;
        let server_address = decoder.string(MAX_SERVER_ADDRESS_LENGTH)?;
        let server_port = decoder.unsigned_short()?;
        let next_step = decoder.varint()?;
        Ok(Handshake {
            protocol_version,
            server_address,
            server_port,
            next_step,
        })
    }

    // Re-packs the parsed handshake so the upstream server sees the exact
    // bytes the client sent.
    pub(crate) fn encode(&self) -> Packet {
        let mut body = Vec::new();
        encode_varint(self.protocol_version, &mut body);
        encode_string(&self.server_address, &mut body);
        body.extend_from_slice(&self.server_port.to_be_bytes());
        encode_varint(self.next_step, &mut body);
        Packet {
            id: HANDSHAKE_PACKET_ID,
            body,
        }
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    text: &'a str,
}

// An early disconnect ("kick"): packet id 0 carrying a JSON chat
// component as a length-prefixed string.
pub(crate) fn disconnect_packet(message: &str) -> Packet {
    let json = serde_json::to_string(&ChatMessage { text: message }).expect("valid JSON");
    let mut body = Vec::new();
    encode_string(&json, &mut body);
    Packet {
        id: DISCONNECT_PACKET_ID,
        body,
    }
}
