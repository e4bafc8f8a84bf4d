//! Wire codec for NetBIOS name service datagrams.
//!
//! Header fields are network byte order (big-endian). RDATA fields inside
//! NB_ADDRESS records are little-endian, matching the reference
//! implementation's reuse of its "Intel" byte-order helpers for RDATA
//! even though the rest of the datagram is big-endian.

use std::io::{Cursor, Read};
use std::net::Ipv4Addr;

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use super::name::{NetBiosName, NAME_LEN};
use crate::error::ServerError;

type Result<T> = std::result::Result<T, ServerError>;

/// Opcode nibble, stored in the high 4 bits of the flags word's opcode
/// field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum Opcode {
    NameQuery = 0,
    Registration = 5,
    Release = 6,
    Wack = 7,
    Refresh = 8,
    MultiHomedRegistration = 15,
}

/// The high-level, dispatch-ready form of a decoded datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    NameQuery { tid: u16, name: NetBiosName },
    Register { tid: u16, name: NetBiosName, addresses: Vec<Ipv4Addr>, ttl: u32, multi_homed: bool },
    Refresh { tid: u16, name: NetBiosName, addresses: Vec<Ipv4Addr>, ttl: u32 },
    Release { tid: u16, name: NetBiosName, addresses: Vec<Ipv4Addr> },
    RegisterResponse { tid: u16, positive: bool },
    QueryResponse { tid: u16, addresses: Vec<Ipv4Addr> },
    ReleaseResponse { tid: u16 },
    Wack { tid: u16 },
}

impl Message {
    pub fn tid(&self) -> u16 {
        match self {
            Message::NameQuery { tid, .. }
            | Message::Register { tid, .. }
            | Message::Refresh { tid, .. }
            | Message::Release { tid, .. }
            | Message::RegisterResponse { tid, .. }
            | Message::QueryResponse { tid, .. }
            | Message::ReleaseResponse { tid }
            | Message::Wack { tid } => *tid,
        }
    }
}

const HEADER_LEN: usize = 12;
const RESPONSE_BIT: u16 = 0x8000;

/// Encodes a 16-raw-byte NetBIOS name (15-byte padded name + suffix) into
/// RFC1001 half-ASCII form: each nibble becomes one ASCII byte in `'A'..='P'`.
fn encode_name(name: &NetBiosName, out: &mut Vec<u8>) {
    out.push(2 * (NAME_LEN as u8 + 1));
    let mut encode_byte = |b: u8| {
        out.push(b'A' + (b >> 4));
        out.push(b'A' + (b & 0x0F));
    };
    for &b in &name.name {
        encode_byte(b);
    }
    encode_byte(name.suffix);
    out.push(0); // root label terminator
}

fn decode_name(src: &mut impl Read) -> Result<NetBiosName> {
    let len = src.read_u8().map_err(|_| ServerError::MalformedPacket)?;
    if len as usize != 2 * (NAME_LEN + 1) {
        return Err(ServerError::MalformedPacket);
    }
    let mut raw = [0u8; NAME_LEN + 1];
    for slot in raw.iter_mut() {
        let mut pair = [0u8; 2];
        src.read_exact(&mut pair).map_err(|_| ServerError::MalformedPacket)?;
        if !(b'A'..=b'P').contains(&pair[0]) || !(b'A'..=b'P').contains(&pair[1]) {
            return Err(ServerError::MalformedPacket);
        }
        *slot = ((pair[0] - b'A') << 4) | (pair[1] - b'A');
    }
    let terminator = src.read_u8().map_err(|_| ServerError::MalformedPacket)?;
    if terminator != 0 {
        return Err(ServerError::MalformedPacket);
    }
    let mut name = [0u8; NAME_LEN];
    name.copy_from_slice(&raw[..NAME_LEN]);
    Ok(NetBiosName { name, suffix: raw[NAME_LEN], is_group: false })
}

/// NB_ADDRESS resource record body: group flag + one or more IPv4 owners.
/// RDATA integers are little-endian (see module doc).
fn encode_nb_address(addresses: &[Ipv4Addr], is_group: bool, out: &mut Vec<u8>) -> Result<()> {
    let mut rdata = Vec::new();
    for addr in addresses {
        let flags: u16 = if is_group { 0x8000 } else { 0x0000 };
        rdata.write_u16::<LittleEndian>(flags).unwrap();
        rdata.write_u32::<LittleEndian>(u32::from_be_bytes(addr.octets())).unwrap();
    }
    out.write_u16::<BigEndian>(rdata.len() as u16).map_err(|_| ServerError::MalformedPacket)?;
    out.extend_from_slice(&rdata);
    Ok(())
}

fn decode_nb_address(src: &mut impl Read) -> Result<Vec<Ipv4Addr>> {
    let rdlength = src.read_u16::<BigEndian>().map_err(|_| ServerError::MalformedPacket)?;
    if rdlength % 6 != 0 {
        return Err(ServerError::MalformedPacket);
    }
    let mut addresses = Vec::with_capacity(rdlength as usize / 6);
    for _ in 0..(rdlength / 6) {
        let _flags = src.read_u16::<LittleEndian>().map_err(|_| ServerError::MalformedPacket)?;
        let ip = src.read_u32::<LittleEndian>().map_err(|_| ServerError::MalformedPacket)?;
        addresses.push(Ipv4Addr::from(ip.to_be_bytes()));
    }
    Ok(addresses)
}

/// Encodes a [`Message`] into a wire datagram.
pub fn encode(message: &Message) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    let tid = message.tid();
    out.write_u16::<BigEndian>(tid).unwrap();

    let (opcode, response, counts, body): (Opcode, bool, (u16, u16, u16, u16), Vec<u8>) =
        match message {
            Message::NameQuery { name, .. } => {
                let mut name_buf = Vec::new();
                encode_name(name, &mut name_buf);
                name_buf.write_u16::<BigEndian>(0x0020).unwrap(); // QTYPE NB
                name_buf.write_u16::<BigEndian>(0x0001).unwrap(); // QCLASS IN
                (Opcode::NameQuery, false, (1, 0, 0, 0), name_buf)
            }
            Message::Register { name, addresses, ttl, multi_homed, .. } => {
                let mut buf = Vec::new();
                encode_name(name, &mut buf);
                buf.write_u16::<BigEndian>(0x0020).unwrap();
                buf.write_u16::<BigEndian>(0x0001).unwrap();
                buf.write_u32::<BigEndian>(*ttl).unwrap();
                encode_nb_address(addresses, name.is_group, &mut buf).unwrap();
                let opcode = if *multi_homed { Opcode::MultiHomedRegistration } else { Opcode::Registration };
                (opcode, false, (0, 0, 0, 1), buf)
            }
            Message::Refresh { name, addresses, ttl, .. } => {
                let mut buf = Vec::new();
                encode_name(name, &mut buf);
                buf.write_u16::<BigEndian>(0x0020).unwrap();
                buf.write_u16::<BigEndian>(0x0001).unwrap();
                buf.write_u32::<BigEndian>(*ttl).unwrap();
                encode_nb_address(addresses, name.is_group, &mut buf).unwrap();
                (Opcode::Refresh, false, (0, 0, 0, 1), buf)
            }
            Message::Release { name, addresses, .. } => {
                let mut buf = Vec::new();
                encode_name(name, &mut buf);
                buf.write_u16::<BigEndian>(0x0020).unwrap();
                buf.write_u16::<BigEndian>(0x0001).unwrap();
                buf.write_u32::<BigEndian>(0).unwrap();
                encode_nb_address(addresses, name.is_group, &mut buf).unwrap();
                (Opcode::Release, false, (0, 0, 0, 1), buf)
            }
            Message::RegisterResponse { positive, .. } => {
                let mut buf = Vec::new();
                buf.write_u16::<BigEndian>(if *positive { 0 } else { 1 }).unwrap();
                (Opcode::Registration, true, (0, 1, 0, 0), buf)
            }
            Message::QueryResponse { addresses, .. } => {
                let mut buf = Vec::new();
                encode_nb_address(addresses, false, &mut buf).unwrap();
                (Opcode::NameQuery, true, (0, 1, 0, 0), buf)
            }
            Message::ReleaseResponse { .. } => (Opcode::Release, true, (0, 0, 0, 0), Vec::new()),
            Message::Wack { .. } => (Opcode::Wack, true, (0, 0, 0, 0), Vec::new()),
        };

    let mut flags: u16 = (opcode as u16) << 11;
    if response {
        flags |= RESPONSE_BIT;
    }
    out.write_u16::<BigEndian>(flags).unwrap();
    out.write_u16::<BigEndian>(counts.0).unwrap();
    out.write_u16::<BigEndian>(counts.1).unwrap();
    out.write_u16::<BigEndian>(counts.2).unwrap();
    out.write_u16::<BigEndian>(counts.3).unwrap();
    out.extend_from_slice(&body);
    out
}

/// Decodes a wire datagram into a [`Message`]. Any short read or malformed
/// field yields `MalformedPacket`, never a panic.
pub fn decode(bytes: &[u8]) -> Result<Message> {
    if bytes.len() < HEADER_LEN {
        return Err(ServerError::MalformedPacket);
    }
    let mut cursor = Cursor::new(bytes);
    let tid = cursor.read_u16::<BigEndian>().map_err(|_| ServerError::MalformedPacket)?;
    let flags = cursor.read_u16::<BigEndian>().map_err(|_| ServerError::MalformedPacket)?;
    let response = flags & RESPONSE_BIT != 0;
    let opcode_bits = ((flags >> 11) & 0x0F) as u8;
    let opcode = Opcode::from_u8(opcode_bits).ok_or(ServerError::MalformedPacket)?;
    let qdcount = cursor.read_u16::<BigEndian>().map_err(|_| ServerError::MalformedPacket)?;
    let ancount = cursor.read_u16::<BigEndian>().map_err(|_| ServerError::MalformedPacket)?;
    let _nscount = cursor.read_u16::<BigEndian>().map_err(|_| ServerError::MalformedPacket)?;
    let _arcount = cursor.read_u16::<BigEndian>().map_err(|_| ServerError::MalformedPacket)?;

    match (opcode, response) {
        (Opcode::NameQuery, false) if qdcount >= 1 => {
            let name = decode_name(&mut cursor)?;
            let _qtype = cursor.read_u16::<BigEndian>().map_err(|_| ServerError::MalformedPacket)?;
            let _qclass = cursor.read_u16::<BigEndian>().map_err(|_| ServerError::MalformedPacket)?;
            Ok(Message::NameQuery { tid, name })
        }
        (Opcode::NameQuery, true) => {
            let addresses = if ancount >= 1 {
                let _name = decode_name(&mut cursor)?;
                let _rtype = cursor.read_u16::<BigEndian>().map_err(|_| ServerError::MalformedPacket)?;
                let _rclass = cursor.read_u16::<BigEndian>().map_err(|_| ServerError::MalformedPacket)?;
                let _ttl = cursor.read_u32::<BigEndian>().map_err(|_| ServerError::MalformedPacket)?;
                decode_nb_address(&mut cursor)?
            } else {
                Vec::new()
            };
            Ok(Message::QueryResponse { tid, addresses })
        }
        (Opcode::Registration, false) | (Opcode::MultiHomedRegistration, false) => {
            let name = decode_name(&mut cursor)?;
            let _rtype = cursor.read_u16::<BigEndian>().map_err(|_| ServerError::MalformedPacket)?;
            let _rclass = cursor.read_u16::<BigEndian>().map_err(|_| ServerError::MalformedPacket)?;
            let ttl = cursor.read_u32::<BigEndian>().map_err(|_| ServerError::MalformedPacket)?;
            let addresses = decode_nb_address(&mut cursor)?;
            Ok(Message::Register { tid, name, addresses, ttl, multi_homed: opcode == Opcode::MultiHomedRegistration })
        }
        (Opcode::Refresh, false) => {
            let name = decode_name(&mut cursor)?;
            let _rtype = cursor.read_u16::<BigEndian>().map_err(|_| ServerError::MalformedPacket)?;
            let _rclass = cursor.read_u16::<BigEndian>().map_err(|_| ServerError::MalformedPacket)?;
            let ttl = cursor.read_u32::<BigEndian>().map_err(|_| ServerError::MalformedPacket)?;
            let addresses = decode_nb_address(&mut cursor)?;
            Ok(Message::Refresh { tid, name, addresses, ttl })
        }
        (Opcode::Release, false) => {
            let name = decode_name(&mut cursor)?;
            let _rtype = cursor.read_u16::<BigEndian>().map_err(|_| ServerError::MalformedPacket)?;
            let _rclass = cursor.read_u16::<BigEndian>().map_err(|_| ServerError::MalformedPacket)?;
            let _ttl = cursor.read_u32::<BigEndian>().map_err(|_| ServerError::MalformedPacket)?;
            let addresses = decode_nb_address(&mut cursor)?;
            Ok(Message::Release { tid, name, addresses })
        }
        (Opcode::Registration, true) | (Opcode::MultiHomedRegistration, true) => {
            let code = cursor.read_u16::<BigEndian>().map_err(|_| ServerError::MalformedPacket)?;
            Ok(Message::RegisterResponse { tid, positive: code == 0 })
        }
        (Opcode::Release, true) => Ok(Message::ReleaseResponse { tid }),
        (Opcode::Wack, _) => Ok(Message::Wack { tid }),
        _ => Err(ServerError::MalformedPacket),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::netbios::name::SUFFIX_FILE_SERVER;

    fn sample_name() -> NetBiosName {
        NetBiosName::new("JFILESRV", SUFFIX_FILE_SERVER, false)
    }

    #[test]
    fn name_roundtrips() {
        let name = sample_name();
        let mut buf = Vec::new();
        encode_name(&name, &mut buf);
        let decoded = decode_name(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded.name, name.name);
        assert_eq!(decoded.suffix, name.suffix);
    }

    #[test]
    fn query_roundtrips() {
        let msg = Message::NameQuery { tid: 42, name: sample_name() };
        let bytes = encode(&msg);
        assert_eq!(decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn register_roundtrips() {
        let msg = Message::Register {
            tid: 7,
            name: sample_name(),
            addresses: vec![Ipv4Addr::new(192, 168, 1, 10)],
            ttl: 300_000,
            multi_homed: false,
        };
        let bytes = encode(&msg);
        assert_eq!(decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn truncated_datagram_is_malformed_not_panic() {
        assert!(matches!(decode(&[0u8; 4]), Err(ServerError::MalformedPacket)));
        assert!(matches!(decode(&[]), Err(ServerError::MalformedPacket)));
    }

    #[test]
    fn register_response_roundtrips() {
        let msg = Message::RegisterResponse { tid: 99, positive: true };
        let bytes = encode(&msg);
        assert_eq!(decode(&bytes).unwrap(), msg);

        let msg = Message::RegisterResponse { tid: 100, positive: false };
        let bytes = encode(&msg);
        assert_eq!(decode(&bytes).unwrap(), msg);
    }
}
