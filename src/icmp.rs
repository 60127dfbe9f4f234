// icmp.rs - ICMP echo packet construction and parsing

use std::fmt;
use std::net::Ipv4Addr;

/// Size of the ICMP echo header (type, code, checksum, identifier, sequence).
pub const ICMP_HEADER_LEN: usize = 8;

/// Minimum IPv4 header size; raw IPv4 sockets deliver the header in front of the ICMP message.
const IPV4_MIN_HEADER_LEN: usize = 20;

/// ICMP message types the relay cares about.
///
/// Everything else arriving on the raw socket (destination unreachable,
/// time exceeded, ...) is noise for the relay and gets dropped while parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpType {
    EchoReply = 0,
    EchoRequest = 8,
}

impl IcmpType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// An ICMP echo packet, header and payload, without any IP header.
///
/// # Examples
///
/// ```rust
/// use ping_relay::icmp::IcmpPacket;
///
/// let packet = IcmpPacket::new_echo_request(0x1234, 1, &[1, 2, 3, 4]);
///
/// assert_eq!(packet.identifier(), 0x1234);
/// assert_eq!(packet.sequence(), 1);
/// assert_eq!(packet.payload(), &[1, 2, 3, 4]);
/// ```
#[derive(Clone)]
pub struct IcmpPacket {
    data: Vec<u8>,
}

impl IcmpPacket {
    /// Builds an echo request with the checksum already filled in.
    pub fn new_echo_request(identifier: u16, sequence: u16, payload: &[u8]) -> Self {
        Self::new(IcmpType::EchoRequest, 0, identifier, sequence, payload)
    }

    pub fn new(
        icmp_type: IcmpType,
        code: u8,
        identifier: u16,
        sequence: u16,
        payload: &[u8],
    ) -> Self {
        let mut data = Vec::with_capacity(ICMP_HEADER_LEN + payload.len());

        data.push(icmp_type.as_u8());
        data.push(code);
        data.extend_from_slice(&[0, 0]); // checksum placeholder
        data.extend_from_slice(&identifier.to_be_bytes());
        data.extend_from_slice(&sequence.to_be_bytes());
        data.extend_from_slice(payload);

        let mut packet = IcmpPacket { data };
        let checksum = checksum(&packet.data);
        packet.set_checksum(checksum);
        packet
    }

    /// Echo request padded with a repeating byte pattern of `len` bytes.
    pub fn echo_request_with_padding(identifier: u16, sequence: u16, len: usize) -> Self {
        let payload: Vec<u8> = (0..len).map(|i| (i & 0xFF) as u8).collect();
        Self::new_echo_request(identifier, sequence, &payload)
    }

    pub fn icmp_type(&self) -> u8 {
        self.data[0]
    }

    pub fn code(&self) -> u8 {
        self.data[1]
    }

    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.data[2], self.data[3]])
    }

    fn set_checksum(&mut self, checksum: u16) {
        let bytes = checksum.to_be_bytes();
        self.data[2] = bytes[0];
        self.data[3] = bytes[1];
    }

    pub fn identifier(&self) -> u16 {
        u16::from_be_bytes([self.data[4], self.data[5]])
    }

    pub fn sequence(&self) -> u16 {
        u16::from_be_bytes([self.data[6], self.data[7]])
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[ICMP_HEADER_LEN..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Whether the checksum over the whole message (including the checksum
    /// field itself) folds to all ones.
    pub fn verify_checksum(&self) -> bool {
        fold(sum_words(&self.data)) == 0xFFFF
    }

    /// Wraps raw ICMP bytes. Returns `None` when shorter than an echo header.
    pub fn parse(data: &[u8]) -> Option<IcmpPacket> {
        if data.len() < ICMP_HEADER_LEN {
            return None;
        }

        Some(IcmpPacket {
            data: data.to_vec(),
        })
    }
}

impl fmt::Debug for IcmpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IcmpPacket")
            .field("icmp_type", &self.icmp_type())
            .field("code", &self.code())
            .field("identifier", &self.identifier())
            .field("sequence", &self.sequence())
            .field("payload_len", &self.payload().len())
            .finish()
    }
}

/// The fields of an echo reply the correlator needs, taken from one raw IPv4 datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedReply {
    pub source: Ipv4Addr,
    pub identifier: u16,
    pub sequence: u16,
    pub ttl: u8,
}

/// Parses a datagram read from a raw IPv4 ICMP socket (IP header included).
///
/// Returns `None` for anything that is not a well-formed echo reply: short
/// reads, non-IPv4 headers, other ICMP types, bad checksums.
pub fn parse_ipv4_echo_reply(datagram: &[u8]) -> Option<ParsedReply> {
    if datagram.len() < IPV4_MIN_HEADER_LEN {
        return None;
    }

    let version = datagram[0] >> 4;
    if version != 4 {
        return None;
    }

    let header_len = ((datagram[0] & 0x0F) as usize) * 4;
    if header_len < IPV4_MIN_HEADER_LEN || datagram.len() < header_len + ICMP_HEADER_LEN {
        return None;
    }

    let ttl = datagram[8];
    let source = Ipv4Addr::new(datagram[12], datagram[13], datagram[14], datagram[15]);

    let packet = IcmpPacket::parse(&datagram[header_len..])?;
    if packet.icmp_type() != IcmpType::EchoReply.as_u8() || packet.code() != 0 {
        return None;
    }
    if !packet.verify_checksum() {
        return None;
    }

    Some(ParsedReply {
        source,
        identifier: packet.identifier(),
        sequence: packet.sequence(),
        ttl,
    })
}

fn sum_words(data: &[u8]) -> u32 {
    data.chunks(2)
        .map(|pair| match *pair {
            [hi, lo] => u16::from_be_bytes([hi, lo]) as u32,
            [hi] => u16::from_be_bytes([hi, 0]) as u32,
            _ => 0,
        })
        .sum()
}

fn fold(mut sum: u32) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

/// Internet checksum (RFC 1071) of a message whose checksum field is zero.
pub fn checksum(data: &[u8]) -> u16 {
    !fold(sum_words(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ipv4_datagram(ttl: u8, source: [u8; 4], icmp: &[u8]) -> Vec<u8> {
        let mut header = vec![0u8; 20];
        header[0] = 0x45;
        header[8] = ttl;
        header[9] = 1; // ICMP
        header[12..16].copy_from_slice(&source);
        header.extend_from_slice(icmp);
        header
    }

    fn echo_reply(identifier: u16, sequence: u16) -> IcmpPacket {
        IcmpPacket::new(IcmpType::EchoReply, 0, identifier, sequence, &[0xAA, 0xBB])
    }

    #[test]
    fn test_echo_request_layout() {
        let packet = IcmpPacket::echo_request_with_padding(0x1234, 0x5678, 6);

        assert_eq!(packet.icmp_type(), 8);
        assert_eq!(packet.code(), 0);
        assert_eq!(packet.identifier(), 0x1234);
        assert_eq!(packet.sequence(), 0x5678);
        assert_eq!(packet.payload(), &[0, 1, 2, 3, 4, 5]);
        assert_eq!(packet.as_bytes().len(), ICMP_HEADER_LEN + 6);
        assert!(packet.verify_checksum());
    }

    #[test]
    fn test_checksum_odd_length() {
        let packet = IcmpPacket::new_echo_request(1, 1, &[0xFF, 0x01, 0x7F]);
        assert_ne!(packet.checksum(), 0);
        assert!(packet.verify_checksum());
    }

    #[test]
    fn test_parse_reply_from_raw_datagram() {
        let datagram = ipv4_datagram(57, [10, 0, 0, 50], echo_reply(7, 3).as_bytes());

        let reply = parse_ipv4_echo_reply(&datagram).unwrap();

        assert_eq!(reply.source, Ipv4Addr::new(10, 0, 0, 50));
        assert_eq!(reply.identifier, 7);
        assert_eq!(reply.sequence, 3);
        assert_eq!(reply.ttl, 57);
    }

    #[test]
    fn test_parse_reply_honours_ip_options() {
        let mut datagram = ipv4_datagram(64, [192, 168, 1, 1], &[]);
        datagram[0] = 0x46; // 24-byte header
        datagram.extend_from_slice(&[0, 0, 0, 0]);
        datagram.extend_from_slice(echo_reply(9, 1).as_bytes());

        let reply = parse_ipv4_echo_reply(&datagram).unwrap();
        assert_eq!(reply.identifier, 9);
        assert_eq!(reply.sequence, 1);
    }

    #[test]
    fn test_noise_is_discarded() {
        // our own echo request looping back
        let request = IcmpPacket::new_echo_request(7, 3, &[]);
        assert!(parse_ipv4_echo_reply(&ipv4_datagram(64, [127, 0, 0, 1], request.as_bytes())).is_none());

        // destination unreachable
        let mut unreachable = vec![3, 1, 0, 0, 0, 0, 0, 0];
        let sum = checksum(&unreachable);
        unreachable[2..4].copy_from_slice(&sum.to_be_bytes());
        assert!(parse_ipv4_echo_reply(&ipv4_datagram(64, [10, 0, 0, 1], &unreachable)).is_none());

        // corrupted checksum
        let mut corrupted = echo_reply(7, 3).as_bytes().to_vec();
        corrupted[9] ^= 0xFF;
        assert!(parse_ipv4_echo_reply(&ipv4_datagram(64, [10, 0, 0, 1], &corrupted)).is_none());

        // truncated and non-IPv4
        assert!(parse_ipv4_echo_reply(&[0x45, 0, 0]).is_none());
        let mut v6 = ipv4_datagram(64, [10, 0, 0, 1], echo_reply(7, 3).as_bytes());
        v6[0] = 0x60;
        assert!(parse_ipv4_echo_reply(&v6).is_none());
    }

    #[test]
    fn test_parse_too_short() {
        assert!(IcmpPacket::parse(&[1, 2, 3]).is_none());
    }
}
