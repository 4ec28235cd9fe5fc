use std::net::Ipv4Addr;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionCode {
    Pad = 0,
    SubnetMask = 1,
    Router = 3,
    DnsServer = 6,
    HostName = 12,
    DomainName = 15,
    BroadcastAddress = 28,
    RequestedIpAddress = 50,
    LeaseTime = 51,
    MessageType = 53,
    ServerIdentifier = 54,
    ParameterRequestList = 55,
    Message = 56,
    RenewalTime = 58,
    RebindingTime = 59,
    End = 255,
}

impl TryFrom<u8> for OptionCode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Pad),
            1 => Ok(Self::SubnetMask),
            3 => Ok(Self::Router),
            6 => Ok(Self::DnsServer),
            12 => Ok(Self::HostName),
            15 => Ok(Self::DomainName),
            28 => Ok(Self::BroadcastAddress),
            50 => Ok(Self::RequestedIpAddress),
            51 => Ok(Self::LeaseTime),
            53 => Ok(Self::MessageType),
            54 => Ok(Self::ServerIdentifier),
            55 => Ok(Self::ParameterRequestList),
            56 => Ok(Self::Message),
            58 => Ok(Self::RenewalTime),
            59 => Ok(Self::RebindingTime),
            255 => Ok(Self::End),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Discover),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Request),
            4 => Ok(Self::Decline),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nak),
            7 => Ok(Self::Release),
            8 => Ok(Self::Inform),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discover => write!(f, "DISCOVER"),
            Self::Offer => write!(f, "OFFER"),
            Self::Request => write!(f, "REQUEST"),
            Self::Decline => write!(f, "DECLINE"),
            Self::Ack => write!(f, "ACK"),
            Self::Nak => write!(f, "NAK"),
            Self::Release => write!(f, "RELEASE"),
            Self::Inform => write!(f, "INFORM"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum DhcpOption {
    SubnetMask(Ipv4Addr),
    Router(Vec<Ipv4Addr>),
    DnsServer(Vec<Ipv4Addr>),
    HostName(String),
    DomainName(String),
    BroadcastAddress(Ipv4Addr),
    RequestedIpAddress(Ipv4Addr),
    LeaseTime(u32),
    MessageType(MessageType),
    ServerIdentifier(Ipv4Addr),
    ParameterRequestList(Vec<u8>),
    Message(String),
    RenewalTime(u32),
    RebindingTime(u32),
    Unknown(u8, Vec<u8>),
}

fn parse_ipv4(data: &[u8], what: &str) -> Result<Ipv4Addr> {
    if data.len() != 4 {
        return Err(Error::InvalidPacket(format!("Invalid {what} length")));
    }
    Ok(Ipv4Addr::new(data[0], data[1], data[2], data[3]))
}

fn parse_ipv4_list(data: &[u8], what: &str) -> Result<Vec<Ipv4Addr>> {
    if data.len() % 4 != 0 || data.is_empty() {
        return Err(Error::InvalidPacket(format!("Invalid {what} length")));
    }
    Ok(data
        .chunks_exact(4)
        .map(|chunk| Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]))
        .collect())
}

fn parse_u32(data: &[u8], what: &str) -> Result<u32> {
    if data.len() != 4 {
        return Err(Error::InvalidPacket(format!("Invalid {what} length")));
    }
    Ok(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
}

impl DhcpOption {
    pub fn parse(code: u8, data: &[u8]) -> Result<Self> {
        match OptionCode::try_from(code) {
            Ok(OptionCode::SubnetMask) => Ok(Self::SubnetMask(parse_ipv4(data, "subnet mask")?)),
            Ok(OptionCode::Router) => Ok(Self::Router(parse_ipv4_list(data, "router option")?)),
            Ok(OptionCode::DnsServer) => {
                Ok(Self::DnsServer(parse_ipv4_list(data, "DNS server option")?))
            }
            Ok(OptionCode::HostName) => {
                Ok(Self::HostName(String::from_utf8_lossy(data).to_string()))
            }
            Ok(OptionCode::DomainName) => {
                Ok(Self::DomainName(String::from_utf8_lossy(data).to_string()))
            }
            Ok(OptionCode::BroadcastAddress) => Ok(Self::BroadcastAddress(parse_ipv4(
                data,
                "broadcast address",
            )?)),
            Ok(OptionCode::RequestedIpAddress) => Ok(Self::RequestedIpAddress(parse_ipv4(
                data,
                "requested IP address",
            )?)),
            Ok(OptionCode::LeaseTime) => Ok(Self::LeaseTime(parse_u32(data, "lease time")?)),
            Ok(OptionCode::MessageType) => {
                if data.len() != 1 {
                    return Err(Error::InvalidPacket(
                        "Invalid message type length".to_string(),
                    ));
                }
                let msg_type = MessageType::try_from(data[0]).map_err(|value| {
                    Error::InvalidPacket(format!("Unknown message type: {}", value))
                })?;
                Ok(Self::MessageType(msg_type))
            }
            Ok(OptionCode::ServerIdentifier) => Ok(Self::ServerIdentifier(parse_ipv4(
                data,
                "server identifier",
            )?)),
            Ok(OptionCode::ParameterRequestList) => Ok(Self::ParameterRequestList(data.to_vec())),
            Ok(OptionCode::Message) => Ok(Self::Message(String::from_utf8_lossy(data).to_string())),
            Ok(OptionCode::RenewalTime) => Ok(Self::RenewalTime(parse_u32(data, "renewal time")?)),
            Ok(OptionCode::RebindingTime) => {
                Ok(Self::RebindingTime(parse_u32(data, "rebinding time")?))
            }
            Ok(OptionCode::Pad) | Ok(OptionCode::End) => Err(Error::InvalidPacket(
                "Pad/End should not be parsed as options".to_string(),
            )),
            Err(unknown_code) => Ok(Self::Unknown(unknown_code, data.to_vec())),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        fn with_addr(code: OptionCode, addr: &Ipv4Addr) -> Vec<u8> {
            let mut result = vec![code as u8, 4];
            result.extend_from_slice(&addr.octets());
            result
        }

        fn with_addrs(code: OptionCode, addrs: &[Ipv4Addr]) -> Vec<u8> {
            let mut result = vec![code as u8, (addrs.len() * 4) as u8];
            for addr in addrs {
                result.extend_from_slice(&addr.octets());
            }
            result
        }

        fn with_bytes(code: OptionCode, data: &[u8]) -> Vec<u8> {
            let mut result = vec![code as u8, data.len() as u8];
            result.extend_from_slice(data);
            result
        }

        fn with_u32(code: OptionCode, value: u32) -> Vec<u8> {
            let mut result = vec![code as u8, 4];
            result.extend_from_slice(&value.to_be_bytes());
            result
        }

        match self {
            Self::SubnetMask(addr) => with_addr(OptionCode::SubnetMask, addr),
            Self::Router(addrs) => with_addrs(OptionCode::Router, addrs),
            Self::DnsServer(addrs) => with_addrs(OptionCode::DnsServer, addrs),
            Self::HostName(name) => with_bytes(OptionCode::HostName, name.as_bytes()),
            Self::DomainName(name) => with_bytes(OptionCode::DomainName, name.as_bytes()),
            Self::BroadcastAddress(addr) => with_addr(OptionCode::BroadcastAddress, addr),
            Self::RequestedIpAddress(addr) => with_addr(OptionCode::RequestedIpAddress, addr),
            Self::LeaseTime(time) => with_u32(OptionCode::LeaseTime, *time),
            Self::MessageType(msg_type) => {
                vec![OptionCode::MessageType as u8, 1, *msg_type as u8]
            }
            Self::ServerIdentifier(addr) => with_addr(OptionCode::ServerIdentifier, addr),
            Self::ParameterRequestList(params) => {
                with_bytes(OptionCode::ParameterRequestList, params)
            }
            Self::Message(text) => with_bytes(OptionCode::Message, text.as_bytes()),
            Self::RenewalTime(time) => with_u32(OptionCode::RenewalTime, *time),
            Self::RebindingTime(time) => with_u32(OptionCode::RebindingTime, *time),
            Self::Unknown(code, data) => {
                let mut result = vec![*code, data.len() as u8];
                result.extend_from_slice(data);
                result
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_roundtrip() {
        for value in 1..=8u8 {
            let msg_type = MessageType::try_from(value).unwrap();
            assert_eq!(msg_type as u8, value);
        }
    }

    #[test]
    fn test_option_encode_decode() {
        let original = DhcpOption::SubnetMask(Ipv4Addr::new(255, 255, 255, 0));
        let encoded = original.encode();
        assert_eq!(encoded, vec![1, 4, 255, 255, 255, 0]);

        let decoded = DhcpOption::parse(1, &[255, 255, 255, 0]).unwrap();
        if let DhcpOption::SubnetMask(addr) = decoded {
            assert_eq!(addr, Ipv4Addr::new(255, 255, 255, 0));
        } else {
            panic!("Expected SubnetMask");
        }
    }

    #[test]
    fn test_lease_time_encoding() {
        let option = DhcpOption::LeaseTime(86400);
        let encoded = option.encode();
        assert_eq!(encoded.len(), 6);
        assert_eq!(encoded[0], 51);
        assert_eq!(encoded[1], 4);

        let decoded = DhcpOption::parse(51, &encoded[2..]).unwrap();
        if let DhcpOption::LeaseTime(time) = decoded {
            assert_eq!(time, 86400);
        } else {
            panic!("Expected LeaseTime");
        }
    }

    #[test]
    fn test_hostname_option() {
        let option = DhcpOption::HostName("laptop-01".to_string());
        let encoded = option.encode();
        assert_eq!(encoded[0], 12);
        assert_eq!(encoded[1], 9);

        let decoded = DhcpOption::parse(12, &encoded[2..]).unwrap();
        if let DhcpOption::HostName(name) = decoded {
            assert_eq!(name, "laptop-01");
        } else {
            panic!("Expected HostName");
        }
    }

    #[test]
    fn test_nak_message_option() {
        let option = DhcpOption::Message("no IP available".to_string());
        let encoded = option.encode();
        assert_eq!(encoded[0], 56);

        let decoded = DhcpOption::parse(56, &encoded[2..]).unwrap();
        if let DhcpOption::Message(text) = decoded {
            assert_eq!(text, "no IP available");
        } else {
            panic!("Expected Message");
        }
    }

    #[test]
    fn test_unknown_option_passthrough() {
        let decoded = DhcpOption::parse(26, &[5, 220]).unwrap();
        if let DhcpOption::Unknown(code, data) = decoded {
            assert_eq!(code, 26);
            assert_eq!(data, vec![5, 220]);
        } else {
            panic!("Expected Unknown");
        }
    }
}
