use crate::socks5::protocol::AddressType;
use anyhow::{Result, anyhow};
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt};

/// parse_address_from_stream reads the address portion of a SOCKS5
/// request (IPv4, IPv6, or domain name plus port) from any stream and
/// returns it as a dialable `host:port` string
pub async fn parse_address_from_stream<S>(stream: &mut S) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    let mut atype = [0u8; 1];
    stream.read_exact(&mut atype).await?;

    let dest_addr = match AddressType::from_byte(atype[0]) {
        Some(AddressType::IPv4) => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            let ip = Ipv4Addr::from(addr);

            let port = read_port(stream).await?;
            format!("{ip}:{port}")
        }
        Some(AddressType::DomainName) => {
            // First octet carries the number of octets to follow
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;

            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await?;
            let domain_str = String::from_utf8(domain)?;

            let port = read_port(stream).await?;
            format!("{domain_str}:{port}")
        }
        Some(AddressType::IPv6) => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            let ip = Ipv6Addr::from(addr);

            let port = read_port(stream).await?;
            format!("[{ip}]:{port}")
        }
        None => return Err(anyhow!("[ERR] unknown address type: {}", atype[0])),
    };

    Ok(dest_addr)
}

/// read_port reads the two-byte network-order port that trails every
/// address form
async fn read_port<S>(stream: &mut S) -> Result<u16>
where
    S: AsyncRead + Unpin,
{
    let mut port_buf = [0u8; 2];
    stream.read_exact(&mut port_buf).await?;
    Ok(u16::from_be_bytes(port_buf))
}
