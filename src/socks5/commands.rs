use crate::socks5::address::parse_address_from_stream;
use crate::socks5::protocol::{AddressType, Command, RSV, ReplyCode, Version};
use anyhow::{Result, anyhow, bail};
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// handle_socks_request checks the incoming request for SOCKS5 version
/// number and command, and for CONNECT returns an outbound stream to
/// the requested target
pub async fn handle_socks_request<S>(stream: &mut S) -> Result<TcpStream>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // SOCKS5 request format
    // +----+-----+-------+------+----------+----------+
    // |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+

    let mut reqbuf = [0u8; 3];
    stream.read_exact(&mut reqbuf).await?;

    let version = reqbuf[0];
    let command = reqbuf[1];
    // RSV (RESERVED) byte is ignored

    if version != Version::SOCKS5 as u8 {
        bail!("[ERR] not SOCKS5");
    }

    match Command::from_byte(command) {
        Some(Command::Connect) => handle_connect_cmd(stream).await,
        Some(Command::Bind) | Some(Command::UdpAssociate) => {
            send_reply(stream, ReplyCode::CommandNotSupported, "0.0.0.0:0".parse()?).await?;
            Err(anyhow!("[ERR] command {command:#04x} not supported"))
        }
        None => {
            send_reply(stream, ReplyCode::ServerFailure, "0.0.0.0:0".parse()?).await?;
            Err(anyhow!("[ERR] unknown command"))
        }
    }
}

/// handle_connect_cmd parses the CONNECT target, dials it, and reports
/// the verdict to the client
async fn handle_connect_cmd<S>(stream: &mut S) -> Result<TcpStream>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let target = parse_address_from_stream(stream).await?;

    match TcpStream::connect(&target).await {
        Ok(outbound) => {
            send_reply(stream, ReplyCode::Succeeded, outbound.local_addr()?).await?;
            Ok(outbound)
        }
        Err(e) => {
            let reply_code = match e.kind() {
                io::ErrorKind::ConnectionRefused => ReplyCode::ConnectionRefused,
                io::ErrorKind::HostUnreachable => ReplyCode::HostUnreachable,
                io::ErrorKind::NetworkUnreachable => ReplyCode::NetworkUnreachable,
                io::ErrorKind::PermissionDenied => ReplyCode::ConnectionNotAllowed,
                _ => ReplyCode::ServerFailure,
            };
            send_reply(stream, reply_code, "0.0.0.0:0".parse()?).await?;
            Err(e.into())
        }
    }
}

/// send_reply writes a SOCKS5 reply carrying the given code and bound
/// address
async fn send_reply<S>(stream: &mut S, reply_code: ReplyCode, bound_addr: SocketAddr) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    // SOCKS5 reply format
    // +----+-----+-------+------+----------+----------+
    // |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+

    let mut reply = vec![Version::SOCKS5 as u8, reply_code as u8, RSV];

    match bound_addr {
        SocketAddr::V4(addr) => {
            reply.push(AddressType::IPv4 as u8);
            reply.extend_from_slice(&addr.ip().octets());
            reply.extend_from_slice(&addr.port().to_be_bytes());
        }
        SocketAddr::V6(addr) => {
            reply.push(AddressType::IPv6 as u8);
            reply.extend_from_slice(&addr.ip().octets());
            reply.extend_from_slice(&addr.port().to_be_bytes());
        }
    }

    stream.write_all(&reply).await?;
    Ok(())
}
