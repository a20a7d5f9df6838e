use crate::socks5::protocol::{AuthMethod, AuthStatus, Version};
use anyhow::{Result, anyhow, bail};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// UserPass holds username/password credentials as dictated
/// server-side
#[derive(Clone)]
pub struct UserPass {
    pub username: String,
    pub password: String,
}

/// negotiate_auth handles authentication negotiation between the SOCKS
/// server and client over any duplex stream
pub async fn negotiate_auth<S>(stream: &mut S, auth_config: &Option<Arc<UserPass>>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // ClientHello format
    // +----+----------+----------+
    // |VER | NMETHODS | METHODS  |
    // +----+----------+----------+
    // | 1  |    1     | 1 to 255 |
    // +----+----------+----------+

    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;

    let version = buf[0];
    let n_methods = buf[1];

    // Ensure version is 0x05 -> SOCKS5
    if version != Version::SOCKS5 as u8 {
        bail!("[ERR] not SOCKS5");
    }

    let mut methods = vec![0u8; n_methods as usize];
    stream.read_exact(&mut methods).await?;

    // Username/password is only negotiated when credentials are
    // actually configured
    let method = select_auth_method(&methods, auth_config.is_some());

    // Write response to client with selected method
    stream.write_all(&[Version::SOCKS5 as u8, method]).await?;

    match method {
        m if m == AuthMethod::UserPass as u8 => {
            let creds = auth_config
                .as_ref()
                .ok_or_else(|| anyhow!("[ERR] username/password required but not configured"))?;
            authenticate_userpass(stream, creds).await?;
        }
        m if m == AuthMethod::NoAuth as u8 => (),
        _ => bail!("[ERR] no acceptable authentication method"),
    }

    Ok(())
}

/// authenticate_userpass handles username/password authentication
/// according to RFC 1929
async fn authenticate_userpass<S>(stream: &mut S, server_creds: &UserPass) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Client Username/Password Request
    // +----+------+----------+------+----------+
    // |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
    // +----+------+----------+------+----------+
    // | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
    // +----+------+----------+------+----------+

    // Subnegotiation version -> 0x01 expected
    let mut ver = [0u8; 1];
    stream.read_exact(&mut ver).await?;

    if ver[0] != 0x01 {
        bail!("[ERR] invalid username/password subnegotiation version");
    }

    let mut username_len = [0u8; 1];
    stream.read_exact(&mut username_len).await?;

    let mut username = vec![0u8; username_len[0] as usize];
    stream.read_exact(&mut username).await?;

    let mut password_len = [0u8; 1];
    stream.read_exact(&mut password_len).await?;

    let mut password = vec![0u8; password_len[0] as usize];
    stream.read_exact(&mut password).await?;

    let user_string = String::from_utf8(username)?;
    let pass_string = String::from_utf8(password)?;

    // Validate credentials
    let status = if user_string != server_creds.username || pass_string != server_creds.password {
        AuthStatus::Failure
    } else {
        AuthStatus::Success
    };

    // Username/Password Server response
    // +----+--------+
    // |VER | STATUS |
    // +----+--------+
    // | 1  |   1    |
    // +----+--------+
    stream.write_all(&[0x01, status as u8]).await?;

    match status {
        AuthStatus::Success => Ok(()),
        AuthStatus::Failure => bail!("[ERR] authentication failed"),
    }
}

/// select_auth_method picks the auth method from the client's offer:
/// username/password when the server has credentials, otherwise
/// no-auth
fn select_auth_method(client_methods: &[u8], want_userpass: bool) -> u8 {
    if want_userpass {
        if client_methods.contains(&(AuthMethod::UserPass as u8)) {
            return AuthMethod::UserPass as u8;
        }
    } else if client_methods.contains(&(AuthMethod::NoAuth as u8)) {
        return AuthMethod::NoAuth as u8;
    }

    AuthMethod::NoAcceptable as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_userpass_only_when_configured() {
        let both = [AuthMethod::NoAuth as u8, AuthMethod::UserPass as u8];
        assert_eq!(select_auth_method(&both, true), AuthMethod::UserPass as u8);
        assert_eq!(select_auth_method(&both, false), AuthMethod::NoAuth as u8);
    }

    #[test]
    fn rejects_when_no_offer_matches() {
        let gssapi_only = [0x01u8];
        assert_eq!(
            select_auth_method(&gssapi_only, false),
            AuthMethod::NoAcceptable as u8
        );
        let noauth_only = [AuthMethod::NoAuth as u8];
        assert_eq!(
            select_auth_method(&noauth_only, true),
            AuthMethod::NoAcceptable as u8
        );
    }
}
