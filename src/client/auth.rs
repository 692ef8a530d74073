use bytes::Bytes;
use tracing::{info, trace};

use super::{messages::read_string, session::Session};
use crate::{config::MAX_STRING_LEN, stream::StreamReader, VncError, VncVersion};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityType {
    Invalid,
    None,
    VncAuth,
    Other(u8),
}

impl From<u8> for SecurityType {
    fn from(num: u8) -> Self {
        match num {
            0 => SecurityType::Invalid,
            1 => SecurityType::None,
            2 => SecurityType::VncAuth,
            other => SecurityType::Other(other),
        }
    }
}

impl From<SecurityType> for u8 {
    fn from(e: SecurityType) -> Self {
        match e {
            SecurityType::Invalid => 0,
            SecurityType::None => 1,
            SecurityType::VncAuth => 2,
            SecurityType::Other(other) => other,
        }
    }
}

/// Answers the server's security challenge
///
/// The engine only frames the exchange: it reads `challenge_len` bytes,
/// hands them to `respond` and writes back whatever comes out. For the
/// classic VNC authentication that is a 16 byte challenge encrypted with
/// the password.
pub trait Authenticator: Send + 'static {
    /// Security type numbers this authenticator handles, in preference order
    fn security_types(&self) -> &[u8];

    fn challenge_len(&self, _security_type: u8) -> usize {
        16
    }

    fn respond(&mut self, security_type: u8, challenge: &[u8]) -> Result<Vec<u8>, VncError>;
}

async fn read_reason(reader: &mut StreamReader) -> Result<String, VncError> {
    let reason = read_string(reader, MAX_STRING_LEN).await?;
    Ok(String::from_utf8_lossy(&reason).into_owned())
}

fn choose(
    offered: &[u8],
    auth: &Option<&mut dyn Authenticator>,
) -> Result<SecurityType, VncError> {
    if offered.contains(&u8::from(SecurityType::None)) {
        return Ok(SecurityType::None);
    }
    match auth {
        Some(auth) => auth
            .security_types()
            .iter()
            .find(|t| offered.contains(t))
            .map(|t| SecurityType::from(*t))
            .ok_or_else(|| VncError::NoSecurityType(offered.to_vec())),
        None => Err(VncError::NoAuthenticator),
    }
}

/// Run the security handshake of `version`
pub(crate) async fn negotiate(
    reader: &mut StreamReader,
    session: &Session,
    version: VncVersion,
    mut auth: Option<&mut dyn Authenticator>,
) -> Result<(), VncError> {
    let security_type = if version == VncVersion::RFB33 {
        // +--------------+--------------+---------------+
        // | No. of bytes | Type [Value] | Description   |
        // +--------------+--------------+---------------+
        // | 4            | U32          | security-type |
        // +--------------+--------------+---------------+
        let chosen = reader.read_u32().await?;
        match u8::try_from(chosen).map(SecurityType::from) {
            Ok(SecurityType::Invalid) => {
                return Err(VncError::ServerRefused(read_reason(reader).await?))
            }
            Ok(SecurityType::None) => SecurityType::None,
            Ok(other) => {
                let t = u8::from(other);
                match &auth {
                    Some(a) if a.security_types().contains(&t) => other,
                    Some(_) => return Err(VncError::NoSecurityType(vec![t])),
                    None => return Err(VncError::NoAuthenticator),
                }
            }
            Err(_) => {
                return Err(VncError::malformed(format!(
                    "security type {} out of range",
                    chosen
                )))
            }
        }
    } else {
        // +--------------------------+-------------+--------------------------+
        // | No. of bytes             | Type        | Description              |
        // |                          | [Value]     |                          |
        // +--------------------------+-------------+--------------------------+
        // | 1                        | U8          | number-of-security-types |
        // | number-of-security-types | U8 array    | security-types           |
        // +--------------------------+-------------+--------------------------+
        let num = reader.read_u8().await?;
        if num == 0 {
            return Err(VncError::ServerRefused(read_reason(reader).await?));
        }
        let offered = reader.read_bytes(num as usize).await?;
        trace!("Security types offered: {:?}", &offered[..]);
        let chosen = choose(&offered, &auth)?;
        session.write_raw(Bytes::copy_from_slice(&[chosen.into()]))?;
        chosen
    };
    trace!("Security type: {:?}", security_type);

    if security_type == SecurityType::None {
        // only 3.8 confirms the None type
        if version < VncVersion::RFB38 {
            info!("No auth needed");
            return Ok(());
        }
    } else {
        let t = u8::from(security_type);
        let auth = auth.as_deref_mut().ok_or(VncError::NoAuthenticator)?;
        let challenge = reader.read_bytes(auth.challenge_len(t)).await?;
        let response = auth.respond(t, &challenge)?;
        session.write_raw(Bytes::from(response))?;
    }

    // +--------------+--------------+-------------+
    // | No. of bytes | Type [Value] | Description |
    // +--------------+--------------+-------------+
    // | 4            | U32          | status:     |
    // |              | [0]          | OK          |
    // |              | [1]          | failed      |
    // +--------------+--------------+-------------+
    match reader.read_u32().await? {
        0 => {
            info!("Auth done");
            Ok(())
        }
        _ if version >= VncVersion::RFB38 => Err(VncError::AuthFailed(read_reason(reader).await?)),
        _ => Err(VncError::AuthFailed("rejected by the server".to_string())),
    }
}
