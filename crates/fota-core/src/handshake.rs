//! Session key exchange with a secure device.
//!
//! 1. Read the device's ephemeral public key.
//! 2. Write our session key followed by its signature under the root key.
//! 3. The device answers through the control status; ERROR means rejected.
//! 4. Both sides derive the keystream from the ECDH secret.

use thiserror::Error;
use tracing::{debug, instrument};

use crate::crypto::{self, CryptoError, PUBLIC_KEY_LEN, ROOT_SK, SIGNATURE_LEN, SessionKeys};
use crate::protocol::CtrlStatus;
use crate::transport::{FotaTransport, TransportError};

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Device rejected the session key")]
    Rejected,
}

/// Run the exchange and switch `keys` to the encrypted path.
#[instrument(skip_all)]
pub fn exchange_keys(
    transport: &dyn FotaTransport,
    keys: &mut SessionKeys,
) -> Result<(), HandshakeError> {
    let peer_pk = transport.read_public_key()?;
    if peer_pk.len() != PUBLIC_KEY_LEN {
        return Err(CryptoError::PublicKeyLength(peer_pk.len()).into());
    }
    // Reject a malformed point before telling the device anything.
    crypto::parse_public_key(&peer_pk)?;

    let signature = crypto::sign(&ROOT_SK, keys.session_pk())?;
    let mut payload = Vec::with_capacity(PUBLIC_KEY_LEN + SIGNATURE_LEN);
    payload.extend_from_slice(keys.session_pk());
    payload.extend_from_slice(&signature);
    transport.write_public_key(&payload)?;

    let status = transport.read_status()?;
    debug!(status = %status, "Key exchange status");
    if status == CtrlStatus::Error {
        return Err(HandshakeError::Rejected);
    }

    keys.establish(&peer_pk)?;
    Ok(())
}
