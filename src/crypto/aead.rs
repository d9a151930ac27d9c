//! AEAD sealing of DATA payloads
//!
//! Optional second layer inside TLS. Each direction has its own
//! ChaCha20-Poly1305 key; a sealed payload is laid out as
//! `nonce (seq u64 BE + 4 random bytes) || ciphertext || tag`.

use super::{random_bytes, CryptoError, Hkdf, Secret, KEY_LEN, NONCE_LEN, TAG_LEN};
use crate::protocol::{KDF_INFO, KDF_SALT};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305};

/// Per-direction keys derived from a user's secret
pub struct SessionKeys {
    client_to_server: [u8; KEY_LEN],
    server_to_client: [u8; KEY_LEN],
}

impl SessionKeys {
    pub fn derive(secret: &Secret) -> Result<Self, CryptoError> {
        let (client_to_server, server_to_client) =
            Hkdf::new(Some(KDF_SALT), secret.as_bytes()).expand_pair(KDF_INFO)?;

        Ok(Self {
            client_to_server,
            server_to_client,
        })
    }

    /// Ciphers for the client side: (send, receive)
    pub fn client_ciphers(&self) -> Result<(PayloadCipher, PayloadCipher), CryptoError> {
        Ok((
            PayloadCipher::new(&self.client_to_server)?,
            PayloadCipher::new(&self.server_to_client)?,
        ))
    }

    /// Ciphers for the server side: (send, receive)
    pub fn server_ciphers(&self) -> Result<(PayloadCipher, PayloadCipher), CryptoError> {
        Ok((
            PayloadCipher::new(&self.server_to_client)?,
            PayloadCipher::new(&self.client_to_server)?,
        ))
    }
}

/// One direction of payload encryption
pub struct PayloadCipher {
    key: LessSafeKey,
    send_seq: u64,
    recv_seq: Option<u64>,
}

impl PayloadCipher {
    /// Create a new cipher from a 32-byte key
    pub fn new(key: &[u8; KEY_LEN]) -> Result<Self, CryptoError> {
        let unbound_key =
            UnboundKey::new(&CHACHA20_POLY1305, key).map_err(|_| CryptoError::InvalidKeyLength)?;

        Ok(Self {
            key: LessSafeKey::new(unbound_key),
            send_seq: 0,
            recv_seq: None,
        })
    }

    /// Bytes added to every sealed payload
    pub const OVERHEAD: usize = NONCE_LEN + TAG_LEN;

    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..8].copy_from_slice(&self.send_seq.to_be_bytes());
        random_bytes(&mut nonce[8..])?;
        self.send_seq = self
            .send_seq
            .checked_add(1)
            .ok_or_else(|| CryptoError::Encryption("sequence exhausted".to_string()))?;

        let mut out = Vec::with_capacity(Self::OVERHEAD + plaintext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(plaintext);

        let mut body = out.split_off(NONCE_LEN);
        self.key
            .seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut body)
            .map_err(|_| CryptoError::Encryption("seal failed".to_string()))?;
        out.extend_from_slice(&body);

        Ok(out)
    }

    /// Open a sealed payload; sequence numbers must strictly increase
    pub fn open(&mut self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < Self::OVERHEAD {
            return Err(CryptoError::Decryption(format!(
                "payload of {} bytes is shorter than nonce and tag",
                sealed.len()
            )));
        }

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&sealed[..NONCE_LEN]);
        let mut seq_bytes = [0u8; 8];
        seq_bytes.copy_from_slice(&nonce[..8]);
        let seq = u64::from_be_bytes(seq_bytes);

        if matches!(self.recv_seq, Some(last) if seq <= last) {
            return Err(CryptoError::Replay(seq));
        }

        let mut body = sealed[NONCE_LEN..].to_vec();
        let plaintext_len = self
            .key
            .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut body)
            .map_err(|_| CryptoError::Decryption("open failed".to_string()))?
            .len();
        body.truncate(plaintext_len);

        self.recv_seq = Some(seq);
        Ok(body)
    }
}
