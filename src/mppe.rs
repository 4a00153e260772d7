//! Session key derivation for negotiated link encryption.
//!
//! Key material is derived from the authentication secret and the
//! challenge/response values of the completed handshake, so encryption
//! can only ever be armed on an authenticated link.

/// The negotiated session key strength.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum KeyStrength {
    Bits40,
    #[default]
    Bits128,
}

impl KeyStrength {
    pub fn key_len(&self) -> usize {
        match self {
            Self::Bits40 => 8,
            Self::Bits128 => 16,
        }
    }
}

// Leading salt of a 40-bit session key, per the original MPPE scheme.
const SALT_40: [u8; 3] = [0xd1, 0x26, 0x9e];

// Direction labels keep the two keys of one session distinct.
const LABEL_SEND: &[u8] = b"session key to peer";
const LABEL_RECV: &[u8] = b"session key from peer";

/// Derived symmetric key material for one direction of a session.
/// Zeroized when dropped.
#[derive(Clone, Eq, PartialEq)]
pub struct SessionKey(Vec<u8>);

impl SessionKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        for byte in self.0.iter_mut() {
            // Sufficient here: the vector is never reallocated after derivation.
            unsafe { std::ptr::write_volatile(byte, 0) };
        }
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionKey({} bytes)", self.0.len())
    }
}

/// Both directions' key material plus the negotiated parameters.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionKeys {
    pub send: SessionKey,
    pub recv: SessionKey,
    pub strength: KeyStrength,
    pub stateless: bool,
}

/// Derives the session keys for one link from the authentication secret
/// and the challenge/response pair of the completed handshake.
///
/// The 128-bit path uses the full master digest re-hashed per direction;
/// the 40-bit path truncates to 8 bytes and overwrites the first three
/// bytes with a fixed salt.
pub fn derive_keys(
    secret: &[u8],
    challenge: &[u8],
    response: &[u8],
    strength: KeyStrength,
    stateless: bool,
) -> SessionKeys {
    let mut master = Vec::with_capacity(secret.len() + challenge.len() + response.len());
    master.extend_from_slice(secret);
    master.extend_from_slice(challenge);
    master.extend_from_slice(response);
    let master = md5::compute(master).0;

    SessionKeys {
        send: derive_one(&master, LABEL_SEND, strength),
        recv: derive_one(&master, LABEL_RECV, strength),
        strength,
        stateless,
    }
}

fn derive_one(master: &[u8; 16], label: &[u8], strength: KeyStrength) -> SessionKey {
    let mut input = Vec::with_capacity(master.len() + label.len());
    input.extend_from_slice(master);
    input.extend_from_slice(label);

    let mut key = md5::compute(input).0.to_vec();
    key.truncate(strength.key_len());

    if strength == KeyStrength::Bits40 {
        key[..3].copy_from_slice(&SALT_40);
    }

    SessionKey(key)
}

/// The per-link encryption state. Created empty, armed exactly once in the
/// window between authentication success and the encryption control
/// protocol reaching `Opened`, read-only afterwards.
#[derive(Debug, Default)]
pub struct EncryptionContext {
    keys: Option<SessionKeys>,
}

impl EncryptionContext {
    pub fn install(&mut self, keys: SessionKeys) {
        self.keys = Some(keys);
    }

    /// Discards the key material. The keys zeroize themselves on drop.
    pub fn clear(&mut self) {
        self.keys = None;
    }

    pub fn is_armed(&self) -> bool {
        self.keys.is_some()
    }

    pub fn keys(&self) -> Option<&SessionKeys> {
        self.keys.as_ref()
    }
}
