use aws_lc_rs::{
    aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey},
    encoding::AsDer,
    rsa::KeySize,
    signature::KeyPair,
};
use base64ct::{Base64, Encoding};
use mail_auth::{
    common::{
        crypto::{RsaKey, Sha256},
        headers::HeaderWriter,
    },
    dkim::DkimSigner,
};
use rand::RngCore;
use thiserror::Error;

/// Headers covered by the DKIM signature. Everything that influences how
/// a receiver renders or threads the message is included; trace headers
/// are not, as relays rewrite them.
const SIGNED_HEADERS: [&str; 16] = [
    "From",
    "Subject",
    "Date",
    "Message-ID",
    "To",
    "Cc",
    "Reply-To",
    "MIME-Version",
    "Content-Type",
    "Content-Transfer-Encoding",
    "In-Reply-To",
    "References",
    "List-Id",
    "List-Unsubscribe",
    "List-Subscribe",
    "List-Post",
];

const MIN_KEY_BITS: u32 = 1024;

#[derive(Debug, Error)]
pub enum DkimError {
    #[error("mail authentication error: {0}")]
    MailAuth(#[from] mail_auth::Error),
    #[error("cryptographic failure")]
    Crypto(#[from] aws_lc_rs::error::Unspecified),
    #[error("key rejected: {0}")]
    KeyRejected(#[from] aws_lc_rs::error::KeyRejected),
    #[error("key size {0} is below the {MIN_KEY_BITS}-bit minimum")]
    KeyTooSmall(u32),
    #[error("unsupported key size {0}, expected one of 2048, 3072 or 4096")]
    UnsupportedKeySize(u32),
    #[error("master key must be 32 bytes, got {0}")]
    BadMasterKey(usize),
    #[error("could not decode stored key material")]
    Decode,
}

/// Generate a new RSA signing key, returned as PKCS#8 DER. The default
/// and minimum-accepted sizes follow the platform policy: 2048 bits by
/// default, nothing below 1024 ever.
pub fn generate_key(bits: u32) -> Result<Vec<u8>, DkimError> {
    if bits < MIN_KEY_BITS {
        return Err(DkimError::KeyTooSmall(bits));
    }

    let size = match bits {
        1024..=2048 => KeySize::Rsa2048,
        3072 => KeySize::Rsa3072,
        4096 => KeySize::Rsa4096,
        other => return Err(DkimError::UnsupportedKeySize(other)),
    };

    let key = aws_lc_rs::rsa::KeyPair::generate(size)?;
    Ok(key.as_der()?.as_ref().to_vec())
}

/// The DER-encoded public half of a stored private key, as published in
/// the `{selector}._domainkey.{domain}` TXT record.
pub fn public_key_der(pkcs8_der: &[u8]) -> Result<Vec<u8>, DkimError> {
    let key = aws_lc_rs::rsa::KeyPair::from_pkcs8(pkcs8_der)?;
    Ok(key.public_key().as_der()?.as_ref().to_vec())
}

/// The TXT record value a domain owner must publish for this key.
pub fn dns_record_value(pkcs8_der: &[u8]) -> Result<String, DkimError> {
    Ok(format!(
        "v=DKIM1; k=rsa; p={}",
        Base64::encode_string(&public_key_der(pkcs8_der)?)
    ))
}

/// A ready-to-use signing identity for one sending domain.
pub struct SigningKey {
    domain: String,
    selector: String,
    key: RsaKey<Sha256>,
}

impl SigningKey {
    pub fn from_pkcs8_der(
        domain: impl Into<String>,
        selector: impl Into<String>,
        pkcs8_der: &[u8],
    ) -> Result<Self, DkimError> {
        Ok(Self {
            domain: domain.into(),
            selector: selector.into(),
            key: RsaKey::<Sha256>::from_pkcs8_der(pkcs8_der)?,
        })
    }

    /// Sign a wire-format message and return the `DKIM-Signature` header
    /// (terminated with CRLF) to prepend to it.
    pub fn sign_header(self, raw_message: &[u8]) -> Result<String, DkimError> {
        let Self {
            domain,
            selector,
            key,
        } = self;

        let signer = DkimSigner::from_key(key)
            .domain(domain)
            .selector(selector)
            .headers(SIGNED_HEADERS);

        Ok(signer.sign(raw_message)?.to_header())
    }
}

/// Encrypts DKIM private keys at rest with AES-256-GCM under the
/// platform master key. The stored form is base64(nonce || ciphertext).
pub struct KeyVault {
    key: LessSafeKey,
}

impl KeyVault {
    pub fn new(master_key: &[u8]) -> Result<Self, DkimError> {
        if master_key.len() != 32 {
            return Err(DkimError::BadMasterKey(master_key.len()));
        }

        Ok(Self {
            key: LessSafeKey::new(UnboundKey::new(&AES_256_GCM, master_key)?),
        })
    }

    pub fn from_hex(master_key_hex: &str) -> Result<Self, DkimError> {
        let bytes = hex::decode(master_key_hex).map_err(|_| DkimError::Decode)?;
        Self::new(&bytes)
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<String, DkimError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);

        let mut in_out = plaintext.to_vec();
        self.key.seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce),
            Aad::empty(),
            &mut in_out,
        )?;

        let mut record = nonce.to_vec();
        record.extend_from_slice(&in_out);
        Ok(Base64::encode_string(&record))
    }

    pub fn open(&self, sealed: &str) -> Result<Vec<u8>, DkimError> {
        let record = Base64::decode_vec(sealed).map_err(|_| DkimError::Decode)?;
        if record.len() < NONCE_LEN {
            return Err(DkimError::Decode);
        }

        let (nonce, ciphertext) = record.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce)?;

        let mut in_out = ciphertext.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)?
            .to_vec();

        Ok(plaintext)
    }
}
