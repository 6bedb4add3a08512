//! DVB-CISSA: AES-128 in CBC mode over the TS payload with a fixed IV.
//!
//! Only whole 16-byte blocks are processed; a trailing residue of fewer
//! than 16 bytes is transmitted in the clear.

use aes::Aes128;
use cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use super::DescrambleError;

type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes128CbcEnc = cbc::Encryptor<Aes128>;

/// Fixed initialisation vector.
pub const CISSA_IV: [u8; 16] = *b"DVBTMCPTAESCISSA";

/// CISSA key length.
pub const CISSA_KEY_LEN: usize = 16;

/// One CISSA control word.
#[derive(Clone)]
pub struct Cissa {
    key: [u8; CISSA_KEY_LEN],
}

impl std::fmt::Debug for Cissa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Cissa(..)")
    }
}

impl Cissa {
    pub fn new(key: &[u8]) -> Result<Self, DescrambleError> {
        let key: [u8; CISSA_KEY_LEN] = key
            .try_into()
            .map_err(|_| DescrambleError::KeyLength(key.len()))?;
        Ok(Self { key })
    }

    fn aligned(len: usize) -> usize {
        len / 16 * 16
    }

    /// Decrypt a packet payload in place.
    pub fn decrypt(&self, payload: &mut [u8]) -> Result<(), DescrambleError> {
        let n = Self::aligned(payload.len());
        if n == 0 {
            return Ok(());
        }
        Aes128CbcDec::new(&self.key.into(), &CISSA_IV.into())
            .decrypt_padded_mut::<NoPadding>(&mut payload[..n])
            .map_err(|_| DescrambleError::Cipher)?;
        Ok(())
    }

    /// Encrypt a packet payload in place.
    pub fn encrypt(&self, payload: &mut [u8]) -> Result<(), DescrambleError> {
        let n = Self::aligned(payload.len());
        if n == 0 {
            return Ok(());
        }
        Aes128CbcEnc::new(&self.key.into(), &CISSA_IV.into())
            .encrypt_padded_mut::<NoPadding>(&mut payload[..n], n)
            .map_err(|_| DescrambleError::Cipher)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 16] = [
        0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee,
        0xff,
    ];

    #[test]
    fn test_residue_stays_clear() {
        let cissa = Cissa::new(&KEY).unwrap();
        let clear: Vec<u8> = (0..184u32).map(|i| i as u8).collect();
        let mut data = clear.clone();
        cissa.encrypt(&mut data).unwrap();

        // 184 = 11 * 16 + 8
        assert_ne!(&data[..176], &clear[..176]);
        assert_eq!(&data[176..], &clear[176..]);

        cissa.decrypt(&mut data).unwrap();
        assert_eq!(data, clear);
    }

    #[test]
    fn test_short_payload_untouched() {
        let cissa = Cissa::new(&KEY).unwrap();
        let mut data = [0xABu8; 15];
        cissa.decrypt(&mut data).unwrap();
        assert_eq!(data, [0xABu8; 15]);
    }

    #[test]
    fn test_rejects_csa_sized_key() {
        assert!(matches!(
            Cissa::new(&[0u8; 8]),
            Err(DescrambleError::KeyLength(8))
        ));
    }
}
