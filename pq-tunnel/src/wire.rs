//! Data-plane framing and per-direction AEAD state.
//!
//! ```text
//! ┌─────────┬──────┬────────────┬─────────┬──────────┬─────────────────┐
//! │ version │ type │ session_id │  epoch  │ sequence │ ciphertext‖tag  │
//! │   1 B   │ 1 B  │    4 B     │ 4 B BE  │  8 B BE  │    variable     │
//! └─────────┴──────┴────────────┴─────────┴──────────┴─────────────────┘
//! ```
//!
//! The 18-byte header is the AEAD associated data. The nonce is never sent:
//! both sides rebuild it as `epoch(4) ‖ sequence(8)`.

use crypto::aead::{AeadCipher, NONCE_LEN};
use crypto::{AeadAlgorithm, CryptoError};

use crate::error::{DropReason, TunnelError};
use crate::replay::ReplayWindow;
use crate::types::{SessionId, WIRE_VERSION};

pub const HEADER_LEN: usize = 18;
pub const TAG_LEN: usize = crypto::aead::TAG_LEN;

/// Per-packet overhead added by framing
pub const FRAME_OVERHEAD: usize = HEADER_LEN + TAG_LEN;

/// Highest sequence number a sender may use; reaching it requires a rekey
pub const MAX_SEQUENCE: u64 = u64::MAX - 1;

/// Frame kinds carried on the encrypted socket
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Application (MAVLink) payload
    Data = 0x01,
    /// In-band rekey control message
    Control = 0x02,
}

impl TryFrom<u8> for FrameType {
    type Error = DropReason;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameType::Data),
            0x02 => Ok(FrameType::Control),
            _ => Err(DropReason::HeaderMalformed),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_type: FrameType,
    pub session_id: SessionId,
    pub epoch: u32,
    pub sequence: u64,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = WIRE_VERSION;
        out[1] = self.frame_type as u8;
        out[2..6].copy_from_slice(&self.session_id);
        out[6..10].copy_from_slice(&self.epoch.to_be_bytes());
        out[10..18].copy_from_slice(&self.sequence.to_be_bytes());
        out
    }

    /// Parse the header at the front of `frame`. The frame must also have room for a tag.
    pub fn decode(frame: &[u8]) -> Result<Self, DropReason> {
        if frame.len() < FRAME_OVERHEAD {
            return Err(DropReason::HeaderMalformed);
        }
        if frame[0] != WIRE_VERSION {
            return Err(DropReason::HeaderMalformed);
        }
        let frame_type = FrameType::try_from(frame[1])?;

        let mut session_id = [0u8; 4];
        session_id.copy_from_slice(&frame[2..6]);
        let mut epoch = [0u8; 4];
        epoch.copy_from_slice(&frame[6..10]);
        let mut sequence = [0u8; 8];
        sequence.copy_from_slice(&frame[10..18]);

        Ok(Self {
            frame_type,
            session_id,
            epoch: u32::from_be_bytes(epoch),
            sequence: u64::from_be_bytes(sequence),
        })
    }

    pub fn nonce(&self) -> [u8; NONCE_LEN] {
        nonce(self.epoch, self.sequence)
    }
}

/// `epoch(4 BE) ‖ sequence(8 BE)`
pub fn nonce(epoch: u32, sequence: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..4].copy_from_slice(&epoch.to_be_bytes());
    nonce[4..].copy_from_slice(&sequence.to_be_bytes());
    nonce
}

/// Outbound half of a session. Only the event loop owns one.
#[derive(Debug)]
pub struct Sender {
    cipher: AeadCipher,
    session_id: SessionId,
    epoch: u32,
    next_sequence: u64,
    rekey_threshold: u64,
}

impl Sender {
    pub fn new(
        algorithm: AeadAlgorithm,
        key: &[u8],
        session_id: SessionId,
        epoch: u32,
        rekey_threshold: u64,
    ) -> Result<Self, CryptoError> {
        Ok(Self {
            cipher: AeadCipher::new(algorithm, key)?,
            session_id,
            epoch,
            next_sequence: 0,
            rekey_threshold,
        })
    }

    /// Resume numbering at `sequence`
    pub fn starting_at(mut self, sequence: u64) -> Self {
        self.next_sequence = sequence;
        self
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// True once the sequence counter has crossed the rekey threshold
    pub fn needs_rekey(&self) -> bool {
        self.next_sequence >= self.rekey_threshold
    }

    /// Seal `plaintext` into a complete frame. The sequence advances only on success.
    pub fn encrypt(&mut self, frame_type: FrameType, plaintext: &[u8]) -> Result<Vec<u8>, TunnelError> {
        if self.next_sequence > MAX_SEQUENCE {
            return Err(TunnelError::SequenceExhausted { epoch: self.epoch });
        }
        let header = FrameHeader {
            frame_type,
            session_id: self.session_id,
            epoch: self.epoch,
            sequence: self.next_sequence,
        };
        let aad = header.encode();
        let sealed = self.cipher.seal(&header.nonce(), &aad, plaintext)?;

        let mut frame = Vec::with_capacity(HEADER_LEN + sealed.len());
        frame.extend_from_slice(&aad);
        frame.extend_from_slice(&sealed);
        self.next_sequence += 1;
        Ok(frame)
    }
}

/// An authenticated, replay-checked frame body
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decrypted {
    pub frame_type: FrameType,
    pub epoch: u32,
    pub sequence: u64,
    pub payload: Vec<u8>,
}

/// Inbound half of a session, with its replay window
#[derive(Debug)]
pub struct Receiver {
    cipher: AeadCipher,
    session_id: SessionId,
    epoch: u32,
    window: ReplayWindow,
}

impl Receiver {
    pub fn new(
        algorithm: AeadAlgorithm,
        key: &[u8],
        session_id: SessionId,
        epoch: u32,
        window_size: u64,
    ) -> Result<Self, CryptoError> {
        Ok(Self {
            cipher: AeadCipher::new(algorithm, key)?,
            session_id,
            epoch,
            window: ReplayWindow::new(window_size),
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn window(&self) -> &ReplayWindow {
        &self.window
    }

    /// Parse and open a complete frame
    pub fn decrypt(&mut self, frame: &[u8]) -> Result<Decrypted, DropReason> {
        let header = FrameHeader::decode(frame)?;
        self.open(&header, frame)
    }

    /// Open a frame whose header has already been parsed.
    ///
    /// The replay window is consulted before the AEAD and marked only after
    /// the tag verifies, so a forgery cannot burn a sequence number.
    pub fn open(&mut self, header: &FrameHeader, frame: &[u8]) -> Result<Decrypted, DropReason> {
        if header.session_id != self.session_id || header.epoch != self.epoch {
            return Err(DropReason::EpochMismatch);
        }
        self.window.check(header.sequence)?;

        let aad = &frame[..HEADER_LEN];
        let payload = self
            .cipher
            .open(&header.nonce(), aad, &frame[HEADER_LEN..])
            .map_err(|_| DropReason::AuthFailure)?;

        self.window.mark(header.sequence);
        Ok(Decrypted {
            frame_type: header.frame_type,
            epoch: header.epoch,
            sequence: header.sequence,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SID: SessionId = [0xaa, 0xbb, 0xcc, 0xdd];

    fn pair(window: u64) -> (Sender, Receiver) {
        let key = [0x42u8; 32];
        (
            Sender::new(AeadAlgorithm::Aes256Gcm, &key, SID, 0, u64::MAX).unwrap(),
            Receiver::new(AeadAlgorithm::Aes256Gcm, &key, SID, 0, window).unwrap(),
        )
    }

    #[test]
    fn test_nonce_layout() {
        assert_eq!(nonce(0, 0), [0u8; 12]);
        assert_eq!(nonce(1, 1), [0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(
            nonce(0x01020304, 0x0506070809101112),
            [1, 2, 3, 4, 5, 6, 7, 8, 9, 0x10, 0x11, 0x12]
        );
    }

    #[test]
    fn test_header_encoding() {
        let header = FrameHeader {
            frame_type: FrameType::Control,
            session_id: SID,
            epoch: 7,
            sequence: 0x0102,
        };
        let bytes = header.encode();
        assert_eq!(bytes[0], WIRE_VERSION);
        assert_eq!(bytes[1], 0x02);
        assert_eq!(&bytes[2..6], &SID);
        assert_eq!(&bytes[6..10], &[0, 0, 0, 7]);
        assert_eq!(&bytes[16..18], &[0x01, 0x02]);

        let mut frame = bytes.to_vec();
        frame.extend_from_slice(&[0u8; TAG_LEN]);
        assert_eq!(FrameHeader::decode(&frame).unwrap(), header);
    }

    #[test]
    fn test_malformed_headers() {
        let (mut sender, _) = pair(64);
        let frame = sender.encrypt(FrameType::Data, b"x").unwrap();

        assert_eq!(FrameHeader::decode(&frame[..10]), Err(DropReason::HeaderMalformed));

        let mut bad_version = frame.clone();
        bad_version[0] = 9;
        assert_eq!(FrameHeader::decode(&bad_version), Err(DropReason::HeaderMalformed));

        let mut bad_type = frame.clone();
        bad_type[1] = 0x7f;
        assert_eq!(FrameHeader::decode(&bad_type), Err(DropReason::HeaderMalformed));
    }

    #[test]
    fn test_encrypt_decrypt() {
        let (mut sender, mut receiver) = pair(64);
        let frame = sender.encrypt(FrameType::Data, b"HEARTBEAT").unwrap();
        assert_eq!(frame.len(), FRAME_OVERHEAD + 9);

        let decrypted = receiver.decrypt(&frame).unwrap();
        assert_eq!(decrypted.payload, b"HEARTBEAT");
        assert_eq!(decrypted.sequence, 0);
        assert_eq!(decrypted.frame_type, FrameType::Data);
        assert_eq!(sender.next_sequence(), 1);
    }

    #[test]
    fn test_replayed_frame_dropped() {
        let (mut sender, mut receiver) = pair(64);
        let mut frames: Vec<Vec<u8>> = (0..8)
            .map(|_| sender.encrypt(FrameType::Data, b"p").unwrap())
            .collect();

        let fifth = frames.swap_remove(5);
        assert!(receiver.decrypt(&fifth).is_ok());
        assert_eq!(receiver.decrypt(&fifth), Err(DropReason::ReplayDetected));
    }

    #[test]
    fn test_forgery_does_not_consume_sequence() {
        let (mut sender, mut receiver) = pair(64);
        let frame = sender.encrypt(FrameType::Data, b"genuine").unwrap();

        let mut forged = frame.clone();
        let last = forged.len() - 1;
        forged[last] ^= 0x01;
        assert_eq!(receiver.decrypt(&forged), Err(DropReason::AuthFailure));

        // The genuine frame with the same sequence still gets through
        assert_eq!(receiver.decrypt(&frame).unwrap().payload, b"genuine");
    }

    #[test]
    fn test_header_tampering_fails_auth() {
        let (mut sender, mut receiver) = pair(64);
        let mut frame = sender.encrypt(FrameType::Data, b"payload").unwrap();
        // Flip type from data to control; still a valid type, but AAD changes
        frame[1] = FrameType::Control as u8;
        assert_eq!(receiver.decrypt(&frame), Err(DropReason::AuthFailure));
    }

    #[test]
    fn test_epoch_and_session_mismatch() {
        let key = [0x42u8; 32];
        let mut sender = Sender::new(AeadAlgorithm::ChaCha20Poly1305, &key, SID, 1, u64::MAX).unwrap();
        let mut receiver = Receiver::new(AeadAlgorithm::ChaCha20Poly1305, &key, SID, 0, 64).unwrap();
        let frame = sender.encrypt(FrameType::Data, b"p").unwrap();
        assert_eq!(receiver.decrypt(&frame), Err(DropReason::EpochMismatch));

        let mut other_session = Receiver::new(AeadAlgorithm::ChaCha20Poly1305, &key, [0; 4], 1, 64).unwrap();
        assert_eq!(other_session.decrypt(&frame), Err(DropReason::EpochMismatch));
    }

    #[test]
    fn test_rekey_threshold_and_exhaustion() {
        let key = [1u8; 32];
        let mut sender = Sender::new(AeadAlgorithm::Aes256Gcm, &key, SID, 3, 10)
            .unwrap()
            .starting_at(9);
        assert!(!sender.needs_rekey());
        sender.encrypt(FrameType::Data, b"a").unwrap();
        assert!(sender.needs_rekey());

        let mut sender = Sender::new(AeadAlgorithm::Aes256Gcm, &key, SID, 3, 10)
            .unwrap()
            .starting_at(MAX_SEQUENCE);
        assert!(sender.encrypt(FrameType::Data, b"last").is_ok());
        assert!(matches!(
            sender.encrypt(FrameType::Data, b"one too many"),
            Err(TunnelError::SequenceExhausted { epoch: 3 })
        ));
        assert_eq!(sender.next_sequence(), u64::MAX);
    }
}
