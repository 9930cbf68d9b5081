// Path: crates/net/src/envelope.rs
//! The high-level message (hlmsg): framing, validation and encoding.
//!
//! Layout, in order: a two-byte public-key hint, the signature, one flags
//! byte (the two low bits are the message class), a little-endian instant,
//! a little-endian advisory serial number, then length-prefixed segments
//! terminated by a zero byte. For committed-redistributable envelopes,
//! unpredictable garbage bytes MAY follow the first terminator up to the
//! MTU, defeating pre-image prediction of future commits.
//!
//! In memory every hlmsg carries one extra trailing zero byte that is not
//! sent over the wire; it acts as an oversight guard when walking
//! segments.

use std::cell::Cell;
use std::rc::Rc;
use synod_crypto::hash::KeyedSponge;
use synod_crypto::random::secure_random;
use synod_crypto::Signator;
use synod_types::codec;
use synod_types::error::EnvelopeError;
use synod_types::wire::{Message, MessageClass, SIGNATURE_SIZE};
use synod_types::Instant;

/// Offset of the public-key hint.
pub const PUBKEY_HINT_OFF: usize = 0;
/// Offset of the signature.
pub const SIGNATURE_OFF: usize = 2;
/// Offset of the flags byte.
pub const FLAGS_OFF: usize = SIGNATURE_OFF + SIGNATURE_SIZE;
/// Offset of the little-endian instant.
pub const INSTANT_OFF: usize = FLAGS_OFF + 1;
/// Offset of the little-endian advisory serial number.
pub const SERNO_OFF: usize = INSTANT_OFF + 4;
/// Offset of the first segment.
pub const SEGMENT_OFF: usize = SERNO_OFF + 4;

/// The minimum MTU an encoder can operate with: the header plus one
/// maximum-size segment.
pub const MTU_MIN: usize = SEGMENT_OFF + 1 + 255;

/// The largest join-accept envelope that can later be relayed inside a
/// single join-tree segment.
pub const JOINACCEPT_MAX: usize = 240;

/// A shared advisory serial-number cell. Encoders post-increment it on
/// every finished envelope; sharing one cell across encoders keeps a
/// node's serial numbers globally ordered.
pub type SerialCell = Rc<Cell<u32>>;

/// A borrowed view of one hlmsg, *including* the in-memory trailing zero.
#[derive(Clone, Copy)]
pub struct Hlmsg<'a> {
    data: &'a [u8],
}

impl<'a> Hlmsg<'a> {
    /// Wraps a buffer that already carries the in-memory trailing zero.
    pub fn new(data_with_guard: &'a [u8]) -> Self {
        Self {
            data: data_with_guard,
        }
    }

    /// The bytes as sent on the wire (without the guard byte).
    pub fn wire_bytes(&self) -> &'a [u8] {
        &self.data[..self.data.len() - 1]
    }

    /// Structural validation. MUST pass before any other accessor is
    /// trusted. Checks the header, the flags, the segment chain and that
    /// every segment decodes to a message of this envelope's class that
    /// satisfies its own constraints. Does not check the signature.
    pub fn is_valid(&self) -> bool {
        let data = self.data;
        // Base header plus one non-empty segment plus the guard byte.
        if data.len() < SEGMENT_OFF + 3 {
            return false;
        }
        let Some(class) = MessageClass::from_flags(data[FLAGS_OFF]) else {
            return false;
        };
        if data[FLAGS_OFF] > 2 {
            return false;
        }
        if data[SEGMENT_OFF] == 0 {
            return false;
        }

        // The segment chain must reach an explicit zero terminator inside
        // the buffer (the guard byte makes the walk safe).
        let mut offset = SEGMENT_OFF;
        while offset < data.len() && data[offset] != 0 {
            offset += data[offset] as usize + 1;
        }
        if offset >= data.len() {
            return false;
        }

        // Each embedded message must decode, belong to this class and
        // pass its own constraints.
        let mut offset = SEGMENT_OFF;
        while offset < data.len() && data[offset] != 0 {
            let len = data[offset] as usize;
            let Ok(message) = codec::from_bytes_canonical::<Message>(&data[offset + 1..offset + 1 + len])
            else {
                return false;
            };
            if message.class() != class || !message.check_constraints() {
                return false;
            }
            offset += len + 1;
        }
        true
    }

    /// The public-key hint.
    pub fn pubkey_hint(&self) -> u16 {
        u16::from_le_bytes([self.data[0], self.data[1]])
    }

    /// The signature bytes.
    pub fn signature(&self) -> [u8; SIGNATURE_SIZE] {
        let mut sig = [0u8; SIGNATURE_SIZE];
        sig.copy_from_slice(&self.data[SIGNATURE_OFF..SIGNATURE_OFF + SIGNATURE_SIZE]);
        sig
    }

    /// The message class. Only meaningful on a validated hlmsg.
    pub fn class(&self) -> MessageClass {
        MessageClass::from_flags(self.data[FLAGS_OFF]).unwrap_or(MessageClass::Rpc)
    }

    /// The envelope instant.
    pub fn instant(&self) -> Instant {
        u32::from_le_bytes([
            self.data[INSTANT_OFF],
            self.data[INSTANT_OFF + 1],
            self.data[INSTANT_OFF + 2],
            self.data[INSTANT_OFF + 3],
        ])
    }

    /// The advisory serial number.
    pub fn serial(&self) -> u32 {
        u32::from_le_bytes([
            self.data[SERNO_OFF],
            self.data[SERNO_OFF + 1],
            self.data[SERNO_OFF + 2],
            self.data[SERNO_OFF + 3],
        ])
    }

    /// The byte range covered by the signature: flags through the final
    /// wire byte.
    pub fn signable(&self) -> &'a [u8] {
        &self.data[FLAGS_OFF..self.data.len() - 1]
    }

    /// Iterates the raw segment payloads.
    pub fn segments(&self) -> SegmentIter<'a> {
        SegmentIter {
            data: self.data,
            offset: SEGMENT_OFF,
        }
    }

    /// Decodes every segment. Only meaningful on a validated hlmsg;
    /// undecodable segments are skipped.
    pub fn messages(&self) -> impl Iterator<Item = Message> + 'a {
        self.segments()
            .filter_map(|seg| codec::from_bytes_canonical::<Message>(seg).ok())
    }
}

/// Iterator over the raw payload of each segment.
pub struct SegmentIter<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for SegmentIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.offset >= self.data.len() || self.data[self.offset] == 0 {
            return None;
        }
        let len = self.data[self.offset] as usize;
        let start = self.offset + 1;
        let end = (start + len).min(self.data.len());
        self.offset = end;
        Some(&self.data[start..end])
    }
}

/// An owned hlmsg, guard byte included.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct HlmsgBuf {
    bytes: Vec<u8>,
}

impl HlmsgBuf {
    /// Wraps wire bytes, appending the in-memory guard byte.
    pub fn from_wire(wire: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(wire.len() + 1);
        bytes.extend_from_slice(wire);
        bytes.push(0);
        Self { bytes }
    }

    /// A borrowed view.
    pub fn as_hlmsg(&self) -> Hlmsg<'_> {
        Hlmsg::new(&self.bytes)
    }

    /// The bytes as sent on the wire.
    pub fn wire_bytes(&self) -> &[u8] {
        &self.bytes[..self.bytes.len() - 1]
    }
}

/// Encodes and aggregates wire messages into signed hlmsgs.
///
/// Messages append into an accumulator; when the next message (plus the
/// garbage reservation) would overflow the MTU, the accumulator finishes
/// into a complete envelope and a fresh one begins.
pub struct HlmsgEncoder {
    class: MessageClass,
    signator: Option<Rc<Signator>>,
    mtu: usize,
    append_garbage: usize,
    garbage: Option<KeyedSponge>,
    now: Instant,
    serno: SerialCell,
    acc: Vec<u8>,
}

impl HlmsgEncoder {
    /// Builds an encoder.
    ///
    /// `append_garbage` is the total size of the garbage tail including
    /// its leading zero terminator; exactly 1 is rejected since it would
    /// claim garbage exists while leaving no room for any garbage byte.
    pub fn new(
        class: MessageClass,
        signator: Option<Rc<Signator>>,
        serno: Option<SerialCell>,
        mtu: usize,
        append_garbage: usize,
    ) -> Result<Self, EnvelopeError> {
        if append_garbage == 1 {
            return Err(EnvelopeError::BadGarbage);
        }
        if mtu < MTU_MIN + append_garbage {
            return Err(EnvelopeError::MtuTooSmall {
                mtu,
                min: MTU_MIN + append_garbage,
            });
        }

        let garbage_bytes = append_garbage.saturating_sub(1);
        let garbage = if garbage_bytes > 0 {
            let mut salt = vec![0u8; garbage_bytes];
            let mut state = vec![0u8; garbage_bytes];
            secure_random(&mut salt).map_err(|e| EnvelopeError::Crypto(e.to_string()))?;
            secure_random(&mut state).map_err(|e| EnvelopeError::Crypto(e.to_string()))?;
            Some(KeyedSponge::new(salt, state))
        } else {
            None
        };

        Ok(Self {
            class,
            signator,
            mtu,
            append_garbage,
            garbage,
            now: 0,
            serno: serno.unwrap_or_default(),
            acc: Vec::new(),
        })
    }

    /// The instant stamped on envelopes started from now on.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Sets the instant for envelopes started from now on. Must not be
    /// called with a partially accumulated envelope pending.
    pub fn set_now(&mut self, now: Instant) {
        debug_assert!(self.acc.is_empty());
        self.now = now;
    }

    /// Resets the advisory serial cell. The join protocol uses this to
    /// produce normalised encodings.
    pub fn reset_serial(&mut self, value: u32) {
        self.serno.set(value);
    }

    fn encode_segment(&self, message: &Message) -> Result<Vec<u8>, EnvelopeError> {
        if message.class() != self.class {
            return Err(EnvelopeError::BadSegment(
                "message class does not match encoder".to_string(),
            ));
        }
        let encoded = codec::to_bytes_canonical(message);
        if encoded.len() > 255 {
            return Err(EnvelopeError::SegmentOverflow(encoded.len()));
        }
        Ok(encoded)
    }

    fn init_msg(&mut self, buf: &mut Vec<u8>) {
        let hint = self
            .signator
            .as_ref()
            .map(|s| s.pubkey_hint())
            .unwrap_or(0);
        buf.extend_from_slice(&hint.to_le_bytes());
        buf.extend_from_slice(&[0u8; SIGNATURE_SIZE]);
        buf.push(self.class.flags());
        buf.extend_from_slice(&self.now.to_le_bytes());
        buf.extend_from_slice(&self.serno.get().to_le_bytes());
        self.serno.set(self.serno.get().wrapping_add(1));
    }

    fn finish_msg(&mut self, mut buf: Vec<u8>) -> Result<HlmsgBuf, EnvelopeError> {
        if let Some(sponge) = self.garbage.as_mut() {
            buf.push(0);
            buf.extend_from_slice(sponge.squeeze());
        }
        buf.push(0);

        if let Some(signator) = self.signator.as_ref() {
            let signature = signator
                .sign(&buf[FLAGS_OFF..buf.len() - 1])
                .map_err(|e| EnvelopeError::Crypto(e.to_string()))?;
            buf[SIGNATURE_OFF..SIGNATURE_OFF + SIGNATURE_SIZE].copy_from_slice(&signature);
        }
        Ok(HlmsgBuf { bytes: buf })
    }

    /// Appends a message, finishing and returning the previous envelope
    /// when this message no longer fits it.
    pub fn append(&mut self, message: &Message) -> Result<Option<HlmsgBuf>, EnvelopeError> {
        let encoded = self.encode_segment(message)?;

        let mut flushed = None;
        if !self.acc.is_empty()
            && self.acc.len() + 1 + encoded.len() + self.append_garbage > self.mtu
        {
            flushed = self.flush()?;
        }

        if self.acc.is_empty() {
            let mut acc = Vec::with_capacity(self.mtu + 1);
            self.init_msg(&mut acc);
            self.acc = acc;
        }
        self.acc.push(encoded.len() as u8);
        self.acc.extend_from_slice(&encoded);
        Ok(flushed)
    }

    /// Encodes a message as a complete single-segment envelope, leaving
    /// any partially accumulated envelope untouched.
    pub fn singleton(&mut self, message: &Message) -> Result<HlmsgBuf, EnvelopeError> {
        let encoded = self.encode_segment(message)?;
        let mut buf = Vec::with_capacity(self.mtu + 1);
        self.init_msg(&mut buf);
        buf.push(encoded.len() as u8);
        buf.extend_from_slice(&encoded);
        self.finish_msg(buf)
    }

    /// Finishes the pending accumulator, if any.
    pub fn flush(&mut self) -> Result<Option<HlmsgBuf>, EnvelopeError> {
        if self.acc.is_empty() {
            return Ok(None);
        }
        let buf = std::mem::take(&mut self.acc);
        self.finish_msg(buf).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use synod_crypto::Verifier;
    use synod_types::wire::{AppUniMsg, ChmodMsg, CommitMsg, PingMsg, HASH_SIZE};

    fn signator() -> Rc<Signator> {
        Rc::new(Signator::generate().unwrap())
    }

    #[test]
    fn singleton_round_trips_and_verifies() {
        // 1. SETUP
        let signator = signator();
        let mut verifier = Verifier::new();
        verifier.assoc(signator.public_key(), 9).unwrap();
        let mut enc =
            HlmsgEncoder::new(MessageClass::Rpc, Some(signator.clone()), None, 2048, 0).unwrap();
        enc.set_now(77);

        // 2. ACT
        let msg = Message::Ping(PingMsg { id: 0xDEAD_BEEF });
        let buf = enc.singleton(&msg).unwrap();
        let hlmsg = buf.as_hlmsg();

        // 3. ASSERT
        assert!(hlmsg.is_valid());
        assert_eq!(hlmsg.instant(), 77);
        assert_eq!(hlmsg.class(), MessageClass::Rpc);
        let decoded: Vec<Message> = hlmsg.messages().collect();
        assert_eq!(decoded, vec![msg]);
        assert_eq!(
            verifier.verify(hlmsg.pubkey_hint(), &hlmsg.signature(), hlmsg.signable()),
            9
        );
    }

    #[test]
    fn class_mismatch_is_rejected_at_encode_time() {
        let mut enc = HlmsgEncoder::new(MessageClass::Rpc, Some(signator()), None, 2048, 0).unwrap();
        let committed = Message::Chmod(ChmodMsg {
            node: 1,
            effective: 2,
            bit: synod_types::status::StatusBit::Grant,
        });
        assert!(enc.append(&committed).is_err());
    }

    #[test]
    fn wrong_class_segment_invalidates_the_envelope() {
        let mut enc = HlmsgEncoder::new(MessageClass::Rpc, Some(signator()), None, 2048, 0).unwrap();
        let buf = enc.singleton(&Message::Ping(PingMsg { id: 1 })).unwrap();
        let mut wire = buf.wire_bytes().to_vec();
        // Flip the class to committed; the ping segment no longer belongs.
        wire[FLAGS_OFF] = MessageClass::Committed.flags();
        let tampered = HlmsgBuf::from_wire(&wire);
        assert!(!tampered.as_hlmsg().is_valid());
    }

    #[test]
    fn garbage_of_one_is_forbidden() {
        let result = HlmsgEncoder::new(MessageClass::Committed, Some(signator()), None, 2048, 1);
        assert!(matches!(result, Err(EnvelopeError::BadGarbage)));
    }

    #[test]
    fn appended_messages_share_an_envelope_until_the_mtu() {
        let signator = signator();
        let mut verifier = Verifier::new();
        verifier.assoc(signator.public_key(), 4).unwrap();

        // Exactly the scenario pinned by the encoder contract: a minimum
        // MTU plus 8, garbage tail of 8, and a stream of 64-byte payloads.
        let mtu = MTU_MIN + 8;
        let mut enc =
            HlmsgEncoder::new(MessageClass::Committed, Some(signator.clone()), None, mtu, 8)
                .unwrap();
        enc.set_now(5);

        let payload = Message::AppEvent(synod_types::wire::AppEventMsg {
            serial: 1,
            data: vec![0x55; 64],
        });

        let mut finished: Vec<HlmsgBuf> = Vec::new();
        for _ in 0..12 {
            if let Some(done) = enc.append(&payload).unwrap() {
                finished.push(done);
            }
        }
        if let Some(done) = enc.flush().unwrap() {
            finished.push(done);
        }

        assert!(finished.len() > 1, "12 segments cannot fit one envelope");
        for buf in &finished {
            let hlmsg = buf.as_hlmsg();
            assert!(hlmsg.is_valid());
            assert!(buf.wire_bytes().len() <= mtu);
            // Wire tail: zero terminator followed by exactly 7 garbage
            // bytes.
            let wire = buf.wire_bytes();
            let tail = &wire[wire.len() - 8..];
            assert_eq!(tail[0], 0);
            assert_eq!(
                verifier.verify(hlmsg.pubkey_hint(), &hlmsg.signature(), hlmsg.signable()),
                4
            );
        }

        // Serial numbers increase monotonically across envelopes.
        let serials: Vec<u32> = finished.iter().map(|b| b.as_hlmsg().serial()).collect();
        let mut sorted = serials.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(serials.len(), sorted.len());
    }

    #[test]
    fn singleton_does_not_disturb_the_accumulator() {
        let mut enc =
            HlmsgEncoder::new(MessageClass::Rpc, Some(signator()), None, 2048, 0).unwrap();
        enc.append(&Message::Ping(PingMsg { id: 1 })).unwrap();
        let single = enc
            .singleton(&Message::AppUni(AppUniMsg { data: vec![1] }))
            .unwrap();
        assert!(single.as_hlmsg().is_valid());

        let flushed = enc.flush().unwrap().unwrap();
        let decoded: Vec<Message> = flushed.as_hlmsg().messages().collect();
        assert_eq!(decoded, vec![Message::Ping(PingMsg { id: 1 })]);
    }

    #[test]
    fn truncated_and_unterminated_envelopes_are_invalid() {
        let mut enc =
            HlmsgEncoder::new(MessageClass::Uncommitted, Some(signator()), None, 2048, 0).unwrap();
        let buf = enc
            .singleton(&Message::Commit(CommitMsg {
                start: 0,
                hash: [7; HASH_SIZE],
            }))
            .unwrap();

        assert!(!HlmsgBuf::from_wire(&buf.wire_bytes()[..SEGMENT_OFF])
            .as_hlmsg()
            .is_valid());

        // Claim a segment that runs past the end of the buffer.
        let mut wire = buf.wire_bytes().to_vec();
        wire[SEGMENT_OFF] = 0xFF;
        assert!(!HlmsgBuf::from_wire(&wire).as_hlmsg().is_valid());
    }
}
