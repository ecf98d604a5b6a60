//! Length-prefixed records on top of the raw byte channel.
//!
//! Each record is written with a single `send`, so a record is either fully
//! visible to the consumer or not at all:
//!
//! ```text
//! +----------------+-----+-----+-----------+-----------------+
//! | payload_len LE | tag | ver | flags LE  | payload bytes   |
//! +----------------+-----+-----+-----------+-----------------+
//!   u32              u8    u8    u16
//! ```
//!
//! Payloads are usually rkyv archives; [`archive`] and [`Frame::decode`] wrap
//! the validated round trip.

use rkyv::{
    api::high::{HighSerializer, HighValidator},
    bytecheck::CheckBytes,
    de::Pool,
    rancor::{Error, Strategy},
    ser::allocator::ArenaHandle,
    util::AlignedVec,
    Archive, Deserialize, Serialize,
};
use tracing::{trace, warn};

use crate::{ChannelError, ChannelResult, Receiver, Sender};

/// Bytes preceding every payload.
pub const FRAME_HEADER_LEN: usize = 8;

/// Names the payload carried by a record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Envelope {
    /// Application-defined discriminant used to select the payload schema.
    pub tag: u8,
    /// Schema version of the payload.
    pub ver: u8,
    /// Bitflags that travel with the payload.
    pub flags: u16,
}

impl Envelope {
    /// Constructs an envelope with the given tag and schema version.
    pub const fn new(tag: u8, ver: u8) -> Self {
        Self { tag, ver, flags: 0 }
    }

    /// Returns a copy carrying `flags`.
    pub const fn with_flags(self, flags: u16) -> Self {
        Self { flags, ..self }
    }
}

/// One record read back from the channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub envelope: Envelope,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Validates the payload as an archived `T` and deserializes it.
    pub fn decode<T>(&self) -> ChannelResult<T>
    where
        T: Archive,
        T::Archived: for<'a> CheckBytes<HighValidator<'a, Error>>
            + Deserialize<T, Strategy<Pool, Error>>,
    {
        let mut aligned = AlignedVec::<16>::with_capacity(self.payload.len());
        aligned.extend_from_slice(&self.payload);
        rkyv::from_bytes::<T, Error>(&aligned)
            .map_err(|err| ChannelError::codec(format!("validation failure: {err}")))
    }

    /// Payload as UTF-8 text.
    pub fn text(&self) -> ChannelResult<&str> {
        std::str::from_utf8(&self.payload)
            .map_err(|err| ChannelError::codec(format!("payload is not utf-8: {err}")))
    }
}

/// Archives `value` into an aligned buffer ready for [`FrameSender::send`].
pub fn archive<T>(value: &T) -> ChannelResult<AlignedVec>
where
    T: for<'a> Serialize<HighSerializer<AlignedVec, ArenaHandle<'a>, Error>>,
{
    rkyv::to_bytes::<Error>(value)
        .map_err(|err| ChannelError::codec(format!("serialization failure: {err}")))
}

fn encode_into(out: &mut Vec<u8>, envelope: Envelope, payload: &[u8]) {
    out.clear();
    out.reserve(FRAME_HEADER_LEN + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.push(envelope.tag);
    out.push(envelope.ver);
    out.extend_from_slice(&envelope.flags.to_le_bytes());
    out.extend_from_slice(payload);
}

/// Producer that writes one record per `send`.
pub struct FrameSender {
    inner: Sender,
    scratch: Vec<u8>,
}

impl FrameSender {
    pub fn new(inner: Sender) -> Self {
        Self {
            inner,
            scratch: Vec::new(),
        }
    }

    /// Writes one record without blocking.
    ///
    /// Fails with `ChannelFull` when the record does not fit right now; nothing
    /// is written in that case.
    pub fn send(&mut self, envelope: Envelope, payload: &[u8]) -> ChannelResult<()> {
        let record_len = FRAME_HEADER_LEN + payload.len();
        if record_len > self.inner.capacity() {
            return Err(ChannelError::ChannelFull {
                requested: record_len,
                available: self.inner.free_space(),
                generation: self.inner.active_generation(),
            });
        }
        encode_into(&mut self.scratch, envelope, payload);
        self.inner.send(&self.scratch)?;
        trace!(tag = envelope.tag, len = payload.len(), "sent frame");
        Ok(())
    }

    /// Writes one record, parking until the consumer frees enough space.
    pub fn send_blocking(&mut self, envelope: Envelope, payload: &[u8]) -> ChannelResult<()> {
        loop {
            match self.send(envelope, payload) {
                Err(err) if err.is_full() => {
                    self.inner.wait_for_space(FRAME_HEADER_LEN + payload.len())?;
                }
                other => return other,
            }
        }
    }

    /// Archives `value` and writes it as one record, parking while the channel is full.
    pub fn send_archived<T>(&mut self, envelope: Envelope, value: &T) -> ChannelResult<()>
    where
        T: for<'a> Serialize<HighSerializer<AlignedVec, ArenaHandle<'a>, Error>>,
    {
        let bytes = archive(value)?;
        self.send_blocking(envelope, &bytes)
    }

    pub fn sender(&self) -> &Sender {
        &self.inner
    }

    pub fn into_inner(self) -> Sender {
        self.inner
    }
}

/// Consumer that splits received spans back into records.
pub struct FrameReceiver {
    inner: Receiver,
    pending: Vec<u8>,
}

impl FrameReceiver {
    pub fn new(inner: Receiver) -> Self {
        Self {
            inner,
            pending: Vec::new(),
        }
    }

    /// Returns the next record if one is visible.
    pub fn try_recv(&mut self) -> ChannelResult<Option<Frame>> {
        if let Some(frame) = self.next_pending()? {
            return Ok(Some(frame));
        }
        if let Some(bytes) = self.inner.try_recv()? {
            self.pending.extend_from_slice(&bytes);
        }
        self.next_pending()
    }

    /// Parks until the next record arrives.
    pub fn recv(&mut self) -> ChannelResult<Frame> {
        loop {
            if let Some(frame) = self.next_pending()? {
                return Ok(frame);
            }
            let bytes = self.inner.recv()?;
            self.pending.extend_from_slice(&bytes);
        }
    }

    /// Records already copied out of the channel but not returned yet.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn receiver(&self) -> &Receiver {
        &self.inner
    }

    pub fn into_inner(self) -> Receiver {
        self.inner
    }

    fn next_pending(&mut self) -> ChannelResult<Option<Frame>> {
        if self.pending.is_empty() {
            return Ok(None);
        }
        if self.pending.len() < FRAME_HEADER_LEN {
            return Err(self.malformed(format!(
                "{} bytes cannot hold a record header",
                self.pending.len()
            )));
        }

        let header = &self.pending[..FRAME_HEADER_LEN];
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let envelope = Envelope {
            tag: header[4],
            ver: header[5],
            flags: u16::from_le_bytes([header[6], header[7]]),
        };

        let total = FRAME_HEADER_LEN + len;
        if total > self.inner.capacity() {
            return Err(self.malformed(format!(
                "record of {total} bytes exceeds channel capacity {}",
                self.inner.capacity()
            )));
        }
        if self.pending.len() < total {
            return Err(self.malformed(format!(
                "record of {total} bytes truncated to {}",
                self.pending.len()
            )));
        }

        let payload = self.pending[FRAME_HEADER_LEN..total].to_vec();
        self.pending.drain(..total);
        Ok(Some(Frame { envelope, payload }))
    }

    fn malformed(&mut self, reason: String) -> ChannelError {
        warn!(%reason, "dropping undecodable bytes");
        self.pending.clear();
        ChannelError::MalformedFrame(reason)
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::SharedChannel;

    #[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, PartialEq, Eq)]
    struct Ping {
        seq: u32,
        label: String,
    }

    fn framed(capacity: usize) -> (SharedChannel, FrameSender, FrameReceiver) {
        let channel = SharedChannel::new(capacity).expect("channel");
        let (tx, rx) = channel.split().expect("split");
        (channel, FrameSender::new(tx), FrameReceiver::new(rx))
    }

    #[test]
    fn records_keep_their_boundaries() {
        let (_channel, mut tx, mut rx) = framed(256);
        tx.send(Envelope::new(1, 1), b"first").expect("first");
        tx.send(Envelope::new(2, 1).with_flags(0x8001), b"").expect("empty");
        tx.send(Envelope::new(3, 2), b"third").expect("third");

        let first = rx.try_recv().expect("recv").expect("first frame");
        assert_eq!(first.envelope, Envelope::new(1, 1));
        assert_eq!(first.text().expect("utf-8"), "first");
        assert!(rx.has_pending());

        let empty = rx.try_recv().expect("recv").expect("empty frame");
        assert_eq!(empty.envelope.flags, 0x8001);
        assert!(empty.payload.is_empty());

        let third = rx.recv().expect("third frame");
        assert_eq!(third.envelope.ver, 2);
        assert_eq!(third.payload, b"third");
        assert_eq!(rx.try_recv().expect("drained"), None);
    }

    #[test]
    fn header_is_little_endian() {
        let mut out = Vec::new();
        encode_into(&mut out, Envelope::new(0x13, 1).with_flags(0x0102), &[0xAA, 0xBB]);
        assert_eq!(out, vec![2, 0, 0, 0, 0x13, 1, 0x02, 0x01, 0xAA, 0xBB]);
    }

    #[test]
    fn archived_values_round_trip() {
        let (_channel, mut tx, mut rx) = framed(512);
        let ping = Ping {
            seq: 7,
            label: "hello".to_owned(),
        };
        tx.send_archived(Envelope::new(9, 1), &ping).expect("send");
        let frame = rx.recv().expect("recv");
        assert_eq!(frame.envelope.tag, 9);
        assert_eq!(frame.decode::<Ping>().expect("decode"), ping);
    }

    #[test]
    fn garbage_payload_fails_validation() {
        let frame = Frame {
            envelope: Envelope::new(9, 1),
            payload: vec![0xFF; 3],
        };
        assert!(matches!(
            frame.decode::<Ping>(),
            Err(ChannelError::Codec(_))
        ));
    }

    #[test]
    fn oversized_record_is_rejected_before_writing() {
        let (channel, mut tx, _rx) = framed(16);
        let err = tx.send(Envelope::new(1, 1), &[0u8; 9]).unwrap_err();
        assert!(err.is_full());
        assert_eq!(channel.snapshot().gen_a_end, 0);
    }

    #[test]
    fn bogus_length_prefix_is_malformed() {
        let channel = SharedChannel::new(32).expect("channel");
        let (mut raw_tx, rx) = channel.split().expect("split");
        let mut rx = FrameReceiver::new(rx);

        raw_tx
            .send(&[0xFF, 0xFF, 0, 0, 1, 1, 0, 0])
            .expect("raw send");
        assert!(matches!(rx.try_recv(), Err(ChannelError::MalformedFrame(_))));
        assert!(!rx.has_pending());

        raw_tx.send(&[1, 2, 3]).expect("short send");
        assert!(matches!(rx.try_recv(), Err(ChannelError::MalformedFrame(_))));
    }
}
