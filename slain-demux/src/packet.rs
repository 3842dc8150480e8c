//! Elementary stream packets and the growable builder used while a
//! container reassembles a fragmented unit.

use bytes::{Bytes, BytesMut};

/// A complete elementary-stream packet.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Payload
    pub data: Bytes,
    /// Presentation timestamp in seconds
    pub pts: Option<f64>,
    /// Byte offset of the container chunk that carried it
    pub pos: u64,
    /// Sync point
    pub keyframe: bool,
    /// Container-level stream id
    pub stream: u32,
}

impl Packet {
    pub fn new(stream: u32, data: impl Into<Bytes>, pts: Option<f64>, pos: u64) -> Self {
        Self {
            data: data.into(),
            pts,
            pos,
            keyframe: false,
            stream,
        }
    }

    pub fn with_keyframe(mut self, keyframe: bool) -> Self {
        self.keyframe = keyframe;
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A packet still being assembled from fragments.
#[derive(Debug)]
pub struct PacketBuilder {
    stream: u32,
    seq: u32,
    data: BytesMut,
    pts: Option<f64>,
    pos: u64,
    keyframe: bool,
}

impl PacketBuilder {
    pub fn new(stream: u32, seq: u32, pts: Option<f64>, pos: u64, keyframe: bool) -> Self {
        Self {
            stream,
            seq,
            data: BytesMut::new(),
            pts,
            pos,
            keyframe,
        }
    }

    /// Preallocate when the total size is announced up front.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.data.reserve(capacity);
        self
    }

    pub fn stream(&self) -> u32 {
        self.stream
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn append(&mut self, fragment: &[u8]) {
        self.data.extend_from_slice(fragment);
    }

    /// Hand the assembled bytes over as an immutable packet.
    pub fn finish(self) -> Packet {
        Packet {
            data: self.data.freeze(),
            pts: self.pts,
            pos: self.pos,
            keyframe: self.keyframe,
            stream: self.stream,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_appends_fragments() {
        let mut builder = PacketBuilder::new(1, 5, Some(1.5), 4096, true).with_capacity(150);
        builder.append(&[1u8; 100]);
        builder.append(&[2u8; 50]);
        assert_eq!(builder.len(), 150);
        assert_eq!(builder.seq(), 5);

        let packet = builder.finish();
        assert_eq!(packet.len(), 150);
        assert_eq!(packet.data[99], 1);
        assert_eq!(packet.data[100], 2);
        assert_eq!(packet.pts, Some(1.5));
        assert_eq!(packet.pos, 4096);
        assert!(packet.keyframe);
    }
}
