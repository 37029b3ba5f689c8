// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::service::{AppError, AppResult, ErrorKind};

/// Width of the length prefix in front of every payload.
pub const LEN_SIZE: usize = 4;

/// Length-prefixed framing: `[u32 big-endian length][payload]`.
///
/// The codec accepts any length the prefix can express. Readers that need a
/// bound look at [`FrameCodec::declared_len`] before more bytes are buffered.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn encode(payload: &[u8]) -> AppResult<Bytes> {
        let length = u32::try_from(payload.len())
            .map_err(|_| AppError::new(ErrorKind::FrameTooLarge))?;
        let mut frame = BytesMut::with_capacity(LEN_SIZE + payload.len());
        frame.put_u32(length);
        frame.put_slice(payload);
        Ok(frame.freeze())
    }

    /// Payload length announced by the prefix at the head of `buffer`, if the
    /// whole prefix has arrived.
    pub fn declared_len(buffer: &[u8]) -> Option<usize> {
        let prefix: [u8; LEN_SIZE] = buffer.get(..LEN_SIZE)?.try_into().ok()?;
        Some(u32::from_be_bytes(prefix) as usize)
    }

    /// Returns the payload size of the frame at the head of `buffer` once all of
    /// it has arrived.
    pub fn check(buffer: &mut BytesMut) -> Option<usize> {
        let body_size = Self::declared_len(buffer)?;
        if buffer.remaining() < body_size + LEN_SIZE {
            buffer.reserve(body_size + LEN_SIZE - buffer.remaining());
            return None;
        }
        Some(body_size)
    }

    /// Splits one complete frame off the front of `buffer`.
    pub fn parse(buffer: &mut BytesMut) -> Option<Bytes> {
        let body_size = Self::check(buffer)?;
        buffer.advance(LEN_SIZE);
        Some(buffer.split_to(body_size).freeze())
    }

    /// Appends `chunk` to `buffer` and yields every frame that is now complete.
    /// Whatever is left stays in `buffer` for the next chunk.
    pub fn feed<'a>(buffer: &'a mut BytesMut, chunk: &[u8]) -> Frames<'a> {
        buffer.extend_from_slice(chunk);
        Self::frames(buffer)
    }

    pub fn frames(buffer: &mut BytesMut) -> Frames<'_> {
        Frames { buffer }
    }
}

/// Complete frames drained lazily from an assembly buffer, in arrival order.
pub struct Frames<'a> {
    buffer: &'a mut BytesMut,
}

impl Iterator for Frames<'_> {
    type Item = Bytes;

    fn next(&mut self) -> Option<Self::Item> {
        FrameCodec::parse(self.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_prefixes_big_endian_length() {
        let frame = FrameCodec::encode(b"Hello, server.").unwrap();
        assert_eq!(&frame[..LEN_SIZE], &[0, 0, 0, 14]);
        assert_eq!(&frame[LEN_SIZE..], b"Hello, server.");
    }

    #[test]
    fn frame_split_across_chunks() {
        let frame = FrameCodec::encode(b"Hello, client #0.").unwrap();
        let mut buffer = BytesMut::new();

        for chunk in frame[..frame.len() - 1].chunks(3) {
            assert_eq!(FrameCodec::feed(&mut buffer, chunk).count(), 0);
        }
        let frames: Vec<_> = FrameCodec::feed(&mut buffer, &frame[frame.len() - 1..]).collect();

        assert_eq!(frames, vec![Bytes::from_static(b"Hello, client #0.")]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn several_frames_in_one_chunk_keep_remainder() {
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&FrameCodec::encode(b"one").unwrap());
        wire.extend_from_slice(&FrameCodec::encode(b"").unwrap());
        wire.extend_from_slice(&FrameCodec::encode(b"three").unwrap());
        let partial = FrameCodec::encode(b"four").unwrap();
        wire.extend_from_slice(&partial[..6]);

        let mut buffer = BytesMut::new();
        let frames: Vec<_> = FrameCodec::feed(&mut buffer, &wire).collect();
        assert_eq!(
            frames,
            vec![
                Bytes::from_static(b"one"),
                Bytes::new(),
                Bytes::from_static(b"three")
            ]
        );
        assert_eq!(&buffer[..], &partial[..6]);

        let rest: Vec<_> = FrameCodec::feed(&mut buffer, &partial[6..]).collect();
        assert_eq!(rest, vec![Bytes::from_static(b"four")]);
    }

    #[test]
    fn zero_length_frame() {
        let mut buffer = BytesMut::new();
        let frame = FrameCodec::feed(&mut buffer, &FrameCodec::encode(b"").unwrap())
            .next()
            .unwrap();
        assert!(frame.is_empty());
    }

    #[test]
    fn any_declared_length_is_accepted() {
        let mut buffer = BytesMut::new();
        assert_eq!(FrameCodec::feed(&mut buffer, &[1, 0, 0, 0]).count(), 0);
        assert_eq!(FrameCodec::declared_len(&buffer), Some(1 << 24));
        assert!(buffer.capacity() >= (1 << 24) + LEN_SIZE);
        assert_eq!(buffer.len(), LEN_SIZE);
    }

    #[test]
    fn declared_len_needs_whole_prefix() {
        assert_eq!(FrameCodec::declared_len(&[0, 0, 1]), None);
        assert_eq!(FrameCodec::declared_len(&[0, 0, 1, 0, 9]), Some(256));
    }

    #[test]
    fn incomplete_frame_reserves_room() {
        let mut buffer = BytesMut::new();
        assert_eq!(FrameCodec::feed(&mut buffer, &[0, 0, 2, 0, 1]).count(), 0);
        assert!(buffer.capacity() >= 512 + LEN_SIZE);
    }
}
