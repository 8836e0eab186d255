use crate::error::SeglogError;
use crate::log::LogAddress;
use crc32c::crc32c;

pub mod builder;

pub const FRAME_MAGIC: u32 = 0x5347_4C46;
/// Magic + content length prefix + trailing crc32c.
pub const FRAME_OVERHEAD: usize = 12;
/// Per-fragment flags byte + payload length prefix.
pub const ENTRY_HEADER_SIZE: usize = 5;
/// Smallest frame capacity that can make progress on any operation.
pub const MIN_FRAME_CAPACITY: usize = 64;

const FLAG_FIRST: u8 = 0b0000_0001;
const FLAG_LAST: u8 = 0b0000_0010;

/// Identity and watermark metadata for one sealed frame. `log_address` is
/// absent at checkpoint time and populated once the durable log
/// acknowledges the write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameCommitArgs {
    /// Builder-local, monotone per builder instance.
    pub frame_id: u64,
    /// Sequence of the last operation whose serialization began in or
    /// before this frame.
    pub last_started_sequence: u64,
    /// Sequence of the last operation whose serialization completed in
    /// this frame; equals `last_started_sequence` iff the frame ends on an
    /// operation boundary.
    pub last_fully_serialized_sequence: u64,
    pub frame_length: usize,
    pub log_address: Option<LogAddress>,
}

/// Fixed-capacity byte container aggregating serialized operation records.
/// A record may span several consecutive frames as flagged fragments.
#[derive(Debug)]
pub struct DataFrame {
    content_capacity: usize,
    content: Vec<u8>,
    last_started_sequence: u64,
    last_fully_serialized_sequence: u64,
    entry_count: usize,
}

impl DataFrame {
    pub fn new(frame_capacity: usize) -> Self {
        let content_capacity = frame_capacity.saturating_sub(FRAME_OVERHEAD);
        Self {
            content_capacity,
            content: Vec::with_capacity(content_capacity),
            last_started_sequence: 0,
            last_fully_serialized_sequence: 0,
            entry_count: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    pub fn free_bytes(&self) -> usize {
        self.content_capacity - self.content.len()
    }

    /// Writes as much of `payload` as fits as one fragment and returns the
    /// number of payload bytes consumed; 0 means the frame is full.
    pub fn append_fragment(&mut self, sequence: u64, payload: &[u8], first: bool) -> usize {
        let free = self.free_bytes();
        if free <= ENTRY_HEADER_SIZE || payload.is_empty() {
            return 0;
        }
        let take = payload.len().min(free - ENTRY_HEADER_SIZE);
        let last = take == payload.len();
        let mut flags = 0u8;
        if first {
            flags |= FLAG_FIRST;
        }
        if last {
            flags |= FLAG_LAST;
        }
        self.content.push(flags);
        self.content.extend_from_slice(&(take as u32).to_be_bytes());
        self.content.extend_from_slice(&payload[..take]);
        if first {
            self.entry_count += 1;
        }
        self.last_started_sequence = sequence;
        if last {
            self.last_fully_serialized_sequence = sequence;
        }
        take
    }

    /// Finalizes the frame into its wire form:
    /// `[magic][content length][content][crc32c]`, all big-endian, with the
    /// checksum covering everything before it.
    pub fn seal(self) -> SealedFrame {
        let mut bytes = Vec::with_capacity(self.content.len() + FRAME_OVERHEAD);
        bytes.extend_from_slice(&FRAME_MAGIC.to_be_bytes());
        bytes.extend_from_slice(&(self.content.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&self.content);
        let crc = crc32c(&bytes);
        bytes.extend_from_slice(&crc.to_be_bytes());
        SealedFrame {
            length: bytes.len(),
            bytes,
            last_started_sequence: self.last_started_sequence,
            last_fully_serialized_sequence: self.last_fully_serialized_sequence,
        }
    }
}

#[derive(Debug)]
pub struct SealedFrame {
    pub bytes: Vec<u8>,
    pub length: usize,
    pub last_started_sequence: u64,
    pub last_fully_serialized_sequence: u64,
}

/// One decoded record fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameFragment {
    pub first: bool,
    pub last: bool,
    pub payload: Vec<u8>,
}

/// Decodes a sealed frame, validating magic, declared length, and crc32c.
pub fn decode_frame(bytes: &[u8]) -> Result<Vec<FrameFragment>, SeglogError> {
    if bytes.len() < FRAME_OVERHEAD {
        return Err(SeglogError::DataCorruption("frame is truncated".into()));
    }
    let magic = u32::from_be_bytes(read4(bytes, 0)?);
    if magic != FRAME_MAGIC {
        return Err(SeglogError::DataCorruption("bad frame magic".into()));
    }
    let content_len = u32::from_be_bytes(read4(bytes, 4)?) as usize;
    if bytes.len() != FRAME_OVERHEAD + content_len {
        return Err(SeglogError::DataCorruption(
            "frame length does not match declared content length".into(),
        ));
    }
    let crc_offset = bytes.len() - 4;
    let stored_crc = u32::from_be_bytes(read4(bytes, crc_offset)?);
    if stored_crc != crc32c(&bytes[..crc_offset]) {
        return Err(SeglogError::DataCorruption("frame checksum mismatch".into()));
    }

    let content = &bytes[8..crc_offset];
    let mut fragments = Vec::new();
    let mut pos = 0usize;
    while pos < content.len() {
        if content.len() - pos < ENTRY_HEADER_SIZE {
            return Err(SeglogError::DataCorruption(
                "truncated fragment header".into(),
            ));
        }
        let flags = content[pos];
        let len = u32::from_be_bytes(read4(content, pos + 1)?) as usize;
        pos += ENTRY_HEADER_SIZE;
        if content.len() - pos < len {
            return Err(SeglogError::DataCorruption(
                "fragment payload exceeds frame content".into(),
            ));
        }
        fragments.push(FrameFragment {
            first: flags & FLAG_FIRST != 0,
            last: flags & FLAG_LAST != 0,
            payload: content[pos..pos + len].to_vec(),
        });
        pos += len;
    }
    Ok(fragments)
}

/// Reassembles complete records from a run of consecutive frames. A record
/// whose final fragment lies beyond the provided frames is omitted.
pub fn reassemble_records<'a>(
    frames: impl IntoIterator<Item = &'a [u8]>,
) -> Result<Vec<Vec<u8>>, SeglogError> {
    let mut records = Vec::new();
    let mut open: Option<Vec<u8>> = None;
    for frame in frames {
        for fragment in decode_frame(frame)? {
            if fragment.first {
                if open.is_some() {
                    return Err(SeglogError::DataCorruption(
                        "new record started before the previous one ended".into(),
                    ));
                }
                open = Some(fragment.payload);
            } else {
                match open.as_mut() {
                    Some(buffer) => buffer.extend_from_slice(&fragment.payload),
                    None => {
                        return Err(SeglogError::DataCorruption(
                            "continuation fragment without an open record".into(),
                        ));
                    }
                }
            }
            if fragment.last {
                if let Some(record) = open.take() {
                    records.push(record);
                }
            }
        }
    }
    Ok(records)
}

fn read4(bytes: &[u8], offset: usize) -> Result<[u8; 4], SeglogError> {
    bytes
        .get(offset..offset + 4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| SeglogError::DataCorruption("frame is truncated".into()))
}

#[cfg(test)]
mod tests {
    use super::{
        DataFrame, ENTRY_HEADER_SIZE, FRAME_OVERHEAD, decode_frame, reassemble_records,
    };
    use crate::error::SeglogError;

    #[test]
    fn fragments_round_trip_through_seal_and_decode() {
        let mut frame = DataFrame::new(256);
        assert_eq!(frame.append_fragment(1, b"alpha", true), 5);
        assert_eq!(frame.append_fragment(2, b"beta", true), 4);
        assert_eq!(frame.entry_count(), 2);

        let sealed = frame.seal();
        assert_eq!(sealed.last_started_sequence, 2);
        assert_eq!(sealed.last_fully_serialized_sequence, 2);

        let fragments = decode_frame(&sealed.bytes).expect("decode");
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0].payload, b"alpha");
        assert!(fragments[0].first && fragments[0].last);
        assert_eq!(fragments[1].payload, b"beta");
    }

    #[test]
    fn records_span_frames_and_watermarks_track_the_split() {
        let capacity = FRAME_OVERHEAD + ENTRY_HEADER_SIZE + 8;
        let payload = [7u8; 20];

        let mut first = DataFrame::new(capacity);
        let taken = first.append_fragment(5, &payload, true);
        assert_eq!(taken, 8);
        assert_eq!(first.append_fragment(5, &payload[taken..], false), 0);
        let first = first.seal();
        assert_eq!(first.last_started_sequence, 5);
        assert_eq!(first.last_fully_serialized_sequence, 0);

        let mut second = DataFrame::new(capacity);
        let taken2 = second.append_fragment(5, &payload[taken..], false);
        assert_eq!(taken2, 8);
        let mut third = DataFrame::new(capacity);
        assert_eq!(
            third.append_fragment(5, &payload[taken + taken2..], false),
            4
        );
        let second = second.seal();
        let third = third.seal();
        assert_eq!(second.last_started_sequence, 5);
        assert_eq!(second.last_fully_serialized_sequence, 0);
        assert_eq!(third.last_fully_serialized_sequence, 5);

        let frames = [
            first.bytes.as_slice(),
            second.bytes.as_slice(),
            third.bytes.as_slice(),
        ];
        let records = reassemble_records(frames).expect("reassemble");
        assert_eq!(records, vec![payload.to_vec()]);
    }

    #[test]
    fn incomplete_tail_record_is_omitted() {
        let capacity = FRAME_OVERHEAD + ENTRY_HEADER_SIZE + 4;
        let mut frame = DataFrame::new(capacity);
        let payload = [1u8; 10];
        assert_eq!(frame.append_fragment(1, &payload, true), 4);
        let sealed = frame.seal();
        let records = reassemble_records([sealed.bytes.as_slice()]).expect("reassemble");
        assert!(records.is_empty());
    }

    #[test]
    fn corrupted_bytes_are_detected() {
        let mut frame = DataFrame::new(128);
        frame.append_fragment(1, b"payload", true);
        let sealed = frame.seal();

        let mut flipped = sealed.bytes.clone();
        let mid = flipped.len() / 2;
        flipped[mid] ^= 0xFF;
        assert!(matches!(
            decode_frame(&flipped),
            Err(SeglogError::DataCorruption(_))
        ));

        let truncated = &sealed.bytes[..sealed.bytes.len() - 3];
        assert!(matches!(
            decode_frame(truncated),
            Err(SeglogError::DataCorruption(_))
        ));
    }

    #[test]
    fn full_frame_refuses_further_fragments() {
        let capacity = FRAME_OVERHEAD + ENTRY_HEADER_SIZE + 4;
        let mut frame = DataFrame::new(capacity);
        assert_eq!(frame.append_fragment(1, &[0u8; 4], true), 4);
        assert_eq!(frame.append_fragment(2, &[0u8; 1], true), 0);
    }
}
