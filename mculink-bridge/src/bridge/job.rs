//! One send sequence: framing, file reading, progress accounting

use super::ack::AckWait;
use super::queue::{PendingSend, SendBody};
use crate::channel::Channel;
use crate::config::ChannelSettings;
use bytes::Bytes;
use mculink_core::checksum::ChecksumSlot;
use mculink_core::encoder::{encode_frame, encode_packet_markers};
use mculink_core::payload::PayloadStream;
use mculink_core::{ChecksumTable, FrameError};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::time::Instant;

/// An encoded frame and the source bytes it accounts for
#[derive(Debug, Clone)]
pub(crate) struct Outgoing {
    pub(crate) bytes: Bytes,
    pub(crate) progress: u64,
    /// Closing packet marker
    pub(crate) end_marker: bool,
}

/// Where a job is in its frame cycle
#[derive(Debug)]
pub(crate) enum Phase {
    /// The next frame may be written
    Ready,
    /// A frame is on the wire
    AwaitAck { frame: Outgoing, wait: AckWait },
    /// Paced channel waiting for DEVICE_READY
    AwaitReady { deadline: Instant },
}

struct FileReader {
    file: File,
    stream: PayloadStream,
    read_chunk: usize,
    remaining: u64,
}

impl FileReader {
    /// Read the next disk chunk; returns (disk bytes, converted payload)
    async fn read_next(&mut self) -> Result<(u64, Vec<u8>), String> {
        let want = (self.read_chunk as u64).min(self.remaining) as usize;
        let mut buf = vec![0u8; want];
        self.file
            .read_exact(&mut buf)
            .await
            .map_err(|e| format!("file read failed: {}", e))?;
        self.remaining -= want as u64;

        let mut data = self.stream.push(&buf).map_err(|e| e.to_string())?;
        if self.remaining == 0 {
            data.extend(self.stream.finish().map_err(|e| e.to_string())?);
        }
        Ok((want as u64, data))
    }
}

/// The in-flight send sequence
pub(crate) struct SendJob {
    pub(crate) pending: PendingSend,
    pub(crate) phase: Phase,
    chunk_size: usize,
    paced: bool,
    read_chunk: usize,
    frames: VecDeque<Outgoing>,
    reader: Option<FileReader>,
    tail: Option<Outgoing>,
    total: u64,
    sent: u64,
}

impl SendJob {
    pub(crate) fn new(pending: PendingSend, settings: &ChannelSettings, file_read_chunk: usize) -> Self {
        Self {
            pending,
            phase: Phase::Ready,
            chunk_size: settings.chunk_size,
            paced: settings.paced,
            read_chunk: file_read_chunk.max(settings.chunk_size).max(1),
            frames: VecDeque::new(),
            reader: None,
            tail: None,
            total: 0,
            sent: 0,
        }
    }

    pub(crate) fn major_key(&self) -> u8 {
        self.pending.request.major_key
    }

    pub(crate) fn is_file(&self) -> bool {
        matches!(self.pending.request.body, SendBody::Path(_))
    }

    pub(crate) fn paced(&self) -> bool {
        self.paced
    }

    pub(crate) fn source(&self) -> Option<Arc<dyn Channel>> {
        self.pending.request.source_channel()
    }

    /// Frames (or file data) left after the current one
    pub(crate) fn has_more(&self) -> bool {
        !self.frames.is_empty() || self.reader.is_some() || self.tail.is_some()
    }

    /// Encode the payload, or open the file. Errors are user-facing labels.
    pub(crate) async fn start(&mut self, checksums: &ChecksumTable) -> Result<(), String> {
        let request = &self.pending.request;
        let major = request.major_key;
        let minor = request.minor_key;
        let slot = checksums.slot(major).clone();

        match &request.body {
            SendBody::Bytes(payload) => {
                let data = request.encoding.encode(payload).map_err(|e| e.to_string())?;
                self.total = data.len() as u64;
                let frames = if data.is_empty() {
                    vec![Outgoing {
                        bytes: encode_frame(major, minor, &[], &slot).map_err(|e| e.to_string())?,
                        progress: 0,
                        end_marker: false,
                    }]
                } else {
                    split_frames(major, minor, &data, self.chunk_size, self.total, &slot)
                        .map_err(|e| e.to_string())?
                };
                self.frames.extend(frames);
            }
            SendBody::Path(path) => {
                let file = File::open(path)
                    .await
                    .map_err(|e| format!("cannot open {}: {}", path.display(), e))?;
                let len = file
                    .metadata()
                    .await
                    .map_err(|e| format!("cannot stat {}: {}", path.display(), e))?
                    .len();
                let stream = PayloadStream::new(request.encoding.clone()).map_err(|e| e.to_string())?;
                self.total = len;
                if len > 0 {
                    self.reader = Some(FileReader {
                        file,
                        stream,
                        read_chunk: self.read_chunk,
                        remaining: len,
                    });
                }
            }
        }

        if request.kind.is_packeted() {
            let total = u32::try_from(self.total)
                .map_err(|_| format!("{} bytes do not fit a packet header", self.total))?;
            let (start, end) =
                encode_packet_markers(major, minor, total, checksums).map_err(|e| e.to_string())?;
            self.frames.push_front(Outgoing {
                bytes: start,
                progress: 0,
                end_marker: false,
            });
            self.tail = Some(Outgoing {
                bytes: end,
                progress: 0,
                end_marker: true,
            });
        }
        Ok(())
    }

    /// Next frame to write, reading from disk when the buffered frames run out
    pub(crate) async fn next_frame(&mut self, checksums: &ChecksumTable) -> Result<Option<Outgoing>, String> {
        loop {
            if let Some(frame) = self.frames.pop_front() {
                return Ok(Some(frame));
            }
            let Some(reader) = self.reader.as_mut() else {
                return Ok(self.tail.take());
            };
            let (disk, data) = reader.read_next().await?;
            if reader.remaining == 0 {
                self.reader = None;
            }
            if data.is_empty() {
                // Only separators in this chunk
                self.sent = (self.sent + disk).min(self.total);
                continue;
            }
            let major = self.pending.request.major_key;
            let minor = self.pending.request.minor_key;
            let frames = split_frames(major, minor, &data, self.chunk_size, disk, checksums.slot(major))
                .map_err(|e| e.to_string())?;
            self.frames.extend(frames);
        }
    }

    /// Account for an acknowledged frame; returns a progress report for file sends.
    ///
    /// A packeted file only reaches 100% once its end marker is acknowledged.
    pub(crate) fn record_ack(&mut self, frame: &Outgoing) -> Option<(u8, String)> {
        if !self.is_file() {
            self.sent = (self.sent + frame.progress).min(self.total);
            return None;
        }
        if frame.end_marker {
            self.sent = self.total;
            return Some((100, self.label()));
        }
        if frame.progress == 0 {
            return None;
        }
        self.sent = (self.sent + frame.progress).min(self.total);
        let percent = if self.pending.request.kind.is_packeted() {
            self.percent().min(99)
        } else {
            self.percent()
        };
        Some((percent, self.label()))
    }

    fn percent(&self) -> u8 {
        if self.total == 0 {
            100
        } else {
            ((self.sent as u128 * 100) / self.total as u128) as u8
        }
    }

    fn label(&self) -> String {
        format!("{}/{} KB", self.sent / 1024, self.total / 1024)
    }
}

/// Split `data` into frames of at most `chunk_size` payload bytes (0 = one
/// frame), sharing `source_bytes` of progress across them.
pub(crate) fn split_frames(
    major_key: u8,
    minor_key: u8,
    data: &[u8],
    chunk_size: usize,
    source_bytes: u64,
    slot: &ChecksumSlot,
) -> Result<Vec<Outgoing>, FrameError> {
    let pieces: Vec<&[u8]> = if chunk_size == 0 {
        vec![data]
    } else {
        data.chunks(chunk_size).collect()
    };
    let data_len = data.len().max(1) as u128;
    let last = pieces.len().saturating_sub(1);
    let mut assigned = 0u64;
    let mut out = Vec::with_capacity(pieces.len());
    for (i, piece) in pieces.into_iter().enumerate() {
        let progress = if i == last {
            source_bytes - assigned
        } else {
            (source_bytes as u128 * piece.len() as u128 / data_len) as u64
        };
        assigned += progress;
        out.push(Outgoing {
            bytes: encode_frame(major_key, minor_key, piece, slot)?,
            progress,
            end_marker: false,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::queue::SendRequest;
    use crate::bridge::SendOutcome;
    use mculink_core::constants::{MINOR_KEY_PACKET_END, MINOR_KEY_PACKET_START};
    use mculink_core::decoder::decode_frame_from_bytes;
    use mculink_core::payload::PayloadEncoding;
    use tokio::sync::oneshot;

    fn job(request: SendRequest, settings: ChannelSettings, read_chunk: usize) -> SendJob {
        let (tx, _rx) = oneshot::channel::<SendOutcome>();
        SendJob::new(PendingSend::new(request, tx), &settings, read_chunk)
    }

    async fn drain(job: &mut SendJob, table: &ChecksumTable) -> Vec<Outgoing> {
        let mut out = Vec::new();
        while let Some(f) = job.next_frame(table).await.unwrap() {
            out.push(f);
        }
        out
    }

    #[test]
    fn test_split_progress_sums() {
        let table = ChecksumTable::new();
        let frames = split_frames(4, 0, &[0u8; 100], 32, 100, table.slot(4)).unwrap();
        assert_eq!(frames.len(), 4);
        assert_eq!(frames.iter().map(|f| f.progress).sum::<u64>(), 100);
        assert_eq!(frames[3].progress, 4);

        // Text payloads: fewer wire bytes than source bytes
        let frames = split_frames(4, 0, &[0u8; 10], 3, 29, table.slot(4)).unwrap();
        assert_eq!(frames.iter().map(|f| f.progress).sum::<u64>(), 29);
    }

    #[tokio::test]
    async fn test_chunk_split_by_chunk_size() {
        let table = ChecksumTable::new();
        let mut j = job(
            SendRequest::chunk(5, 2, vec![7u8; 70]),
            ChannelSettings::new(5).with_chunk_size(32),
            1024,
        );
        j.start(&table).await.unwrap();
        let frames = drain(&mut j, &table).await;
        let lens: Vec<usize> = frames
            .iter()
            .map(|f| decode_frame_from_bytes(&f.bytes, &table).unwrap().payload.len())
            .collect();
        assert_eq!(lens, vec![32, 32, 6]);
    }

    #[tokio::test]
    async fn test_empty_chunk_still_sends_a_frame() {
        let table = ChecksumTable::new();
        let mut j = job(SendRequest::chunk(4, 0, Bytes::new()), ChannelSettings::new(4), 1024);
        j.start(&table).await.unwrap();
        let frames = drain(&mut j, &table).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].bytes.len(), 3);
    }

    #[tokio::test]
    async fn test_packeted_file_with_markers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fw.bin");
        std::fs::write(&path, vec![1u8; 100]).unwrap();
        let table = ChecksumTable::new();

        let mut j = job(
            SendRequest::file(6, 3, &path).packeted(),
            ChannelSettings::new(6).with_chunk_size(40),
            // Smaller than the chunk size: raised to it
            16,
        );
        j.start(&table).await.unwrap();
        let frames: Vec<_> = drain(&mut j, &table)
            .await
            .iter()
            .map(|f| decode_frame_from_bytes(&f.bytes, &table).unwrap())
            .collect();

        let minors: Vec<u8> = frames.iter().map(|f| f.minor_key).collect();
        assert_eq!(minors, vec![MINOR_KEY_PACKET_START, 3, 3, 3, MINOR_KEY_PACKET_END]);
        assert_eq!(frames[0].payload.as_ref(), &[3, 0, 0, 0, 100]);
        let data: usize = frames[1..4].iter().map(|f| f.payload.len()).sum();
        assert_eq!(data, 100);
    }

    #[tokio::test]
    async fn test_text_file_tokens_across_reads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bytes.txt");
        std::fs::write(&path, "01 02 03 ff 10").unwrap();
        let table = ChecksumTable::new();

        let mut j = job(
            SendRequest::file(4, 0, &path).encoding(PayloadEncoding::text(16, " ")),
            ChannelSettings::new(4),
            4,
        );
        j.start(&table).await.unwrap();
        let mut payload = Vec::new();
        let mut progress = 0;
        for f in drain(&mut j, &table).await {
            progress += f.progress;
            payload.extend_from_slice(&decode_frame_from_bytes(&f.bytes, &table).unwrap().payload);
        }
        assert_eq!(payload, vec![0x01, 0x02, 0x03, 0xFF, 0x10]);
        assert_eq!(progress + j.sent, 14);
    }

    #[tokio::test]
    async fn test_missing_file_is_a_label() {
        let table = ChecksumTable::new();
        let mut j = job(
            SendRequest::file(4, 0, "/definitely/not/here.bin"),
            ChannelSettings::new(4),
            1024,
        );
        let err = j.start(&table).await.unwrap_err();
        assert!(err.starts_with("cannot open"));
    }

    #[test]
    fn test_progress_labels() {
        let table = ChecksumTable::new();
        let mut j = job(SendRequest::file(4, 0, "unused"), ChannelSettings::new(4), 1024);
        j.total = 4096;
        let frames = split_frames(4, 0, &[0u8; 2048], 0, 2048, table.slot(4)).unwrap();
        assert_eq!(j.record_ack(&frames[0]), Some((50, "2/4 KB".to_string())));
        assert_eq!(j.record_ack(&frames[0]), Some((100, "4/4 KB".to_string())));
    }

    #[tokio::test]
    async fn test_packeted_file_completes_on_end_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fw.bin");
        std::fs::write(&path, vec![1u8; 2048]).unwrap();
        let table = ChecksumTable::new();

        let mut j = job(
            SendRequest::file(6, 0, &path).packeted(),
            ChannelSettings::new(6).with_chunk_size(1024),
            1024,
        );
        j.start(&table).await.unwrap();
        let reports: Vec<_> = drain(&mut j, &table)
            .await
            .iter()
            .filter_map(|f| j.record_ack(f))
            .collect();
        assert_eq!(
            reports,
            vec![
                (50, "1/2 KB".to_string()),
                (99, "2/2 KB".to_string()),
                (100, "2/2 KB".to_string()),
            ]
        );
    }
}
