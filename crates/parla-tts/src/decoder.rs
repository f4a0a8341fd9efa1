//! Encoded speech → PCM samples.
//!
//! Containers and compressed codecs go through Symphonia; raw PCM
//! responses are converted directly. Two entry points:
//!
//! - [`decode`]: whole-buffer decode into [`CachedAudio`] for the cache.
//! - [`decode_reader`]: incremental decode from a blocking reader, used by
//!   progressive playback while the stream is still arriving.

use std::io::{self, Read};
use std::sync::{Mutex, PoisonError, mpsc};

use bytes::{Buf, Bytes};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSource, MediaSourceStream, ReadOnlySource};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::audio::{AudioFormat, CachedAudio, PCM_CHANNELS, PCM_SAMPLE_RATE};
use crate::error::DecodeError;

// ── Decoded blocks ─────────────────────────────────────────────────

/// A run of decoded frames in planar layout.
///
/// The samples borrow the decoder's transient buffer; callers copy what
/// they keep.
#[derive(Debug, Clone, Copy)]
pub struct PlanarBlock<'a> {
    pub sample_rate: u32,
    pub channels: usize,
    pub frames: usize,
    samples: &'a [f32],
}

impl<'a> PlanarBlock<'a> {
    pub const fn new(sample_rate: u32, channels: usize, frames: usize, samples: &'a [f32]) -> Self {
        Self {
            sample_rate,
            channels,
            frames,
            samples,
        }
    }

    /// Samples of one channel.
    pub fn channel(&self, index: usize) -> &'a [f32] {
        let start = index * self.frames;
        &self.samples[start..start + self.frames]
    }

    /// Interleaved copy of the block.
    pub fn interleaved(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.frames * self.channels);
        for frame in 0..self.frames {
            for channel in 0..self.channels {
                out.push(self.samples[channel * self.frames + frame]);
            }
        }
        out
    }
}

// ── Whole-buffer decode ────────────────────────────────────────────

/// Decode a complete utterance.
///
/// Fails with [`DecodeError::Empty`] on zero bytes and
/// [`DecodeError::NoAudio`] when nothing decodable was found.
pub fn decode(bytes: &[u8], format: AudioFormat) -> Result<CachedAudio, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }

    if format == AudioFormat::Pcm {
        let mut assembler = PcmAssembler::new();
        let samples = assembler.push(bytes);
        if samples.is_empty() {
            return Err(DecodeError::NoAudio);
        }
        return Ok(CachedAudio::new(vec![samples], PCM_SAMPLE_RATE));
    }

    let mut collector = PlanarCollector::default();
    // Symphonia requires a 'static source, so the bytes are copied.
    let source = io::Cursor::new(bytes.to_vec());
    decode_source(Box::new(source), format, |block| collector.push(block))?;
    collector.finish()
}

#[derive(Default)]
struct PlanarCollector {
    channels: Vec<Vec<f32>>,
    sample_rate: u32,
}

impl PlanarCollector {
    fn push(&mut self, block: &PlanarBlock<'_>) {
        if self.channels.is_empty() {
            self.channels = vec![Vec::new(); block.channels];
            self.sample_rate = block.sample_rate;
        }
        if block.channels != self.channels.len() || block.sample_rate != self.sample_rate {
            tracing::warn!(
                channels = block.channels,
                sample_rate = block.sample_rate,
                "Dropping decoded block with mismatched layout"
            );
            return;
        }
        for (index, channel) in self.channels.iter_mut().enumerate() {
            channel.extend_from_slice(block.channel(index));
        }
    }

    fn finish(self) -> Result<CachedAudio, DecodeError> {
        let audio = CachedAudio::new(self.channels, self.sample_rate);
        if audio.is_empty() {
            return Err(DecodeError::NoAudio);
        }
        Ok(audio)
    }
}

// ── Incremental decode ─────────────────────────────────────────────

/// Decode from a blocking reader, invoking `on_block` per decoded packet.
///
/// Returns the number of frames decoded. Runs until the reader reports
/// end of input; call from a blocking context.
pub fn decode_reader<R>(
    reader: R,
    format: AudioFormat,
    on_block: impl FnMut(&PlanarBlock<'_>),
) -> Result<usize, DecodeError>
where
    R: Read + Send + Sync + 'static,
{
    decode_source(Box::new(ReadOnlySource::new(reader)), format, on_block)
}

fn decode_source(
    source: Box<dyn MediaSource>,
    format: AudioFormat,
    mut on_block: impl FnMut(&PlanarBlock<'_>),
) -> Result<usize, DecodeError> {
    let mss = MediaSourceStream::new(source, Default::default());

    let mut hint = Hint::new();
    hint.with_extension(format.as_str());

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(classify)?;

    let mut reader = probed.format;
    let track = reader
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| DecodeError::Unsupported("no audio track".into()))?;
    let track_id = track.id;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(classify)?;

    let mut total_frames = 0usize;

    loop {
        let packet = match reader.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(ref e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) if total_frames > 0 => {
                // Trailing garbage after valid audio is tolerated.
                tracing::warn!(error = %e, "Stopping decode on stream error");
                break;
            }
            Err(e) => return Err(classify(e)),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphoniaError::DecodeError(e)) => {
                tracing::warn!("Audio packet decode error (skipping): {e}");
                continue;
            }
            Err(e) => return Err(classify(e)),
        };

        let frames = decoded.frames();
        if frames == 0 {
            continue;
        }
        let spec = *decoded.spec();
        let channels = spec.channels.count();
        let mut sample_buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        sample_buf.copy_planar_ref(decoded);

        on_block(&PlanarBlock::new(
            spec.rate,
            channels,
            frames,
            sample_buf.samples(),
        ));
        total_frames += frames;
    }

    Ok(total_frames)
}

fn classify(e: SymphoniaError) -> DecodeError {
    match e {
        SymphoniaError::Unsupported(what) => DecodeError::Unsupported(what.to_string()),
        other => DecodeError::Malformed(other.to_string()),
    }
}

// ── Raw PCM ────────────────────────────────────────────────────────

/// Converts signed 16-bit little-endian chunks into `f32` samples,
/// carrying an odd trailing byte over to the next chunk.
#[derive(Debug, Default)]
pub struct PcmAssembler {
    carry: Option<u8>,
}

impl PcmAssembler {
    pub const CHANNELS: u16 = PCM_CHANNELS;

    pub const fn new() -> Self {
        Self { carry: None }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<f32> {
        let mut out = Vec::with_capacity(chunk.len() / 2 + 1);
        let mut rest = chunk;

        if let Some(low) = self.carry.take() {
            match rest.split_first() {
                Some((&high, tail)) => {
                    out.push(pcm_sample(low, high));
                    rest = tail;
                }
                None => {
                    self.carry = Some(low);
                    return out;
                }
            }
        }

        let mut pairs = rest.chunks_exact(2);
        for pair in pairs.by_ref() {
            out.push(pcm_sample(pair[0], pair[1]));
        }
        if let [odd] = pairs.remainder() {
            self.carry = Some(*odd);
        }
        out
    }
}

fn pcm_sample(low: u8, high: u8) -> f32 {
    f32::from(i16::from_le_bytes([low, high])) / 32_768.0
}

// ── Chunk reader ───────────────────────────────────────────────────

/// Blocking [`Read`] adapter over chunks delivered through a channel.
///
/// Reports end of input once the sender is dropped.
pub struct ChunkReader {
    rx: Mutex<mpsc::Receiver<Bytes>>,
    current: Bytes,
}

impl ChunkReader {
    pub const fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            rx: Mutex::new(rx),
            current: Bytes::new(),
        }
    }
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.current.is_empty() {
            let rx = self.rx.get_mut().unwrap_or_else(PoisonError::into_inner);
            match rx.recv() {
                Ok(chunk) => self.current = chunk,
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a 16-bit PCM WAV file in memory.
    fn wav_bytes(sample_rate: u32, channels: u16, samples: &[i16]) -> Vec<u8> {
        let data_len = u32::try_from(samples.len() * 2).unwrap();
        let block_align = channels * 2;
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&channels.to_le_bytes());
        out.extend_from_slice(&sample_rate.to_le_bytes());
        out.extend_from_slice(&(sample_rate * u32::from(block_align)).to_le_bytes());
        out.extend_from_slice(&block_align.to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        for s in samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out
    }

    #[test]
    fn empty_input_is_rejected() {
        assert_eq!(decode(&[], AudioFormat::Mp3), Err(DecodeError::Empty));
        assert_eq!(decode(&[], AudioFormat::Pcm), Err(DecodeError::Empty));
    }

    #[test]
    fn garbage_is_not_audio() {
        let err = decode(b"definitely not audio", AudioFormat::Wav).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::Unsupported(_) | DecodeError::Malformed(_)
        ));
    }

    #[test]
    fn wav_decodes_into_channels() {
        let samples: Vec<i16> = (0..2_000).map(|i| if i % 2 == 0 { 16_384 } else { -16_384 }).collect();
        let audio = decode(&wav_bytes(16_000, 2, &samples), AudioFormat::Wav).unwrap();

        assert_eq!(audio.sample_rate(), 16_000);
        assert_eq!(audio.channels(), 2);
        assert_eq!(audio.frames(), 1_000);
        assert!(audio.channel(0).unwrap().iter().all(|s| (*s - 0.5).abs() < 1e-3));
        assert!(audio.channel(1).unwrap().iter().all(|s| (*s + 0.5).abs() < 1e-3));
    }

    #[test]
    fn pcm_decodes_as_mono_24k() {
        let bytes: Vec<u8> = [0i16, 16_384, -32_768].iter().flat_map(|s| s.to_le_bytes()).collect();
        let audio = decode(&bytes, AudioFormat::Pcm).unwrap();
        assert_eq!(audio.sample_rate(), PCM_SAMPLE_RATE);
        assert_eq!(audio.channel(0).unwrap(), &[0.0, 0.5, -1.0]);
    }

    #[test]
    fn single_pcm_byte_has_no_samples() {
        assert_eq!(decode(&[7], AudioFormat::Pcm), Err(DecodeError::NoAudio));
    }

    #[test]
    fn pcm_assembler_carries_odd_bytes() {
        let bytes = 16_384i16.to_le_bytes();
        let mut assembler = PcmAssembler::new();
        assert!(assembler.push(&bytes[..1]).is_empty());
        assert_eq!(assembler.push(&bytes[1..]), vec![0.5]);
    }

    #[test]
    fn chunk_reader_reads_across_chunks_until_sender_drops() {
        let (tx, rx) = mpsc::channel();
        tx.send(Bytes::from_static(b"abc")).unwrap();
        tx.send(Bytes::from_static(b"de")).unwrap();
        drop(tx);

        let mut out = Vec::new();
        ChunkReader::new(rx).read_to_end(&mut out).unwrap();
        assert_eq!(out, b"abcde");
    }

    const MP3_SILENCE: &[u8] = include_bytes!("../tests/fixtures/silence-48k-mono.mp3");

    #[test]
    fn mp3_decodes_whole_buffer() {
        let audio = decode(MP3_SILENCE, AudioFormat::Mp3).unwrap();
        assert_eq!(audio.sample_rate(), 48_000);
        assert_eq!(audio.channels(), 1);
        assert!(audio.frames() >= 1_152 * 20);
        assert!(audio.channel(0).unwrap().iter().all(|s| s.abs() < 1e-3));
    }

    #[test]
    fn mp3_decodes_incrementally_from_chunks() {
        let (tx, rx) = mpsc::channel();
        // Chunk boundaries deliberately split frames.
        for chunk in MP3_SILENCE.chunks(250) {
            tx.send(Bytes::copy_from_slice(chunk)).unwrap();
        }
        drop(tx);

        let mut blocks = 0;
        let mut seen = 0;
        let frames = decode_reader(ChunkReader::new(rx), AudioFormat::Mp3, |block| {
            assert_eq!(block.sample_rate, 48_000);
            assert_eq!(block.channels, 1);
            blocks += 1;
            seen += block.frames;
        })
        .unwrap();
        assert_eq!(frames, seen);
        assert!(blocks >= 20);
        assert_eq!(frames, decode(MP3_SILENCE, AudioFormat::Mp3).unwrap().frames());
    }

    #[test]
    fn wav_decodes_incrementally_from_chunks() {
        let samples = vec![8_192i16; 4_800];
        let bytes = wav_bytes(24_000, 1, &samples);
        let (tx, rx) = mpsc::channel();
        for chunk in bytes.chunks(1_000) {
            tx.send(Bytes::copy_from_slice(chunk)).unwrap();
        }
        drop(tx);

        let mut seen = 0;
        let frames = decode_reader(ChunkReader::new(rx), AudioFormat::Wav, |block| {
            assert_eq!(block.channels, 1);
            seen += block.frames;
        })
        .unwrap();
        assert_eq!(frames, 4_800);
        assert_eq!(seen, 4_800);
    }
}
