//! In-process transcoding through the FFmpeg libraries.
//!
//! [`NativeSession`] adapts an `ffmpeg-the-third` demuxer, decoders,
//! encoders and muxer to [`MediaSession`] so the shared streaming engine can
//! drive it. The transcode runs on a blocking thread; dropping the
//! `compress` future raises the abort flag and the engine stops at the next
//! packet.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};

use async_trait::async_trait;
use ffmpeg_the_third as ffmpeg;
use mf_core::config::TranscodeConfig;

use ffmpeg::format::sample::Type as SampleType;
use ffmpeg::format::{Pixel, Sample};
use ffmpeg::software::{resampling, scaling};
use ffmpeg::{codec, decoder, encoder, format, frame, media, Packet, Rational};

use super::engine::{self, Demuxed, MediaSession, StreamKind};
use super::Transcoder;
use crate::artifacts::ArtifactDir;
use crate::tools::{ToolRegistry, VideoEncoder};

static FFMPEG_INIT: Once = Once::new();

fn init_ffmpeg() {
    FFMPEG_INIT.call_once(|| {
        if let Err(e) = ffmpeg::init() {
            tracing::error!("Failed to initialize FFmpeg: {e}");
        }
    });
}

/// Millisecond time base used for sampled video frames.
const VIDEO_TIME_BASE: Rational = Rational(1, 1000);

fn codec_err(context: &str, e: impl std::fmt::Display) -> mf_core::Error {
    mf_core::Error::Compression(format!("{context}: {e}"))
}

/// [`Transcoder`] backed by the linked FFmpeg libraries.
#[derive(Debug, Clone)]
pub struct NativeTranscoder {
    tools: Arc<ToolRegistry>,
    artifacts: ArtifactDir,
}

impl NativeTranscoder {
    pub fn new(tools: Arc<ToolRegistry>, artifacts: ArtifactDir) -> Self {
        Self { tools, artifacts }
    }
}

/// Raises the abort flag when the owning future is dropped.
struct AbortOnDrop(Arc<AtomicBool>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

#[async_trait]
impl Transcoder for NativeTranscoder {
    fn name(&self) -> &'static str {
        "ffmpeg-native"
    }

    async fn compress(&self, input: &Path, config: &TranscodeConfig) -> mf_core::Result<PathBuf> {
        // Frames are converted to yuv420p in system memory; vaapi and qsv
        // need hardware frame contexts and fall back to libx264 here.
        let encoder = match self.tools.video_encoder(config.hw_accel.as_deref()).await {
            VideoEncoder::Vaapi | VideoEncoder::Qsv => VideoEncoder::Software,
            other => other,
        };
        let guard = self.artifacts.reserve(input, "mp4");
        let abort = Arc::new(AtomicBool::new(false));
        let _abort_on_drop = AbortOnDrop(Arc::clone(&abort));

        let input_path = input.to_path_buf();
        let output_path = guard.path().to_path_buf();
        let config = config.clone();
        let result = tokio::task::spawn_blocking(move || {
            init_ffmpeg();
            let mut session = NativeSession::open(&input_path, &output_path, &config, encoder)?;
            engine::run(&mut session, config.fps, &abort)
        })
        .await
        .map_err(|e| mf_core::Error::Compression(format!("transcode task failed: {e}")))
        .and_then(|r| r);

        match result {
            Ok(stats) => {
                tracing::debug!(
                    input = %input.display(),
                    encoder = encoder.codec_name(),
                    frames_decoded = stats.frames_decoded,
                    frames_dropped = stats.frames_dropped,
                    packets_written = stats.packets_written,
                    "Compressed media"
                );
                Ok(guard.commit())
            }
            Err(e) => {
                guard.discard(&e.to_string());
                Err(e)
            }
        }
    }
}

struct VideoLane {
    in_index: usize,
    out_index: usize,
    in_time_base: Rational,
    decoder: decoder::Video,
    encoder: encoder::Video,
    scaler: Option<scaling::Context>,
    width: u32,
    height: u32,
}

struct AudioLane {
    in_index: usize,
    out_index: usize,
    decoder: decoder::Audio,
    encoder: encoder::Audio,
    resampler: Option<resampling::Context>,
    layout: ffmpeg::ChannelLayout,
    rate: u32,
    frame_size: usize,
    /// Resampled planar samples awaiting a full encoder frame.
    fifo: Vec<Vec<f32>>,
    next_pts: i64,
}

/// One input file being transcoded into one output file.
pub struct NativeSession {
    ictx: format::context::Input,
    octx: format::context::Output,
    video: Option<VideoLane>,
    audio: Option<AudioLane>,
}

impl NativeSession {
    pub fn open(
        input: &Path,
        output: &Path,
        config: &TranscodeConfig,
        video_encoder: VideoEncoder,
    ) -> mf_core::Result<Self> {
        let ictx = format::input(input).map_err(|e| codec_err("open input", e))?;
        let mut octx =
            format::output_as(output, "mp4").map_err(|e| codec_err("create output", e))?;
        let global_header = octx
            .format()
            .flags()
            .contains(format::Flags::GLOBAL_HEADER);

        let video = match ictx.streams().best(media::Type::Video) {
            Some(stream) => Some(open_video_lane(
                &stream,
                &mut octx,
                config,
                video_encoder,
                global_header,
            )?),
            None => None,
        };
        let audio = match ictx.streams().best(media::Type::Audio) {
            Some(stream) => Some(open_audio_lane(&stream, &mut octx, config, global_header)?),
            None => None,
        };

        if video.is_none() && audio.is_none() {
            return Err(mf_core::Error::Compression(
                "input has no audio or video stream".into(),
            ));
        }

        octx.write_header()
            .map_err(|e| codec_err("write header", e))?;

        Ok(Self {
            ictx,
            octx,
            video,
            audio,
        })
    }

    fn drain_video_encoder(&mut self) -> mf_core::Result<u64> {
        let Some(lane) = self.video.as_mut() else {
            return Ok(0);
        };
        let out_tb = self
            .octx
            .stream(lane.out_index)
            .map(|s| s.time_base())
            .unwrap_or(VIDEO_TIME_BASE);
        let mut written = 0;
        let mut packet = Packet::empty();
        while lane.encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(lane.out_index);
            packet.rescale_ts(VIDEO_TIME_BASE, out_tb);
            packet.set_position(-1);
            packet
                .write_interleaved(&mut self.octx)
                .map_err(|e| codec_err("write video packet", e))?;
            written += 1;
        }
        Ok(written)
    }

    fn drain_audio_encoder(&mut self) -> mf_core::Result<u64> {
        let Some(lane) = self.audio.as_mut() else {
            return Ok(0);
        };
        let enc_tb = Rational(1, lane.rate as i32);
        let out_tb = self
            .octx
            .stream(lane.out_index)
            .map(|s| s.time_base())
            .unwrap_or(enc_tb);
        let mut written = 0;
        let mut packet = Packet::empty();
        while lane.encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(lane.out_index);
            packet.rescale_ts(enc_tb, out_tb);
            packet.set_position(-1);
            packet
                .write_interleaved(&mut self.octx)
                .map_err(|e| codec_err("write audio packet", e))?;
            written += 1;
        }
        Ok(written)
    }

    /// Encode every complete frame sitting in the audio FIFO. With `flush`
    /// the remainder is encoded as a short final frame.
    fn encode_audio_fifo(&mut self, flush: bool) -> mf_core::Result<u64> {
        let mut written = 0;
        loop {
            let Some(lane) = self.audio.as_mut() else {
                return Ok(written);
            };
            let buffered = lane.fifo.first().map_or(0, Vec::len);
            let take = if buffered >= lane.frame_size {
                lane.frame_size
            } else if flush && buffered > 0 {
                buffered
            } else {
                return Ok(written);
            };

            let mut chunk = frame::Audio::new(
                Sample::F32(SampleType::Planar),
                take,
                lane.layout.clone(),
            );
            chunk.set_rate(lane.rate);
            for (ch, samples) in lane.fifo.iter_mut().enumerate() {
                chunk.plane_mut::<f32>(ch)[..take].copy_from_slice(&samples[..take]);
                samples.drain(..take);
            }
            chunk.set_pts(Some(lane.next_pts));
            lane.next_pts += take as i64;

            lane.encoder
                .send_frame(&chunk)
                .map_err(|e| codec_err("send audio frame", e))?;
            written += self.drain_audio_encoder()?;
        }
    }
}

fn open_video_lane(
    stream: &format::stream::Stream,
    octx: &mut format::context::Output,
    config: &TranscodeConfig,
    video_encoder: VideoEncoder,
    global_header: bool,
) -> mf_core::Result<VideoLane> {
    let decoder = codec::context::Context::from_parameters(stream.parameters())
        .and_then(|c| c.decoder().video())
        .map_err(|e| codec_err("open video decoder", e))?;

    let codec = encoder::find_by_name(video_encoder.codec_name())
        .or_else(|| encoder::find_by_name(VideoEncoder::Software.codec_name()))
        .ok_or_else(|| mf_core::Error::Compression("no H.264 encoder available".into()))?;

    let mut enc = codec::context::Context::new_with_codec(codec)
        .encoder()
        .video()
        .map_err(|e| codec_err("create video encoder", e))?;
    enc.set_width(config.width);
    enc.set_height(config.height);
    enc.set_format(Pixel::YUV420P);
    enc.set_time_base(VIDEO_TIME_BASE);
    enc.set_bit_rate(config.video_bitrate as usize);
    if global_header {
        enc.set_flags(codec::Flags::GLOBAL_HEADER);
    }
    let encoder = enc
        .open_as(codec)
        .map_err(|e| codec_err("open video encoder", e))?;

    let mut ost = octx
        .add_stream(codec)
        .map_err(|e| codec_err("add video stream", e))?;
    ost.set_time_base(VIDEO_TIME_BASE);
    copy_encoder_parameters(&mut ost, &encoder)?;
    let out_index = ost.index();

    Ok(VideoLane {
        in_index: stream.index(),
        out_index,
        in_time_base: stream.time_base(),
        decoder,
        encoder,
        scaler: None,
        width: config.width,
        height: config.height,
    })
}

fn open_audio_lane(
    stream: &format::stream::Stream,
    octx: &mut format::context::Output,
    config: &TranscodeConfig,
    global_header: bool,
) -> mf_core::Result<AudioLane> {
    let decoder = codec::context::Context::from_parameters(stream.parameters())
        .and_then(|c| c.decoder().audio())
        .map_err(|e| codec_err("open audio decoder", e))?;

    let codec = encoder::find(codec::Id::AAC)
        .ok_or_else(|| mf_core::Error::Compression("AAC encoder not available".into()))?;

    let layout = match config.audio_channels {
        1 => ffmpeg::ChannelLayout::MONO,
        _ => ffmpeg::ChannelLayout::STEREO,
    };
    let rate = decoder.rate();

    let mut enc = codec::context::Context::new_with_codec(codec)
        .encoder()
        .audio()
        .map_err(|e| codec_err("create audio encoder", e))?;
    enc.set_ch_layout(layout.clone());
    enc.set_rate(rate as i32);
    enc.set_format(Sample::F32(SampleType::Planar));
    enc.set_bit_rate(config.audio_bitrate as usize);
    enc.set_time_base(Rational(1, rate as i32));
    if global_header {
        enc.set_flags(codec::Flags::GLOBAL_HEADER);
    }
    let encoder = enc
        .open_as(codec)
        .map_err(|e| codec_err("open audio encoder", e))?;
    let frame_size = (encoder.frame_size() as usize).max(1);
    let channels = layout.channels() as usize;

    let mut ost = octx
        .add_stream(codec)
        .map_err(|e| codec_err("add audio stream", e))?;
    ost.set_time_base(Rational(1, rate as i32));
    copy_encoder_parameters(&mut ost, &encoder)?;
    let out_index = ost.index();

    Ok(AudioLane {
        in_index: stream.index(),
        out_index,
        decoder,
        encoder,
        resampler: None,
        layout,
        rate,
        frame_size,
        fifo: vec![Vec::with_capacity(frame_size * 2); channels],
        next_pts: 0,
    })
}

fn copy_encoder_parameters(
    ost: &mut format::stream::StreamMut,
    encoder: &codec::context::Context,
) -> mf_core::Result<()> {
    // SAFETY: both pointers are valid for the duration of the call and the
    // stream owns its codecpar.
    let ret = unsafe {
        ffmpeg::ffi::avcodec_parameters_from_context((*ost.as_mut_ptr()).codecpar, encoder.as_ptr())
    };
    if ret < 0 {
        return Err(mf_core::Error::Compression(
            "failed to copy encoder parameters to output stream".into(),
        ));
    }
    Ok(())
}

/// A decoded frame of either kind.
pub enum NativeFrame {
    Video(frame::Video),
    Audio(frame::Audio),
}

impl MediaSession for NativeSession {
    type Packet = Packet;
    type Frame = NativeFrame;

    fn has_stream(&self, kind: StreamKind) -> bool {
        match kind {
            StreamKind::Video => self.video.is_some(),
            StreamKind::Audio => self.audio.is_some(),
        }
    }

    fn read_packet(&mut self) -> mf_core::Result<Demuxed<Packet>> {
        let mut packet = Packet::empty();
        match packet.read(&mut self.ictx) {
            Ok(()) => {}
            Err(ffmpeg::Error::Eof) => return Ok(Demuxed::End),
            Err(e) => return Err(codec_err("read packet", e)),
        }

        let index = packet.stream();
        if self.video.as_ref().is_some_and(|l| l.in_index == index) {
            Ok(Demuxed::Packet {
                kind: StreamKind::Video,
                packet,
            })
        } else if self.audio.as_ref().is_some_and(|l| l.in_index == index) {
            Ok(Demuxed::Packet {
                kind: StreamKind::Audio,
                packet,
            })
        } else {
            Ok(Demuxed::Ignored)
        }
    }

    fn send_packet(&mut self, kind: StreamKind, packet: Packet) -> mf_core::Result<()> {
        let result = match kind {
            StreamKind::Video => self.video.as_mut().map(|l| l.decoder.send_packet(&packet)),
            StreamKind::Audio => self.audio.as_mut().map(|l| l.decoder.send_packet(&packet)),
        };
        match result {
            Some(Err(e)) => Err(codec_err("decode", e)),
            _ => Ok(()),
        }
    }

    fn send_eof(&mut self, kind: StreamKind) -> mf_core::Result<()> {
        let result = match kind {
            StreamKind::Video => self.video.as_mut().map(|l| l.decoder.send_eof()),
            StreamKind::Audio => self.audio.as_mut().map(|l| l.decoder.send_eof()),
        };
        match result {
            Some(Err(e)) => Err(codec_err("flush decoder", e)),
            _ => Ok(()),
        }
    }

    fn receive_frame(&mut self, kind: StreamKind) -> mf_core::Result<Option<NativeFrame>> {
        match kind {
            StreamKind::Video => {
                let Some(lane) = self.video.as_mut() else {
                    return Ok(None);
                };
                let mut decoded = frame::Video::empty();
                Ok(lane
                    .decoder
                    .receive_frame(&mut decoded)
                    .ok()
                    .map(|()| NativeFrame::Video(decoded)))
            }
            StreamKind::Audio => {
                let Some(lane) = self.audio.as_mut() else {
                    return Ok(None);
                };
                let mut decoded = frame::Audio::empty();
                Ok(lane
                    .decoder
                    .receive_frame(&mut decoded)
                    .ok()
                    .map(|()| NativeFrame::Audio(decoded)))
            }
        }
    }

    fn frame_time(&self, _kind: StreamKind, frame: &NativeFrame) -> Option<f64> {
        match frame {
            NativeFrame::Video(f) => {
                let tb = self.video.as_ref()?.in_time_base;
                f.timestamp().map(|ts| ts as f64 * f64::from(tb))
            }
            NativeFrame::Audio(_) => None,
        }
    }

    fn encode(&mut self, _kind: StreamKind, frame: NativeFrame) -> mf_core::Result<u64> {
        match frame {
            NativeFrame::Video(decoded) => {
                let Some(lane) = self.video.as_mut() else {
                    return Ok(0);
                };
                let time = decoded
                    .timestamp()
                    .map(|ts| ts as f64 * f64::from(lane.in_time_base));
                if lane.scaler.is_none() {
                    lane.scaler = Some(
                        scaling::Context::get(
                            decoded.format(),
                            decoded.width(),
                            decoded.height(),
                            Pixel::YUV420P,
                            lane.width,
                            lane.height,
                            scaling::Flags::BILINEAR,
                        )
                        .map_err(|e| codec_err("create scaler", e))?,
                    );
                }
                let mut scaled = frame::Video::empty();
                if let Some(scaler) = lane.scaler.as_mut() {
                    scaler
                        .run(&decoded, &mut scaled)
                        .map_err(|e| codec_err("scale frame", e))?;
                }
                drop(decoded);
                scaled.set_pts(time.map(|t| (t * 1000.0).round() as i64));
                lane.encoder
                    .send_frame(&scaled)
                    .map_err(|e| codec_err("send video frame", e))?;
                self.drain_video_encoder()
            }
            NativeFrame::Audio(decoded) => {
                let Some(lane) = self.audio.as_mut() else {
                    return Ok(0);
                };
                if lane.resampler.is_none() {
                    lane.resampler = Some(
                        resampling::Context::get2(
                            decoded.format(),
                            decoded.ch_layout(),
                            decoded.rate(),
                            Sample::F32(SampleType::Planar),
                            lane.layout.clone(),
                            lane.rate,
                        )
                        .map_err(|e| codec_err("create resampler", e))?,
                    );
                }
                let mut resampled = frame::Audio::empty();
                if let Some(resampler) = lane.resampler.as_mut() {
                    resampler
                        .run(&decoded, &mut resampled)
                        .map_err(|e| codec_err("resample audio", e))?;
                }
                drop(decoded);
                let samples = resampled.samples();
                for (ch, fifo) in lane.fifo.iter_mut().enumerate() {
                    fifo.extend_from_slice(&resampled.plane::<f32>(ch)[..samples]);
                }
                self.encode_audio_fifo(false)
            }
        }
    }

    fn finish(&mut self) -> mf_core::Result<u64> {
        let mut written = self.encode_audio_fifo(true)?;

        if let Some(lane) = self.video.as_mut() {
            lane.encoder
                .send_eof()
                .map_err(|e| codec_err("flush video encoder", e))?;
        }
        written += self.drain_video_encoder()?;

        if let Some(lane) = self.audio.as_mut() {
            lane.encoder
                .send_eof()
                .map_err(|e| codec_err("flush audio encoder", e))?;
        }
        written += self.drain_audio_encoder()?;

        self.octx
            .write_trailer()
            .map_err(|e| codec_err("write trailer", e))?;
        Ok(written)
    }
}
