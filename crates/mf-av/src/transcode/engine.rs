//! Streaming demux/decode/re-encode/mux loop.
//!
//! The engine pulls one packet at a time from a [`MediaSession`], drains the
//! decoder for that packet, drops video frames that fall before the next
//! sampling instant and encodes the rest immediately. Nothing is buffered
//! across iterations, so the number of decoded frames alive at once does not
//! depend on the input's duration.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

/// Tolerance when comparing frame times against the sampling grid.
const TIME_EPSILON: f64 = 1e-6;

/// Which elementary stream a packet or frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
}

/// Result of reading one packet from the input.
#[derive(Debug)]
pub enum Demuxed<P> {
    Packet { kind: StreamKind, packet: P },
    /// A packet from a stream that is not transcoded (subtitles, data, extra
    /// audio tracks).
    Ignored,
    End,
}

/// One open input/output pair driven by [`run`].
///
/// Implementations wrap a demuxer, one decoder and encoder per transcoded
/// stream, and a muxer. All failures should be reported as
/// [`mf_core::Error::Compression`].
pub trait MediaSession {
    type Packet;
    type Frame;

    fn has_stream(&self, kind: StreamKind) -> bool;

    fn read_packet(&mut self) -> mf_core::Result<Demuxed<Self::Packet>>;

    fn send_packet(&mut self, kind: StreamKind, packet: Self::Packet) -> mf_core::Result<()>;

    /// Signal end of input to the decoder for `kind`.
    fn send_eof(&mut self, kind: StreamKind) -> mf_core::Result<()>;

    /// Next decoded frame, or `None` when the decoder needs more input.
    fn receive_frame(&mut self, kind: StreamKind) -> mf_core::Result<Option<Self::Frame>>;

    /// Presentation time of `frame` in seconds, if known.
    fn frame_time(&self, kind: StreamKind, frame: &Self::Frame) -> Option<f64>;

    /// Encode and mux `frame`; returns the number of packets written.
    fn encode(&mut self, kind: StreamKind, frame: Self::Frame) -> mf_core::Result<u64>;

    /// Flush encoders and finalise the container; returns packets written.
    fn finish(&mut self) -> mf_core::Result<u64>;
}

/// Counters reported by a completed transcode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscodeStats {
    pub packets_read: u64,
    pub packets_ignored: u64,
    pub frames_decoded: u64,
    pub frames_dropped: u64,
    pub video_frames_encoded: u64,
    pub audio_frames_encoded: u64,
    pub packets_written: u64,
    /// Largest number of decoded frames held by the engine at once, counted
    /// from receipt until the frame is encoded or dropped.
    pub peak_in_flight_frames: u64,
}

/// Decoded frames currently owned by the engine.
#[derive(Debug, Default)]
struct InFlight {
    held: u64,
    peak: u64,
}

impl InFlight {
    fn acquire(&mut self) {
        self.held += 1;
        self.peak = self.peak.max(self.held);
    }

    fn release(&mut self) {
        self.held = self.held.saturating_sub(1);
    }
}

/// Decimates a frame sequence to a target rate.
///
/// A frame is kept when its timestamp reaches the next sampling instant; the
/// instant then advances by one interval. After a gap longer than one
/// interval the grid restarts at the kept frame instead of emitting a burst.
#[derive(Debug, Clone)]
pub struct FrameSampler {
    interval: f64,
    next_due: Option<f64>,
}

impl FrameSampler {
    pub fn new(fps: f64) -> Self {
        let interval = if fps > 0.0 { 1.0 / fps } else { 0.0 };
        Self {
            interval,
            next_due: None,
        }
    }

    /// Whether the frame at `time` should be kept.
    ///
    /// Frames without a timestamp cannot be placed on the grid and are
    /// dropped.
    pub fn accept(&mut self, time: Option<f64>) -> bool {
        let Some(t) = time else {
            return false;
        };

        match self.next_due {
            None => {
                self.next_due = Some(t + self.interval);
                true
            }
            Some(due) if t + TIME_EPSILON < due => false,
            Some(due) => {
                let mut next = due + self.interval;
                if next <= t {
                    next = t + self.interval;
                }
                self.next_due = Some(next);
                true
            }
        }
    }
}

/// Drive `session` to completion.
///
/// `abort` is polled between packets; setting it stops the loop with a
/// compression error so the caller can discard the output.
pub fn run<S: MediaSession>(
    session: &mut S,
    fps: f64,
    abort: &AtomicBool,
) -> mf_core::Result<TranscodeStats> {
    let mut stats = TranscodeStats::default();
    let mut sampler = FrameSampler::new(fps);
    let mut in_flight = InFlight::default();

    loop {
        if abort.load(Ordering::Relaxed) {
            return Err(mf_core::Error::Compression("transcode aborted".into()));
        }

        match session.read_packet()? {
            Demuxed::End => break,
            Demuxed::Ignored => stats.packets_ignored += 1,
            Demuxed::Packet { kind, packet } => {
                stats.packets_read += 1;
                session.send_packet(kind, packet)?;
                drain(session, kind, &mut sampler, &mut in_flight, &mut stats)?;
            }
        }
    }

    for kind in [StreamKind::Video, StreamKind::Audio] {
        if session.has_stream(kind) {
            session.send_eof(kind)?;
            drain(session, kind, &mut sampler, &mut in_flight, &mut stats)?;
        }
    }

    stats.packets_written += session.finish()?;
    stats.peak_in_flight_frames = in_flight.peak;
    Ok(stats)
}

fn drain<S: MediaSession>(
    session: &mut S,
    kind: StreamKind,
    sampler: &mut FrameSampler,
    in_flight: &mut InFlight,
    stats: &mut TranscodeStats,
) -> mf_core::Result<()> {
    while let Some(frame) = session.receive_frame(kind)? {
        stats.frames_decoded += 1;
        in_flight.acquire();

        let keep = match kind {
            StreamKind::Video => sampler.accept(session.frame_time(kind, &frame)),
            StreamKind::Audio => true,
        };
        if keep {
            let written = session.encode(kind, frame);
            in_flight.release();
            stats.packets_written += written?;
            match kind {
                StreamKind::Video => stats.video_frames_encoded += 1,
                StreamKind::Audio => stats.audio_frames_encoded += 1,
            }
        } else {
            drop(frame);
            in_flight.release();
            stats.frames_dropped += 1;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    /// Tracks how many synthetic frames are alive.
    #[derive(Default)]
    struct LiveFrames {
        live: AtomicUsize,
        peak: AtomicUsize,
    }

    struct SyntheticFrame {
        time: f64,
        _payload: Vec<u8>,
        counter: Arc<LiveFrames>,
    }

    impl SyntheticFrame {
        fn new(time: f64, counter: &Arc<LiveFrames>) -> Self {
            let live = counter.live.fetch_add(1, Ordering::SeqCst) + 1;
            counter.peak.fetch_max(live, Ordering::SeqCst);
            Self {
                time,
                _payload: vec![0u8; 64 * 1024],
                counter: Arc::clone(counter),
            }
        }
    }

    impl Drop for SyntheticFrame {
        fn drop(&mut self) {
            self.counter.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// A 30 fps video track interleaved with 50 audio packets per second,
    /// generated lazily so the input itself is never held in memory.
    struct SyntheticSession {
        duration: f64,
        next_video: u64,
        next_audio: u64,
        pending: VecDeque<(StreamKind, f64)>,
        decoded: Option<SyntheticFrame>,
        counter: Arc<LiveFrames>,
        fail_encode_at: Option<u64>,
        encoded: u64,
        finished: bool,
    }

    const SOURCE_FPS: f64 = 30.0;
    const AUDIO_PACKET_SECS: f64 = 0.02;

    impl SyntheticSession {
        fn new(duration: f64) -> Self {
            Self {
                duration,
                next_video: 0,
                next_audio: 0,
                pending: VecDeque::new(),
                decoded: None,
                counter: Arc::new(LiveFrames::default()),
                fail_encode_at: None,
                encoded: 0,
                finished: false,
            }
        }
    }

    impl MediaSession for SyntheticSession {
        type Packet = f64;
        type Frame = SyntheticFrame;

        fn has_stream(&self, _kind: StreamKind) -> bool {
            true
        }

        fn read_packet(&mut self) -> mf_core::Result<Demuxed<f64>> {
            let video_t = self.next_video as f64 / SOURCE_FPS;
            let audio_t = self.next_audio as f64 * AUDIO_PACKET_SECS;
            if video_t >= self.duration && audio_t >= self.duration {
                return Ok(Demuxed::End);
            }
            if video_t <= audio_t {
                self.next_video += 1;
                // A subtitle packet every 10 seconds.
                if self.next_video % 300 == 0 {
                    return Ok(Demuxed::Ignored);
                }
                Ok(Demuxed::Packet {
                    kind: StreamKind::Video,
                    packet: video_t,
                })
            } else {
                self.next_audio += 1;
                Ok(Demuxed::Packet {
                    kind: StreamKind::Audio,
                    packet: audio_t,
                })
            }
        }

        fn send_packet(&mut self, kind: StreamKind, packet: f64) -> mf_core::Result<()> {
            self.pending.push_back((kind, packet));
            Ok(())
        }

        fn send_eof(&mut self, _kind: StreamKind) -> mf_core::Result<()> {
            Ok(())
        }

        fn receive_frame(&mut self, kind: StreamKind) -> mf_core::Result<Option<SyntheticFrame>> {
            match self.pending.front() {
                Some((k, _)) if *k == kind => {
                    let (_, t) = self.pending.pop_front().unwrap_or((kind, 0.0));
                    self.decoded = Some(SyntheticFrame::new(t, &self.counter));
                    Ok(self.decoded.take())
                }
                _ => Ok(None),
            }
        }

        fn frame_time(&self, _kind: StreamKind, frame: &SyntheticFrame) -> Option<f64> {
            Some(frame.time)
        }

        fn encode(&mut self, _kind: StreamKind, frame: SyntheticFrame) -> mf_core::Result<u64> {
            self.encoded += 1;
            if Some(self.encoded) == self.fail_encode_at {
                return Err(mf_core::Error::Compression(
                    "Error while encoding frame: Invalid argument".into(),
                ));
            }
            drop(frame);
            Ok(1)
        }

        fn finish(&mut self) -> mf_core::Result<u64> {
            self.finished = true;
            Ok(0)
        }
    }

    fn transcode(duration: f64) -> (TranscodeStats, usize) {
        let mut session = SyntheticSession::new(duration);
        let stats = run(&mut session, 2.0, &AtomicBool::new(false)).unwrap();
        assert!(session.finished);
        assert_eq!(session.counter.live.load(Ordering::SeqCst), 0);
        (stats, session.counter.peak.load(Ordering::SeqCst))
    }

    #[test]
    fn peak_frames_do_not_grow_with_duration() {
        let (short, short_peak) = transcode(1.0);
        let (medium, medium_peak) = transcode(10.0);
        let (long, long_peak) = transcode(100.0);

        assert!(short_peak <= 2, "peak {short_peak}");
        assert_eq!(short_peak, medium_peak);
        assert_eq!(medium_peak, long_peak);

        assert_eq!(short.peak_in_flight_frames, 1);
        assert_eq!(long.peak_in_flight_frames, short.peak_in_flight_frames);
        assert!(long.peak_in_flight_frames as usize <= long_peak);
        assert!(long.frames_decoded > medium.frames_decoded * 9);
    }

    #[test]
    fn empty_input_holds_no_frames() {
        let (stats, peak) = transcode(0.0);
        assert_eq!(stats.frames_decoded, 0);
        assert_eq!(stats.peak_in_flight_frames, 0);
        assert_eq!(peak, 0);
    }

    #[test]
    fn in_flight_gauge_tracks_peak() {
        let mut gauge = InFlight::default();
        gauge.acquire();
        gauge.acquire();
        gauge.release();
        gauge.acquire();
        gauge.release();
        gauge.release();
        assert_eq!(gauge.held, 0);
        assert_eq!(gauge.peak, 2);
    }

    #[test]
    fn video_is_sampled_at_target_rate() {
        let (stats, _) = transcode(10.0);
        // 2 fps over 10 s.
        assert!(
            (19..=21).contains(&stats.video_frames_encoded),
            "encoded {}",
            stats.video_frames_encoded
        );
        assert_eq!(stats.audio_frames_encoded, 500);
        assert_eq!(
            stats.frames_decoded,
            stats.video_frames_encoded + stats.audio_frames_encoded + stats.frames_dropped
        );
        assert_eq!(stats.packets_ignored, 1);
    }

    #[test]
    fn encode_failure_surfaces_codec_message() {
        let mut session = SyntheticSession::new(5.0);
        session.fail_encode_at = Some(7);
        let err = run(&mut session, 2.0, &AtomicBool::new(false)).unwrap_err();
        assert!(matches!(err, mf_core::Error::Compression(_)));
        assert!(err.to_string().contains("Invalid argument"));
        assert!(!session.finished);
        assert_eq!(session.counter.live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn abort_flag_stops_the_loop() {
        let mut session = SyntheticSession::new(5.0);
        let err = run(&mut session, 2.0, &AtomicBool::new(true)).unwrap_err();
        assert!(err.to_string().contains("aborted"));
        assert_eq!(session.next_video + session.next_audio, 0);
    }

    #[test]
    fn sampler_keeps_one_frame_per_interval() {
        let mut sampler = FrameSampler::new(2.0);
        let kept: Vec<f64> = (0..60)
            .map(|i| i as f64 / 30.0)
            .filter(|t| sampler.accept(Some(*t)))
            .collect();
        assert_eq!(kept.len(), 4);
        assert_eq!(kept[0], 0.0);
        assert!((kept[1] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn sampler_resyncs_after_gap() {
        let mut sampler = FrameSampler::new(1.0);
        assert!(sampler.accept(Some(0.0)));
        assert!(sampler.accept(Some(10.0)));
        // No burst to catch up with the missed instants.
        assert!(!sampler.accept(Some(10.5)));
        assert!(sampler.accept(Some(11.0)));
    }

    #[test]
    fn sampler_drops_untimed_frames() {
        let mut sampler = FrameSampler::new(2.0);
        assert!(!sampler.accept(None));
        assert!(sampler.accept(Some(0.0)));
    }
}
