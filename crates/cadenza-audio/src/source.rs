//! Playback source: the decoded-audio production pipeline.
//!
//! A long-lived decode worker thread pulls packets from the active
//! [`SampleReader`], rate-corrects them, and keeps a lock-free ring buffer
//! filled ahead of the render callback. The render path only ever touches
//! the ring buffer and a handful of atomics, so a control-path file swap or
//! seek can never stall it.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use cadenza_core::SessionParams;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, trace, warn};

use crate::buffer::{shared_ring_buffer, SharedRingBuffer};
use crate::formats::SampleReader;
use crate::resample::Resampler;

/// Ring capacity in samples: a couple of seconds of stereo at 48 kHz.
const RING_CAPACITY: usize = 48_000 * 2 * 2;

/// Notified from the decode worker whenever the running flag flips,
/// including a natural end of stream. Never invoked on the render path.
pub type SourceListener = Box<dyn Fn() + Send + Sync>;

/// Commands from the control path to the decode worker.
enum SourceCommand {
    SetReader {
        reader: Option<Box<dyn SampleReader>>,
        read_ahead: usize,
        source_sample_rate: u32,
    },
    Prepare(SessionParams),
    Release,
    Start,
    Stop,
    Seek(f64),
    Shutdown,
}

/// State shared between the control path, the worker, and the render path.
struct Shared {
    ring: SharedRingBuffer,
    /// Session primed via `prepare`; render yields silence until set.
    prepared: AtomicBool,
    /// Whether `next_block` advances through the stream.
    running: AtomicBool,
    /// Session sample rate, for position arithmetic.
    session_rate: AtomicU32,
    /// Channel count of the active stream (interleaving stride).
    channels: AtomicU32,
    /// Session-rate frames consumed since the stream origin.
    frames_played: AtomicU64,
    /// Start commands issued over this source's lifetime.
    starts_issued: AtomicU64,
}

impl Shared {
    fn position_secs(&self) -> f64 {
        let rate = self.session_rate.load(Ordering::Relaxed);
        if rate == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let secs = self.frames_played.load(Ordering::Relaxed) as f64 / f64::from(rate);
        secs
    }
}

/// File-backed sample producer serving fixed-size blocks to the render path.
///
/// All methods take `&self`; control-path calls are serialized by the owning
/// transport controller, while [`next_block`](Self::next_block) is safe to
/// call concurrently from the render callback.
pub struct PlaybackSource {
    shared: Arc<Shared>,
    command_tx: Sender<SourceCommand>,
    worker: Option<JoinHandle<()>>,
}

impl PlaybackSource {
    /// Spawn the decode worker and return the control-side handle.
    ///
    /// `listener` is invoked from the worker thread on every running-state
    /// change (start/stop taking effect, or the stream draining to its end).
    pub fn new(listener: SourceListener) -> Self {
        let (command_tx, command_rx) = bounded(64);

        let shared = Arc::new(Shared {
            ring: shared_ring_buffer(RING_CAPACITY),
            prepared: AtomicBool::new(false),
            running: AtomicBool::new(false),
            session_rate: AtomicU32::new(0),
            channels: AtomicU32::new(2),
            frames_played: AtomicU64::new(0),
            starts_issued: AtomicU64::new(0),
        });

        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("cadenza-decode".to_string())
            .spawn(move || DecodeWorker::new(command_rx, worker_shared, listener).run())
            .ok();

        if worker.is_none() {
            warn!("Failed to spawn decode worker; source will stay silent");
        }

        Self {
            shared,
            command_tx,
            worker,
        }
    }

    /// Prime the pipeline for a render session. Idempotent; each call fully
    /// reconfigures for the given parameters.
    pub fn prepare(&self, sample_rate: u32, block_size: u32) {
        debug!("Preparing session: {}Hz, block {}", sample_rate, block_size);
        self.shared
            .session_rate
            .store(sample_rate, Ordering::Relaxed);
        self.shared.prepared.store(true, Ordering::Release);
        self.send(SourceCommand::Prepare(SessionParams {
            sample_rate,
            block_size,
        }));
    }

    /// Release session-scoped state. Safe without a prior `prepare`.
    pub fn release(&self) {
        self.shared.prepared.store(false, Ordering::Release);
        self.send(SourceCommand::Release);
    }

    /// Swap in a new reader, or detach with `None` (silence thereafter).
    ///
    /// The previous reader is dropped on the worker thread after the ring is
    /// cleared, so no render call can observe a half-swapped source.
    pub fn set_source(
        &self,
        reader: Option<Box<dyn SampleReader>>,
        read_ahead: usize,
        source_sample_rate: u32,
    ) {
        self.send(SourceCommand::SetReader {
            reader,
            read_ahead,
            source_sample_rate,
        });
    }

    /// Begin advancing on subsequent `next_block` calls.
    pub fn start(&self) {
        self.shared.starts_issued.fetch_add(1, Ordering::Relaxed);
        self.send(SourceCommand::Start);
    }

    /// How many start commands have been issued so far.
    #[cfg(test)]
    pub(crate) fn start_command_count(&self) -> u64 {
        self.shared.starts_issued.load(Ordering::Relaxed)
    }

    /// Halt advancing without resetting the position.
    pub fn stop(&self) {
        self.send(SourceCommand::Stop);
    }

    /// Reposition the stream. Safe concurrently with render pulls.
    pub fn set_position(&self, seconds: f64) {
        self.send(SourceCommand::Seek(seconds));
    }

    /// Current stream position in seconds.
    pub fn position(&self) -> f64 {
        self.shared.position_secs()
    }

    /// Whether the source is currently running (as opposed to paused or
    /// stopped).
    pub fn is_playing(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Real-time entry point: fill `dest` from the current position.
    ///
    /// Returns the number of samples taken from the stream; any shortfall
    /// (underrun, end of stream, paused, unprepared) is zero-filled. Never
    /// allocates and never blocks on I/O.
    pub fn next_block(&self, dest: &mut [f32]) -> usize {
        if !self.shared.prepared.load(Ordering::Acquire)
            || !self.shared.running.load(Ordering::Acquire)
        {
            dest.fill(0.0);
            return 0;
        }

        let channels = self.shared.channels.load(Ordering::Relaxed).max(1) as usize;

        // Only ever consume whole frames so the interleaving phase of the
        // ring stays aligned across callbacks.
        let want = dest.len() - dest.len() % channels;
        let read = self.shared.ring.read(&mut dest[..want]);
        dest[read..].fill(0.0);

        // The worker writes whole frames only, so a drained ring still hands
        // back a frame-aligned count.
        debug_assert_eq!(read % channels, 0);

        if read > 0 {
            self.shared
                .frames_played
                .fetch_add((read / channels) as u64, Ordering::Relaxed);
        }

        read
    }

    // Non-blocking: the worker's listener may be waiting on a lock the
    // caller holds, so the control path must never park on a full channel.
    fn send(&self, command: SourceCommand) {
        if self.command_tx.try_send(command).is_err() {
            warn!("Decode worker unavailable; command dropped");
        }
    }
}

impl Drop for PlaybackSource {
    fn drop(&mut self) {
        let _ = self.command_tx.send(SourceCommand::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// The decode worker: owns the reader, the resampler, and the producer side
/// of the ring buffer.
struct DecodeWorker {
    command_rx: Receiver<SourceCommand>,
    shared: Arc<Shared>,
    listener: SourceListener,
    reader: Option<Box<dyn SampleReader>>,
    resampler: Option<Resampler>,
    session: Option<SessionParams>,
    source_sample_rate: u32,
    /// Interleaving stride of the active stream; ring writes are rounded
    /// down to a multiple of this so frames never split across refills.
    stride: usize,
    /// Target fill level of the ring, in samples.
    read_ahead: usize,
    /// Resampled samples that did not fit into the ring yet.
    staged: Vec<f32>,
    /// Reader reported end of stream; drain the ring then stop.
    at_end: bool,
}

impl DecodeWorker {
    fn new(
        command_rx: Receiver<SourceCommand>,
        shared: Arc<Shared>,
        listener: SourceListener,
    ) -> Self {
        Self {
            command_rx,
            shared,
            listener,
            reader: None,
            resampler: None,
            session: None,
            source_sample_rate: 0,
            stride: 2,
            read_ahead: RING_CAPACITY / 2,
            staged: Vec::new(),
            at_end: false,
        }
    }

    fn run(mut self) {
        debug!("Decode worker started");

        loop {
            let busy = self.shared.running.load(Ordering::Acquire) && self.reader.is_some();
            let timeout = if busy {
                Duration::from_millis(1)
            } else {
                Duration::from_millis(50)
            };

            match self.command_rx.recv_timeout(timeout) {
                Ok(SourceCommand::Shutdown) => break,
                Ok(command) => self.handle_command(command),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("Command channel closed, shutting down");
                    break;
                }
            }

            if self.shared.running.load(Ordering::Acquire) {
                self.fill_ring();

                // Natural end of stream: everything decoded and played out.
                if self.at_end && self.staged.is_empty() && self.shared.ring.is_empty() {
                    info!("Stream reached its end");
                    self.set_running(false);
                }
            }
        }

        debug!("Decode worker stopped");
    }

    fn handle_command(&mut self, command: SourceCommand) {
        match command {
            SourceCommand::SetReader {
                reader,
                read_ahead,
                source_sample_rate,
            } => {
                // Publish order matters: quiesce the ring first, then swap.
                // The render path only reads the ring, so it sees either the
                // old stream's samples or the new one's, never a mixture.
                self.shared.ring.clear();
                self.staged.clear();
                self.at_end = false;

                if let Some(reader) = &reader {
                    let info = reader.info();
                    self.stride = usize::from(info.channels).max(1);
                    self.shared
                        .channels
                        .store(u32::from(info.channels), Ordering::Relaxed);
                    debug!(
                        "Source attached: {}Hz, {} channels",
                        source_sample_rate, info.channels
                    );
                } else {
                    debug!("Source detached");
                }

                // The old reader, if any, is retired here on the worker
                // thread, after the swap is visible to the render path.
                self.reader = reader;
                self.source_sample_rate = source_sample_rate;
                self.read_ahead = read_ahead.clamp(1, RING_CAPACITY);
                self.shared.frames_played.store(0, Ordering::Relaxed);
                self.rebuild_resampler();
            }
            SourceCommand::Prepare(params) => {
                self.session = Some(params);
                self.shared.ring.clear();
                self.staged.clear();
                self.rebuild_resampler();
            }
            SourceCommand::Release => {
                self.session = None;
                self.resampler = None;
                self.shared.ring.clear();
                self.staged.clear();
            }
            SourceCommand::Start => self.set_running(true),
            SourceCommand::Stop => self.set_running(false),
            SourceCommand::Seek(seconds) => self.seek(seconds),
            SourceCommand::Shutdown => {}
        }
    }

    fn set_running(&self, running: bool) {
        let was = self.shared.running.swap(running, Ordering::AcqRel);
        if was != running {
            trace!("Source running: {} -> {}", was, running);
            (self.listener)();
        }
    }

    fn seek(&mut self, seconds: f64) {
        let seconds = seconds.max(0.0);

        if let Some(reader) = self.reader.as_mut() {
            if let Err(e) = reader.seek(seconds) {
                warn!("Seek to {seconds:.2}s failed: {e}");
                return;
            }
            self.at_end = false;
        }

        self.shared.ring.clear();
        self.staged.clear();
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }

        let rate = self.shared.session_rate.load(Ordering::Relaxed);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let frames = (seconds * f64::from(rate)) as u64;
        self.shared.frames_played.store(frames, Ordering::Relaxed);
    }

    fn rebuild_resampler(&mut self) {
        self.resampler = None;

        let (Some(session), Some(reader)) = (self.session, self.reader.as_ref()) else {
            return;
        };

        let source_rate = if self.source_sample_rate > 0 {
            self.source_sample_rate
        } else {
            reader.info().sample_rate
        };

        match Resampler::new(
            source_rate,
            session.sample_rate,
            usize::from(reader.info().channels).max(1),
        ) {
            Ok(resampler) => self.resampler = Some(resampler),
            Err(e) => warn!("Rate correction unavailable: {e}"),
        }
    }

    /// Write whole frames only, so neither a full ring nor a wraparound can
    /// shift the interleaving phase the render path sees.
    fn write_frames(&self, samples: &[f32]) -> usize {
        let free = self.shared.ring.free();
        let writable = samples.len().min(free - free % self.stride);
        self.shared.ring.write(&samples[..writable])
    }

    /// Rate correction buffers internally; drain what it still holds when
    /// the reader runs out, otherwise the stream's tail is lost.
    fn finish_stream(&mut self) {
        let tail = match self.resampler.as_mut() {
            Some(resampler) => match resampler.flush() {
                Ok(tail) => tail,
                Err(e) => {
                    warn!("Flush failed at end of stream: {e}");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        if !tail.is_empty() {
            let written = self.write_frames(&tail);
            self.staged.extend_from_slice(&tail[written..]);
        }

        self.at_end = true;
    }

    /// Keep the ring filled up to the read-ahead target.
    fn fill_ring(&mut self) {
        loop {
            // Flush previously staged samples first.
            if !self.staged.is_empty() {
                let written = self.write_frames(&self.staged);
                self.staged.drain(..written);
                if !self.staged.is_empty() {
                    return; // Ring is full.
                }
            }

            if self.at_end || self.shared.ring.available() >= self.read_ahead {
                return;
            }

            let Some(reader) = self.reader.as_mut() else {
                return;
            };

            let packet = match reader.read_packet() {
                Ok(Some(packet)) => packet,
                Ok(None) => {
                    self.finish_stream();
                    return;
                }
                Err(e) => {
                    // Real-time policy: a broken stream degrades to silence,
                    // it never propagates an error toward the render path.
                    warn!("Reader failed, treating as end of stream: {e}");
                    self.finish_stream();
                    return;
                }
            };

            let converted = match self.resampler.as_mut() {
                Some(resampler) => match resampler.process(&packet) {
                    Ok(converted) => converted,
                    Err(e) => {
                        warn!("Resampling failed, treating as end of stream: {e}");
                        self.at_end = true;
                        return;
                    }
                },
                None => packet,
            };

            if converted.is_empty() {
                continue;
            }

            let written = self.write_frames(&converted);
            if written < converted.len() {
                self.staged.extend_from_slice(&converted[written..]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::float_cmp)]

    use super::*;
    use cadenza_core::{Result, StreamInfo};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    const RATE: u32 = 48_000;

    /// In-memory reader producing constant-value stereo packets.
    struct StubReader {
        frames_left: u64,
        total: u64,
        rate: u32,
    }

    impl StubReader {
        fn new(total_frames: u64) -> Self {
            Self::at_rate(total_frames, RATE)
        }

        fn at_rate(total_frames: u64, rate: u32) -> Self {
            Self {
                frames_left: total_frames,
                total: total_frames,
                rate,
            }
        }
    }

    impl SampleReader for StubReader {
        fn info(&self) -> StreamInfo {
            StreamInfo {
                sample_rate: self.rate,
                channels: 2,
                n_frames: Some(self.total),
            }
        }

        fn read_packet(&mut self) -> Result<Option<Vec<f32>>> {
            if self.frames_left == 0 {
                return Ok(None);
            }
            let frames = self.frames_left.min(256);
            self.frames_left -= frames;
            let samples = usize::try_from(frames).unwrap_or(0) * 2;
            Ok(Some(vec![0.5; samples]))
        }

        fn seek(&mut self, _seconds: f64) -> Result<()> {
            self.frames_left = self.total;
            Ok(())
        }
    }

    fn counting_source() -> (PlaybackSource, Arc<AtomicUsize>) {
        let notifications = Arc::new(AtomicUsize::new(0));
        let seen = notifications.clone();
        let source = PlaybackSource::new(Box::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        (source, notifications)
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_silence_before_prepare() {
        let (source, _) = counting_source();

        let mut block = [1.0f32; 128];
        assert_eq!(source.next_block(&mut block), 0);
        assert!(block.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_silence_when_detached() {
        let (source, _) = counting_source();
        source.prepare(RATE, 512);
        source.start();
        assert!(wait_until(|| source.is_playing()));

        let mut block = [1.0f32; 128];
        assert_eq!(source.next_block(&mut block), 0);
        assert!(block.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_start_produces_samples_and_notifies() {
        let (source, notifications) = counting_source();
        source.prepare(RATE, 512);
        source.set_source(Some(Box::new(StubReader::new(RATE as u64))), 8192, RATE);
        source.start();

        assert!(wait_until(|| source.is_playing()
            && notifications.load(Ordering::SeqCst) == 1));

        let mut block = [0.0f32; 256];
        assert!(wait_until(|| source.next_block(&mut block) > 0));
        assert!(block.iter().any(|&s| s != 0.0));
        assert!(source.position() > 0.0);
    }

    #[test]
    fn test_stop_retains_position() {
        let (source, _) = counting_source();
        source.prepare(RATE, 512);
        source.set_source(Some(Box::new(StubReader::new(RATE as u64))), 8192, RATE);
        source.start();

        let mut block = [0.0f32; 256];
        assert!(wait_until(|| source.next_block(&mut block) > 0));

        source.stop();
        assert!(wait_until(|| !source.is_playing()));

        let position = source.position();
        assert!(position > 0.0);

        // Pulls while stopped are silent and do not advance.
        let mut silent = [1.0f32; 256];
        assert_eq!(source.next_block(&mut silent), 0);
        assert!(silent.iter().all(|&s| s == 0.0));
        assert!((source.position() - position).abs() < f64::EPSILON);
    }

    #[test]
    fn test_set_position_resets() {
        let (source, _) = counting_source();
        source.prepare(RATE, 512);
        source.set_source(Some(Box::new(StubReader::new(RATE as u64))), 8192, RATE);
        source.start();

        let mut block = [0.0f32; 256];
        assert!(wait_until(|| source.next_block(&mut block) > 0));

        source.stop();
        assert!(wait_until(|| !source.is_playing()));

        source.set_position(0.0);
        assert!(wait_until(|| source.position() == 0.0));
    }

    #[test]
    fn test_end_of_stream_stops_and_notifies() {
        let (source, notifications) = counting_source();
        source.prepare(RATE, 512);
        // A very short stream: 512 frames.
        source.set_source(Some(Box::new(StubReader::new(512))), 8192, RATE);
        source.start();
        assert!(wait_until(|| source.is_playing()));

        // Drain until the worker declares the end.
        let mut block = [0.0f32; 512];
        assert!(wait_until(|| {
            let _ = source.next_block(&mut block);
            !source.is_playing()
        }));

        // One notification for start, one for the end-of-stream stop.
        assert!(wait_until(|| notifications.load(Ordering::SeqCst) == 2));
    }

    /// Stereo reader with distinct per-channel markers, emitting odd-sized
    /// packets so ring wraparounds and full-ring splits get exercised.
    struct MarkerReader {
        frames_left: u64,
    }

    impl SampleReader for MarkerReader {
        fn info(&self) -> StreamInfo {
            StreamInfo {
                sample_rate: RATE,
                channels: 2,
                n_frames: None,
            }
        }

        fn read_packet(&mut self) -> Result<Option<Vec<f32>>> {
            if self.frames_left == 0 {
                return Ok(None);
            }
            let frames = self.frames_left.min(333);
            self.frames_left -= frames;
            Ok(Some([1.0f32, -1.0].repeat(usize::try_from(frames).unwrap_or(0))))
        }

        fn seek(&mut self, _seconds: f64) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_interleaving_stays_aligned_across_ring_splits() {
        let (source, _) = counting_source();
        source.prepare(RATE, 512);
        // A read-ahead past the ring capacity keeps the worker packing the
        // ring completely full, forcing writes to split at the boundary.
        source.set_source(
            Some(Box::new(MarkerReader {
                frames_left: u64::from(RATE) * 30,
            })),
            usize::MAX,
            RATE,
        );
        source.start();
        assert!(wait_until(|| source.is_playing()));
        std::thread::sleep(Duration::from_millis(100));

        // Drain several ring capacities in blocks that are not a divisor of
        // the ring size; every frame must keep its channel phase.
        let mut block = [0.0f32; 510];
        let mut consumed = 0usize;
        let deadline = Instant::now() + Duration::from_secs(20);
        while consumed < 1_000_000 && Instant::now() < deadline {
            let read = source.next_block(&mut block);
            assert_eq!(read % 2, 0);
            for frame in block[..read].chunks_exact(2) {
                assert_eq!(frame[0], 1.0);
                assert_eq!(frame[1], -1.0);
            }
            consumed += read;
            if read == 0 {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        assert!(consumed >= 1_000_000);
    }

    #[test]
    fn test_short_resampled_stream_still_plays_out() {
        let (source, _) = counting_source();
        source.prepare(RATE, 512);
        // 500 source frames at 44.1kHz: less than one rate-correction chunk,
        // so the audio only surfaces via the end-of-stream flush.
        source.set_source(Some(Box::new(StubReader::at_rate(500, 44_100))), 8192, 44_100);
        source.start();
        assert!(wait_until(|| source.is_playing()));

        let mut block = [0.0f32; 512];
        let mut saw_audio = false;
        assert!(wait_until(|| {
            let read = source.next_block(&mut block);
            if block[..read].iter().any(|&s| s.abs() > 0.01) {
                saw_audio = true;
            }
            saw_audio
        }));
    }

    #[test]
    fn test_redundant_start_notifies_once() {
        let (source, notifications) = counting_source();
        source.prepare(RATE, 512);
        source.set_source(Some(Box::new(StubReader::new(RATE as u64))), 8192, RATE);

        source.start();
        source.start();
        assert!(wait_until(|| source.is_playing()));
        // Give the worker time to chew through both commands.
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(notifications.load(Ordering::SeqCst), 1);
    }
}
