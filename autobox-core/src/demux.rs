//! Splits decoded messages by kind onto typed subscriber streams.
//!
//! Backpressure is per lane: video uses a single-slot latest-wins
//! channel (a late renderer only ever sees the newest access unit),
//! audio/metadata/commands are push-through. Routing never blocks the
//! transport thread — every send here is non-blocking.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::protocol::{AudioData, CommandValue, MediaPayload, Message, VideoData};

// ── DemuxStreams ─────────────────────────────────────────────────

/// The subscriber ends handed to the pipelines.
pub struct DemuxStreams {
    /// Latest-wins: holds the newest undrawn access unit.
    pub video: watch::Receiver<Option<VideoData>>,
    pub audio: mpsc::UnboundedReceiver<AudioData>,
    pub media: mpsc::UnboundedReceiver<MediaPayload>,
    pub commands: mpsc::UnboundedReceiver<CommandValue>,
}

// ── Demux ────────────────────────────────────────────────────────

/// Message router between the codec and the media pipelines.
pub struct Demux {
    video_tx: watch::Sender<Option<VideoData>>,
    audio_tx: mpsc::UnboundedSender<AudioData>,
    media_tx: mpsc::UnboundedSender<MediaPayload>,
    command_tx: mpsc::UnboundedSender<CommandValue>,
    /// Set once any media lane has carried traffic (pair timeout).
    media_seen: Arc<AtomicBool>,
}

impl Demux {
    pub fn new() -> (Self, DemuxStreams) {
        let (video_tx, video_rx) = watch::channel(None);
        let (audio_tx, audio_rx) = mpsc::unbounded_channel();
        let (media_tx, media_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        (
            Self {
                video_tx,
                audio_tx,
                media_tx,
                command_tx,
                media_seen: Arc::new(AtomicBool::new(false)),
            },
            DemuxStreams {
                video: video_rx,
                audio: audio_rx,
                media: media_rx,
                commands: command_rx,
            },
        )
    }

    /// Route one message.
    ///
    /// Media and command messages are consumed; anything else (session
    /// control: Plugged, BoxInfo, acks…) is handed back to the caller.
    pub fn route(&self, message: Message) -> Option<Message> {
        match message {
            Message::VideoData(v) => {
                self.media_seen.store(true, Ordering::Relaxed);
                self.video_tx.send_replace(Some(v));
                None
            }
            Message::AudioData(a) => {
                self.media_seen.store(true, Ordering::Relaxed);
                let _ = self.audio_tx.send(a);
                None
            }
            Message::MediaData(m) => {
                self.media_seen.store(true, Ordering::Relaxed);
                let _ = self.media_tx.send(m);
                None
            }
            Message::Command(c) => {
                let _ = self.command_tx.send(c);
                None
            }
            other => Some(other),
        }
    }

    /// Shared flag the pair timeout polls.
    pub fn media_seen_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.media_seen)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn video(ts: u32) -> Message {
        Message::VideoData(VideoData {
            width: 800,
            height: 480,
            flags: 0,
            timestamp: ts,
            reserved: 0,
            payload: Bytes::new(),
        })
    }

    #[test]
    fn video_lane_is_latest_wins() {
        let (demux, mut streams) = Demux::new();
        demux.route(video(1));
        demux.route(video(2));
        demux.route(video(3));

        let latest = streams.video.borrow_and_update().clone().unwrap();
        assert_eq!(latest.timestamp, 3);
    }

    #[test]
    fn audio_and_commands_push_through_in_order() {
        let (demux, mut streams) = Demux::new();
        demux.route(Message::AudioData(AudioData::pcm_frame(
            1,
            1,
            Bytes::from_static(&[1, 0]),
        )));
        demux.route(Message::AudioData(AudioData::pcm_frame(
            1,
            1,
            Bytes::from_static(&[2, 0]),
        )));
        demux.route(Message::Command(CommandValue::Siri));

        assert_eq!(
            streams.audio.try_recv().unwrap().data,
            Bytes::from_static(&[1, 0])
        );
        assert_eq!(
            streams.audio.try_recv().unwrap().data,
            Bytes::from_static(&[2, 0])
        );
        assert_eq!(streams.commands.try_recv().unwrap(), CommandValue::Siri);
    }

    #[test]
    fn session_messages_are_handed_back() {
        let (demux, _streams) = Demux::new();
        let back = demux.route(Message::HeartBeat);
        assert_eq!(back, Some(Message::HeartBeat));
        assert_eq!(demux.route(Message::Unplugged), Some(Message::Unplugged));
    }

    #[test]
    fn media_seen_flag_tracks_media_only() {
        let (demux, _streams) = Demux::new();
        let flag = demux.media_seen_flag();
        assert!(!flag.load(Ordering::Relaxed));

        demux.route(Message::Command(CommandValue::Siri));
        assert!(!flag.load(Ordering::Relaxed));

        demux.route(video(1));
        assert!(flag.load(Ordering::Relaxed));
    }
}
