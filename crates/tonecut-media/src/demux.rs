// crates/tonecut-media/src/demux.rs
//
// FfmpegDemuxer: container reading behind the core Demuxer trait. Opens the
// input once, enumerates tracks with their container-reported formats, and
// yields compressed access units for the selected audio track with
// microsecond timestamps taken from the container's sample table.
//
// `seek_to_sync` must report where the seek actually landed, which libavformat
// does not say directly — so after seeking, the next packet is read and
// stashed in a one-AU pushback slot; its timestamp is the landing point and
// `next()` returns it first.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use ffmpeg_the_third as ffmpeg;
use ffmpeg::codec::Id as CodecId;
use ffmpeg::media::Type as MediaType;

use tonecut_core::backend::Demuxer;
use tonecut_core::media_types::{AccessUnit, AuFlags, SourceFormat, TrackFormat};
use tonecut_core::AudioError;

use crate::helpers::seek::seek_to_us;

// ── MIME mapping ──────────────────────────────────────────────────────────────

/// Track MIME from the codec id. Unknown audio codecs map to a generic audio
/// MIME so they still count as audio tracks; non-audio media keeps its kind
/// visible in the track listing.
pub fn mime_for_codec(id: CodecId, medium: MediaType) -> String {
    if medium != MediaType::Audio {
        return match medium {
            MediaType::Video => "video/unknown".into(),
            _ => "application/octet-stream".into(),
        };
    }
    match id {
        CodecId::AAC => "audio/mp4a-latm",
        CodecId::MP3 => "audio/mpeg",
        CodecId::VORBIS => "audio/vorbis",
        CodecId::OPUS => "audio/opus",
        CodecId::FLAC => "audio/flac",
        CodecId::PCM_S16LE
        | CodecId::PCM_S16BE
        | CodecId::PCM_U8
        | CodecId::PCM_S24LE
        | CodecId::PCM_S32LE
        | CodecId::PCM_F32LE => "audio/x-wav",
        _ => "audio/unknown",
    }
    .into()
}

/// Container MIME from libavformat's short format name (a comma-separated
/// alias list such as "mov,mp4,m4a,3gp,3g2,mj2").
pub fn mime_for_container(name: &str) -> &'static str {
    let name = name.to_ascii_lowercase();
    if name.contains("mp4") || name.contains("m4a") || name.contains("mov") {
        "audio/mp4"
    } else if name.contains("mp3") {
        "audio/mpeg"
    } else if name.contains("wav") {
        "audio/x-wav"
    } else if name.contains("ogg") {
        "audio/ogg"
    } else if name.contains("aac") || name.contains("adts") {
        "audio/aac"
    } else if name.contains("flac") {
        "audio/flac"
    } else {
        "application/octet-stream"
    }
}

// ── Demuxer ───────────────────────────────────────────────────────────────────

pub struct FfmpegDemuxer {
    path: PathBuf,
    ictx: ffmpeg::format::context::Input,
    source: SourceFormat,
    tracks: Vec<TrackFormat>,
    selected: Option<usize>,
    /// One-AU pushback slot filled by `seek_to_sync`'s landing probe.
    pending: Option<AccessUnit>,
}

impl std::fmt::Debug for FfmpegDemuxer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FfmpegDemuxer")
            .field("path", &self.path)
            .field("source", &self.source)
            .field("tracks", &self.tracks)
            .field("selected", &self.selected)
            .field("pending", &self.pending)
            .finish()
    }
}

impl FfmpegDemuxer {
    pub fn open(path: &Path) -> Result<Self, AudioError> {
        let ictx = ffmpeg::format::input(&path).map_err(|e| match e {
            ffmpeg::Error::InvalidData => AudioError::UnsupportedFormat(format!(
                "'{}' is not a recognized container",
                path.display()
            )),
            other => AudioError::io(path, other.to_string()),
        })?;

        let tracks: Vec<TrackFormat> = ictx.streams().map(|s| track_format(&s)).collect();

        // Container duration is in AV_TIME_BASE units (microseconds); fall
        // back to the best audio stream's own duration when absent.
        let mut duration_us = ictx.duration();
        if duration_us <= 0 {
            duration_us = ictx
                .streams()
                .best(MediaType::Audio)
                .and_then(|s| stream_duration_us(&s))
                .unwrap_or(0);
        }

        let bit_rate = unsafe { (*ictx.as_ptr()).bit_rate.max(0) as u64 };
        let metadata: BTreeMap<String, String> = ictx
            .metadata()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let source = SourceFormat {
            mime: mime_for_container(ictx.format().name()).to_string(),
            duration_us,
            bit_rate,
            metadata,
        };

        Ok(Self {
            path: path.to_path_buf(),
            ictx,
            source,
            tracks,
            selected: None,
            pending: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn selected_index(&self) -> Option<usize> {
        self.selected
    }

    pub fn selected_track(&self) -> Option<&TrackFormat> {
        self.selected.and_then(|i| self.tracks.get(i))
    }
}

impl Demuxer for FfmpegDemuxer {
    fn source(&self) -> &SourceFormat {
        &self.source
    }

    fn tracks(&self) -> &[TrackFormat] {
        &self.tracks
    }

    fn select(&mut self, track_index: usize) -> Result<(), AudioError> {
        let track = self.tracks.get(track_index).ok_or_else(|| {
            AudioError::InvalidArguments(format!("track {track_index} out of range"))
        })?;
        if !track.mime.starts_with("audio/") {
            return Err(AudioError::UnsupportedFormat(format!(
                "track {track_index} is not audio ({})",
                track.mime
            )));
        }
        self.selected = Some(track_index);
        Ok(())
    }

    fn seek_to_sync(&mut self, time_us: i64) -> Result<i64, AudioError> {
        self.pending = None;
        if !seek_to_us(&mut self.ictx, time_us, "demux") {
            // Reading continues from the current position; the gate discards
            // whatever falls before the range.
            return Ok(0);
        }
        // Probe one AU to learn the landing timestamp, then push it back.
        match self.next()? {
            Some(au) => {
                let landing = au.pts_us;
                self.pending = Some(au);
                Ok(landing)
            }
            None => Ok(time_us),
        }
    }

    fn next(&mut self) -> Result<Option<AccessUnit>, AudioError> {
        if let Some(au) = self.pending.take() {
            return Ok(Some(au));
        }
        let selected = self
            .selected
            .ok_or_else(|| AudioError::Codec("no track selected".into()))?;

        // packets() yields Result<(Stream, Packet)> and ends at EOF; read
        // errors are fatal to the owning pipeline.
        let path = &self.path;
        for result in self.ictx.packets() {
            let (stream, packet) =
                result.map_err(|e| AudioError::io(path, format!("read packet: {e}")))?;
            if stream.index() != selected {
                continue;
            }

            let tb = stream.time_base();
            let pts = packet.pts().or_else(|| packet.dts()).unwrap_or(0);
            let pts_us = (pts as i128 * tb.numerator() as i128 * 1_000_000
                / tb.denominator().max(1) as i128) as i64;

            let data = packet.data().map(|d| d.to_vec()).unwrap_or_default();
            return Ok(Some(AccessUnit {
                data,
                pts_us,
                flags: AuFlags { is_sync: packet.is_key(), is_eos: false },
            }));
        }
        Ok(None)
    }
}

// ── Stream helpers ────────────────────────────────────────────────────────────

fn track_format(stream: &ffmpeg::format::stream::Stream) -> TrackFormat {
    let params = stream.parameters();
    let medium = params.medium();
    let id = params.id();

    // AVCodecParameters has no safe accessors for the audio fields; read the
    // struct directly, as with the video dimensions elsewhere.
    let (sample_rate, channels, bit_rate, codec_specific_data) = unsafe {
        let p = params.as_ptr();
        let csd_size = (*p).extradata_size as usize;
        let csd = if csd_size > 0 && !(*p).extradata.is_null() {
            Some(std::slice::from_raw_parts((*p).extradata, csd_size).to_vec())
        } else {
            None
        };
        (
            (*p).sample_rate.max(0) as u32,
            (*p).ch_layout.nb_channels.max(0) as u16,
            (*p).bit_rate.max(0) as u64,
            csd,
        )
    };

    TrackFormat {
        mime: mime_for_codec(id, medium),
        sample_rate,
        channels,
        bit_rate: (bit_rate > 0).then_some(bit_rate),
        duration_us: stream_duration_us(stream),
        codec_specific_data,
    }
}

fn stream_duration_us(stream: &ffmpeg::format::stream::Stream) -> Option<i64> {
    let duration = stream.duration();
    if duration <= 0 {
        return None;
    }
    let tb = stream.time_base();
    Some(
        (duration as i128 * tb.numerator() as i128 * 1_000_000
            / tb.denominator().max(1) as i128) as i64,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_mime_covers_supported_families() {
        assert_eq!(mime_for_codec(CodecId::AAC, MediaType::Audio), "audio/mp4a-latm");
        assert_eq!(mime_for_codec(CodecId::MP3, MediaType::Audio), "audio/mpeg");
        assert_eq!(mime_for_codec(CodecId::PCM_S16LE, MediaType::Audio), "audio/x-wav");
        assert_eq!(mime_for_codec(CodecId::VORBIS, MediaType::Audio), "audio/vorbis");
        assert_eq!(mime_for_codec(CodecId::H264, MediaType::Video), "video/unknown");
    }

    #[test]
    fn container_mime_matches_format_aliases() {
        assert_eq!(mime_for_container("mov,mp4,m4a,3gp,3g2,mj2"), "audio/mp4");
        assert_eq!(mime_for_container("mp3"), "audio/mpeg");
        assert_eq!(mime_for_container("wav"), "audio/x-wav");
        assert_eq!(mime_for_container("ogg"), "audio/ogg");
        assert_eq!(mime_for_container("aac"), "audio/aac");
        assert_eq!(mime_for_container("matroska,webm"), "application/octet-stream");
    }

    #[test]
    fn open_missing_file_is_io_error() {
        ffmpeg::init().ok();
        let err = FfmpegDemuxer::open(Path::new("/nonexistent/tonecut.mp3")).unwrap_err();
        assert!(matches!(err, AudioError::Io { .. }));
    }
}
