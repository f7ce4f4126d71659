//! Codec capability descriptors registered on the SFU's WebRTC media engine.
//!
//! The SFU only forwards RTP — it never decodes or re-encodes media — so this
//! module has no encoder/decoder types. It exists to pin down the exact
//! codec parameters the rest of the system (media engine registration, SDP
//! constraints) must agree on.

use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP9};
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::RTCPFeedback;

/// Opus, 48kHz stereo, payload type 111. The only audio codec registered.
pub const AUDIO_PAYLOAD_TYPE: u8 = 111;

/// VP9 profile 0, payload type 98. The only video codec registered
/// (screen-share is the only video path in this system).
pub const VIDEO_PAYLOAD_TYPE: u8 = 98;

pub fn audio_codec_parameters() -> RTCRtpCodecParameters {
    RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
            rtcp_feedback: vec![],
        },
        payload_type: AUDIO_PAYLOAD_TYPE,
        ..Default::default()
    }
}

pub fn video_codec_parameters() -> RTCRtpCodecParameters {
    RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP9.to_owned(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: "profile-id=0".to_owned(),
            rtcp_feedback: vec![
                RTCPFeedback { typ: "nack".into(), parameter: "".into() },
                RTCPFeedback { typ: "nack".into(), parameter: "pli".into() },
            ],
        },
        payload_type: VIDEO_PAYLOAD_TYPE,
        ..Default::default()
    }
}

pub const fn codec_type_for(kind: vocore_protocol::TrackKind) -> RTPCodecType {
    match kind {
        vocore_protocol::TrackKind::Audio => RTPCodecType::Audio,
        vocore_protocol::TrackKind::Video => RTPCodecType::Video,
    }
}
