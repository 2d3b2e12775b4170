use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::config::Config;
use crate::error::Result;
use crate::mesh::transport::{
    CandidateInfo, LinkFactory, LinkNotice, LinkNoticeKind, NoticeSender, PeerTransport,
};
use crate::models::{TrackKind, TrackSet};

/// Production link factory backed by webrtc-rs: one peer connection per
/// link, trickle ICE, per-kind sample tracks.
pub struct WebRtcEngine {
    api: Arc<webrtc::api::API>,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcEngine {
    pub fn new(config: &Config) -> Result<Self> {
        // Configure media engine with the default codec set
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        // Create interceptor registry
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        // Create setting engine
        let setting_engine = SettingEngine::default();

        // Build API
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        // Configure ICE servers
        let mut ice_servers = vec![RTCIceServer {
            urls: vec![config.stun_server.clone()],
            ..Default::default()
        }];

        if let Some(turn_server) = &config.turn_server {
            ice_servers.push(RTCIceServer {
                urls: vec![turn_server.clone()],
                username: config.turn_username.clone().unwrap_or_default(),
                credential: config.turn_credential.clone().unwrap_or_default(),
                ..Default::default()
            });
        }

        Ok(Self {
            api: Arc::new(api),
            ice_servers,
        })
    }
}

#[async_trait]
impl LinkFactory for WebRtcEngine {
    async fn open_link(
        &self,
        remote_id: &str,
        notices: NoticeSender,
    ) -> Result<Arc<dyn PeerTransport>> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(RTCConfiguration {
                    ice_servers: self.ice_servers.clone(),
                    ..Default::default()
                })
                .await?,
        );

        // Trickle locally discovered candidates up to the coordinator.
        let candidate_notices = notices.clone();
        let candidate_remote = remote_id.to_string();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let notices = candidate_notices.clone();
            let remote_id = candidate_remote.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = notices.send(LinkNotice {
                                remote_id,
                                kind: LinkNoticeKind::Candidate(CandidateInfo {
                                    candidate: init.candidate,
                                    sdp_mid: init.sdp_mid,
                                    sdp_mline_index: init.sdp_mline_index,
                                }),
                            });
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "Failed to serialize local candidate");
                        }
                    }
                }
            })
        }));

        let state_remote = remote_id.to_string();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let notices = notices.clone();
            let remote_id = state_remote.clone();
            Box::pin(async move {
                tracing::trace!(remote_id = %remote_id, state = %state, "Peer connection state");
                if state == RTCPeerConnectionState::Failed {
                    let _ = notices.send(LinkNotice {
                        remote_id,
                        kind: LinkNoticeKind::TransportFailed {
                            reason: "peer connection failed".to_string(),
                        },
                    });
                }
            })
        }));

        Ok(Arc::new(WebRtcLink {
            pc,
            senders: Mutex::new(HashMap::new()),
        }))
    }
}

/// One peer connection and its per-kind RTP senders.
pub struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<TrackKind, Arc<RTCRtpSender>>>,
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio | TrackKind::ScreenAudio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
            rtcp_feedback: vec![],
        },
        TrackKind::ScreenVideo => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
    }
}

fn track_id(kind: TrackKind) -> &'static str {
    match kind {
        TrackKind::Audio => "audio",
        TrackKind::ScreenVideo => "screen-video",
        TrackKind::ScreenAudio => "screen-audio",
    }
}

#[async_trait]
impl PeerTransport for WebRtcLink {
    async fn sync_tracks(&self, tracks: &TrackSet) -> Result<()> {
        let mut senders = self.senders.lock().await;

        let stale: Vec<TrackKind> = senders
            .keys()
            .copied()
            .filter(|kind| !tracks.contains(*kind))
            .collect();
        for kind in stale {
            if let Some(sender) = senders.remove(&kind) {
                self.pc.remove_track(&sender).await?;
            }
        }

        for kind in tracks.iter() {
            if senders.contains_key(&kind) {
                continue;
            }
            let track = Arc::new(TrackLocalStaticSample::new(
                codec_for(kind),
                track_id(kind).to_string(),
                "voicemesh".to_string(),
            ));
            let sender = self
                .pc
                .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
            senders.insert(kind, sender);
        }

        Ok(())
    }

    async fn create_offer(&self) -> Result<String> {
        let offer = self.pc.create_offer(None).await?;
        let sdp = offer.sdp.clone();
        self.pc.set_local_description(offer).await?;
        Ok(sdp)
    }

    async fn accept_offer(&self, sdp: &str) -> Result<String> {
        let offer = RTCSessionDescription::offer(sdp.to_string())?;
        self.pc.set_remote_description(offer).await?;
        let answer = self.pc.create_answer(None).await?;
        let sdp = answer.sdp.clone();
        self.pc.set_local_description(answer).await?;
        Ok(sdp)
    }

    async fn accept_answer(&self, sdp: &str) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp.to_string())?;
        self.pc.set_remote_description(answer).await?;
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: CandidateInfo) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::debug!(error = %e, "Error closing peer connection");
        }
    }
}
