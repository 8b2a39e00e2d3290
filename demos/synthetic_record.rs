//! Synthetic Record - Records a generated stream in every format
//!
//! Run with: cargo run --example synthetic_record -- [output_dir] [seconds]
//!
//! Publishes a synthetic H.264/AAC stream into an in-process `StreamHub` and
//! lets `RecordService` record it as FLV, MP4, fragmented MP4, HLS and raw
//! elementary streams. Run it twice to see FLV, HLS and raw appends resume
//! the timeline.
//!
//! ```text
//!   generator ──► StreamHub ──events──► RecordService
//!                    │                        │
//!                    └──── frames ──────► 6 recorders ──► output_dir/<format>/live/demo.*
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use stream_record::amf::{self, AmfValue};
use stream_record::media::FlvTag;
use stream_record::{
    FormatPolicy, MediaFrame, RecordConfig, RecordFormat, RecordService, StreamHub, SubscribePolicy,
};

const STREAM: &str = "live/demo";

/// avcC with a minimal SPS/PPS pair
const AVC_RECORD: &[u8] = &[
    0x01, 0x64, 0x00, 0x1F, 0xFF, 0xE1, 0x00, 0x04, 0x67, 0x64, 0x00, 0x1F, 0x01, 0x00, 0x02, 0x68,
    0xEF,
];

/// AAC-LC, 44.1 kHz, stereo
const AAC_CONFIG: &[u8] = &[0x12, 0x10];

const FPS: u32 = 25;

fn metadata_tag() -> FlvTag {
    FlvTag::script(amf::encode_all(&[
        "@setDataFrame".into(),
        "onMetaData".into(),
        AmfValue::EcmaArray(vec![
            ("width".into(), 1280.0.into()),
            ("height".into(), 720.0.into()),
            ("framerate".into(), f64::from(FPS).into()),
            ("encoder".into(), "synthetic_record".into()),
        ]),
    ]))
}

fn video_header_tag() -> FlvTag {
    let mut body = BytesMut::from(&[0x17u8, 0x00, 0, 0, 0][..]);
    body.put_slice(AVC_RECORD);
    FlvTag::video(0, body.freeze())
}

fn audio_header_tag() -> FlvTag {
    let mut body = BytesMut::from(&[0xAFu8, 0x00][..]);
    body.put_slice(AAC_CONFIG);
    FlvTag::audio(0, body.freeze())
}

fn video_tag(timestamp: u32, keyframe: bool) -> FlvTag {
    let (first, nalu) = if keyframe { (0x17, 0x65) } else { (0x27, 0x41) };
    let mut body = BytesMut::with_capacity(64);
    body.put_slice(&[first, 0x01, 0, 0, 0]);
    // one NAL unit with a filler payload
    body.put_u32(48);
    body.put_u8(nalu);
    body.put_bytes(0x88, 47);
    FlvTag::video(timestamp, body.freeze())
}

fn audio_tag(timestamp: u32) -> FlvTag {
    let mut body = BytesMut::with_capacity(32);
    body.put_slice(&[0xAF, 0x01]);
    body.put_bytes(0x21, 24);
    FlvTag::audio(timestamp, body.freeze())
}

/// Publish one tag the way an ingest bridge would
async fn publish_tag(hub: &StreamHub, tag: FlvTag) {
    hub.broadcast(STREAM, MediaFrame::from_flv_tag(&tag)).await;
}

fn config(output_dir: &str) -> RecordConfig {
    let mut config = RecordConfig::default();
    for format in RecordFormat::ALL {
        let dir = PathBuf::from(output_dir).join(format.as_str());
        let policy = FormatPolicy::enabled()
            .path(dir.to_string_lossy())
            .append(format != RecordFormat::Mp4)
            .fragment_duration(Duration::from_secs(2));
        config = config.with_format(format, policy);
    }
    config.with_subscribe(SubscribePolicy {
        wait_timeout_ms: 2_000,
        ..SubscribePolicy::default()
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("stream_record=info".parse()?)
                .add_directive("synthetic_record=info".parse()?),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let output_dir = args.get(1).cloned().unwrap_or_else(|| "./recordings".to_string());
    let seconds: u32 = match args.get(2) {
        Some(s) => s.parse()?,
        None => 6,
    };

    let hub = Arc::new(StreamHub::new());
    let service = RecordService::with_config(hub.clone(), &config(&output_dir))?;
    let runner = tokio::spawn(Arc::clone(&service).run(hub.events()));

    hub.publish(STREAM).await?;

    // give the recorders time to subscribe before the headers go out
    let started = tokio::time::Instant::now();
    while service.active_recordings().await.len() < RecordFormat::ALL.len() {
        if started.elapsed() > Duration::from_secs(2) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tracing::info!(
        recorders = service.active_recordings().await.len(),
        output = %output_dir,
        "Recording started"
    );

    publish_tag(&hub, metadata_tag()).await;
    publish_tag(&hub, video_header_tag()).await;
    publish_tag(&hub, audio_header_tag()).await;

    let frame_interval = 1000 / FPS;
    let mut ticker = tokio::time::interval(Duration::from_millis(u64::from(frame_interval)));
    for i in 0..seconds * FPS {
        ticker.tick().await;
        let timestamp = i * frame_interval;
        publish_tag(&hub, video_tag(timestamp, i % FPS == 0)).await;
        publish_tag(&hub, audio_tag(timestamp + 5)).await;
    }

    hub.unpublish(STREAM).await;
    while !service.active_recordings().await.is_empty() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let stopped = service.shutdown().await;
    runner.abort();
    tracing::info!(stopped = stopped, "Done");
    Ok(())
}
