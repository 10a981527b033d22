//! GStreamer pipeline description for the multicast H.264 receiver

use crate::config::{EncodeMode, SourceConfig};

/// Name of the appsink element the capture code looks up
pub const APPSINK_NAME: &str = "sink";

/// Builds the `gst-launch` style description for `config`.
///
/// ```text
/// udpsrc ! rtp/h264 caps ! rtph264depay ! h264parse ! avdec_h264
///   [! videoscale ! sized caps] ! videoconvert ! <encode tail> ! appsink
/// ```
///
/// In pipeline mode the tail is `I420 ! jpegenc` and scaling happens here;
/// in in-process mode the tail is packed RGB and the encoder scales.
pub fn describe(config: &SourceConfig) -> String {
    let mut desc = format!(
        "udpsrc address={} port={} multicast-iface={} auto-multicast=true \
         ! application/x-rtp,media=video,clock-rate=90000,encoding-name=H264 \
         ! rtph264depay ! h264parse ! avdec_h264",
        config.multicast_address, config.multicast_port, config.interface
    );

    match config.encode {
        EncodeMode::Pipeline => {
            if let Some((width, height)) = config.scaled_dimensions() {
                desc.push_str(&format!(
                    " ! videoscale ! video/x-raw,width={},height={}",
                    width, height
                ));
            }
            desc.push_str(&format!(
                " ! videoconvert ! video/x-raw,format=I420 ! jpegenc quality={}",
                config.quality
            ));
        }
        EncodeMode::InProcess => {
            desc.push_str(" ! videoconvert ! video/x-raw,format=RGB");
        }
    }

    // One buffer, drop older ones: the pipeline never queues behind a slow producer
    desc.push_str(&format!(
        " ! appsink name={} emit-signals=false sync=false max-buffers=1 drop=true",
        APPSINK_NAME
    ));

    desc
}
