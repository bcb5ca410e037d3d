//! Wire-format records and the magic-number framing rules.
//!
//! Every payload format carried over a data pipe starts with the same 32-bit
//! magic so a reader that lands mid-stream can tell valid records from
//! garbage. Fixed-size records are streamed back to back; variable-size
//! payloads (camera frames, point clouds) are a fixed metadata record
//! immediately followed by a payload whose length the metadata describes.

use crate::errors::{PipeError, Result};

/// Spells "VOXL" in ASCII. Cast as a float it is ~5.7e13, a value no sensor
/// field can legitimately take, which is what makes it usable as a frame
/// delimiter.
pub const MAGIC_NUMBER: u32 = 0x564F584C;

// Image format ids shared between servers and clients. Custom values outside
// this list are allowed as long as both ends agree.
pub const IMAGE_FORMAT_RAW8: i16 = 0;
pub const IMAGE_FORMAT_NV12: i16 = 1;
pub const IMAGE_FORMAT_STEREO_RAW8: i16 = 2;
pub const IMAGE_FORMAT_H264: i16 = 3;
pub const IMAGE_FORMAT_H265: i16 = 4;
pub const IMAGE_FORMAT_RAW16: i16 = 5;
pub const IMAGE_FORMAT_NV21: i16 = 6;
pub const IMAGE_FORMAT_JPG: i16 = 7;
pub const IMAGE_FORMAT_YUV422: i16 = 8;
pub const IMAGE_FORMAT_YUV420: i16 = 9;
pub const IMAGE_FORMAT_RGB: i16 = 10;
pub const IMAGE_FORMAT_FLOAT32: i16 = 11;
pub const IMAGE_FORMAT_STEREO_NV21: i16 = 12;
pub const IMAGE_FORMAT_STEREO_RGB: i16 = 13;
pub const IMAGE_FORMAT_YUV422_UYVY: i16 = 14;
pub const IMAGE_FORMAT_STEREO_NV12: i16 = 15;

/// Human-readable name for an image format id.
pub fn image_format_to_string(format: i16) -> &'static str {
    match format {
        IMAGE_FORMAT_RAW8 => "RAW8",
        IMAGE_FORMAT_NV12 => "NV12",
        IMAGE_FORMAT_STEREO_RAW8 => "STEREO_RAW8",
        IMAGE_FORMAT_H264 => "H264",
        IMAGE_FORMAT_H265 => "H265",
        IMAGE_FORMAT_RAW16 => "RAW16",
        IMAGE_FORMAT_NV21 => "NV21",
        IMAGE_FORMAT_JPG => "JPG",
        IMAGE_FORMAT_YUV422 => "YUV422",
        IMAGE_FORMAT_YUV420 => "YUV420",
        IMAGE_FORMAT_RGB => "RGB",
        IMAGE_FORMAT_FLOAT32 => "FLOAT32",
        IMAGE_FORMAT_STEREO_NV21 => "STEREO_NV21",
        IMAGE_FORMAT_STEREO_RGB => "STEREO_RGB",
        IMAGE_FORMAT_YUV422_UYVY => "YUV422_UYVY",
        IMAGE_FORMAT_STEREO_NV12 => "STEREO_NV12",
        _ => "UNKNOWN",
    }
}

/// Metadata record sent before every camera frame. 48 bytes on the wire.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct CameraMeta {
    /// Set to [`MAGIC_NUMBER`]; write helpers fill this in.
    pub magic_number: u32,
    /// Timestamp of the beginning of exposure, clock-monotonic nanoseconds.
    pub timestamp_ns: i64,
    /// Iterator from 0 counting up from the first frame the server produced.
    pub frame_id: i32,
    /// Image width in pixels.
    pub width: i32,
    /// Image height in pixels.
    pub height: i32,
    /// Size of the payload that follows; for stereo this covers both halves.
    pub size_bytes: i32,
    /// Bytes per row.
    pub stride: i32,
    /// Exposure in nanoseconds.
    pub exposure_ns: i64,
    /// ISO gain (100, 200, 400, ...).
    pub gain: i16,
    /// One of the `IMAGE_FORMAT_*` ids.
    pub format: i16,
    /// Expected framerate in hz.
    pub framerate: i16,
    pub reserved: i16,
}

/// Metadata record sent before every point cloud.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct PointCloudMeta {
    /// Set to [`MAGIC_NUMBER`]; write helpers fill this in.
    pub magic_number: u32,
    /// Timestamp in clock-monotonic nanoseconds.
    pub timestamp_ns: i64,
    /// Number of points following this record.
    pub n_points: u32,
    /// One of the [`PointCloudFormat`] ids.
    pub format: u32,
    /// Optional id, meaning is assigned by individual servers.
    pub id: u32,
    /// Optional NUL-padded name of the producing server.
    pub server_name: [u8; 32],
    pub reserved: u32,
}

/// Per-point layout of a point cloud payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointCloudFormat {
    FloatXyz = 0,
    FloatXyzc = 1,
    FloatXyzRgb = 2,
    FloatXyzcRgb = 3,
    FloatXy = 4,
    FloatXyc = 5,
}

impl PointCloudFormat {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::FloatXyz),
            1 => Some(Self::FloatXyzc),
            2 => Some(Self::FloatXyzRgb),
            3 => Some(Self::FloatXyzcRgb),
            4 => Some(Self::FloatXy),
            5 => Some(Self::FloatXyc),
            _ => None,
        }
    }

    /// Bytes occupied by one point in this layout.
    pub fn stride(self) -> usize {
        match self {
            Self::FloatXyz => 12,
            Self::FloatXyzc => 16,
            Self::FloatXyzRgb => 15,
            Self::FloatXyzcRgb => 19,
            Self::FloatXy => 8,
            Self::FloatXyc => 12,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::FloatXyz => "FLOAT_XYZ",
            Self::FloatXyzc => "FLOAT_XYZC",
            Self::FloatXyzRgb => "FLOAT_XYZRGB",
            Self::FloatXyzcRgb => "FLOAT_XYZCRGB",
            Self::FloatXy => "FLOAT_XY",
            Self::FloatXyc => "FLOAT_XYC",
        }
    }
}

/// Expected payload length following a point cloud metadata record.
pub fn point_cloud_size_bytes(meta: &PointCloudMeta) -> Result<usize> {
    let format = meta.format;
    let n_points = meta.n_points;
    let Some(fmt) = PointCloudFormat::from_u32(format) else {
        return Err(PipeError::invalid_arg(format!(
            "unknown point cloud format id {format}"
        )));
    };
    Ok(n_points as usize * fmt.stride())
}

/// Marker for fixed-size wire records that can be validated and re-cast
/// straight out of a pipe read buffer.
///
/// # Safety
///
/// Implementors must be `#[repr(C, packed)]` (alignment 1, no padding) with a
/// `u32` magic number equal to [`MAGIC_NUMBER`] as their first field, so that
/// any byte offset of a read buffer is a valid place to cast from.
pub unsafe trait FixedRecord: Copy + 'static {}

// The two metadata records lead with the magic themselves, so they can be
// picked out of a raw stream the same way fixed payload records are.
unsafe impl FixedRecord for CameraMeta {}
unsafe impl FixedRecord for PointCloudMeta {}

/// Validate a buffer read from a pipe as a run of consecutive `T` records.
///
/// Returns the longest valid prefix re-cast as a typed slice without copying.
/// Readers are expected to size their buffers as a multiple of the record
/// size; a partial record tail is logged and dropped, and a buffer that does
/// not even start with the magic fails outright.
pub fn validate_stream<T: FixedRecord>(buf: &[u8]) -> Result<&[T]> {
    let size = std::mem::size_of::<T>();
    debug_assert_eq!(std::mem::align_of::<T>(), 1, "wire records must be packed");

    if buf.len() < size {
        return Err(PipeError::invalid_arg(format!(
            "buffer of {} bytes cannot hold a {} byte record",
            buf.len(),
            size
        )));
    }

    let mut valid = 0usize;
    while (valid + 1) * size <= buf.len() {
        let off = valid * size;
        let magic = u32::from_ne_bytes(buf[off..off + 4].try_into().expect("4 byte slice"));
        if magic != MAGIC_NUMBER {
            break;
        }
        valid += 1;
    }

    if valid == 0 {
        return Err(PipeError::invalid_arg(
            "no magic number at start of buffer, stream is out of sync",
        ));
    }
    if valid * size < buf.len() && buf.len() % size != 0 {
        tracing::warn!(
            "dropping {} trailing bytes of a partial record",
            buf.len() - valid * size
        );
    }

    // Packed records have alignment 1, so any starting offset is valid.
    let records = unsafe { std::slice::from_raw_parts(buf.as_ptr().cast::<T>(), valid) };
    Ok(records)
}

/// Role of an encoded video frame inside its GOP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodedFrameKind {
    /// SPS/PPS (or VPS) parameter sets a decoder needs before any frame.
    Header,
    /// Intra-coded frame, decodable on its own.
    Intra,
    /// Predicted frame, only decodable after the preceding intra frame.
    Predicted,
}

/// Classify an H264/H265 frame from byte 4 of its payload.
///
/// Returns `None` (with a warning) for byte values that are not a header, I,
/// or P frame; B frames land here until their markers are confirmed.
pub fn classify_encoded_frame(format: i16, payload: &[u8]) -> Option<EncodedFrameKind> {
    let Some(&marker) = payload.get(4) else {
        tracing::warn!("encoded frame of {} bytes is too short to classify", payload.len());
        return None;
    };

    match format {
        IMAGE_FORMAT_H264 => match marker {
            0x67 => Some(EncodedFrameKind::Header),
            0x65 => Some(EncodedFrameKind::Intra),
            0x41 => Some(EncodedFrameKind::Predicted),
            other => {
                tracing::warn!("received frame of unknown type for H264: {:#04x}", other);
                None
            }
        },
        IMAGE_FORMAT_H265 => match marker {
            0x40 => Some(EncodedFrameKind::Header),
            0x26 => Some(EncodedFrameKind::Intra),
            0x02 => Some(EncodedFrameKind::Predicted),
            other => {
                tracing::warn!("received frame of unknown type for H265: {:#04x}", other);
                None
            }
        },
        _ => {
            tracing::warn!(
                "frames in format {} have no encoded frame type",
                image_format_to_string(format)
            );
            None
        }
    }
}

/// View any packed record as raw bytes for writing to a pipe.
pub fn record_bytes<T: FixedRecord>(record: &T) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts((record as *const T).cast::<u8>(), std::mem::size_of::<T>())
    }
}

/// Copy a packed record out of the front of a read buffer.
pub fn record_from_bytes<T: FixedRecord>(buf: &[u8]) -> Option<T> {
    if buf.len() < std::mem::size_of::<T>() {
        return None;
    }
    Some(unsafe { buf.as_ptr().cast::<T>().read_unaligned() })
}

impl CameraMeta {
    pub const SIZE: usize = std::mem::size_of::<CameraMeta>();
}

impl PointCloudMeta {
    pub const SIZE: usize = std::mem::size_of::<PointCloudMeta>();
}

impl Default for CameraMeta {
    fn default() -> Self {
        CameraMeta {
            magic_number: MAGIC_NUMBER,
            timestamp_ns: 0,
            frame_id: 0,
            width: 0,
            height: 0,
            size_bytes: 0,
            stride: 0,
            exposure_ns: 0,
            gain: 0,
            format: IMAGE_FORMAT_RAW8,
            framerate: 0,
            reserved: 0,
        }
    }
}

impl Default for PointCloudMeta {
    fn default() -> Self {
        PointCloudMeta {
            magic_number: MAGIC_NUMBER,
            timestamp_ns: 0,
            n_points: 0,
            format: PointCloudFormat::FloatXyz as u32,
            id: 0,
            server_name: [0; 32],
            reserved: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C, packed)]
    #[derive(Debug, Clone, Copy)]
    struct TestRecord {
        magic_number: u32,
        value: u64,
    }
    unsafe impl FixedRecord for TestRecord {}

    #[test]
    fn test_camera_meta_wire_size() {
        assert_eq!(
            CameraMeta::SIZE,
            48,
            "camera metadata must be exactly 48 bytes on the wire"
        );
        assert_eq!(std::mem::align_of::<CameraMeta>(), 1);
    }

    #[test]
    fn test_point_cloud_meta_wire_size() {
        assert_eq!(PointCloudMeta::SIZE, 60);
        assert_eq!(std::mem::align_of::<PointCloudMeta>(), 1);
    }

    #[test]
    fn test_magic_spells_voxl() {
        assert_eq!(&MAGIC_NUMBER.to_be_bytes(), b"VOXL");
    }

    #[test]
    fn test_validate_stream_counts_records() {
        let records = [
            TestRecord { magic_number: MAGIC_NUMBER, value: 1 },
            TestRecord { magic_number: MAGIC_NUMBER, value: 2 },
            TestRecord { magic_number: MAGIC_NUMBER, value: 3 },
        ];
        let mut buf = Vec::new();
        for r in &records {
            buf.extend_from_slice(record_bytes(r));
        }

        let parsed = validate_stream::<TestRecord>(&buf).unwrap();
        assert_eq!(parsed.len(), 3);
        for (i, r) in parsed.iter().enumerate() {
            let v = r.value;
            assert_eq!(v, (i + 1) as u64);
        }
    }

    #[test]
    fn test_validate_stream_stops_at_bad_magic() {
        let good = TestRecord { magic_number: MAGIC_NUMBER, value: 9 };
        let bad = TestRecord { magic_number: 0xDEADBEEF, value: 10 };
        let mut buf = Vec::new();
        buf.extend_from_slice(record_bytes(&good));
        buf.extend_from_slice(record_bytes(&bad));

        let parsed = validate_stream::<TestRecord>(&buf).unwrap();
        assert_eq!(parsed.len(), 1, "validation must stop at the first bad magic");
    }

    #[test]
    fn test_validate_stream_rejects_garbage() {
        let buf = [0u8; 24];
        assert!(validate_stream::<TestRecord>(&buf).is_err());
        assert!(validate_stream::<TestRecord>(&buf[..4]).is_err());
    }

    #[test]
    fn test_point_cloud_strides() {
        let cases = [
            (PointCloudFormat::FloatXyz, 12),
            (PointCloudFormat::FloatXyzc, 16),
            (PointCloudFormat::FloatXyzRgb, 15),
            (PointCloudFormat::FloatXyzcRgb, 19),
            (PointCloudFormat::FloatXy, 8),
            (PointCloudFormat::FloatXyc, 12),
        ];
        for (fmt, stride) in cases {
            assert_eq!(fmt.stride(), stride, "{} stride", fmt.as_str());
        }
    }

    #[test]
    fn test_point_cloud_size_from_meta() {
        let meta = PointCloudMeta {
            n_points: 100,
            format: PointCloudFormat::FloatXyzc as u32,
            ..Default::default()
        };
        assert_eq!(point_cloud_size_bytes(&meta).unwrap(), 1600);

        let bogus = PointCloudMeta {
            format: 99,
            ..Default::default()
        };
        assert!(point_cloud_size_bytes(&bogus).is_err());
    }

    #[test]
    fn test_h264_frame_classification() {
        let mut payload = [0u8; 16];
        payload[4] = 0x67;
        assert_eq!(
            classify_encoded_frame(IMAGE_FORMAT_H264, &payload),
            Some(EncodedFrameKind::Header)
        );
        payload[4] = 0x65;
        assert_eq!(
            classify_encoded_frame(IMAGE_FORMAT_H264, &payload),
            Some(EncodedFrameKind::Intra)
        );
        payload[4] = 0x41;
        assert_eq!(
            classify_encoded_frame(IMAGE_FORMAT_H264, &payload),
            Some(EncodedFrameKind::Predicted)
        );
        payload[4] = 0x01;
        assert_eq!(classify_encoded_frame(IMAGE_FORMAT_H264, &payload), None);
    }

    #[test]
    fn test_h265_frame_classification() {
        let mut payload = [0u8; 16];
        payload[4] = 0x40;
        assert_eq!(
            classify_encoded_frame(IMAGE_FORMAT_H265, &payload),
            Some(EncodedFrameKind::Header)
        );
        payload[4] = 0x26;
        assert_eq!(
            classify_encoded_frame(IMAGE_FORMAT_H265, &payload),
            Some(EncodedFrameKind::Intra)
        );
        payload[4] = 0x02;
        assert_eq!(
            classify_encoded_frame(IMAGE_FORMAT_H265, &payload),
            Some(EncodedFrameKind::Predicted)
        );
    }

    #[test]
    fn test_unencoded_formats_have_no_frame_kind() {
        let payload = [0u8; 16];
        assert_eq!(classify_encoded_frame(IMAGE_FORMAT_RAW8, &payload), None);
        assert_eq!(classify_encoded_frame(IMAGE_FORMAT_H264, &payload[..3]), None);
    }

    #[test]
    fn test_record_round_trip_through_bytes() {
        let meta = CameraMeta {
            frame_id: 42,
            width: 640,
            height: 480,
            size_bytes: 640 * 480,
            ..Default::default()
        };
        let bytes = record_bytes(&meta);
        assert_eq!(bytes.len(), CameraMeta::SIZE);

        let back: CameraMeta = record_from_bytes(bytes).unwrap();
        let (id, w, h) = (back.frame_id, back.width, back.height);
        assert_eq!((id, w, h), (42, 640, 480));
        assert!(record_from_bytes::<CameraMeta>(&bytes[..10]).is_none());
    }
}
