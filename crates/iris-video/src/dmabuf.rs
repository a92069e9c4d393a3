//! Decode-format translation and dmabuf plane extraction.
//!
//! Bridges what the decoder negotiated (GStreamer caps) to what the GPU
//! import path consumes: a DRM fourcc, an optional color matrix tag, a DRM
//! format modifier and one file descriptor per plane. Nothing here touches
//! pixel data; buffers that are not dmabuf-backed are handed off through
//! [`MappedFrame`] instead.

use std::os::unix::io::RawFd;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_allocators::DmaBufMemory;
use gstreamer_video as gst_video;
use gstreamer_video::prelude::*;
use tracing::warn;

/// Linear (untiled) layout, the default when caps carry no modifier.
pub const DRM_FORMAT_MOD_LINEAR: u64 = 0;

const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32)
        | (code[1] as u32) << 8
        | (code[2] as u32) << 16
        | (code[3] as u32) << 24
}

/// DRM fourcc codes for the chroma layouts the import path understands.
pub mod drm_fourcc {
    use super::fourcc;

    pub const YUV420: u32 = fourcc(b"YU12");
    pub const YVU420: u32 = fourcc(b"YV12");
    pub const YUV422: u32 = fourcc(b"YU16");
    pub const NV12: u32 = fourcc(b"NV12");
    pub const NV21: u32 = fourcc(b"NV21");
    pub const YUYV: u32 = fourcc(b"YUYV");
}

/// Maps a negotiated pixel format to its DRM fourcc.
///
/// Formats outside this table cannot be imported; the caller logs once and
/// keeps the pipeline running with CPU-mapped hand-off.
pub fn drm_fourcc_for(format: gst_video::VideoFormat) -> Option<u32> {
    match format {
        gst_video::VideoFormat::I420 => Some(drm_fourcc::YUV420),
        gst_video::VideoFormat::Yv12 => Some(drm_fourcc::YVU420),
        gst_video::VideoFormat::Y42b => Some(drm_fourcc::YUV422),
        gst_video::VideoFormat::Nv12 => Some(drm_fourcc::NV12),
        gst_video::VideoFormat::Nv21 => Some(drm_fourcc::NV21),
        gst_video::VideoFormat::Yuy2 => Some(drm_fourcc::YUYV),
        _ => None,
    }
}

/// YUV to RGB conversion matrix family of the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMatrix {
    Bt601,
    Bt709,
    Bt2020,
}

/// Maps negotiated colorimetry to a matrix tag. Unrecognized colorimetry
/// degrades to `None` ("no colorspace") rather than failing the stream.
pub fn color_matrix_for(colorimetry: &gst_video::VideoColorimetry) -> Option<ColorMatrix> {
    match colorimetry.matrix() {
        gst_video::VideoColorMatrix::Bt601 => Some(ColorMatrix::Bt601),
        gst_video::VideoColorMatrix::Bt709 => Some(ColorMatrix::Bt709),
        gst_video::VideoColorMatrix::Bt2020 => Some(ColorMatrix::Bt2020),
        other => {
            warn!(matrix = ?other, "unsupported colorimetry, frames carry no colorspace tag");
            None
        }
    }
}

/// Negotiated stream description consumed by the GPU import path, resolved
/// once per caps event and cached alongside the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFormat {
    pub fourcc: u32,
    pub matrix: Option<ColorMatrix>,
    pub width: u32,
    pub height: u32,
    pub modifier: u64,
}

impl FrameFormat {
    /// Resolves the format descriptor from negotiated caps.
    ///
    /// `None` means the pixel format has no DRM mapping and frames of this
    /// incarnation will not be GPU-imported.
    pub fn from_video_info(info: &gst_video::VideoInfo, caps: &gst::CapsRef) -> Option<Self> {
        let fourcc = match drm_fourcc_for(info.format()) {
            Some(fourcc) => fourcc,
            None => {
                warn!(format = ?info.format(), "pixel format has no DRM fourcc mapping");
                return None;
            }
        };
        Some(Self {
            fourcc,
            matrix: color_matrix_for(&info.colorimetry()),
            width: info.width(),
            height: info.height(),
            modifier: modifier_from_caps(caps),
        })
    }
}

/// Extracts the DRM format modifier from caps.
///
/// DRM-aware decoders negotiate a `drm-format` field shaped like
/// `"NV12:0x0100000000000002"`. A missing or malformed field means a linear
/// layout.
pub fn modifier_from_caps(caps: &gst::CapsRef) -> u64 {
    let Some(structure) = caps.structure(0) else {
        return DRM_FORMAT_MOD_LINEAR;
    };
    let Ok(drm_format) = structure.get::<&str>("drm-format") else {
        return DRM_FORMAT_MOD_LINEAR;
    };
    drm_format
        .split(':')
        .nth(1)
        .and_then(|raw| u64::from_str_radix(raw.trim_start_matches("0x"), 16).ok())
        .unwrap_or(DRM_FORMAT_MOD_LINEAR)
}

/// Layout of one plane inside a dmabuf-backed buffer.
#[derive(Debug, Clone, Copy)]
pub struct PlaneLayout {
    /// Descriptor owned by the containing [`DmaBufPlanes`].
    pub fd: RawFd,
    /// Byte offset of this plane within the memory behind `fd`.
    pub offset: usize,
    /// Row pitch in bytes.
    pub stride: u32,
    /// Size of the memory behind `fd`.
    pub size: usize,
}

/// Per-plane dmabuf descriptors extracted from one decoded buffer.
///
/// Every plane holds its own duplicated fd, also when the decoder packed
/// all planes into a single memory; the GPU driver consumes one descriptor
/// per plane import. Descriptors not consumed via [`DmaBufPlanes::take`]
/// are closed on drop.
#[derive(Debug)]
pub struct DmaBufPlanes {
    planes: Vec<PlaneLayout>,
}

impl DmaBufPlanes {
    pub fn planes(&self) -> &[PlaneLayout] {
        &self.planes
    }

    pub fn len(&self) -> usize {
        self.planes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.planes.is_empty()
    }

    /// Transfers fd ownership to the caller; drop no longer closes them.
    pub(crate) fn take(mut self) -> Vec<PlaneLayout> {
        std::mem::take(&mut self.planes)
    }
}

impl Drop for DmaBufPlanes {
    fn drop(&mut self) {
        for plane in &self.planes {
            // SAFETY: each fd was dup'd by extract_planes and has not been
            // handed to the GPU driver.
            unsafe {
                libc::close(plane.fd);
            }
        }
    }
}

/// Pulls per-plane dmabuf descriptors out of `buffer` without copying.
///
/// `None` covers both "not dmabuf-backed" (system-memory decoder output,
/// fall back to a CPU mapping) and layouts the import path cannot express;
/// the latter are logged.
pub fn extract_planes(
    buffer: &gst::BufferRef,
    info: &gst_video::VideoInfo,
) -> Option<DmaBufPlanes> {
    let n_memory = buffer.n_memory();
    if n_memory == 0 {
        return None;
    }
    if !buffer.peek_memory(0).is_memory_type::<DmaBufMemory>() {
        return None;
    }

    let n_planes = info.n_planes() as usize;
    let single_memory = n_memory == 1;
    if !single_memory && n_memory as usize != n_planes {
        warn!(
            n_memory,
            n_planes, "dmabuf memory count matches neither one nor the plane count"
        );
        return None;
    }

    let mut owned = DmaBufPlanes { planes: Vec::with_capacity(n_planes) };
    for plane_idx in 0..n_planes {
        let mem_idx = if single_memory { 0 } else { plane_idx };
        let memory = buffer.peek_memory(mem_idx);
        let Some(dmabuf) = memory.downcast_memory_ref::<DmaBufMemory>() else {
            warn!(plane = plane_idx, "buffer mixes dmabuf and system memory");
            return None;
        };

        let stride = info.stride()[plane_idx];
        if stride < 0 {
            warn!(plane = plane_idx, stride, "negative stride is not importable");
            return None;
        }

        // One descriptor per plane import; duplicate so the original stays
        // with the GStreamer memory.
        let fd = unsafe { libc::dup(dmabuf.fd()) };
        if fd < 0 {
            warn!(
                "dup of dmabuf fd failed: {}",
                std::io::Error::last_os_error()
            );
            return None;
        }
        owned.planes.push(PlaneLayout {
            fd,
            offset: info.offset()[plane_idx],
            stride: stride as u32,
            size: dmabuf.size(),
        });
    }
    Some(owned)
}

/// Decoded frame kept in system memory, for consumers that upload pixel
/// data themselves. Owns the buffer mapping; plane slices stay valid until
/// drop.
pub struct MappedFrame {
    frame: gst_video::VideoFrame<gst_video::video_frame::Readable>,
}

impl MappedFrame {
    /// Maps `buffer` readably against the negotiated `info`. `None` when
    /// the buffer does not match the info (short buffer, foreign layout).
    pub fn new(buffer: gst::Buffer, info: &gst_video::VideoInfo) -> Option<Self> {
        match gst_video::VideoFrame::from_buffer_readable(buffer, info) {
            Ok(frame) => Some(Self { frame }),
            Err(_) => {
                warn!("decoded buffer does not map against negotiated caps");
                None
            }
        }
    }

    pub fn width(&self) -> u32 {
        self.frame.info().width()
    }

    pub fn height(&self) -> u32 {
        self.frame.info().height()
    }

    pub fn format(&self) -> gst_video::VideoFormat {
        self.frame.info().format()
    }

    pub fn n_planes(&self) -> u32 {
        self.frame.info().n_planes()
    }

    pub fn pts(&self) -> Option<std::time::Duration> {
        self.frame
            .buffer()
            .pts()
            .map(|t| std::time::Duration::from_nanos(t.nseconds()))
    }

    /// Raw bytes of one plane, stride padding included.
    pub fn plane_data(&self, plane: u32) -> Option<&[u8]> {
        self.frame.plane_data(plane).ok()
    }

    /// Row pitch of one plane in bytes.
    pub fn plane_stride(&self, plane: u32) -> Option<i32> {
        self.frame.info().stride().get(plane as usize).copied()
    }
}

impl std::fmt::Debug for MappedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFrame")
            .field("format", &self.format())
            .field("width", &self.width())
            .field("height", &self.height())
            .field("n_planes", &self.n_planes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init() {
        gst::init().unwrap();
    }

    #[test]
    fn fourcc_codes_match_drm_encoding() {
        // Little-endian packing of the ascii code, per drm_fourcc.h.
        assert_eq!(drm_fourcc::YUV420, 0x3231_5559);
        assert_eq!(drm_fourcc::NV12, 0x3231_564e);
        assert_eq!(drm_fourcc::YUYV, 0x5659_5559);
    }

    #[test]
    fn format_table_covers_supported_layouts() {
        init();
        let cases = [
            (gst_video::VideoFormat::I420, drm_fourcc::YUV420),
            (gst_video::VideoFormat::Yv12, drm_fourcc::YVU420),
            (gst_video::VideoFormat::Y42b, drm_fourcc::YUV422),
            (gst_video::VideoFormat::Nv12, drm_fourcc::NV12),
            (gst_video::VideoFormat::Nv21, drm_fourcc::NV21),
            (gst_video::VideoFormat::Yuy2, drm_fourcc::YUYV),
        ];
        for (format, expected) in cases {
            assert_eq!(drm_fourcc_for(format), Some(expected));
        }
        assert_eq!(drm_fourcc_for(gst_video::VideoFormat::Rgba), None);
        assert_eq!(drm_fourcc_for(gst_video::VideoFormat::Gray8), None);
    }

    #[test]
    fn colorimetry_maps_to_matrix_tag() {
        init();
        let bt709: gst_video::VideoColorimetry = "bt709".parse().unwrap();
        assert_eq!(color_matrix_for(&bt709), Some(ColorMatrix::Bt709));

        let bt601: gst_video::VideoColorimetry = "bt601".parse().unwrap();
        assert_eq!(color_matrix_for(&bt601), Some(ColorMatrix::Bt601));

        let bt2020: gst_video::VideoColorimetry = "bt2020".parse().unwrap();
        assert_eq!(color_matrix_for(&bt2020), Some(ColorMatrix::Bt2020));

        // RGB colorimetry has no YUV matrix and degrades to no tag.
        let srgb: gst_video::VideoColorimetry = "sRGB".parse().unwrap();
        assert_eq!(color_matrix_for(&srgb), None);
    }

    #[test]
    fn modifier_parses_from_drm_format_field() {
        init();
        let caps = gst::Caps::builder("video/x-raw")
            .field("drm-format", "NV12:0x0100000000000002")
            .build();
        assert_eq!(modifier_from_caps(&caps), 0x0100_0000_0000_0002);

        let caps = gst::Caps::builder("video/x-raw").build();
        assert_eq!(modifier_from_caps(&caps), DRM_FORMAT_MOD_LINEAR);

        let caps = gst::Caps::builder("video/x-raw")
            .field("drm-format", "NV12")
            .build();
        assert_eq!(modifier_from_caps(&caps), DRM_FORMAT_MOD_LINEAR);

        let caps = gst::Caps::builder("video/x-raw")
            .field("drm-format", "NV12:junk")
            .build();
        assert_eq!(modifier_from_caps(&caps), DRM_FORMAT_MOD_LINEAR);
    }

    #[test]
    fn frame_format_resolves_from_caps_and_info() {
        init();
        let info = gst_video::VideoInfo::builder(gst_video::VideoFormat::Nv12, 1920, 1080)
            .fps(gst::Fraction::new(30, 1))
            .build()
            .unwrap();
        let caps = info.to_caps().unwrap();

        let format = FrameFormat::from_video_info(&info, &caps).unwrap();
        assert_eq!(format.fourcc, drm_fourcc::NV12);
        assert_eq!(format.width, 1920);
        assert_eq!(format.height, 1080);
        assert_eq!(format.modifier, DRM_FORMAT_MOD_LINEAR);
    }

    #[test]
    fn unsupported_format_resolves_to_none() {
        init();
        let info = gst_video::VideoInfo::builder(gst_video::VideoFormat::Rgba, 64, 64)
            .build()
            .unwrap();
        let caps = info.to_caps().unwrap();
        assert!(FrameFormat::from_video_info(&info, &caps).is_none());
    }

    #[test]
    fn system_memory_buffer_yields_no_planes() {
        init();
        let info = gst_video::VideoInfo::builder(gst_video::VideoFormat::I420, 4, 4)
            .build()
            .unwrap();
        let buffer = gst::Buffer::with_size(info.size()).unwrap();
        assert!(extract_planes(&buffer, &info).is_none());

        // A buffer carrying no memory at all is rejected the same way.
        assert!(extract_planes(&gst::Buffer::new(), &info).is_none());
    }

    #[test]
    fn mapped_frame_exposes_planes() {
        init();
        let info = gst_video::VideoInfo::builder(gst_video::VideoFormat::I420, 4, 4)
            .build()
            .unwrap();
        let buffer = gst::Buffer::with_size(info.size()).unwrap();

        let frame = MappedFrame::new(buffer, &info).unwrap();
        assert_eq!(frame.format(), gst_video::VideoFormat::I420);
        assert_eq!(frame.width(), 4);
        assert_eq!(frame.height(), 4);
        assert_eq!(frame.n_planes(), 3);
        assert_eq!(frame.pts(), None);
        assert!(frame.plane_data(0).is_some());
        assert!(frame.plane_data(2).is_some());
        assert!(frame.plane_stride(0).unwrap() >= 4);
    }
}
