//! Zero-copy GPU frame import.
//!
//! Owns the shared GPU import context (wgpu device/queue plus probed
//! Vulkan capabilities) and turns extracted dmabuf planes into wgpu
//! textures through `VK_EXT_external_memory_dma_buf`. Every plane becomes
//! one single-channel (or packed) texture; the consumer's shaders
//! recombine planes using the color matrix tag carried by the format
//! descriptor.
//!
//! On non-Vulkan backends, or devices without the external-memory
//! extensions, every import attempt reports [`ImportError::NotAvailable`]
//! and the pipeline keeps delivering CPU-mapped frames instead.

use std::any::Any;
use std::ffi::CStr;
use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::dmabuf::{drm_fourcc, DmaBufPlanes, FrameFormat, MappedFrame, DRM_FORMAT_MOD_LINEAR};

const EXT_EXTERNAL_MEMORY_DMA_BUF: &CStr = c"VK_EXT_external_memory_dma_buf";
const KHR_EXTERNAL_MEMORY_FD: &CStr = c"VK_KHR_external_memory_fd";
const EXT_IMAGE_DRM_FORMAT_MODIFIER: &CStr = c"VK_EXT_image_drm_format_modifier";

/// How long to wait for the layout-transition submission before declaring
/// the import failed.
const TRANSITION_FENCE_TIMEOUT_NS: u64 = 1_000_000_000;

/// Errors from the GPU import path. Import failures are per-frame and
/// non-fatal; the affected frame is dropped or handed off CPU-mapped.
#[derive(Debug, Clone, PartialEq)]
pub enum ImportError {
    /// The device/backend cannot import dmabuf memory
    NotAvailable(String),
    /// Raw Vulkan handles could not be reached through the HAL
    HalAccess(String),
    /// Creating or binding a Vulkan object failed
    CreateFailed(String),
    /// The post-import layout transition did not complete
    Transition(String),
}

impl std::fmt::Display for ImportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImportError::NotAvailable(msg) => write!(f, "dmabuf import not available: {msg}"),
            ImportError::HalAccess(msg) => write!(f, "HAL access failed: {msg}"),
            ImportError::CreateFailed(msg) => write!(f, "import object creation failed: {msg}"),
            ImportError::Transition(msg) => write!(f, "image layout transition failed: {msg}"),
        }
    }
}

impl std::error::Error for ImportError {}

/// Shared GPU import context.
///
/// Created once per texture consumer and referenced by every frame imported
/// through it, so the device outlives all imported textures. The submit
/// lock serializes the raw Vulkan queue submissions used for layout
/// transitions; wgpu knows nothing about those and must not race them.
pub struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    submit_lock: Mutex<()>,
    dmabuf_import: bool,
    drm_modifiers: bool,
}

impl GpuContext {
    /// Probes the device's import capabilities and wraps it. Any backend is
    /// accepted; capability getters report what the probe found.
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Arc<Self> {
        let (dmabuf_import, drm_modifiers) = probe_import_extensions(&device);
        info!(dmabuf_import, drm_modifiers, "GPU import context created");
        Arc::new(Self {
            device,
            queue,
            submit_lock: Mutex::new(()),
            dmabuf_import,
            drm_modifiers,
        })
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// True when dmabuf fds can be imported as textures on this device.
    pub fn supports_dmabuf_import(&self) -> bool {
        self.dmabuf_import
    }

    /// True when tiled layouts and non-zero plane offsets are importable.
    pub fn supports_drm_modifiers(&self) -> bool {
        self.drm_modifiers
    }
}

impl std::fmt::Debug for GpuContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuContext")
            .field("dmabuf_import", &self.dmabuf_import)
            .field("drm_modifiers", &self.drm_modifiers)
            .finish()
    }
}

fn probe_import_extensions(device: &wgpu::Device) -> (bool, bool) {
    // SAFETY: the callback only reads the enabled-extension list while the
    // device is alive.
    unsafe {
        device.as_hal::<wgpu::hal::api::Vulkan, _, (bool, bool)>(|hal_device| {
            let Some(hal_device) = hal_device else {
                debug!("not a Vulkan device, dmabuf import disabled");
                return (false, false);
            };
            let extensions = hal_device.enabled_device_extensions();
            let dmabuf = extensions.contains(&EXT_EXTERNAL_MEMORY_DMA_BUF)
                && extensions.contains(&KHR_EXTERNAL_MEMORY_FD);
            let modifiers = dmabuf && extensions.contains(&EXT_IMAGE_DRM_FORMAT_MODIFIER);
            (dmabuf, modifiers)
        })
    }
}

/// Texture shape of one imported plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneDesc {
    pub width: u32,
    pub height: u32,
    pub format: wgpu::TextureFormat,
}

/// Per-plane texture shapes for a frame format.
///
/// Planar luma/chroma planes import as `R8`, interleaved chroma as `RG8`.
/// Packed YUYV imports as a single `RGBA8` texture at half width, two
/// pixels per texel.
pub fn plane_descs(format: &FrameFormat) -> Result<Vec<PlaneDesc>, ImportError> {
    let FrameFormat { fourcc, width, height, .. } = *format;
    let chroma_w = width.div_ceil(2);
    let chroma_h = height.div_ceil(2);

    let descs = match fourcc {
        drm_fourcc::YUV420 | drm_fourcc::YVU420 => vec![
            PlaneDesc { width, height, format: wgpu::TextureFormat::R8Unorm },
            PlaneDesc { width: chroma_w, height: chroma_h, format: wgpu::TextureFormat::R8Unorm },
            PlaneDesc { width: chroma_w, height: chroma_h, format: wgpu::TextureFormat::R8Unorm },
        ],
        drm_fourcc::YUV422 => vec![
            PlaneDesc { width, height, format: wgpu::TextureFormat::R8Unorm },
            PlaneDesc { width: chroma_w, height, format: wgpu::TextureFormat::R8Unorm },
            PlaneDesc { width: chroma_w, height, format: wgpu::TextureFormat::R8Unorm },
        ],
        drm_fourcc::NV12 | drm_fourcc::NV21 => vec![
            PlaneDesc { width, height, format: wgpu::TextureFormat::R8Unorm },
            PlaneDesc { width: chroma_w, height: chroma_h, format: wgpu::TextureFormat::Rg8Unorm },
        ],
        drm_fourcc::YUYV => vec![PlaneDesc {
            width: chroma_w,
            height,
            format: wgpu::TextureFormat::Rgba8Unorm,
        }],
        other => {
            return Err(ImportError::NotAvailable(format!(
                "no plane layout for fourcc 0x{other:08x}"
            )))
        }
    };
    Ok(descs)
}

fn plane_vk_format(format: wgpu::TextureFormat) -> Result<vk::Format, ImportError> {
    match format {
        wgpu::TextureFormat::R8Unorm => Ok(vk::Format::R8_UNORM),
        wgpu::TextureFormat::Rg8Unorm => Ok(vk::Format::R8G8_UNORM),
        wgpu::TextureFormat::Rgba8Unorm => Ok(vk::Format::R8G8B8A8_UNORM),
        other => Err(ImportError::NotAvailable(format!(
            "plane format {other:?} has no Vulkan equivalent"
        ))),
    }
}

/// One imported plane: the texture plus the shape it was created with.
#[derive(Debug)]
pub struct GpuPlane {
    pub texture: wgpu::Texture,
    pub desc: PlaneDesc,
}

/// Presentation transform attached to a frame descriptor. Decode output
/// arrives upright; no crop or rotation is applied in this path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameTransform {
    #[default]
    Identity,
}

/// What the texture consumer binds for one frame.
#[derive(Debug)]
pub struct FrameDescriptor<'a> {
    pub planes: &'a [GpuPlane],
    pub format: FrameFormat,
    pub transform: FrameTransform,
    pub pts: Option<Duration>,
}

/// Holds what must be released exactly once per frame: the context
/// reference and the decode sample keeping the dmabuf memory alive.
#[derive(Default)]
pub(crate) struct ReleaseGuard {
    ctx: Option<Arc<GpuContext>>,
    sample: Option<Arc<dyn Any + Send + Sync>>,
}

impl ReleaseGuard {
    pub(crate) fn new(ctx: Arc<GpuContext>, sample: Arc<dyn Any + Send + Sync>) -> Self {
        Self { ctx: Some(ctx), sample: Some(sample) }
    }

    pub(crate) fn release(&mut self) {
        self.ctx.take();
        self.sample.take();
    }
}

/// Zero-copy imported frame: one texture per plane, plus ownership of the
/// decode sample whose memory the textures alias.
///
/// Dropping the frame releases everything; [`GpuFrame::release`] does the
/// same eagerly and is safe to call more than once.
pub struct GpuFrame {
    planes: Vec<GpuPlane>,
    format: FrameFormat,
    pts: Option<Duration>,
    guard: ReleaseGuard,
}

impl GpuFrame {
    pub fn width(&self) -> u32 {
        self.format.width
    }

    pub fn height(&self) -> u32 {
        self.format.height
    }

    pub fn format(&self) -> &FrameFormat {
        &self.format
    }

    pub fn pts(&self) -> Option<Duration> {
        self.pts
    }

    /// Texture bindings plus presentation transform for the consumer.
    pub fn descriptor(&self) -> FrameDescriptor<'_> {
        FrameDescriptor {
            planes: &self.planes,
            format: self.format,
            transform: FrameTransform::Identity,
            pts: self.pts,
        }
    }

    /// Releases the plane textures, the sample and the context reference.
    /// The Vulkan image and memory behind each texture are freed by the
    /// texture's drop callback once wgpu retires it.
    pub fn release(&mut self) {
        self.planes.clear();
        self.guard.release();
    }
}

impl Drop for GpuFrame {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for GpuFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuFrame")
            .field("format", &self.format)
            .field("planes", &self.planes.len())
            .field("pts", &self.pts)
            .finish()
    }
}

/// A decoded frame on its way to the texture consumer.
#[derive(Debug)]
pub enum VideoFrame {
    /// Imported zero-copy; the consumer binds the plane textures directly.
    Gpu(GpuFrame),
    /// System-memory frame; the consumer uploads the mapped planes itself.
    Mapped(MappedFrame),
}

impl VideoFrame {
    pub fn width(&self) -> u32 {
        match self {
            VideoFrame::Gpu(frame) => frame.width(),
            VideoFrame::Mapped(frame) => frame.width(),
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            VideoFrame::Gpu(frame) => frame.height(),
            VideoFrame::Mapped(frame) => frame.height(),
        }
    }

    pub fn pts(&self) -> Option<Duration> {
        match self {
            VideoFrame::Gpu(frame) => frame.pts(),
            VideoFrame::Mapped(frame) => frame.pts(),
        }
    }
}

/// Imports extracted dmabuf planes as wgpu textures.
///
/// On success the plane fds belong to the Vulkan driver. On failure every
/// fd not yet consumed is closed and already-created objects are destroyed;
/// the pipeline continues with the next frame.
///
/// # Safety
///
/// - `planes` must describe memory that really matches `format` (plane
///   count, offsets, strides); the driver trusts these values.
/// - The dmabuf memory must stay valid until the returned frame is
///   released. Passing the decode sample as `sample` is what guarantees
///   this: the frame holds it until release.
pub unsafe fn import_planes(
    ctx: &Arc<GpuContext>,
    planes: DmaBufPlanes,
    format: &FrameFormat,
    sample: Arc<dyn Any + Send + Sync>,
    pts: Option<Duration>,
) -> Result<GpuFrame, ImportError> {
    if !ctx.dmabuf_import {
        return Err(ImportError::NotAvailable(
            "device lacks VK_EXT_external_memory_dma_buf / VK_KHR_external_memory_fd".to_string(),
        ));
    }

    let descs = plane_descs(format)?;
    if descs.len() != planes.len() {
        return Err(ImportError::NotAvailable(format!(
            "buffer carries {} planes, format 0x{:08x} needs {}",
            planes.len(),
            format.fourcc,
            descs.len()
        )));
    }
    // From here on the fds are managed manually; `layouts` entries are
    // consumed one by one as vkAllocateMemory takes ownership.
    let layouts = planes.take();

    let modifier = format.modifier;
    let needs_modifier_ext =
        modifier != DRM_FORMAT_MOD_LINEAR || layouts.iter().any(|l| l.offset != 0);
    if needs_modifier_ext && !ctx.drm_modifiers {
        close_fds(&layouts, 0);
        return Err(ImportError::NotAvailable(format!(
            "layout (modifier 0x{modifier:x}, plane offsets) needs VK_EXT_image_drm_format_modifier"
        )));
    }

    let hal_planes = ctx.device.as_hal::<wgpu::hal::api::Vulkan, _, Result<
        Vec<wgpu::hal::vulkan::Texture>,
        ImportError,
    >>(|hal_device| {
        let Some(hal_device) = hal_device else {
            close_fds(&layouts, 0);
            return Err(ImportError::HalAccess("not a Vulkan device".to_string()));
        };

        let vk_device = hal_device.raw_device();
        let physical_device = hal_device.raw_physical_device();
        let instance = hal_device.shared_instance().raw_instance();
        let vk_queue = hal_device.raw_queue();
        let queue_family_index = hal_device.queue_family_index();

        // (image, memory) pairs created so far, torn down on any failure.
        let mut created: Vec<(vk::Image, vk::DeviceMemory)> = Vec::with_capacity(layouts.len());
        let fail = |created: &[(vk::Image, vk::DeviceMemory)],
                    layouts: &[crate::dmabuf::PlaneLayout],
                    next_fd: usize,
                    err: ImportError| {
            for &(image, memory) in created {
                vk_device.destroy_image(image, None);
                vk_device.free_memory(memory, None);
            }
            close_fds(layouts, next_fd);
            Err(err)
        };

        for (plane_idx, (layout, desc)) in layouts.iter().zip(&descs).enumerate() {
            let vk_format = match plane_vk_format(desc.format) {
                Ok(f) => f,
                Err(e) => return fail(&created, &layouts, plane_idx, e),
            };

            let mut external_memory_info = vk::ExternalMemoryImageCreateInfo::default()
                .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);

            let plane_layout;
            let mut drm_modifier_info;
            let mut image_create_info = vk::ImageCreateInfo::default()
                .image_type(vk::ImageType::TYPE_2D)
                .format(vk_format)
                .extent(vk::Extent3D { width: desc.width, height: desc.height, depth: 1 })
                .mip_levels(1)
                .array_layers(1)
                .samples(vk::SampleCountFlags::TYPE_1)
                .usage(vk::ImageUsageFlags::SAMPLED)
                .sharing_mode(vk::SharingMode::EXCLUSIVE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .push_next(&mut external_memory_info);

            if needs_modifier_ext {
                plane_layout = vk::SubresourceLayout {
                    offset: layout.offset as u64,
                    size: layout.size as u64,
                    row_pitch: u64::from(layout.stride),
                    array_pitch: 0,
                    depth_pitch: 0,
                };
                drm_modifier_info = vk::ImageDrmFormatModifierExplicitCreateInfoEXT::default()
                    .drm_format_modifier(modifier)
                    .plane_layouts(std::slice::from_ref(&plane_layout));
                image_create_info = image_create_info
                    .tiling(vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT)
                    .push_next(&mut drm_modifier_info);
            } else {
                image_create_info = image_create_info.tiling(vk::ImageTiling::LINEAR);
            }

            let image = match vk_device.create_image(&image_create_info, None) {
                Ok(image) => image,
                Err(e) => {
                    return fail(
                        &created,
                        &layouts,
                        plane_idx,
                        ImportError::CreateFailed(format!("vkCreateImage: {e:?}")),
                    )
                }
            };

            let requirements = vk_device.get_image_memory_requirements(image);
            let memory_type_index = find_memory_type_index(
                instance,
                physical_device,
                requirements.memory_type_bits,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )
            .or_else(|| {
                find_memory_type_index(
                    instance,
                    physical_device,
                    requirements.memory_type_bits,
                    vk::MemoryPropertyFlags::empty(),
                )
            });
            let Some(memory_type_index) = memory_type_index else {
                vk_device.destroy_image(image, None);
                return fail(
                    &created,
                    &layouts,
                    plane_idx,
                    ImportError::CreateFailed("no suitable memory type".to_string()),
                );
            };

            let mut import_info = vk::ImportMemoryFdInfoKHR::default()
                .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
                .fd(layout.fd);
            let allocate_info = vk::MemoryAllocateInfo::default()
                .allocation_size(requirements.size)
                .memory_type_index(memory_type_index)
                .push_next(&mut import_info);

            let memory = match vk_device.allocate_memory(&allocate_info, None) {
                Ok(memory) => memory,
                Err(e) => {
                    vk_device.destroy_image(image, None);
                    return fail(
                        &created,
                        &layouts,
                        plane_idx,
                        ImportError::CreateFailed(format!("vkAllocateMemory (import): {e:?}")),
                    );
                }
            };
            // The fd now belongs to the driver, also if binding fails.

            if let Err(e) = vk_device.bind_image_memory(image, memory, 0) {
                vk_device.destroy_image(image, None);
                vk_device.free_memory(memory, None);
                return fail(
                    &created,
                    &layouts,
                    plane_idx + 1,
                    ImportError::CreateFailed(format!("vkBindImageMemory: {e:?}")),
                );
            }

            created.push((image, memory));
        }

        // External memory arrives in UNDEFINED layout owned by the foreign
        // queue family; one submission moves all planes to shader-readable.
        {
            let _submit = ctx.submit_lock.lock();
            let images: Vec<vk::Image> = created.iter().map(|&(image, _)| image).collect();
            if let Err(e) = transition_to_shader_read(
                vk_device,
                vk_queue,
                queue_family_index,
                &images,
            ) {
                return fail(&created, &layouts, layouts.len(), e);
            }
        }

        let mut hal_textures = Vec::with_capacity(created.len());
        for (&(image, memory), desc) in created.iter().zip(&descs) {
            let texture_desc = wgpu::hal::TextureDescriptor {
                label: Some("dmabuf plane"),
                size: wgpu::Extent3d {
                    width: desc.width,
                    height: desc.height,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: desc.format,
                usage: wgpu::hal::TextureUses::RESOURCE,
                memory_flags: wgpu::hal::MemoryFlags::empty(),
                view_formats: vec![],
            };

            let device_clone = vk_device.clone();
            let drop_callback = Box::new(move || {
                // SAFETY: image and memory were created above and stay
                // untouched until wgpu retires the texture and runs this.
                unsafe {
                    device_clone.destroy_image(image, None);
                    device_clone.free_memory(memory, None);
                }
            });

            hal_textures.push(wgpu::hal::vulkan::Device::texture_from_raw(
                image,
                &texture_desc,
                Some(drop_callback),
            ));
        }
        Ok(hal_textures)
    })?;

    let mut gpu_planes = Vec::with_capacity(hal_planes.len());
    for (hal_texture, desc) in hal_planes.into_iter().zip(descs) {
        let texture_desc = wgpu::TextureDescriptor {
            label: Some("dmabuf plane"),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: desc.format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        };
        let texture = ctx
            .device
            .create_texture_from_hal::<wgpu::hal::api::Vulkan>(hal_texture, &texture_desc);
        gpu_planes.push(GpuPlane { texture, desc });
    }

    debug!(
        width = format.width,
        height = format.height,
        planes = gpu_planes.len(),
        "imported dmabuf frame (fourcc 0x{:08x})",
        format.fourcc
    );

    Ok(GpuFrame {
        planes: gpu_planes,
        format: *format,
        pts,
        guard: ReleaseGuard::new(Arc::clone(ctx), sample),
    })
}

fn close_fds(layouts: &[crate::dmabuf::PlaneLayout], from: usize) {
    for layout in &layouts[from.min(layouts.len())..] {
        // SAFETY: these fds were dup'd for this import and have not been
        // passed to vkAllocateMemory.
        unsafe {
            libc::close(layout.fd);
        }
    }
}

fn find_memory_type_index(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    type_bits: u32,
    properties: vk::MemoryPropertyFlags,
) -> Option<u32> {
    // SAFETY: the physical device comes from the live wgpu adapter.
    let memory = unsafe { instance.get_physical_device_memory_properties(physical_device) };
    (0..memory.memory_type_count).find(|&index| {
        type_bits & (1 << index) != 0
            && memory.memory_types[index as usize].property_flags.contains(properties)
    })
}

/// Moves freshly imported images from UNDEFINED (owned by the external
/// queue family) to SHADER_READ_ONLY_OPTIMAL on our queue family, with a
/// one-shot transient command buffer. Blocks until the submission fences.
///
/// # Safety
///
/// `images` must be bound, alive, and not in use by any other submission;
/// `queue_family_index` must be the family `queue` belongs to.
unsafe fn transition_to_shader_read(
    device: &ash::Device,
    queue: vk::Queue,
    queue_family_index: u32,
    images: &[vk::Image],
) -> Result<(), ImportError> {
    let pool_info = vk::CommandPoolCreateInfo::default()
        .queue_family_index(queue_family_index)
        .flags(vk::CommandPoolCreateFlags::TRANSIENT);
    let pool = device
        .create_command_pool(&pool_info, None)
        .map_err(|e| ImportError::Transition(format!("vkCreateCommandPool: {e:?}")))?;

    let alloc_info = vk::CommandBufferAllocateInfo::default()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);
    let command_buffer = match device.allocate_command_buffers(&alloc_info) {
        Ok(buffers) => buffers[0],
        Err(e) => {
            device.destroy_command_pool(pool, None);
            return Err(ImportError::Transition(format!(
                "vkAllocateCommandBuffers: {e:?}"
            )));
        }
    };

    let begin_info =
        vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    if let Err(e) = device.begin_command_buffer(command_buffer, &begin_info) {
        device.destroy_command_pool(pool, None);
        return Err(ImportError::Transition(format!("vkBeginCommandBuffer: {e:?}")));
    }

    let barriers: Vec<vk::ImageMemoryBarrier<'_>> = images
        .iter()
        .map(|&image| {
            vk::ImageMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::SHADER_READ)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_EXTERNAL)
                .dst_queue_family_index(queue_family_index)
                .image(image)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                })
        })
        .collect();

    device.cmd_pipeline_barrier(
        command_buffer,
        vk::PipelineStageFlags::TOP_OF_PIPE,
        vk::PipelineStageFlags::FRAGMENT_SHADER,
        vk::DependencyFlags::empty(),
        &[],
        &[],
        &barriers,
    );

    if let Err(e) = device.end_command_buffer(command_buffer) {
        device.destroy_command_pool(pool, None);
        return Err(ImportError::Transition(format!("vkEndCommandBuffer: {e:?}")));
    }

    let fence = match device.create_fence(&vk::FenceCreateInfo::default(), None) {
        Ok(fence) => fence,
        Err(e) => {
            device.destroy_command_pool(pool, None);
            return Err(ImportError::Transition(format!("vkCreateFence: {e:?}")));
        }
    };

    let command_buffers = [command_buffer];
    let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
    if let Err(e) = device.queue_submit(queue, &[submit_info], fence) {
        device.destroy_fence(fence, None);
        device.destroy_command_pool(pool, None);
        return Err(ImportError::Transition(format!("vkQueueSubmit: {e:?}")));
    }

    let wait = device.wait_for_fences(&[fence], true, TRANSITION_FENCE_TIMEOUT_NS);
    device.destroy_fence(fence, None);
    device.destroy_command_pool(pool, None);
    match wait {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!("layout transition fence wait failed: {e:?}");
            Err(ImportError::Transition(format!("fence wait: {e:?}")))
        }
    }
}
