//! Renderer seam for the zero-copy display path.
//!
//! The engine never talks to a GPU API directly. A host that wants on-screen
//! rendering supplies a [`Renderer`]; its DMA-BUF capabilities decide which
//! formats and modifiers get advertised, and its import/create calls turn
//! negotiated buffers into textures. Hosts without one still get the CPU
//! paths.

use std::os::fd::BorrowedFd;

use drm_fourcc::DrmFourcc;

/// Texture layouts a renderer is asked to allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureFormat {
    Bgra,
    Rgba,
    Bgrx,
}

/// Modifier sets importable for one DRM format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmaBufFormat {
    pub fourcc: DrmFourcc,
    pub modifiers: Vec<u64>,
}

/// What the renderer can import. `None` from
/// [`Renderer::dmabuf_capabilities`] means shared memory only.
#[derive(Debug, Clone, Default)]
pub struct DmaBufCapabilities {
    /// Buffers without an explicit layout tag can still be imported.
    pub implicit_modifiers: bool,
    pub formats: Vec<DmaBufFormat>,
}

/// One DMA-BUF plane. The fd is borrowed from the transport buffer; an
/// importer that needs it past the call must duplicate it.
#[derive(Debug, Clone, Copy)]
pub struct DmaBufPlane<'a> {
    pub fd: BorrowedFd<'a>,
    pub offset: u32,
    pub stride: u32,
}

/// A complete DMA-BUF frame description handed to the importer.
#[derive(Debug)]
pub struct DmaBufImage<'a> {
    pub width: u32,
    pub height: u32,
    pub drm_format: DrmFourcc,
    /// `None` requests driver-chosen (implicit) layout.
    pub modifier: Option<u64>,
    pub planes: Vec<DmaBufPlane<'a>>,
}

/// An opaque GPU texture. Dropping it releases the GPU resources.
pub trait Texture: Send {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
}

/// GPU backend supplied by the host.
///
/// Calls arrive from two threads, serialized by the session lock: imports and
/// uploads from the stream loop, draws from the host's render pass.
pub trait Renderer: Send {
    fn dmabuf_capabilities(&self) -> Option<DmaBufCapabilities>;

    /// Imports a DMA-BUF frame. `None` reports an import failure, which the
    /// engine answers by narrowing the advertised modifier set and
    /// renegotiating.
    fn import_dmabuf(
        &mut self,
        image: &DmaBufImage<'_>,
        format: TextureFormat,
    ) -> Option<Box<dyn Texture>>;

    /// Uploads pixels into a fresh texture. Used for shared-memory frames
    /// and cursor bitmaps.
    fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        format: TextureFormat,
        data: &[u8],
        stride: u32,
    ) -> Option<Box<dyn Texture>>;

    /// Draws the whole texture at the origin.
    fn draw(&mut self, texture: &dyn Texture, swap_red_blue: bool);

    /// Draws a subregion of the texture, used when a crop rectangle is in
    /// effect.
    fn draw_region(
        &mut self,
        texture: &dyn Texture,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        swap_red_blue: bool,
    );

    /// Draws the whole texture translated to the given position. Cursor
    /// overlays land here with the hotspot already subtracted, so the
    /// coordinates may be negative.
    fn draw_at(&mut self, texture: &dyn Texture, x: i32, y: i32);
}
