//! Raw views over dequeued transport buffers.
//!
//! The safe buffer wrapper exposes data blocks but not metadata regions, and
//! the crop/cursor/header metas are exactly what the capture paths live on.
//! So the process callbacks dequeue raw buffers and this module walks the
//! `spa_buffer` layout once, producing a borrowed [`BufferView`] the adapters
//! consume without further unsafe code.
//!
//! Every view borrows buffer memory owned by the transport. It is only valid
//! between dequeue and requeue of the buffer it was built from.

use std::os::fd::BorrowedFd;
use std::ptr;
use std::slice;

use pipewire::spa::buffer::DataType;
use pipewire::spa::sys as spa_sys;
use pipewire::sys as pw_sys;

use crate::render::DmaBufPlane;

/// One mapped shared-memory plane, sliced to its chunk.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MemoryPlane<'a> {
    pub data: &'a [u8],
    pub stride: u32,
}

/// The data blocks of one buffer, classified by transport.
pub(crate) enum BufferPlanes<'a> {
    /// The primary block carries zero bytes: a metadata-only cycle.
    Empty,
    /// GPU handles, one plane per block.
    DmaBuf(Vec<DmaBufPlane<'a>>),
    /// Mapped shared memory.
    Memory(Vec<MemoryPlane<'a>>),
    /// The block claims bytes but exposes no usable pointer or fd.
    Unmapped,
}

/// Crop rectangle as carried in the buffer, not yet validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CropMeta {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// Cursor bitmap payload attached to a cursor meta.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CursorBitmap<'a> {
    /// Raw SPA video format id of the bitmap pixels.
    pub format: u32,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub data: &'a [u8],
}

/// Cursor state as carried in the buffer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CursorMeta<'a> {
    /// Zero means the cursor is not on this stream right now.
    pub id: u32,
    pub position_x: i32,
    pub position_y: i32,
    pub hotspot_x: i32,
    pub hotspot_y: i32,
    /// Present only on cycles where the cursor shape changed.
    pub bitmap: Option<CursorBitmap<'a>>,
}

impl CursorMeta<'_> {
    pub fn is_valid(&self) -> bool {
        self.id != 0
    }
}

/// Everything the receive adapters read from one dequeued buffer.
pub(crate) struct BufferView<'a> {
    pub planes: BufferPlanes<'a>,
    pub crop: Option<CropMeta>,
    pub cursor: Option<CursorMeta<'a>>,
}

/// Walks a dequeued buffer into a [`BufferView`].
///
/// # Safety
///
/// `buffer` must be a buffer dequeued from a stream and not yet requeued,
/// and the view must not outlive that window.
pub(crate) unsafe fn view_buffer<'a>(buffer: *mut pw_sys::pw_buffer) -> Option<BufferView<'a>> {
    let spa_buf = (*buffer).buffer;
    if spa_buf.is_null() {
        return None;
    }

    Some(BufferView {
        planes: collect_planes(&*spa_buf),
        crop: find_crop_meta(&*spa_buf),
        cursor: find_cursor_meta(&*spa_buf),
    })
}

/// Drains a stream's queue down to the newest buffer.
///
/// Receive paths never work through a backlog: each stale buffer goes back
/// to the transport the moment a newer one turns up, and only the last
/// dequeued buffer is returned for conversion (null when nothing was
/// queued). The caller requeues the returned buffer once it is done with it.
pub(crate) fn drain_to_newest(
    mut dequeue: impl FnMut() -> *mut pw_sys::pw_buffer,
    mut requeue: impl FnMut(*mut pw_sys::pw_buffer),
) -> *mut pw_sys::pw_buffer {
    let mut latest: *mut pw_sys::pw_buffer = ptr::null_mut();
    loop {
        let buffer = dequeue();
        if buffer.is_null() {
            break;
        }
        if !latest.is_null() {
            requeue(latest);
        }
        latest = buffer;
    }
    latest
}

unsafe fn datas<'a>(spa_buf: &spa_sys::spa_buffer) -> &'a [spa_sys::spa_data] {
    if spa_buf.datas.is_null() || spa_buf.n_datas == 0 {
        return &[];
    }
    slice::from_raw_parts(spa_buf.datas, spa_buf.n_datas as usize)
}

/// Mutable data blocks of a dequeued buffer, for the export fill path.
///
/// # Safety
///
/// Same contract as [`view_buffer`].
pub(crate) unsafe fn datas_mut<'a>(buffer: *mut pw_sys::pw_buffer) -> &'a mut [spa_sys::spa_data] {
    let spa_buf = (*buffer).buffer;
    if spa_buf.is_null() || (*spa_buf).datas.is_null() || (*spa_buf).n_datas == 0 {
        return &mut [];
    }
    slice::from_raw_parts_mut((*spa_buf).datas, (*spa_buf).n_datas as usize)
}

unsafe fn collect_planes<'a>(spa_buf: &spa_sys::spa_buffer) -> BufferPlanes<'a> {
    let datas = datas(spa_buf);
    let Some(first) = datas.first() else {
        return BufferPlanes::Empty;
    };
    if first.chunk.is_null() || (*first.chunk).size == 0 {
        return BufferPlanes::Empty;
    }

    if first.type_ == DataType::DmaBuf.as_raw() {
        let mut planes = Vec::with_capacity(datas.len());
        for data in datas {
            if data.fd < 0 || data.chunk.is_null() {
                return BufferPlanes::Unmapped;
            }
            let chunk = &*data.chunk;
            planes.push(DmaBufPlane {
                fd: BorrowedFd::borrow_raw(data.fd as i32),
                offset: chunk.offset,
                stride: chunk.stride.max(0) as u32,
            });
        }
        return BufferPlanes::DmaBuf(planes);
    }

    let mut planes = Vec::with_capacity(datas.len());
    for data in datas {
        if data.data.is_null() || data.chunk.is_null() {
            return BufferPlanes::Unmapped;
        }
        let chunk = &*data.chunk;
        let offset = chunk.offset.min(data.maxsize) as usize;
        let len = (chunk.size as usize).min(data.maxsize as usize - offset);
        planes.push(MemoryPlane {
            data: slice::from_raw_parts(data.data.cast::<u8>().add(offset), len),
            stride: chunk.stride.max(0) as u32,
        });
    }
    BufferPlanes::Memory(planes)
}

/// Finds a metadata region of the given type with at least `min_size` bytes.
unsafe fn find_meta(
    spa_buf: &spa_sys::spa_buffer,
    meta_type: u32,
    min_size: usize,
) -> Option<*mut u8> {
    if spa_buf.metas.is_null() {
        return None;
    }
    let metas = slice::from_raw_parts(spa_buf.metas, spa_buf.n_metas as usize);
    metas
        .iter()
        .find(|meta| {
            meta.type_ == meta_type && meta.size as usize >= min_size && !meta.data.is_null()
        })
        .map(|meta| meta.data.cast::<u8>())
}

unsafe fn find_crop_meta(spa_buf: &spa_sys::spa_buffer) -> Option<CropMeta> {
    let data = find_meta(
        spa_buf,
        spa_sys::SPA_META_VideoCrop,
        std::mem::size_of::<spa_sys::spa_meta_region>(),
    )?;
    let region = &*data.cast::<spa_sys::spa_meta_region>();
    Some(CropMeta {
        x: region.region.position.x,
        y: region.region.position.y,
        width: region.region.size.width,
        height: region.region.size.height,
    })
}

unsafe fn find_cursor_meta<'a>(spa_buf: &spa_sys::spa_buffer) -> Option<CursorMeta<'a>> {
    if spa_buf.metas.is_null() {
        return None;
    }
    let meta = slice::from_raw_parts(spa_buf.metas, spa_buf.n_metas as usize)
        .iter()
        .find(|meta| {
            meta.type_ == spa_sys::SPA_META_Cursor
                && meta.size as usize >= std::mem::size_of::<spa_sys::spa_meta_cursor>()
                && !meta.data.is_null()
        })?;
    let cursor = &*meta.data.cast::<spa_sys::spa_meta_cursor>();

    let mut bitmap = None;
    let bitmap_end =
        cursor.bitmap_offset as usize + std::mem::size_of::<spa_sys::spa_meta_bitmap>();
    if cursor.bitmap_offset != 0 && bitmap_end <= meta.size as usize {
        let raw = &*meta
            .data
            .cast::<u8>()
            .add(cursor.bitmap_offset as usize)
            .cast::<spa_sys::spa_meta_bitmap>();
        let stride = raw.stride.max(0) as u32;
        let pixel_bytes = stride as usize * raw.size.height as usize;
        let pixels_end = cursor.bitmap_offset as usize + raw.offset as usize + pixel_bytes;
        if raw.size.width > 0 && raw.size.height > 0 && pixels_end <= meta.size as usize {
            let data = slice::from_raw_parts(
                (raw as *const spa_sys::spa_meta_bitmap)
                    .cast::<u8>()
                    .add(raw.offset as usize),
                pixel_bytes,
            );
            bitmap = Some(CursorBitmap {
                format: raw.format,
                width: raw.size.width,
                height: raw.size.height,
                stride,
                data,
            });
        }
    }

    Some(CursorMeta {
        id: cursor.id,
        position_x: cursor.position.x,
        position_y: cursor.position.y,
        hotspot_x: cursor.hotspot.x,
        hotspot_y: cursor.hotspot.y,
        bitmap,
    })
}

/// Header meta of a dequeued buffer, writable, for export timestamps.
///
/// # Safety
///
/// Same contract as [`view_buffer`].
pub(crate) unsafe fn header_meta_mut<'a>(
    buffer: *mut pw_sys::pw_buffer,
) -> Option<&'a mut spa_sys::spa_meta_header> {
    let spa_buf = (*buffer).buffer;
    if spa_buf.is_null() {
        return None;
    }
    let data = find_meta(
        &*spa_buf,
        spa_sys::SPA_META_Header,
        std::mem::size_of::<spa_sys::spa_meta_header>(),
    )?;
    Some(&mut *data.cast::<spa_sys::spa_meta_header>())
}

/// Hand-built buffers for exercising the walk and fill paths without a
/// running daemon.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::mem::size_of;

    /// Backing storage for a hand-built single-block buffer.
    pub(crate) struct FakeBuffer {
        pixels: Box<[u8]>,
        _chunk: Box<spa_sys::spa_chunk>,
        _datas: Box<[spa_sys::spa_data]>,
        _metas: Box<[spa_sys::spa_meta]>,
        meta_payloads: Vec<Box<[u8]>>,
        spa_buf: Box<spa_sys::spa_buffer>,
        pw_buf: pw_sys::pw_buffer,
    }

    impl FakeBuffer {
        pub fn new(pixels: Vec<u8>, chunk_size: u32, stride: i32) -> Self {
            let mut pixels = pixels.into_boxed_slice();
            let mut chunk: Box<spa_sys::spa_chunk> = Box::new(unsafe { std::mem::zeroed() });
            chunk.offset = 0;
            chunk.size = chunk_size;
            chunk.stride = stride;

            let mut data: spa_sys::spa_data = unsafe { std::mem::zeroed() };
            data.type_ = DataType::MemPtr.as_raw();
            data.fd = -1;
            data.maxsize = pixels.len() as u32;
            data.data = pixels.as_mut_ptr().cast();
            data.chunk = chunk.as_mut() as *mut _;

            let mut datas = vec![data].into_boxed_slice();
            let mut spa_buf: Box<spa_sys::spa_buffer> = Box::new(unsafe { std::mem::zeroed() });
            spa_buf.n_datas = 1;
            spa_buf.datas = datas.as_mut_ptr();

            let mut pw_buf: pw_sys::pw_buffer = unsafe { std::mem::zeroed() };
            pw_buf.buffer = spa_buf.as_mut() as *mut _;

            Self {
                pixels,
                _chunk: chunk,
                _datas: datas,
                _metas: Box::new([]),
                meta_payloads: Vec::new(),
                spa_buf,
                pw_buf,
            }
        }

        pub fn with_metas(mut self, payloads: Vec<(u32, Box<[u8]>)>) -> Self {
            let mut metas = Vec::with_capacity(payloads.len());
            let mut kept = Vec::with_capacity(payloads.len());
            for (meta_type, mut payload) in payloads {
                let mut meta: spa_sys::spa_meta = unsafe { std::mem::zeroed() };
                meta.type_ = meta_type;
                meta.size = payload.len() as u32;
                meta.data = payload.as_mut_ptr().cast();
                metas.push(meta);
                kept.push(payload);
            }
            self._metas = metas.into_boxed_slice();
            self.meta_payloads = kept;
            self.spa_buf.n_metas = self._metas.len() as u32;
            self.spa_buf.metas = self._metas.as_mut_ptr();
            self
        }

        pub fn ptr(&mut self) -> *mut pw_sys::pw_buffer {
            &mut self.pw_buf as *mut _
        }

        /// The data block's backing bytes, for asserting on filled output.
        pub fn pixels(&self) -> &[u8] {
            &self.pixels
        }
    }

    pub(crate) fn crop_payload(x: i32, y: i32, width: u32, height: u32) -> Box<[u8]> {
        let mut region: spa_sys::spa_meta_region = unsafe { std::mem::zeroed() };
        region.region.position.x = x;
        region.region.position.y = y;
        region.region.size.width = width;
        region.region.size.height = height;
        let bytes = unsafe {
            slice::from_raw_parts(
                (&region as *const spa_sys::spa_meta_region).cast::<u8>(),
                size_of::<spa_sys::spa_meta_region>(),
            )
        };
        bytes.to_vec().into_boxed_slice()
    }

    pub(crate) fn cursor_payload(
        id: u32,
        pos: (i32, i32),
        hotspot: (i32, i32),
        bitmap: Option<(u32, u32)>,
    ) -> Box<[u8]> {
        let cursor_len = size_of::<spa_sys::spa_meta_cursor>();
        let bitmap_len = size_of::<spa_sys::spa_meta_bitmap>();

        let mut cursor: spa_sys::spa_meta_cursor = unsafe { std::mem::zeroed() };
        cursor.id = id;
        cursor.position.x = pos.0;
        cursor.position.y = pos.1;
        cursor.hotspot.x = hotspot.0;
        cursor.hotspot.y = hotspot.1;

        let total = match bitmap {
            Some((w, h)) => {
                cursor.bitmap_offset = cursor_len as u32;
                cursor_len + bitmap_len + (w * h * 4) as usize
            }
            None => cursor_len,
        };
        let mut payload = vec![0u8; total];
        unsafe {
            std::ptr::copy_nonoverlapping(
                (&cursor as *const spa_sys::spa_meta_cursor).cast::<u8>(),
                payload.as_mut_ptr(),
                cursor_len,
            );
        }
        if let Some((w, h)) = bitmap {
            let mut bm: spa_sys::spa_meta_bitmap = unsafe { std::mem::zeroed() };
            bm.format = pipewire::spa::param::video::VideoFormat::BGRA.as_raw();
            bm.size.width = w;
            bm.size.height = h;
            bm.stride = (w * 4) as i32;
            bm.offset = bitmap_len as u32;
            unsafe {
                std::ptr::copy_nonoverlapping(
                    (&bm as *const spa_sys::spa_meta_bitmap).cast::<u8>(),
                    payload.as_mut_ptr().add(cursor_len),
                    bitmap_len,
                );
            }
            for byte in payload.iter_mut().skip(cursor_len + bitmap_len) {
                *byte = 0xab;
            }
        }
        payload.into_boxed_slice()
    }

    pub(crate) fn header_payload() -> Box<[u8]> {
        vec![0u8; size_of::<spa_sys::spa_meta_header>()].into_boxed_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::collections::VecDeque;

    #[test]
    fn test_drain_keeps_only_newest_buffer() {
        let mut first = FakeBuffer::new(vec![1u8; 16], 16, 16);
        let mut second = FakeBuffer::new(vec![2u8; 16], 16, 16);
        let mut third = FakeBuffer::new(vec![3u8; 16], 16, 16);
        let mut queue = VecDeque::from([first.ptr(), second.ptr(), third.ptr()]);

        let mut requeued = Vec::new();
        let newest = drain_to_newest(
            || queue.pop_front().unwrap_or(ptr::null_mut()),
            |stale| requeued.push(stale),
        );

        assert_eq!(newest, third.ptr(), "only the last buffer is converted");
        assert_eq!(
            requeued,
            vec![first.ptr(), second.ptr()],
            "stale buffers go back in arrival order before any conversion"
        );
        assert!(queue.is_empty(), "the whole queue was consumed");
    }

    #[test]
    fn test_drain_single_buffer_and_empty_queue() {
        let mut only = FakeBuffer::new(vec![5u8; 16], 16, 16);
        let mut queue = VecDeque::from([only.ptr()]);
        let mut requeued = Vec::new();

        let newest = drain_to_newest(
            || queue.pop_front().unwrap_or(ptr::null_mut()),
            |stale| requeued.push(stale),
        );
        assert_eq!(newest, only.ptr());
        assert!(requeued.is_empty(), "a lone buffer is never requeued early");

        let newest = drain_to_newest(|| ptr::null_mut(), |stale| requeued.push(stale));
        assert!(newest.is_null());
        assert!(requeued.is_empty());
    }

    #[test]
    fn test_memory_planes_follow_chunk() {
        let mut fake = FakeBuffer::new(vec![7u8; 64], 32, 16);
        let view = unsafe { view_buffer(fake.ptr()) }.unwrap();
        match view.planes {
            BufferPlanes::Memory(planes) => {
                assert_eq!(planes.len(), 1);
                assert_eq!(planes[0].data.len(), 32);
                assert_eq!(planes[0].stride, 16);
                assert!(planes[0].data.iter().all(|&b| b == 7));
            }
            _ => panic!("expected memory planes"),
        }
        assert!(view.crop.is_none());
        assert!(view.cursor.is_none());
    }

    #[test]
    fn test_zero_chunk_is_metadata_only() {
        let mut fake = FakeBuffer::new(vec![0u8; 16], 0, 16)
            .with_metas(vec![(spa_sys::SPA_META_VideoCrop, crop_payload(2, 3, 10, 20))]);
        let view = unsafe { view_buffer(fake.ptr()) }.unwrap();
        assert!(matches!(view.planes, BufferPlanes::Empty));
        let crop = view.crop.unwrap();
        assert_eq!((crop.x, crop.y, crop.width, crop.height), (2, 3, 10, 20));
    }

    #[test]
    fn test_cursor_meta_with_bitmap() {
        let mut fake = FakeBuffer::new(vec![1u8; 16], 16, 16).with_metas(vec![(
            spa_sys::SPA_META_Cursor,
            cursor_payload(9, (100, 200), (4, 6), Some((8, 8))),
        )]);
        let view = unsafe { view_buffer(fake.ptr()) }.unwrap();
        let cursor = view.cursor.unwrap();
        assert!(cursor.is_valid());
        assert_eq!((cursor.position_x, cursor.position_y), (100, 200));
        assert_eq!((cursor.hotspot_x, cursor.hotspot_y), (4, 6));
        let bitmap = cursor.bitmap.unwrap();
        assert_eq!((bitmap.width, bitmap.height), (8, 8));
        assert_eq!(bitmap.stride, 32);
        assert_eq!(bitmap.data.len(), 8 * 8 * 4);
        assert!(bitmap.data.iter().all(|&b| b == 0xab));
    }

    #[test]
    fn test_hidden_cursor_without_bitmap() {
        let mut fake = FakeBuffer::new(vec![1u8; 16], 16, 16).with_metas(vec![(
            spa_sys::SPA_META_Cursor,
            cursor_payload(0, (-5, -5), (0, 0), None),
        )]);
        let view = unsafe { view_buffer(fake.ptr()) }.unwrap();
        let cursor = view.cursor.unwrap();
        assert!(!cursor.is_valid());
        assert!(cursor.bitmap.is_none());
    }

    #[test]
    fn test_undersized_meta_is_skipped() {
        let mut fake = FakeBuffer::new(vec![1u8; 16], 16, 16).with_metas(vec![(
            spa_sys::SPA_META_VideoCrop,
            vec![0u8; 4].into_boxed_slice(),
        )]);
        let view = unsafe { view_buffer(fake.ptr()) }.unwrap();
        assert!(view.crop.is_none());
    }

    #[test]
    fn test_header_meta_is_writable() {
        let mut fake = FakeBuffer::new(vec![1u8; 16], 16, 16)
            .with_metas(vec![(spa_sys::SPA_META_Header, header_payload())]);
        let ptr = fake.ptr();
        {
            let header = unsafe { header_meta_mut(ptr) }.unwrap();
            header.pts = 123_456;
            header.seq = 7;
        }
        let header = unsafe { header_meta_mut(ptr) }.unwrap();
        assert_eq!(header.pts, 123_456);
        assert_eq!(header.seq, 7);
    }
}
