//! Fragment descriptors and the partial-I/O engine that packs them into and
//! drains them from socket I/O vectors under non-blocking `writev`/`readv`.

use std::fmt;
use std::io;
use std::io::{IoSlice, IoSliceMut, Read, Write};

use crate::frame::{
    FragHeader, SegmentDesc, HDR_SIZE, HDR_TYPE_FIN, HDR_TYPE_GET, HDR_TYPE_PUT, HDR_TYPE_SEND,
    SEG_SIZE,
};
use crate::support::{
    CompletionFn, CompletionStatus, DescFlags, ErrorType, TransportError, TransportResult,
};

/// Size class a fragment was allocated from. `User` fragments carry no inline
/// space and point directly at caller memory.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FragClass {
    Eager,
    Max,
    User,
}

/// One entry of a fragment's I/O vector. Entries resolve to byte regions that
/// are disjoint by construction: the staged header, a range of the inline
/// payload space, the staged segment table, or raw caller memory.
#[derive(Debug, Clone, Copy)]
enum IovKind {
    Header,
    Inline { off: usize, len: usize },
    SegTable { len: usize },
    Raw { base: *mut u8, len: usize },
}

/// Source description for the payload of an outbound fragment.
#[derive(Debug, Clone, Copy)]
enum SendSrc {
    None,
    Inline { len: usize },
    User { ptr: *const u8, len: usize },
}

/// Where a completed inbound fragment goes next.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RecvOutcome {
    /// The socket would block; re-arm the read event and resume later.
    Blocked,
    /// The fragment reached a dispatchable boundary.
    Deliver,
    /// The peer requested a graceful close.
    Fin,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum PhaseStep {
    Again,
    Deliver,
    Fin,
}

/// Unit of transmission: a wire header, an I/O vector list with a partial-I/O
/// cursor, segment descriptors and the inline payload space of its size
/// class. A fragment is single-owner: it is held either by the upper layer
/// (between allocation and `send`) or by the transport (until the completion
/// callback returns).
pub struct Fragment {
    pub hdr: FragHeader,
    pub segments: Vec<SegmentDesc>,
    pub class: FragClass,
    pub flags: DescFlags,
    pub tag: u16,
    pub rc: CompletionStatus,
    pub(crate) cb: Option<CompletionFn>,

    hdr_bytes: [u8; HDR_SIZE],
    seg_bytes: Vec<u8>,
    data: Box<[u8]>,
    src: SendSrc,

    iovs: Vec<IovKind>,
    /// Number of fully transferred iov entries.
    iov_idx: usize,
    /// Bytes already transferred within `iovs[iov_idx]`.
    cursor: usize,
}

// Raw iov targets are only dereferenced by whichever thread currently owns
// the fragment; ownership transfers whole at `send` and at completion.
unsafe impl Send for Fragment {}

impl Fragment {
    pub(crate) fn new(class: FragClass, capacity: usize) -> Fragment {
        Fragment {
            hdr: FragHeader::new(0, 0, 0, 0, 0),
            segments: Vec::new(),
            class,
            flags: DescFlags::default(),
            tag: 0,
            rc: CompletionStatus::Ok,
            cb: None,
            hdr_bytes: [0; HDR_SIZE],
            seg_bytes: Vec::new(),
            data: vec![0; capacity].into_boxed_slice(),
            src: SendSrc::None,
            iovs: Vec::new(),
            iov_idx: 0,
            cursor: 0,
        }
    }

    /// Restore the fragment to its freshly allocated state for pool reuse.
    pub(crate) fn reset(&mut self) {
        self.hdr = FragHeader::new(0, 0, 0, 0, 0);
        self.segments.clear();
        self.flags = DescFlags::default();
        self.tag = 0;
        self.rc = CompletionStatus::Ok;
        self.cb = None;
        self.seg_bytes.clear();
        self.src = SendSrc::None;
        self.iovs.clear();
        self.iov_idx = 0;
        self.cursor = 0;
    }

    /// Capacity of the inline payload space.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Register the completion callback invoked when the fragment finishes.
    #[inline]
    pub fn set_completion(&mut self, cb: CompletionFn) {
        self.cb = Some(cb);
    }

    /// Payload region of an outbound fragment, as sized by `alloc` or
    /// `prepare_src`.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        match self.src {
            SendSrc::Inline { len } => &self.data[..len],
            _ => &[],
        }
    }

    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        match self.src {
            SendSrc::Inline { len } => &mut self.data[..len],
            _ => &mut [],
        }
    }

    /// Payload region of a completed inbound SEND fragment.
    #[inline]
    pub fn recv_payload(&self) -> &[u8] {
        &self.data[..self.hdr.size as usize]
    }

    #[inline]
    pub(crate) fn set_inline_src(&mut self, len: usize) {
        debug_assert!(len <= self.data.len());
        self.src = SendSrc::Inline { len };
    }

    #[inline]
    pub(crate) fn set_user_src(&mut self, ptr: *const u8, len: usize) {
        self.src = SendSrc::User { ptr, len };
    }

    /// Remaining entries in the current I/O phase.
    #[inline]
    pub fn iov_cnt(&self) -> usize {
        self.iovs.len() - self.iov_idx
    }

    #[inline]
    pub(crate) fn phase_done(&self) -> bool {
        self.iov_cnt() == 0
    }

    // --- outbound construction -------------------------------------------

    /// Stage the fragment as a tagged SEND. The payload source must have been
    /// set by `alloc`/`prepare_src`.
    pub(crate) fn setup_send(&mut self, tag: u16) {
        let size = match self.src {
            SendSrc::None => 0,
            SendSrc::Inline { len } => len,
            SendSrc::User { len, .. } => len,
        };

        self.tag = tag;
        self.hdr = FragHeader::new(HDR_TYPE_SEND, 1, tag, size as u32, 0);
        self.hdr.encode(&mut self.hdr_bytes);

        self.iovs.clear();
        self.iov_idx = 0;
        self.cursor = 0;
        self.iovs.push(IovKind::Header);
        match self.src {
            SendSrc::Inline { len } if len > 0 => self.iovs.push(IovKind::Inline { off: 0, len }),
            SendSrc::User { ptr, len } if len > 0 => self.iovs.push(IovKind::Raw {
                base: ptr as *mut u8,
                len,
            }),
            _ => (),
        }
    }

    /// Stage the fragment as a PUT of `size` bytes read from `local` into the
    /// peer's memory at `remote`. `base` is zero for a plain put and echoes
    /// the request cookie when the put answers a GET.
    pub(crate) fn setup_put(&mut self, local: *const u8, remote: u64, size: u32, base: u64) {
        self.segments.clear();
        self.segments.push(SegmentDesc::new(remote, size, 0));

        self.hdr = FragHeader::new(HDR_TYPE_PUT, 1, 0, size, base);
        self.hdr.encode(&mut self.hdr_bytes);

        self.seg_bytes.clear();
        self.seg_bytes.resize(SEG_SIZE, 0);
        self.segments[0].encode(&mut self.seg_bytes[..]);

        self.iovs.clear();
        self.iov_idx = 0;
        self.cursor = 0;
        self.iovs.push(IovKind::Header);
        self.iovs.push(IovKind::SegTable { len: SEG_SIZE });
        if size > 0 {
            self.iovs.push(IovKind::Raw {
                base: local as *mut u8,
                len: size as usize,
            });
        }
    }

    /// Stage the fragment as a GET of `size` bytes from the peer's memory at
    /// `remote`; `cookie` identifies the requester-side destination and is
    /// echoed by the reply.
    pub(crate) fn setup_get(&mut self, cookie: u64, remote: u64, size: u32) {
        self.segments.clear();
        self.segments.push(SegmentDesc::new(remote, size, 0));

        self.hdr = FragHeader::new(HDR_TYPE_GET, 1, 0, size, cookie);
        self.hdr.encode(&mut self.hdr_bytes);

        self.seg_bytes.clear();
        self.seg_bytes.resize(SEG_SIZE, 0);
        self.segments[0].encode(&mut self.seg_bytes[..]);

        self.iovs.clear();
        self.iov_idx = 0;
        self.cursor = 0;
        self.iovs.push(IovKind::Header);
        self.iovs.push(IovKind::SegTable { len: SEG_SIZE });
    }

    /// Stage the fragment as a graceful-close notice.
    pub(crate) fn setup_fin(&mut self) {
        self.hdr = FragHeader::new(HDR_TYPE_FIN, 0, 0, 0, 0);
        self.hdr.encode(&mut self.hdr_bytes);

        self.iovs.clear();
        self.iov_idx = 0;
        self.cursor = 0;
        self.iovs.push(IovKind::Header);
    }

    /// Stage the fragment to receive a wire header.
    pub(crate) fn begin_recv(&mut self) {
        self.iovs.clear();
        self.iov_idx = 0;
        self.cursor = 0;
        self.iovs.push(IovKind::Header);
    }

    // --- cursor mechanics -------------------------------------------------

    #[inline]
    fn entry(&self, idx: usize) -> (*mut u8, usize) {
        match self.iovs[idx] {
            IovKind::Header => (self.hdr_bytes.as_ptr() as *mut u8, HDR_SIZE),
            IovKind::Inline { off, len } => (self.data[off..].as_ptr() as *mut u8, len),
            IovKind::SegTable { len } => (self.seg_bytes.as_ptr() as *mut u8, len),
            IovKind::Raw { base, len } => (base, len),
        }
    }

    /// Total bytes outstanding in the current phase.
    fn remaining(&self) -> usize {
        let mut total = 0;
        for idx in self.iov_idx..self.iovs.len() {
            let (_, len) = self.entry(idx);
            total += len;
        }
        total - self.cursor
    }

    /// Consume `count` transferred bytes: fully drained entries advance the
    /// cursor pair `(iov_idx, cursor)`; the straddling entry only moves the
    /// in-entry cursor. `iovs.len()` never changes here, so
    /// `iov_cnt + iov_idx` is invariant across partial I/O.
    fn advance(&mut self, mut count: usize) {
        while count > 0 {
            if self.iov_idx == self.iovs.len() {
                panic!("Attempted to advance past the iov list");
            }
            let (_, len) = self.entry(self.iov_idx);
            let left = len - self.cursor;
            if count >= left {
                self.iov_idx += 1;
                self.cursor = 0;
                count -= left;
            } else {
                self.cursor += count;
                count = 0;
            }
        }
    }

    /// Consume at most the bytes the current phase still needs, returning how
    /// many were taken. The surplus (if any) belongs to the endpoint cache.
    fn advance_upto(&mut self, count: usize) -> usize {
        let used = count.min(self.remaining());
        self.advance(used);
        used
    }

    /// Gather the unsent tail of the current phase as `writev` slices.
    fn write_slices<'a>(&'a self, out: &mut Vec<IoSlice<'a>>) {
        for idx in self.iov_idx..self.iovs.len() {
            let (ptr, len) = self.entry(idx);
            let skip = if idx == self.iov_idx { self.cursor } else { 0 };
            // Entries resolve to disjoint regions owned by (or contracted to)
            // this fragment, so reconstructing shared slices is sound.
            let slice = unsafe { std::slice::from_raw_parts(ptr.add(skip), len - skip) };
            out.push(IoSlice::new(slice));
        }
    }

    /// Gather the unfilled tail of the current phase as `readv` slices.
    fn read_slices<'a>(&'a mut self, out: &mut Vec<IoSliceMut<'a>>) {
        for idx in self.iov_idx..self.iovs.len() {
            let (ptr, len) = self.entry(idx);
            let skip = if idx == self.iov_idx { self.cursor } else { 0 };
            // Same disjointness argument as `write_slices`, with `&mut self`
            // guaranteeing exclusive access to the owned regions.
            let slice = unsafe { std::slice::from_raw_parts_mut(ptr.add(skip), len - skip) };
            out.push(IoSliceMut::new(slice));
        }
    }

    /// Copy bytes already buffered (endpoint cache) into the iov targets.
    /// Returns the number of bytes consumed from `src`.
    fn fill_from_slice(&mut self, src: &[u8]) -> usize {
        let mut consumed = 0;
        while consumed < src.len() && self.iov_idx < self.iovs.len() {
            let (ptr, len) = self.entry(self.iov_idx);
            let take = (len - self.cursor).min(src.len() - consumed);
            unsafe {
                std::ptr::copy_nonoverlapping(
                    src[consumed..].as_ptr(),
                    ptr.add(self.cursor),
                    take,
                );
            }
            consumed += take;
            self.cursor += take;
            if self.cursor == len {
                self.iov_idx += 1;
                self.cursor = 0;
            }
        }
        consumed
    }

    // --- send engine ------------------------------------------------------

    /// Attempt a non-blocking vectored write of the current phase. Returns
    /// `true` once the phase is fully sent, `false` if the transport would
    /// block (the caller re-arms the write event). Interrupted writes retry
    /// transparently; hard errors are fatal for the endpoint and surface to
    /// the caller, which must hold the endpoint send lock.
    pub(crate) fn frag_send<W: Write>(&mut self, writer: &mut W) -> TransportResult<bool> {
        loop {
            if self.phase_done() {
                return Ok(true);
            }

            let mut slices = Vec::with_capacity(self.iov_cnt());
            self.write_slices(&mut slices);

            match writer.write_vectored(&slices) {
                Ok(0) => return Err(TransportError::Fatal(ErrorType::Io(io::ErrorKind::WriteZero))),
                Ok(count) => {
                    drop(slices);
                    self.advance(count);
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) => return Err(err.into()),
            }
        }
    }

    // --- receive engine ---------------------------------------------------

    /// Drive the inbound state machine: fill the current phase (draining the
    /// endpoint cache first, then `readv` with the cache as trailing iov),
    /// dispatch completed phases by header type, and loop until the fragment
    /// reaches a dispatchable boundary or the socket would block.
    pub(crate) fn frag_recv<R: Read>(
        &mut self,
        reader: &mut R,
        nbo: bool,
        mut cache: Option<&mut Cache>,
    ) -> TransportResult<RecvOutcome> {
        loop {
            if !self.recv_phase(reader, cache.as_deref_mut())? {
                return Ok(RecvOutcome::Blocked);
            }
            match self.phase_complete(nbo)? {
                PhaseStep::Again => continue,
                PhaseStep::Deliver => return Ok(RecvOutcome::Deliver),
                PhaseStep::Fin => return Ok(RecvOutcome::Fin),
            }
        }
    }

    /// Fill the current phase. Returns `true` when the phase completed,
    /// `false` when the socket would block first.
    fn recv_phase<R: Read>(
        &mut self,
        reader: &mut R,
        mut cache: Option<&mut Cache>,
    ) -> TransportResult<bool> {
        loop {
            if self.phase_done() {
                return Ok(true);
            }

            // Drain buffered bytes before touching the socket. The cache is
            // always copied out, never aliased into iov targets.
            if let Some(cached) = cache.as_deref_mut() {
                if !cached.is_empty() {
                    let taken = {
                        let window = cached.readable();
                        self.fill_from_slice(window)
                    };
                    cached.consume(taken);
                    continue;
                }
            }

            let mut slices: Vec<IoSliceMut> = Vec::with_capacity(self.iov_cnt() + 1);
            self.read_slices(&mut slices);
            if let Some(cached) = cache.as_deref_mut() {
                if cached.capacity() > 0 {
                    // One extra iovec is reserved for prefetching into the
                    // (empty) cache behind the fragment's own needs.
                    slices.push(IoSliceMut::new(cached.free_slice()));
                }
            }

            match reader.read_vectored(&mut slices) {
                Ok(0) => {
                    drop(slices);
                    return Err(TransportError::Fatal(ErrorType::PeerHungUp));
                }
                Ok(count) => {
                    drop(slices);
                    let used = self.advance_upto(count);
                    if let Some(cached) = cache.as_deref_mut() {
                        cached.produce(count - used);
                    } else {
                        debug_assert_eq!(used, count);
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Dispatch a completed phase by header type, appending the iovs of the
    /// next phase where one exists.
    fn phase_complete(&mut self, nbo: bool) -> TransportResult<PhaseStep> {
        if self.iov_idx == 1 {
            // Header phase. A foreign-order header is converted exactly once.
            self.hdr = FragHeader::decode(&self.hdr_bytes);
            if nbo {
                self.hdr.byteswap();
            }

            return match self.hdr.htype {
                HDR_TYPE_FIN => Ok(PhaseStep::Fin),
                HDR_TYPE_SEND => {
                    let size = self.hdr.size as usize;
                    if size == 0 {
                        return Ok(PhaseStep::Deliver);
                    }
                    if size > self.data.len() {
                        return Err(TransportError::Fatal(ErrorType::PayloadTooLarge));
                    }
                    self.iovs.push(IovKind::Inline { off: 0, len: size });
                    Ok(PhaseStep::Again)
                }
                HDR_TYPE_PUT => {
                    if self.hdr.count == 0 {
                        return Ok(PhaseStep::Deliver);
                    }
                    let len = self.hdr.count as usize * SEG_SIZE;
                    self.seg_bytes.clear();
                    self.seg_bytes.resize(len, 0);
                    self.iovs.push(IovKind::SegTable { len });
                    Ok(PhaseStep::Again)
                }
                HDR_TYPE_GET => {
                    if self.hdr.count == 0 {
                        return Err(TransportError::Fatal(ErrorType::Corrupt));
                    }
                    let len = self.hdr.count as usize * SEG_SIZE;
                    self.seg_bytes.clear();
                    self.seg_bytes.resize(len, 0);
                    self.iovs.push(IovKind::SegTable { len });
                    Ok(PhaseStep::Again)
                }
                _ => Err(TransportError::Fatal(ErrorType::Corrupt)),
            };
        }

        if self.iov_idx == 2 && self.hdr.htype == HDR_TYPE_PUT {
            // Segment-table phase: decode the descriptors and target the
            // caller-supplied addresses for the payload phase.
            self.decode_segments(nbo)?;
            for i in 0..self.segments.len() {
                let seg = self.segments[i];
                if seg.len == 0 {
                    continue;
                }
                if seg.addr == 0 {
                    return Err(TransportError::Fatal(ErrorType::Corrupt));
                }
                self.iovs.push(IovKind::Raw {
                    base: seg.addr as *mut u8,
                    len: seg.len as usize,
                });
            }
            return Ok(PhaseStep::Again);
        }

        if self.iov_idx == 2 && self.hdr.htype == HDR_TYPE_GET {
            self.decode_segments(nbo)?;
            return Ok(PhaseStep::Deliver);
        }

        Ok(PhaseStep::Deliver)
    }

    fn decode_segments(&mut self, nbo: bool) -> TransportResult<()> {
        self.segments.clear();
        for chunk in self.seg_bytes.chunks_exact(SEG_SIZE) {
            let mut seg = SegmentDesc::decode(chunk);
            if nbo {
                seg.byteswap();
            }
            self.segments.push(seg);
        }
        if self.segments.len() != self.hdr.count as usize {
            return Err(TransportError::Fatal(ErrorType::Corrupt));
        }
        Ok(())
    }
}

impl fmt::Debug for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "frag {:?} iov_cnt {} iov_idx {} size {}",
            self.class,
            self.iov_cnt(),
            self.iov_idx,
            self.hdr.size
        )
    }
}

/// Per-endpoint prefetch cache: a fixed buffer whose `(pos, len)` pair
/// describes one contiguous occupied window. Reads drain the window by copy
/// before any socket I/O; the buffer never holds more than its capacity.
pub struct Cache {
    buf: Box<[u8]>,
    pos: usize,
    len: usize,
}

impl Cache {
    pub fn new(capacity: usize) -> Cache {
        Cache {
            buf: vec![0; capacity].into_boxed_slice(),
            pos: 0,
            len: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn readable(&self) -> &[u8] {
        &self.buf[self.pos..self.pos + self.len]
    }

    #[inline]
    pub fn consume(&mut self, count: usize) {
        if count > self.len {
            panic!("Attempted to consume past the cached window");
        }
        self.pos += count;
        self.len -= count;
        if self.len == 0 {
            self.pos = 0;
        }
    }

    /// Free space behind the occupied window. Only valid while the cache is
    /// empty, which is the only moment it joins a `readv`.
    #[inline]
    pub fn free_slice(&mut self) -> &mut [u8] {
        debug_assert!(self.is_empty());
        &mut self.buf[..]
    }

    #[inline]
    pub fn produce(&mut self, count: usize) {
        if self.pos + self.len + count > self.buf.len() {
            panic!("Attempted to produce past the cache capacity");
        }
        self.len += count;
    }

    #[inline]
    pub fn clear(&mut self) {
        self.pos = 0;
        self.len = 0;
    }
}
