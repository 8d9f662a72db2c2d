//! Dynamic tensor: slice reads and writes over a chunked, cached store.
//!
//! A tensor owns one key space of a [`BackingStore`]:
//!
//! - `meta.json`: [`TensorMeta`] (JSON)
//! - `--dynamic--/shape_table`: [`DynamicShapeTable`] (bincode), only when
//!   some per-sample dimension is dynamic
//! - `chunks/<key>`: encoded chunks, see [`ChunkCoord::key`]
//!
//! Recorded extents of dynamic dimensions follow two rules:
//! a dimension written through a fully open slice (`..`, or omitted) takes
//! exactly the written extent, while a dimension written through an index
//! or a bounded slice only ever grows (`max(old, stop)`).

use crate::backend::BackingStore;
use crate::cache::{CacheStats, ChunkCache};
use crate::config::StoreConfig;
use crate::dtype::{DType, Element};
use crate::error::{Result, TensorStoreError};
use crate::grid::{contiguous_strides, parse_chunk_key, walk, ChunkCoord, ChunkGrid};
use crate::index::{normalize, DimRange, SliceIndex};
use crate::meta::{TensorMeta, TensorSpec, TENSOR_META_KEY};
use crate::shape_table::{DynamicShapeTable, SHAPE_TABLE_KEY};
use ndarray::{ArrayBase, ArrayD, Data, Dimension, IxDyn};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Key prefix of encoded chunks, relative to the tensor root.
pub const CHUNKS_PREFIX: &str = "chunks/";

/// Access mode of an opened tensor or dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Read only; every mutation fails with `ReadOnly`.
    Read,
    /// Read and write. A dataset opened this way is recreated from scratch.
    Write,
    /// Read and write, keeping existing contents.
    #[default]
    Append,
}

impl Mode {
    pub fn is_writable(self) -> bool {
        !matches!(self, Mode::Read)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Read => "r",
            Mode::Write => "w",
            Mode::Append => "a",
        })
    }
}

impl FromStr for Mode {
    type Err = TensorStoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "r" => Ok(Mode::Read),
            "w" => Ok(Mode::Write),
            "a" => Ok(Mode::Append),
            other => Err(TensorStoreError::InvalidParameter(format!(
                "unknown mode {other:?}, expected one of \"r\", \"w\", \"a\""
            ))),
        }
    }
}

#[derive(Debug)]
struct TensorState {
    meta: TensorMeta,
    shapes: Option<DynamicShapeTable>,
    shapes_dirty: bool,
    closed: bool,
}

impl TensorState {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(TensorStoreError::Closed("tensor".into()))
        } else {
            Ok(())
        }
    }
}

/// One (sample, old shape, new shape) change of recorded extents.
type ExtentUpdate = (usize, Vec<usize>, Vec<usize>);

/// Layout of a tensor before a resize.
#[derive(Debug)]
pub(crate) struct ResizeUndo {
    meta: TensorMeta,
    shapes: Option<DynamicShapeTable>,
}

/// A chunked N-dimensional array with an appendable outer dimension and
/// optionally ragged inner dimensions.
#[derive(Debug)]
pub struct DynamicTensor {
    store: Arc<dyn BackingStore>,
    cache: ChunkCache,
    grid: ChunkGrid,
    mode: Mode,
    state: RwLock<TensorState>,
    op_lock: Option<Mutex<()>>,
}

impl DynamicTensor {
    /// Create a tensor of `num_samples` samples in `store`, replacing any
    /// tensor already there.
    ///
    /// If persisting the new tensor fails, the tensor's keys are removed
    /// again and the original error is returned.
    pub fn create(
        store: Arc<dyn BackingStore>,
        num_samples: usize,
        spec: &TensorSpec,
        config: &StoreConfig,
    ) -> Result<Self> {
        config.validate()?;
        let meta = TensorMeta::resolve(num_samples, spec, config.target_chunk_bytes)?;
        let shapes = if meta.is_dynamic() {
            Some(DynamicShapeTable::new(
                meta.sample_shape(),
                meta.sample_max_shape(),
                num_samples,
            )?)
        } else {
            None
        };

        if let Err(e) = persist_new(store.as_ref(), &meta, shapes.as_ref()) {
            if let Err(cleanup) = remove_tensor_keys(store.as_ref()) {
                error!(error = %cleanup, "failed to remove partially created tensor");
            }
            return Err(e);
        }

        info!(
            shape = ?meta.max_shape,
            chunks = ?meta.chunks,
            dtype = %meta.dtype,
            compressor = %meta.compressor,
            "created tensor"
        );
        Self::from_parts(store, meta, shapes, Mode::Write, config)
    }

    /// Open the tensor persisted in `store`.
    pub fn open(store: Arc<dyn BackingStore>, mode: Mode, config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        let (meta, shapes) = load(store.as_ref())?;
        debug!(shape = ?meta.max_shape, %mode, "opened tensor");
        Self::from_parts(store, meta, shapes, mode, config)
    }

    fn from_parts(
        store: Arc<dyn BackingStore>,
        meta: TensorMeta,
        shapes: Option<DynamicShapeTable>,
        mode: Mode,
        config: &StoreConfig,
    ) -> Result<Self> {
        let grid = meta.grid()?;
        let cache = ChunkCache::new(
            Arc::clone(&store),
            meta.compressor,
            grid.chunk_bytes(),
            config.cache_bytes,
        );
        Ok(Self {
            store,
            cache,
            grid,
            mode,
            state: RwLock::new(TensorState {
                meta,
                shapes,
                shapes_dirty: false,
                closed: false,
            }),
            op_lock: config.lock_cache.then(|| Mutex::new(())),
        })
    }

    fn guard(&self) -> Option<MutexGuard<'_, ()>> {
        self.op_lock.as_ref().map(|m| m.lock())
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.mode.is_writable() {
            Ok(())
        } else {
            Err(TensorStoreError::ReadOnly("tensor opened in read mode".into()))
        }
    }

    /// Read the hyper-rectangle selected by `index`.
    ///
    /// Missing trailing indices select whole dimensions; scalar indices drop
    /// their dimension from the result. Elements beyond a sample's recorded
    /// extent read as zero.
    pub fn read<T: Element>(&self, index: &[SliceIndex]) -> Result<ArrayD<T>> {
        let _guard = self.guard();
        let state = self.state.read();
        state.ensure_open()?;
        check_dtype::<T>(state.meta.dtype)?;

        let ranges = resolve_ranges(&state.meta, state.shapes.as_ref(), index, None)?;
        let mut buf = self.read_region(&ranges)?;
        if let Some(table) = &state.shapes {
            clip_to_extents(&state.meta, table, &ranges, &mut buf)?;
        }

        let out_shape: Vec<usize> = ranges
            .iter()
            .filter(|r| !r.squeeze)
            .map(DimRange::len)
            .collect();
        let values: Vec<T> = buf.chunks_exact(T::DTYPE.size()).map(T::read_le).collect();
        ArrayD::from_shape_vec(IxDyn(&out_shape), values)
            .map_err(|e| TensorStoreError::InvalidShape(e.to_string()))
    }

    /// Write `value` into the hyper-rectangle selected by `index`.
    ///
    /// `value` is broadcast to the selected shape. An open slice stop on a
    /// dynamic dimension takes its extent from `value` when `value` has one
    /// axis per selected (non-scalar) dimension. Nothing is written when the
    /// shape checks fail.
    pub fn write<T, S, D>(&self, index: &[SliceIndex], value: &ArrayBase<S, D>) -> Result<()>
    where
        T: Element,
        S: Data<Elem = T>,
        D: Dimension,
    {
        let _guard = self.guard();
        let mut state = self.state.write();
        state.ensure_open()?;
        self.ensure_writable()?;
        check_dtype::<T>(state.meta.dtype)?;

        let ranges = resolve_ranges(
            &state.meta,
            state.shapes.as_ref(),
            index,
            Some(value.shape()),
        )?;
        let target: Vec<usize> = ranges
            .iter()
            .filter(|r| !r.squeeze)
            .map(DimRange::len)
            .collect();
        let view = value
            .broadcast(IxDyn(&target))
            .ok_or_else(|| TensorStoreError::ShapeMismatch {
                expected: target.clone(),
                actual: value.shape().to_vec(),
            })?;

        let updates = match &state.shapes {
            Some(table) => plan_extents(&state.meta, table, &ranges)?,
            None => Vec::new(),
        };

        let elem_size = T::DTYPE.size();
        let mut bytes = vec![0u8; view.len() * elem_size];
        for (dst, v) in bytes.chunks_exact_mut(elem_size).zip(view.iter()) {
            v.write_le(dst);
        }

        for (sample, old, new) in &updates {
            self.clear_narrowed(&state.meta, *sample, old, new)?;
        }
        self.write_region(&ranges, &bytes)?;

        if !updates.is_empty() {
            if let Some(table) = state.shapes.as_mut() {
                for (sample, _, new) in &updates {
                    table.set_shape(*sample, new)?;
                }
            }
            state.shapes_dirty = true;
        }
        Ok(())
    }

    /// Write `value` to every element selected by `index`.
    pub fn fill<T: Element>(&self, index: &[SliceIndex], value: T) -> Result<()> {
        self.write(index, &ndarray::arr0(value))
    }

    /// Change the number of samples. Metadata is persisted immediately;
    /// chunks are never allocated or reclaimed. Cells of samples dropped by
    /// a shrink are zeroed, so growing again yields empty samples.
    ///
    /// If the new metadata cannot be persisted, the tensor keeps its
    /// previous sample count, in memory and in the backing store.
    pub fn resize_shape(&self, num_samples: usize) -> Result<()> {
        if let Some(undo) = self.begin_resize(num_samples)? {
            self.finish_resize(&undo)?;
        }
        Ok(())
    }

    /// Persist and apply the new sample count. Returns the previous layout
    /// (`None` when nothing changed) for [`Self::undo_resize`] or
    /// [`Self::finish_resize`].
    pub(crate) fn begin_resize(&self, num_samples: usize) -> Result<Option<ResizeUndo>> {
        let _guard = self.guard();
        let mut state = self.state.write();
        state.ensure_open()?;
        self.ensure_writable()?;

        let current = state.meta.num_samples();
        if num_samples == current {
            return Ok(None);
        }
        let mut meta = state.meta.clone();
        meta.set_num_samples(num_samples);
        let shapes = state.shapes.clone().map(|mut table| {
            table.resize(num_samples);
            table
        });

        self.persist_layout(&meta, shapes.as_ref(), state.shapes.as_ref())?;
        let undo = ResizeUndo {
            meta: std::mem::replace(&mut state.meta, meta),
            shapes: std::mem::replace(&mut state.shapes, shapes),
        };
        state.shapes_dirty = false;
        info!(from = current, to = num_samples, "resized tensor");
        Ok(Some(undo))
    }

    /// Restore the layout captured by [`Self::begin_resize`].
    pub(crate) fn undo_resize(&self, undo: ResizeUndo) -> Result<()> {
        let _guard = self.guard();
        let mut state = self.state.write();
        state.ensure_open()?;
        self.persist_layout(&undo.meta, undo.shapes.as_ref(), state.shapes.as_ref())?;
        let from = state.meta.num_samples();
        state.meta = undo.meta;
        state.shapes = undo.shapes;
        state.shapes_dirty = false;
        warn!(from, to = state.meta.num_samples(), "reverted tensor resize");
        Ok(())
    }

    /// Zero the recorded cells of every sample a shrink dropped.
    pub(crate) fn finish_resize(&self, undo: &ResizeUndo) -> Result<()> {
        let Some(old_table) = &undo.shapes else {
            return Ok(());
        };
        let _guard = self.guard();
        let state = self.state.read();
        state.ensure_open()?;

        let kept = state.meta.num_samples();
        for sample in kept..old_table.len() {
            let shape = old_table.get_shape(sample)?;
            let mut region = Vec::with_capacity(state.meta.rank());
            region.push(span(sample, sample + 1));
            region.extend(shape.iter().map(|&extent| span(0, extent)));
            let elems: usize = region.iter().map(DimRange::len).product();
            if elems > 0 {
                self.write_region(&region, &vec![0u8; elems * state.meta.dtype.size()])?;
            }
        }
        Ok(())
    }

    /// Write the shape table, then the metadata. If the metadata write fails
    /// the `previous` table is put back so both records stay consistent.
    fn persist_layout(
        &self,
        meta: &TensorMeta,
        shapes: Option<&DynamicShapeTable>,
        previous: Option<&DynamicShapeTable>,
    ) -> Result<()> {
        let meta_bytes = meta.to_json()?;
        if let Some(table) = shapes {
            self.store.set(SHAPE_TABLE_KEY, &table.to_bytes()?)?;
        }
        if let Err(e) = self.store.set(TENSOR_META_KEY, &meta_bytes) {
            if let (Some(_), Some(previous)) = (shapes, previous) {
                let restored = previous
                    .to_bytes()
                    .and_then(|bytes| self.store.set(SHAPE_TABLE_KEY, &bytes));
                if let Err(cleanup) = restored {
                    error!(error = %cleanup, "failed to restore shape table");
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// Persist every pending chunk and the shape table.
    pub fn flush(&self) -> Result<()> {
        let _guard = self.guard();
        let mut state = self.state.write();
        state.ensure_open()?;
        self.flush_locked(&mut state)
    }

    /// Flush, then release the cache. Any later call fails with `Closed`.
    pub fn close(&self) -> Result<()> {
        let _guard = self.guard();
        let mut state = self.state.write();
        state.ensure_open()?;
        self.flush_locked(&mut state)?;
        self.cache.close()?;
        state.closed = true;
        debug!("closed tensor");
        Ok(())
    }

    /// Drop cached clean chunks and reload metadata, so writes flushed by
    /// another handle on the same store become visible.
    pub fn invalidate(&self) -> Result<()> {
        let _guard = self.guard();
        let mut state = self.state.write();
        state.ensure_open()?;
        self.cache.invalidate()?;
        if state.shapes_dirty {
            return Ok(());
        }

        let (meta, shapes) = load(self.store.as_ref())?;
        if meta.chunks != state.meta.chunks
            || meta.dtype != state.meta.dtype
            || meta.compressor != state.meta.compressor
        {
            return Err(TensorStoreError::InvalidShape(
                "tensor was recreated with a different layout; reopen it".into(),
            ));
        }
        state.meta = meta;
        state.shapes = shapes;
        Ok(())
    }

    /// Forget cached state without writing anything; the tensor is closed.
    pub(crate) fn discard(&self) {
        self.cache.discard();
        self.state.write().closed = true;
    }

    fn flush_locked(&self, state: &mut TensorState) -> Result<()> {
        if !self.mode.is_writable() {
            return Ok(());
        }
        let written = self.cache.flush()?;
        if state.shapes_dirty {
            if let Some(table) = &state.shapes {
                self.store.set(SHAPE_TABLE_KEY, &table.to_bytes()?)?;
            }
            state.shapes_dirty = false;
        }
        debug!(chunks = written, "flushed tensor");
        Ok(())
    }

    fn read_region(&self, ranges: &[DimRange]) -> Result<Vec<u8>> {
        let request: Vec<usize> = ranges.iter().map(DimRange::len).collect();
        let es = self.grid.elem_size();
        let mut buf = vec![0u8; request.iter().product::<usize>() * es];

        for overlap in self.grid.overlaps(ranges) {
            let chunk = self.cache.get(&chunk_key(&overlap.coord))?;
            for (c, r, len) in overlap.runs(self.grid.chunk_shape(), &request) {
                buf[r * es..(r + len) * es].copy_from_slice(&chunk[c * es..(c + len) * es]);
            }
        }
        Ok(buf)
    }

    fn write_region(&self, ranges: &[DimRange], data: &[u8]) -> Result<()> {
        let request: Vec<usize> = ranges.iter().map(DimRange::len).collect();
        let es = self.grid.elem_size();
        let full = self.grid.chunk_elements();

        for overlap in self.grid.overlaps(ranges) {
            let key = chunk_key(&overlap.coord);
            let runs = overlap.runs(self.grid.chunk_shape(), &request);
            let copy = |chunk: &mut [u8]| {
                for &(c, r, len) in &runs {
                    chunk[c * es..(c + len) * es].copy_from_slice(&data[r * es..(r + len) * es]);
                }
            };
            if overlap.len() == full {
                // whole chunk replaced, no need to fetch the old one
                let mut chunk = vec![0u8; self.grid.chunk_bytes()];
                copy(&mut chunk);
                self.cache.set(&key, chunk)?;
            } else {
                self.cache.with_chunk_mut(&key, copy)?;
            }
        }
        Ok(())
    }

    /// Zero the cells of `sample` that fall outside its narrowed extents.
    fn clear_narrowed(&self, meta: &TensorMeta, sample: usize, old: &[usize], new: &[usize]) -> Result<()> {
        for k in 0..old.len() {
            if new[k] >= old[k] {
                continue;
            }
            let mut region = Vec::with_capacity(meta.rank());
            region.push(span(sample, sample + 1));
            for (j, &extent) in old.iter().enumerate() {
                region.push(if j == k {
                    span(new[k], old[k])
                } else {
                    span(0, extent)
                });
            }
            let elems: usize = region.iter().map(DimRange::len).product();
            if elems > 0 {
                self.write_region(&region, &vec![0u8; elems * meta.dtype.size()])?;
            }
        }
        Ok(())
    }

    /// Snapshot of the tensor metadata.
    pub fn meta(&self) -> TensorMeta {
        self.state.read().meta.clone()
    }

    pub fn num_samples(&self) -> usize {
        self.state.read().meta.num_samples()
    }

    /// Logical (maximum) shape, outer dimension first.
    pub fn shape(&self) -> Vec<usize> {
        self.state.read().meta.max_shape.clone()
    }

    pub fn dtype(&self) -> DType {
        self.state.read().meta.dtype
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Current shape of one sample, with recorded extents for dynamic dimensions.
    pub fn sample_shape(&self, sample: usize) -> Result<Vec<usize>> {
        let state = self.state.read();
        let n = state.meta.num_samples();
        if sample >= n {
            return Err(TensorStoreError::OutOfBounds {
                dim: 0,
                index: sample as i64,
                len: n,
            });
        }
        match &state.shapes {
            Some(table) => table.get_shape(sample),
            None => Ok(state.meta.sample_max_shape().to_vec()),
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().closed
    }

    /// Coordinates of every chunk persisted in the backing store.
    pub fn chunk_keys(&self) -> Result<Vec<ChunkCoord>> {
        self.state.read().ensure_open()?;
        Ok(self
            .store
            .list_keys(CHUNKS_PREFIX)?
            .iter()
            .filter_map(|k| k.strip_prefix(CHUNKS_PREFIX))
            .filter_map(parse_chunk_key)
            .collect())
    }
}

impl Drop for DynamicTensor {
    fn drop(&mut self) {
        if !self.mode.is_writable() {
            return;
        }
        let mut state = self.state.write();
        if state.closed {
            return;
        }
        if let Err(e) = self.flush_locked(&mut state) {
            warn!(error = %e, "failed to flush tensor on drop");
        }
    }
}

fn persist_new(
    store: &dyn BackingStore,
    meta: &TensorMeta,
    shapes: Option<&DynamicShapeTable>,
) -> Result<()> {
    store.delete_prefix(CHUNKS_PREFIX)?;
    store.set(TENSOR_META_KEY, &meta.to_json()?)?;
    match shapes {
        Some(table) => store.set(SHAPE_TABLE_KEY, &table.to_bytes()?)?,
        None => {
            store.delete(SHAPE_TABLE_KEY)?;
        }
    }
    Ok(())
}

/// Remove only the keys a tensor owns, leaving anything else in `store`.
fn remove_tensor_keys(store: &dyn BackingStore) -> Result<()> {
    store.delete(TENSOR_META_KEY)?;
    store.delete(SHAPE_TABLE_KEY)?;
    store.delete_prefix(CHUNKS_PREFIX)?;
    Ok(())
}

fn load(store: &dyn BackingStore) -> Result<(TensorMeta, Option<DynamicShapeTable>)> {
    let bytes = store
        .get(TENSOR_META_KEY)?
        .ok_or_else(|| TensorStoreError::TensorNotFound(format!("no {TENSOR_META_KEY}")))?;
    let meta = TensorMeta::from_json(&bytes)?;
    let shapes = if meta.is_dynamic() {
        let table = DynamicShapeTable::from_bytes(&store.get_required(SHAPE_TABLE_KEY)?)?;
        if table.len() != meta.num_samples() {
            return Err(TensorStoreError::SerializationError(format!(
                "shape table has {} samples, tensor has {}",
                table.len(),
                meta.num_samples()
            )));
        }
        Some(table)
    } else {
        None
    };
    Ok((meta, shapes))
}

fn chunk_key(coord: &ChunkCoord) -> String {
    format!("{}{}", CHUNKS_PREFIX, coord.key())
}

fn span(start: usize, stop: usize) -> DimRange {
    DimRange {
        start,
        stop,
        squeeze: false,
        open_start: false,
        open_stop: false,
    }
}

fn check_dtype<T: Element>(stored: DType) -> Result<()> {
    if T::DTYPE == stored {
        Ok(())
    } else {
        Err(TensorStoreError::DTypeMismatch {
            expected: stored,
            actual: T::DTYPE,
        })
    }
}

/// Normalize `index` against the tensor's current shape.
///
/// Dynamic dimensions resolve omitted and negative bounds against the
/// largest recorded extent over the selected samples, and may address up
/// to their maximum. With `value_shape`, open stops of dynamic dimensions
/// are taken from the value instead.
fn resolve_ranges(
    meta: &TensorMeta,
    shapes: Option<&DynamicShapeTable>,
    index: &[SliceIndex],
    value_shape: Option<&[usize]>,
) -> Result<Vec<DimRange>> {
    let rank = meta.rank();
    if index.len() > rank {
        return Err(TensorStoreError::ShapeLength {
            what: "index",
            expected: rank,
            actual: index.len(),
        });
    }
    let full = SliceIndex::full();
    let at = |d: usize| index.get(d).unwrap_or(&full);

    let n = meta.num_samples();
    let outer = normalize(at(0), 0, n, n)?;
    let extents: Vec<usize> = match shapes {
        Some(table) => {
            let mut extents = Vec::with_capacity(rank);
            extents.push(n);
            extents.extend(table.max_extents(outer.as_range())?);
            extents
        }
        None => meta.max_shape.clone(),
    };

    let mut ranges = Vec::with_capacity(rank);
    ranges.push(outer);
    for d in 1..rank {
        ranges.push(normalize(at(d), d, extents[d], meta.max_shape[d])?);
    }

    if let (Some(value_shape), Some(_)) = (value_shape, shapes) {
        let selected = ranges.iter().filter(|r| !r.squeeze).count();
        if value_shape.len() == selected {
            let mut axis = 0;
            for (d, r) in ranges.iter_mut().enumerate() {
                if r.squeeze {
                    continue;
                }
                if meta.shape[d].is_none() && r.open_stop {
                    let stop = r.start + value_shape[axis];
                    if stop > meta.max_shape[d] {
                        return Err(TensorStoreError::ExtentExceedsMax {
                            dim: d,
                            extent: stop,
                            max: meta.max_shape[d],
                        });
                    }
                    r.stop = stop;
                }
                axis += 1;
            }
        }
    }
    Ok(ranges)
}

/// New recorded shapes for every sample a write touches.
fn plan_extents(
    meta: &TensorMeta,
    table: &DynamicShapeTable,
    ranges: &[DimRange],
) -> Result<Vec<ExtentUpdate>> {
    let dims = meta.dynamic_dims();
    let mut updates = Vec::new();
    for sample in ranges[0].as_range() {
        let old = table.get_shape(sample)?;
        let mut new = old.clone();
        for &d in &dims {
            let r = &ranges[d];
            if r.is_open() {
                new[d - 1] = r.stop;
            } else if !r.is_empty() {
                new[d - 1] = old[d - 1].max(r.stop);
            }
        }
        if new != old {
            updates.push((sample, old, new));
        }
    }
    Ok(updates)
}

/// Zero every element of `buf` (laid out as `ranges`) beyond the recorded
/// extent of its sample.
fn clip_to_extents(
    meta: &TensorMeta,
    table: &DynamicShapeTable,
    ranges: &[DimRange],
    buf: &mut [u8],
) -> Result<()> {
    let dims = meta.dynamic_dims();
    let request: Vec<usize> = ranges.iter().map(DimRange::len).collect();
    let es = meta.dtype.size();

    for (i, sample) in ranges[0].as_range().enumerate() {
        let shape = table.get_shape(sample)?;
        for &d in &dims {
            let r = &ranges[d];
            let valid = shape[d - 1];
            if r.stop <= valid {
                continue;
            }
            let lo = valid.max(r.start) - r.start;
            let mut region: Vec<Range<usize>> = request.iter().map(|&len| 0..len).collect();
            region[0] = i..i + 1;
            region[d] = lo..r.len();
            zero_region(buf, &request, &region, es);
        }
    }
    Ok(())
}

fn zero_region(buf: &mut [u8], shape: &[usize], region: &[Range<usize>], elem_size: usize) {
    let strides = contiguous_strides(shape);
    let inner = shape.len() - 1;
    let run = region[inner].len() * elem_size;
    if run == 0 {
        return;
    }
    walk(&region[..inner], |idx| {
        let mut offset = region[inner].start;
        for (d, &i) in idx.iter().enumerate() {
            offset += i * strides[d];
        }
        let start = offset * elem_size;
        buf[start..start + run].fill(0);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::test_support::FailingStore;
    use crate::backend::MemoryStore;
    use crate::sel;
    use ndarray::{arr1, arr2, Array2, Array3};

    fn store() -> Arc<dyn BackingStore> {
        Arc::new(MemoryStore::new())
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("r".parse::<Mode>().unwrap(), Mode::Read);
        assert_eq!("a".parse::<Mode>().unwrap(), Mode::Append);
        assert_eq!(Mode::Write.to_string(), "w");
        assert!("rw".parse::<Mode>().is_err());
    }

    #[test]
    fn test_fixed_sample_roundtrip() {
        let spec = TensorSpec::new(&[4, 4], DType::U8).with_chunks(&[2, 4, 4]);
        let t = DynamicTensor::create(store(), 10, &spec, &StoreConfig::default()).unwrap();

        let value = Array3::from_elem((1, 4, 4), 7u8);
        t.write(&sel![3..4], &value).unwrap();
        assert_eq!(
            t.read::<u8>(&sel![3]).unwrap(),
            Array2::from_elem((4, 4), 7u8).into_dyn()
        );
        assert_eq!(t.read::<u8>(&sel![3..4]).unwrap().shape(), &[1, 4, 4]);
        assert!(t.read::<u8>(&sel![2]).unwrap().iter().all(|&v| v == 0));

        t.flush().unwrap();
        assert_eq!(t.chunk_keys().unwrap(), vec![ChunkCoord(vec![1, 0, 0])]);
    }

    #[test]
    fn test_whole_chunk_write_skips_fetch() {
        let spec = TensorSpec::new(&[4], DType::U8).with_chunks(&[2, 4]);
        let t = DynamicTensor::create(store(), 4, &spec, &StoreConfig::default()).unwrap();
        t.fill(&sel![0..2], 1u8).unwrap();
        assert_eq!(t.cache_stats().misses, 0);

        t.fill(&sel![2, 1..3], 2u8).unwrap();
        assert_eq!(t.cache_stats().misses, 1);
        assert_eq!(t.read::<u8>(&sel![2]).unwrap(), arr1(&[0u8, 2, 2, 0]).into_dyn());
    }

    #[test]
    fn test_dtype_and_mode_checks() {
        let s = store();
        let spec = TensorSpec::new(&[2], DType::F32);
        let t = DynamicTensor::create(Arc::clone(&s), 2, &spec, &StoreConfig::default()).unwrap();
        assert!(matches!(
            t.read::<f64>(&sel![0]),
            Err(TensorStoreError::DTypeMismatch { expected: DType::F32, actual: DType::F64 })
        ));
        t.close().unwrap();

        let r = DynamicTensor::open(s, Mode::Read, &StoreConfig::default()).unwrap();
        assert!(matches!(
            r.fill(&sel![0], 1.0f32),
            Err(TensorStoreError::ReadOnly(_))
        ));
        assert!(matches!(r.resize_shape(3), Err(TensorStoreError::ReadOnly(_))));
        assert_eq!(r.read::<f32>(&sel![1]).unwrap(), arr1(&[0.0f32, 0.0]).into_dyn());
    }

    #[test]
    fn test_open_missing_tensor() {
        assert!(matches!(
            DynamicTensor::open(store(), Mode::Append, &StoreConfig::default()),
            Err(TensorStoreError::TensorNotFound(_))
        ));
    }

    #[test]
    fn test_open_stop_takes_value_extent() {
        let spec = TensorSpec::dynamic(&[None, None], &[8, 8], DType::I32).with_chunks(&[1, 4, 4]);
        let t = DynamicTensor::create(store(), 2, &spec, &StoreConfig::default()).unwrap();

        t.write(&sel![0], &arr2(&[[1, 2, 3], [4, 5, 6]])).unwrap();
        assert_eq!(t.sample_shape(0).unwrap(), vec![2, 3]);
        assert_eq!(t.read::<i32>(&sel![0]).unwrap(), arr2(&[[1, 2, 3], [4, 5, 6]]).into_dyn());

        // too large for max_shape: rejected before any chunk is touched
        let big = ndarray::Array2::<i32>::zeros((9, 1));
        assert!(matches!(
            t.write(&sel![1], &big),
            Err(TensorStoreError::ExtentExceedsMax { dim: 1, extent: 9, max: 8 })
        ));
        assert_eq!(t.sample_shape(1).unwrap(), vec![0, 0]);
    }

    #[test]
    fn test_narrowing_clears_stale_cells() {
        let spec = TensorSpec::dynamic(&[None], &[6], DType::U8).with_chunks(&[1, 6]);
        let t = DynamicTensor::create(store(), 1, &spec, &StoreConfig::default()).unwrap();

        t.write(&sel![0], &arr1(&[9u8, 9, 9, 9])).unwrap();
        t.write(&sel![0], &arr1(&[1u8, 1])).unwrap();
        assert_eq!(t.sample_shape(0).unwrap(), vec![2]);

        // growing again through a bounded slice must not resurface old data
        t.write(&sel![0, 3..4], &arr1(&[5u8])).unwrap();
        assert_eq!(t.read::<u8>(&sel![0]).unwrap(), arr1(&[1u8, 1, 0, 5]).into_dyn());
    }

    #[test]
    fn test_too_many_indices() {
        let t = DynamicTensor::create(store(), 2, &TensorSpec::new(&[2], DType::U8), &StoreConfig::default())
            .unwrap();
        assert!(matches!(
            t.read::<u8>(&sel![0, 0, 0]),
            Err(TensorStoreError::ShapeLength { what: "index", expected: 2, actual: 3 })
        ));
    }

    #[test]
    fn test_failed_resize_keeps_previous_layout() {
        let failing = Arc::new(FailingStore::default());
        let s: Arc<dyn BackingStore> = failing.clone();
        let spec = TensorSpec::dynamic(&[None], &[8], DType::U8);
        let t = DynamicTensor::create(Arc::clone(&s), 4, &spec, &StoreConfig::default()).unwrap();
        t.write(&sel![1], &arr1(&[1u8, 2])).unwrap();

        failing.fail_under(TENSOR_META_KEY);
        assert!(matches!(t.resize_shape(6), Err(TensorStoreError::IoError(_))));
        assert_eq!(t.num_samples(), 4);
        assert!(t.sample_shape(5).is_err());

        // the shape table written ahead of the metadata was put back
        let reopened = DynamicTensor::open(Arc::clone(&s), Mode::Read, &StoreConfig::default()).unwrap();
        assert_eq!(reopened.num_samples(), 4);
        assert_eq!(reopened.sample_shape(1).unwrap(), vec![2]);

        failing.heal();
        t.resize_shape(6).unwrap();
        assert_eq!(t.num_samples(), 6);
    }

    #[test]
    fn test_undo_resize_restores_extents() {
        let spec = TensorSpec::dynamic(&[None], &[8], DType::U8);
        let t = DynamicTensor::create(store(), 4, &spec, &StoreConfig::default()).unwrap();
        t.write(&sel![3], &arr1(&[5u8, 5, 5])).unwrap();

        let undo = t.begin_resize(2).unwrap().unwrap();
        assert_eq!(t.num_samples(), 2);
        t.undo_resize(undo).unwrap();
        assert_eq!(t.num_samples(), 4);
        assert_eq!(t.read::<u8>(&sel![3]).unwrap(), arr1(&[5u8, 5, 5]).into_dyn());
        assert!(t.begin_resize(4).unwrap().is_none());
    }

    #[test]
    fn test_failed_create_leaves_foreign_keys() {
        let failing = Arc::new(FailingStore::default());
        failing.set("notes/readme", b"keep me").unwrap();
        failing.fail_under(SHAPE_TABLE_KEY);

        let s: Arc<dyn BackingStore> = failing.clone();
        let spec = TensorSpec::dynamic(&[None], &[8], DType::U8);
        assert!(DynamicTensor::create(Arc::clone(&s), 2, &spec, &StoreConfig::default()).is_err());
        assert!(!s.exists(TENSOR_META_KEY).unwrap());
        assert_eq!(s.list_keys("").unwrap(), vec!["notes/readme".to_string()]);
    }
}
