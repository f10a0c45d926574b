use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use crate::axes::{Axes, Axis, AxisIdTuple, AxisSlice};
use crate::dtype::DType;
use crate::error::{Error, Result};

// TensorDescription: how a tensor's axes map onto a flat buffer
//
// A description pairs an axis list with strides, sizes and an offset, all in
// elements. Views (reaxe, slice, dot reshapes) never copy data: they build a
// new description over the same storage.
//
// Each axis owns a small vector of strides rather than a single stride. A
// plain axis has one entry. A flattened axis has one entry per member, so a
// view such as "(C, H) seen as one axis" over a transposed buffer stays
// exact: stepping the flattened axis walks the members in row-major order,
// each with its own stride.
//
// The description that owns the buffer is the base. Every view records the
// StorageId of its base; the transformer attaches physical buffers to
// StorageIds, never to views.

/// Identifies the buffer a description (and all its views) lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageId(pub u32);

/// One entry of a `slice` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SliceItem {
    /// Select one cell; the axis is dropped.
    Index(isize),
    /// Keep a window of the axis.
    Range(AxisSlice),
}

impl From<AxisSlice> for SliceItem {
    fn from(s: AxisSlice) -> Self {
        SliceItem::Range(s)
    }
}

impl From<isize> for SliceItem {
    fn from(i: isize) -> Self {
        SliceItem::Index(i)
    }
}

/// Where each target axis of a reaxe comes from in the source description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AxisPosition {
    /// Not in the source; broadcast with stride 0.
    Missing,
    At(usize),
    /// A flattened target axis; one entry per member.
    Members(Vec<Option<usize>>),
}

#[derive(Clone)]
pub struct TensorDescription {
    axes: Axes,
    dtype: DType,
    full_strides: Vec<Vec<isize>>,
    full_sizes: Vec<Vec<usize>>,
    offset: isize,
    storage: StorageId,
    base: Option<Arc<TensorDescription>>,
}

impl TensorDescription {
    /// A base description: contiguous row-major storage for `axes`.
    pub fn new(axes: Axes, dtype: DType, storage: StorageId) -> Self {
        let full_sizes = axes.full_lengths();
        let mut full_strides: Vec<Vec<isize>> = full_sizes.iter().map(|s| vec![0; s.len()]).collect();
        let mut stride = 1isize;
        for (sizes, strides) in full_sizes.iter().zip(full_strides.iter_mut()).rev() {
            for (len, st) in sizes.iter().zip(strides.iter_mut()).rev() {
                *st = stride;
                stride *= *len as isize;
            }
        }
        let mut td = TensorDescription {
            axes,
            dtype,
            full_strides,
            full_sizes,
            offset: 0,
            storage,
            base: None,
        };
        td.collapse_numerics();
        td
    }

    pub fn axes(&self) -> &Axes {
        &self.axes
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn offset(&self) -> isize {
        self.offset
    }

    pub fn storage(&self) -> StorageId {
        self.storage
    }

    pub fn full_strides(&self) -> &[Vec<isize>] {
        &self.full_strides
    }

    pub fn full_sizes(&self) -> &[Vec<usize>] {
        &self.full_sizes
    }

    pub fn ndim(&self) -> usize {
        self.axes.len()
    }

    pub fn is_base(&self) -> bool {
        self.base.is_none()
    }

    /// The description that owns the buffer.
    pub fn base(&self) -> &TensorDescription {
        match &self.base {
            Some(base) => base,
            None => self,
        }
    }

    pub fn shape(&self) -> Vec<usize> {
        self.axes.lengths()
    }

    /// One stride per axis; the smallest of a flattened axis' strides.
    pub fn strides(&self) -> Vec<isize> {
        self.full_strides
            .iter()
            .map(|s| s.iter().copied().min().unwrap_or(0))
            .collect()
    }

    pub fn sizes(&self) -> Vec<usize> {
        self.full_sizes.iter().map(|s| s.iter().product()).collect()
    }

    /// Number of logical elements.
    pub fn size(&self) -> usize {
        self.axes.size()
    }

    /// Number of elements the base buffer must hold.
    pub fn base_elems(&self) -> usize {
        self.base().size()
    }

    /// Key describing layout and element type, used to cache generated code.
    pub fn parameter_key(&self) -> String {
        format!(
            "{}{:?}{:?}+{}",
            self.dtype,
            self.axes.full_lengths(),
            self.full_strides,
            self.offset
        )
    }

    fn view(
        &self,
        axes: Axes,
        full_strides: Vec<Vec<isize>>,
        full_sizes: Vec<Vec<usize>>,
        offset: isize,
    ) -> TensorDescription {
        let base = match &self.base {
            Some(base) => base.clone(),
            None => Arc::new(self.clone()),
        };
        let mut td = TensorDescription {
            axes,
            dtype: self.dtype,
            full_strides,
            full_sizes,
            offset,
            storage: self.storage,
            base: Some(base),
        };
        td.collapse_numerics();
        td
    }

    /// A view of this description over `new_axes`. Axes present in the
    /// source keep their strides; a missing axis is broadcast (stride 0) if
    /// `broadcast` is set, otherwise it is an error.
    pub fn reaxe(&self, new_axes: &Axes, broadcast: bool) -> Result<TensorDescription> {
        let positions = self.guess_positions(new_axes);
        self.reaxe_with_positions(new_axes, &positions, broadcast)
    }

    fn guess_positions(&self, new_axes: &Axes) -> Vec<AxisPosition> {
        let mut used = vec![false; self.axes.len()];
        let mut take = |axis: &Axis| -> Option<usize> {
            let found = (0..self.axes.len()).find(|&i| !used[i] && self.axes[i] == *axis);
            if let Some(i) = found {
                used[i] = true;
            }
            found
        };
        new_axes
            .iter()
            .map(|axis| {
                if let Some(i) = take(axis) {
                    return AxisPosition::At(i);
                }
                match axis.members() {
                    Some(members) => AxisPosition::Members(members.iter().map(&mut take).collect()),
                    None => AxisPosition::Missing,
                }
            })
            .collect()
    }

    pub fn reaxe_with_positions(
        &self,
        new_axes: &Axes,
        positions: &[AxisPosition],
        broadcast: bool,
    ) -> Result<TensorDescription> {
        if new_axes.len() != positions.len() {
            return Err(Error::Internal(format!(
                "reaxe to {} with {} positions",
                new_axes,
                positions.len()
            )));
        }
        let missing = |axis: &Axis| -> Result<()> {
            if broadcast {
                Ok(())
            } else {
                Err(Error::axis(format!(
                    "axis {} not found in {}, and broadcast disabled",
                    axis, self.axes
                )))
            }
        };
        let mut full_strides = Vec::with_capacity(new_axes.len());
        let mut full_sizes = Vec::with_capacity(new_axes.len());
        for (axis, pos) in new_axes.iter().zip(positions) {
            match pos {
                AxisPosition::Missing => {
                    missing(axis)?;
                    let lens = match axis.members() {
                        Some(members) => members.lengths(),
                        None => vec![axis.length()],
                    };
                    full_strides.push(vec![0; lens.len()]);
                    full_sizes.push(lens);
                }
                AxisPosition::At(i) => {
                    full_strides.push(self.full_strides[*i].clone());
                    full_sizes.push(self.full_sizes[*i].clone());
                }
                AxisPosition::Members(subs) => {
                    let members = axis.members().ok_or_else(|| {
                        Error::Internal(format!("member positions given for plain axis {}", axis))
                    })?;
                    let mut strides = Vec::with_capacity(subs.len());
                    let mut sizes = Vec::with_capacity(subs.len());
                    for (member, sub) in members.iter().zip(subs) {
                        match sub {
                            None => {
                                missing(member)?;
                                strides.push(0);
                                sizes.push(member.length());
                            }
                            Some(i) => {
                                if self.full_strides[*i].len() != 1 {
                                    return Err(Error::axis(format!(
                                        "cannot flatten already flattened axis {}",
                                        self.axes[*i]
                                    )));
                                }
                                strides.push(self.full_strides[*i][0]);
                                sizes.push(self.full_sizes[*i][0]);
                            }
                        }
                    }
                    full_strides.push(strides);
                    full_sizes.push(sizes);
                }
            }
        }
        Ok(self.view(new_axes.clone(), full_strides, full_sizes, self.offset))
    }

    /// Reaxe to the axes named by `ids`, resolving each id against this
    /// description's own ids.
    pub fn reaxe_with_axis_ids(&self, ids: &AxisIdTuple) -> Result<TensorDescription> {
        let old = self.axes.as_axis_ids();
        let positions: Vec<AxisPosition> = ids
            .iter()
            .map(|id| match old.position(id) {
                Some(i) => AxisPosition::At(i),
                None => AxisPosition::Missing,
            })
            .collect();
        self.reaxe_with_positions(&ids.as_axes(), &positions, true)
    }

    /// Insert a broadcast `dummy` axis at `position` (default: last).
    pub fn reaxe_with_dummy_axis(
        &self,
        dummy: &Axis,
        position: Option<usize>,
    ) -> Result<TensorDescription> {
        let position = position.unwrap_or(self.axes.len()).min(self.axes.len());
        let mut axes = self.axes.to_vec();
        axes.insert(position, dummy.clone());
        let mut positions: Vec<AxisPosition> = (0..self.axes.len()).map(AxisPosition::At).collect();
        positions.insert(position, AxisPosition::Missing);
        self.reaxe_with_positions(&Axes::new(axes), &positions, true)
    }

    /// Same strides, relabelled axes of identical lengths.
    pub fn cast(&self, new_axes: &Axes) -> Result<TensorDescription> {
        if new_axes.lengths() != self.axes.lengths() {
            return Err(Error::axis(format!(
                "cannot cast {} to {}: lengths differ",
                self.axes, new_axes
            )));
        }
        Ok(self.view(
            new_axes.clone(),
            self.full_strides.clone(),
            self.full_sizes.clone(),
            self.offset,
        ))
    }

    /// View the description as at most two axes: the axes before `div`
    /// flattened together, and the axes from `div` on. When `div` is 0 or
    /// the number of axes, the result has a single flattened axis.
    pub fn split_reduce_at(&self, div: usize) -> Result<TensorDescription> {
        let n = self.axes.len();
        if n == 0 {
            return Ok(self.view(
                self.axes.clone(),
                self.full_strides.clone(),
                self.full_sizes.clone(),
                self.offset,
            ));
        }
        let groups: Vec<Range<usize>> = if div == 0 || div >= n {
            vec![0..n]
        } else {
            vec![0..div, div..n]
        };
        let mut axes = Vec::with_capacity(groups.len());
        let mut positions = Vec::with_capacity(groups.len());
        for group in groups {
            if group.len() == 1 {
                axes.push(self.axes[group.start].clone());
                positions.push(AxisPosition::At(group.start));
            } else {
                axes.push(Axis::flattened(self.axes.slice(group.clone())));
                positions.push(AxisPosition::Members(group.map(Some).collect()));
            }
        }
        self.reaxe_with_positions(&Axes::new(axes), &positions, false)
    }

    /// Left operand of a dot: kept axes flattened, then the reduction axes
    /// flattened.
    pub fn dot_reaxe_left(&self, red_ids: &AxisIdTuple) -> Result<TensorDescription> {
        let old = self.axes.as_axis_ids();
        if !red_ids.sub(&old).is_empty() {
            return Err(Error::axis(format!(
                "reduction axes {} not all in {}",
                red_ids.as_axes(),
                self.axes
            )));
        }
        let ids = old.sub(red_ids).append(red_ids);
        self.reaxe_with_axis_ids(&ids)?
            .split_reduce_at(old.len() - red_ids.len())
    }

    /// Right operand of a dot: reduction axes flattened, then the kept axes
    /// flattened. `forward_ids` renames reduction ids taken from a forward
    /// dot's output into this description's ids (used by dot adjoints).
    pub fn dot_reaxe_right(
        &self,
        red_ids: &AxisIdTuple,
        forward_ids: Option<&AxisIdTuple>,
    ) -> Result<TensorDescription> {
        let old = self.axes.as_axis_ids();
        let red_ids = match forward_ids {
            Some(forward) => red_ids
                .iter()
                .map(|id| match forward.position(id) {
                    Some(p) if p < old.len() => Ok(old.as_slice()[p].clone()),
                    Some(_) => Err(Error::axis("forward dot axes do not match adjoint axes")),
                    None => Ok(id.clone()),
                })
                .collect::<Result<AxisIdTuple>>()?,
            None => red_ids.clone(),
        };
        if !red_ids.sub(&old).is_empty() {
            return Err(Error::axis(format!(
                "reduction axes {} not all in {}",
                red_ids.as_axes(),
                self.axes
            )));
        }
        let ids = red_ids.append(&old.sub(&red_ids));
        self.reaxe_with_axis_ids(&ids)?.split_reduce_at(red_ids.len())
    }

    /// Select cells or windows of each axis. `new_axes` names the axes kept
    /// by range entries, in order; each must match the window's length.
    pub fn slice(&self, slices: &[SliceItem], new_axes: &Axes) -> Result<TensorDescription> {
        if slices.len() > self.axes.len() {
            return Err(Error::InvalidSlice(format!(
                "{} slice entries for {} axes",
                slices.len(),
                self.axes.len()
            )));
        }
        let strides = self.strides();
        let mut full_strides = Vec::new();
        let mut full_sizes = Vec::new();
        let mut kept = 0;
        let mut offset = self.offset;
        for (i, axis) in self.axes.iter().enumerate() {
            let item = slices
                .get(i)
                .copied()
                .unwrap_or(SliceItem::Range(AxisSlice::full()));
            let len = axis.length();
            let idx = match item {
                SliceItem::Range(s) => {
                    let (start, _, step) = s.indices(len)?;
                    let new_len = s.len_for(len)?;
                    let new_axis = new_axes.get(kept).ok_or_else(|| {
                        Error::InvalidSlice(format!("not enough new axes for slice of {}", self.axes))
                    })?;
                    if new_axis.length() != new_len {
                        return Err(Error::InvalidSlice(format!(
                            "axis {} has length {}, slice selects {}",
                            new_axis, new_axis.length(), new_len
                        )));
                    }
                    kept += 1;
                    full_strides.push(vec![strides[i] * step]);
                    full_sizes.push(vec![new_len]);
                    start
                }
                SliceItem::Index(idx) => {
                    let idx = if idx < 0 { idx + len as isize } else { idx };
                    if idx < 0 || idx >= len as isize {
                        return Err(Error::InvalidSlice(format!(
                            "index {} out of range for axis {}",
                            idx, axis
                        )));
                    }
                    idx
                }
            };
            offset += idx * strides[i];
        }
        if kept != new_axes.len() {
            return Err(Error::InvalidSlice(format!(
                "slice keeps {} axes but {} were given",
                kept,
                new_axes.len()
            )));
        }
        Ok(self.view(new_axes.clone(), full_strides, full_sizes, offset))
    }

    /// Replace flattened axes whose members are all numeric, and laid out
    /// contiguously, by a single numeric axis.
    fn collapse_numerics(&mut self) {
        let mut changed = false;
        let mut axes = self.axes.to_vec();
        for (i, axis) in self.axes.iter().enumerate() {
            let members = match axis.members() {
                Some(m) if m.iter().all(|a| a.is_numeric()) => m,
                _ => continue,
            };
            let strides = &self.full_strides[i];
            let lens = members.lengths();
            let contiguous = strides.iter().all(|&s| s == 0)
                || (1..strides.len()).all(|k| strides[k - 1] == strides[k] * lens[k] as isize);
            if !contiguous {
                continue;
            }
            let inner = strides.last().copied().unwrap_or(0);
            axes[i] = Axis::numeric(axis.length());
            self.full_strides[i] = vec![inner];
            self.full_sizes[i] = vec![self.full_sizes[i].iter().product()];
            changed = true;
        }
        if changed {
            self.axes = Axes::new(axes);
        }
    }

    /// Leaf dims and strides of `range` of axes, flattened axes expanded to
    /// their members.
    pub fn leaf_layout(&self, range: Range<usize>) -> (Vec<usize>, Vec<isize>) {
        let mut dims = Vec::new();
        let mut strides = Vec::new();
        for i in range {
            let axis = &self.axes[i];
            let nested = &self.full_strides[i];
            match axis.members() {
                Some(members) if nested.len() > 1 && members.len() == nested.len() => {
                    dims.extend(members.lengths());
                    strides.extend(nested.iter().copied());
                }
                _ => {
                    dims.push(axis.length());
                    strides.push(nested.iter().copied().min().unwrap_or(0));
                }
            }
        }
        (dims, strides)
    }

    /// Buffer offsets of every element, in row-major logical order.
    pub fn offsets(&self) -> LeafOffsets {
        let (dims, strides) = self.leaf_layout(0..self.axes.len());
        LeafOffsets::new(dims, strides, self.offset)
    }

    /// Offsets, relative to the description's own offset, of every index
    /// combination of the axes in `range`.
    pub fn axis_offsets(&self, range: Range<usize>) -> Vec<isize> {
        let (dims, strides) = self.leaf_layout(range);
        LeafOffsets::new(dims, strides, 0).collect()
    }
}

impl PartialEq for TensorDescription {
    fn eq(&self, other: &Self) -> bool {
        self.axes == other.axes
            && self.dtype == other.dtype
            && self.full_strides == other.full_strides
            && self.full_sizes == other.full_sizes
            && self.offset == other.offset
            && self.storage == other.storage
    }
}

impl fmt::Debug for TensorDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorDescription")
            .field("axes", &self.axes)
            .field("dtype", &self.dtype)
            .field("strides", &self.full_strides)
            .field("offset", &self.offset)
            .field("storage", &self.storage)
            .finish()
    }
}

/// Iterator over buffer offsets of a strided layout, rightmost dim fastest.
pub struct LeafOffsets {
    current: Vec<usize>,
    dims: Vec<usize>,
    strides: Vec<isize>,
    offset: isize,
    remaining: usize,
    started: bool,
}

impl LeafOffsets {
    pub fn new(dims: Vec<usize>, strides: Vec<isize>, offset: isize) -> Self {
        let remaining = dims.iter().product();
        LeafOffsets {
            current: vec![0; dims.len()],
            dims,
            strides,
            offset,
            remaining,
            started: false,
        }
    }

    fn flat_index(&self) -> isize {
        let mut idx = self.offset;
        for (i, &c) in self.current.iter().enumerate() {
            idx += c as isize * self.strides[i];
        }
        idx
    }

    fn advance(&mut self) {
        for i in (0..self.dims.len()).rev() {
            self.current[i] += 1;
            if self.current[i] < self.dims[i] {
                return;
            }
            self.current[i] = 0;
        }
    }
}

impl Iterator for LeafOffsets {
    type Item = isize;

    fn next(&mut self) -> Option<isize> {
        if self.remaining == 0 {
            return None;
        }
        if self.started {
            self.advance();
        }
        self.started = true;
        self.remaining -= 1;
        Some(self.flat_index())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for LeafOffsets {}
