use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::{Add, Index, Sub};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

// Axes: the dimension model of every tensor in a graph
//
// A tensor never has "dimension 0" or "dimension 1". It has a sequence of
// Axis handles, and two tensors line up wherever they share an axis. Axes
// compare by identity: two axes created with the same name and length are
// still different axes. The only exception is NumericAxis, which is keyed by
// its length so that every anonymous axis of length 3 is the same axis.
//
// Because an axis may appear more than once in one tensor (a square matrix
// over (H, H)), set algebra is done on AxisId pairs (axis, occurrence) rather
// than on bare axes.
//
// Derived axis kinds:
//
//   Sliced    : a window of a parent axis (step 1 or -1)
//   Padded    : a parent axis with extra cells before and after
//   Flattened : several axes viewed as one; length is the product

static NEXT_AXIS_UID: AtomicU64 = AtomicU64::new(1);

fn next_uid() -> u64 {
    NEXT_AXIS_UID.fetch_add(1, Ordering::Relaxed)
}

/// How an axis was derived.
#[derive(Debug, Clone)]
pub enum AxisKind {
    Plain,
    Numeric,
    Sliced { parent: Axis, slice: AxisSlice },
    Padded { parent: Axis, pre: usize, post: usize },
    Flattened(Axes),
}

struct AxisInner {
    uid: u64,
    name: Option<String>,
    length: usize,
    batch: bool,
    kind: AxisKind,
}

/// A named dimension with a length. Cheap to clone; clones share identity.
#[derive(Clone)]
pub struct Axis(Arc<AxisInner>);

#[derive(PartialEq, Eq, Hash)]
enum Identity {
    Numeric(usize),
    Unique(u64),
}

impl Axis {
    fn build(name: Option<String>, length: usize, batch: bool, kind: AxisKind) -> Self {
        Axis(Arc::new(AxisInner {
            uid: next_uid(),
            name,
            length,
            batch,
            kind,
        }))
    }

    /// A fresh anonymous sample axis.
    pub fn new(length: usize) -> Self {
        Self::build(None, length, false, AxisKind::Plain)
    }

    pub fn named(name: impl Into<String>, length: usize) -> Self {
        Self::build(Some(name.into()), length, false, AxisKind::Plain)
    }

    /// A fresh batch axis.
    pub fn batch(length: usize) -> Self {
        Self::build(Some("N".to_string()), length, true, AxisKind::Plain)
    }

    pub fn named_batch(name: impl Into<String>, length: usize) -> Self {
        Self::build(Some(name.into()), length, true, AxisKind::Plain)
    }

    /// The numeric axis of this length. Equal to every other numeric axis
    /// with the same length.
    pub fn numeric(length: usize) -> Self {
        Self::build(None, length, false, AxisKind::Numeric)
    }

    /// A window of `parent` selected by `slice`.
    pub fn sliced(parent: &Axis, slice: AxisSlice) -> Result<Self> {
        let length = slice.len_for(parent.length())?;
        Ok(Self::build(
            None,
            length,
            parent.is_batch(),
            AxisKind::Sliced {
                parent: parent.clone(),
                slice,
            },
        ))
    }

    pub fn padded(parent: &Axis, pre: usize, post: usize) -> Self {
        Self::build(
            None,
            parent.length() + pre + post,
            parent.is_batch(),
            AxisKind::Padded {
                parent: parent.clone(),
                pre,
                post,
            },
        )
    }

    /// Several axes viewed as one. Use [`Axes::new`] to get the canonical
    /// form: an empty flattened axis disappears, a single member collapses.
    pub fn flattened(members: Axes) -> Self {
        let length = members.size();
        Self::build(None, length, false, AxisKind::Flattened(members))
    }

    pub fn length(&self) -> usize {
        self.0.length
    }

    pub fn is_batch(&self) -> bool {
        self.0.batch
    }

    pub fn kind(&self) -> &AxisKind {
        &self.0.kind
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self.0.kind, AxisKind::Numeric)
    }

    pub fn is_flattened(&self) -> bool {
        matches!(self.0.kind, AxisKind::Flattened(_))
    }

    /// Member axes of a flattened axis.
    pub fn members(&self) -> Option<&Axes> {
        match &self.0.kind {
            AxisKind::Flattened(axes) => Some(axes),
            _ => None,
        }
    }

    pub fn name(&self) -> String {
        match (&self.0.name, &self.0.kind) {
            (Some(name), _) => name.clone(),
            (None, AxisKind::Numeric) => format!("Numeric{}", self.0.length),
            (None, AxisKind::Sliced { parent, .. }) => format!("{}_sliced", parent.name()),
            (None, AxisKind::Padded { parent, .. }) => format!("{}_padded", parent.name()),
            (None, AxisKind::Flattened(members)) => {
                let names: Vec<String> = members.iter().map(|a| a.name()).collect();
                format!("[{}]", names.join(","))
            }
            (None, AxisKind::Plain) => format!("Axis{}", self.0.uid),
        }
    }

    fn identity(&self) -> Identity {
        match self.0.kind {
            AxisKind::Numeric => Identity::Numeric(self.0.length),
            _ => Identity::Unique(self.0.uid),
        }
    }
}

impl PartialEq for Axis {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for Axis {}

impl Hash for Axis {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state)
    }
}

impl fmt::Debug for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name(), self.length())
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A Python-style slice over one axis. Only steps of 1 and -1 are valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AxisSlice {
    pub start: Option<isize>,
    pub stop: Option<isize>,
    pub step: isize,
}

impl AxisSlice {
    pub fn new(start: Option<isize>, stop: Option<isize>, step: isize) -> Self {
        AxisSlice { start, stop, step }
    }

    /// The whole axis.
    pub fn full() -> Self {
        AxisSlice::new(None, None, 1)
    }

    pub fn range(start: isize, stop: isize) -> Self {
        AxisSlice::new(Some(start), Some(stop), 1)
    }

    /// The whole axis, back to front.
    pub fn reversed() -> Self {
        AxisSlice::new(None, None, -1)
    }

    /// Resolve against an axis of length `len`: `(start, stop, step)` with
    /// the same clamping rules as Python's `slice.indices`.
    pub fn indices(&self, len: usize) -> Result<(isize, isize, isize)> {
        let step = self.step;
        if step != 1 && step != -1 {
            return Err(Error::InvalidSlice(format!(
                "step must be 1 or -1, got {}",
                step
            )));
        }
        let len = len as isize;
        let (lower, upper) = if step > 0 { (0, len) } else { (-1, len - 1) };
        let clamp = |v: Option<isize>, default: isize| -> isize {
            match v {
                None => default,
                Some(v) => {
                    let v = if v < 0 { v + len } else { v };
                    v.clamp(lower, upper)
                }
            }
        };
        let start = clamp(self.start, if step < 0 { upper } else { lower });
        let stop = clamp(self.stop, if step < 0 { lower } else { upper });
        Ok((start, stop, step))
    }

    /// Number of cells selected from an axis of length `len`.
    pub fn len_for(&self, len: usize) -> Result<usize> {
        let (start, stop, step) = self.indices(len)?;
        let n = if step > 0 { stop - start } else { start - stop };
        Ok(n.max(0) as usize)
    }
}

// AxisId: one occurrence of an axis in an axis list

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AxisId {
    pub axis: Axis,
    pub index: usize,
}

/// An ordered tuple of AxisIds. All set operations keep the left operand's
/// order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct AxisIdTuple(Vec<AxisId>);

impl AxisIdTuple {
    pub fn new(ids: Vec<AxisId>) -> Self {
        AxisIdTuple(ids)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, AxisId> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[AxisId] {
        &self.0
    }

    pub fn contains(&self, id: &AxisId) -> bool {
        self.0.contains(id)
    }

    pub fn as_axes(&self) -> Axes {
        Axes::new(self.0.iter().map(|id| id.axis.clone()))
    }

    /// Ids of `self` that are not in `other`.
    pub fn sub(&self, other: &AxisIdTuple) -> AxisIdTuple {
        self.0
            .iter()
            .filter(|id| !other.contains(id))
            .cloned()
            .collect()
    }

    /// Ids of `self` that are also in `other`.
    pub fn intersect(&self, other: &AxisIdTuple) -> AxisIdTuple {
        self.0
            .iter()
            .filter(|id| other.contains(id))
            .cloned()
            .collect()
    }

    /// `self` followed by the ids of `other` not already present.
    pub fn append(&self, other: &AxisIdTuple) -> AxisIdTuple {
        let mut ids = self.0.clone();
        for id in other.iter() {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        AxisIdTuple(ids)
    }

    /// Position at which `sub` occurs as a contiguous run of `self`.
    pub fn find(&self, sub: &AxisIdTuple) -> Option<usize> {
        if sub.is_empty() {
            return Some(0);
        }
        if sub.len() > self.len() {
            return None;
        }
        (0..=self.len() - sub.len()).find(|&i| self.0[i..i + sub.len()] == sub.0[..])
    }

    pub fn position(&self, id: &AxisId) -> Option<usize> {
        self.0.iter().position(|x| x == id)
    }
}

impl FromIterator<AxisId> for AxisIdTuple {
    fn from_iter<I: IntoIterator<Item = AxisId>>(iter: I) -> Self {
        AxisIdTuple(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a AxisIdTuple {
    type Item = &'a AxisId;
    type IntoIter = std::slice::Iter<'a, AxisId>;
    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl Add for &AxisIdTuple {
    type Output = AxisIdTuple;
    fn add(self, rhs: &AxisIdTuple) -> AxisIdTuple {
        self.append(rhs)
    }
}

impl Sub for &AxisIdTuple {
    type Output = AxisIdTuple;
    fn sub(self, rhs: &AxisIdTuple) -> AxisIdTuple {
        AxisIdTuple::sub(self, rhs)
    }
}

// Axes: an ordered, canonicalized axis list

#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Axes(Vec<Axis>);

fn canonicalize(axis: Axis) -> Option<Axis> {
    match axis.members() {
        Some(members) if members.is_empty() => None,
        Some(members) if members.len() == 1 => Some(members[0].clone()),
        _ => Some(axis),
    }
}

impl Axes {
    pub fn new(axes: impl IntoIterator<Item = Axis>) -> Self {
        Axes(axes.into_iter().filter_map(canonicalize).collect())
    }

    pub fn empty() -> Self {
        Axes(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Axis> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Axis] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<Axis> {
        self.0.clone()
    }

    pub fn get(&self, i: usize) -> Option<&Axis> {
        self.0.get(i)
    }

    /// Pair each axis with its occurrence count so far.
    pub fn as_axis_ids(&self) -> AxisIdTuple {
        let mut ids = Vec::with_capacity(self.0.len());
        for (i, axis) in self.0.iter().enumerate() {
            let index = self.0[..i].iter().filter(|a| *a == axis).count();
            ids.push(AxisId {
                axis: axis.clone(),
                index,
            });
        }
        AxisIdTuple(ids)
    }

    /// Ordered union.
    pub fn union(&self, other: &Axes) -> Axes {
        self.as_axis_ids().append(&other.as_axis_ids()).as_axes()
    }

    /// Ordered difference.
    pub fn difference(&self, other: &Axes) -> Axes {
        self.as_axis_ids().sub(&other.as_axis_ids()).as_axes()
    }

    pub fn intersect(&self, other: &Axes) -> Axes {
        self.as_axis_ids().intersect(&other.as_axis_ids()).as_axes()
    }

    pub fn batch_axes(&self) -> Axes {
        Axes(self.0.iter().filter(|a| a.is_batch()).cloned().collect())
    }

    pub fn sample_axes(&self) -> Axes {
        Axes(self.0.iter().filter(|a| !a.is_batch()).cloned().collect())
    }

    pub fn lengths(&self) -> Vec<usize> {
        self.0.iter().map(|a| a.length()).collect()
    }

    /// Lengths with flattened axes expanded to their members.
    pub fn full_lengths(&self) -> Vec<Vec<usize>> {
        self.0
            .iter()
            .map(|a| match a.members() {
                Some(members) => members.lengths(),
                None => vec![a.length()],
            })
            .collect()
    }

    /// Number of elements of a tensor with these axes.
    pub fn size(&self) -> usize {
        self.0.iter().map(|a| a.length()).product()
    }

    /// Plain concatenation; duplicates are kept.
    pub fn concat(&self, other: &Axes) -> Axes {
        Axes::new(self.0.iter().chain(other.0.iter()).cloned())
    }

    pub fn index(&self, axis: &Axis) -> Option<usize> {
        self.0.iter().position(|a| a == axis)
    }

    pub fn contains(&self, axis: &Axis) -> bool {
        self.0.contains(axis)
    }

    /// Position of `sub` as a contiguous run of these axes.
    pub fn find(&self, sub: &Axes) -> Option<usize> {
        self.as_axis_ids().find(&sub.as_axis_ids())
    }

    /// True when both lists hold the same axis ids, in any order.
    pub fn has_same_axes(&self, other: &Axes) -> bool {
        let a = self.as_axis_ids();
        let b = other.as_axis_ids();
        a.len() == b.len() && a.sub(&b).is_empty()
    }

    pub fn slice(&self, range: std::ops::Range<usize>) -> Axes {
        Axes(self.0[range].to_vec())
    }
}

/// Axes of a linear map from `in_axes` to `out_axes`: the output axes,
/// then the input axes, without the axes they share.
pub fn linear_map_axes(in_axes: &Axes, out_axes: &Axes) -> Axes {
    let in_ids = in_axes.as_axis_ids();
    let out_ids = out_axes.as_axis_ids();
    out_ids
        .append(&in_ids)
        .sub(&in_ids.intersect(&out_ids))
        .as_axes()
}

impl fmt::Debug for Axes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter()).finish()
    }
}

impl fmt::Display for Axes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|a| a.to_string()).collect();
        write!(f, "({})", parts.join(", "))
    }
}

impl Index<usize> for Axes {
    type Output = Axis;
    fn index(&self, i: usize) -> &Axis {
        &self.0[i]
    }
}

impl From<Vec<Axis>> for Axes {
    fn from(axes: Vec<Axis>) -> Self {
        Axes::new(axes)
    }
}

impl From<&[Axis]> for Axes {
    fn from(axes: &[Axis]) -> Self {
        Axes::new(axes.iter().cloned())
    }
}

impl<const N: usize> From<[Axis; N]> for Axes {
    fn from(axes: [Axis; N]) -> Self {
        Axes::new(axes)
    }
}

impl From<&Axes> for Axes {
    fn from(axes: &Axes) -> Self {
        axes.clone()
    }
}

impl From<Axis> for Axes {
    fn from(axis: Axis) -> Self {
        Axes::new([axis])
    }
}

impl FromIterator<Axis> for Axes {
    fn from_iter<I: IntoIterator<Item = Axis>>(iter: I) -> Self {
        Axes::new(iter)
    }
}

impl<'a> IntoIterator for &'a Axes {
    type Item = &'a Axis;
    type IntoIter = std::slice::Iter<'a, Axis>;
    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl Add for &Axes {
    type Output = Axes;
    fn add(self, rhs: &Axes) -> Axes {
        self.union(rhs)
    }
}

impl Sub for &Axes {
    type Output = Axes;
    fn sub(self, rhs: &Axes) -> Axes {
        self.difference(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_axes(rng: &mut StdRng, pool: &[Axis]) -> Axes {
        let n = rng.gen_range(0..6);
        Axes::new((0..n).map(|_| pool[rng.gen_range(0..pool.len())].clone()))
    }

    #[test]
    fn test_identity_not_name() {
        let a = Axis::named("C", 3);
        let b = Axis::named("C", 3);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_numeric_axes_equal_by_length() {
        assert_eq!(Axis::numeric(4), Axis::numeric(4));
        assert_ne!(Axis::numeric(4), Axis::numeric(5));
    }

    #[test]
    fn test_axis_ids_disambiguate_duplicates() {
        let h = Axis::named("H", 2);
        let w = Axis::named("W", 2);
        let ids = Axes::new([h.clone(), w.clone(), h.clone()]).as_axis_ids();
        let idx: Vec<usize> = ids.iter().map(|id| id.index).collect();
        assert_eq!(idx, vec![0, 0, 1]);
        assert_eq!(ids.as_axes(), Axes::new([h.clone(), w, h]));
    }

    #[test]
    fn test_union_difference_intersect_order() {
        let a = Axis::named("A", 2);
        let b = Axis::named("B", 3);
        let c = Axis::named("C", 4);
        let x = Axes::new([a.clone(), b.clone()]);
        let y = Axes::new([c.clone(), b.clone()]);
        assert_eq!(&x + &y, Axes::new([a.clone(), b.clone(), c.clone()]));
        assert_eq!(&y + &x, Axes::new([c.clone(), b.clone(), a.clone()]));
        assert_eq!(&x - &y, Axes::new([a.clone()]));
        assert_eq!(x.intersect(&y), Axes::new([b.clone()]));
        assert_eq!(y.intersect(&x), Axes::new([b]));
    }

    #[test]
    fn test_algebra_laws_random() {
        let pool: Vec<Axis> = (0..5).map(|i| Axis::new(i + 1)).collect();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let a = random_axes(&mut rng, &pool);
            let b = random_axes(&mut rng, &pool);
            let ia = a.as_axis_ids();
            let ib = b.as_axis_ids();

            let expected = ia.append(&ib.sub(&ia));
            assert_eq!((&a + &b).as_axis_ids(), expected);
            assert!((&a - &a).is_empty());

            let inter = a.intersect(&b).as_axis_ids();
            assert!(inter.sub(&ia).is_empty());
            assert!(inter.sub(&ib).is_empty());
        }
    }

    #[test]
    fn test_flattened_canonicalization() {
        let a = Axis::named("A", 2);
        let b = Axis::named("B", 3);
        let single = Axis::flattened(Axes::new([a.clone()]));
        let empty = Axis::flattened(Axes::empty());
        let both = Axis::flattened(Axes::new([a.clone(), b.clone()]));
        let axes = Axes::new([single, empty, both.clone()]);
        assert_eq!(axes.len(), 2);
        assert_eq!(axes[0], a);
        assert_eq!(axes[1].length(), 6);
        assert_eq!(axes.full_lengths(), vec![vec![2], vec![2, 3]]);
        assert_eq!(axes.size(), 12);
    }

    #[test]
    fn test_sliced_and_padded_lengths() {
        let a = Axis::named("A", 10);
        assert_eq!(Axis::sliced(&a, AxisSlice::range(2, 5)).unwrap().length(), 3);
        assert_eq!(Axis::sliced(&a, AxisSlice::reversed()).unwrap().length(), 10);
        assert_eq!(
            Axis::sliced(&a, AxisSlice::new(Some(-3), None, 1))
                .unwrap()
                .length(),
            3
        );
        assert!(Axis::sliced(&a, AxisSlice::new(None, None, 2)).is_err());
        assert_eq!(Axis::padded(&a, 1, 2).length(), 13);
    }

    #[test]
    fn test_slice_indices_match_python() {
        assert_eq!(AxisSlice::full().indices(5).unwrap(), (0, 5, 1));
        assert_eq!(AxisSlice::reversed().indices(5).unwrap(), (4, -1, -1));
        assert_eq!(AxisSlice::range(1, 100).indices(5).unwrap(), (1, 5, 1));
        assert_eq!(
            AxisSlice::new(Some(3), Some(0), -1).indices(5).unwrap(),
            (3, 0, -1)
        );
    }

    #[test]
    fn test_find_and_batch() {
        let n = Axis::batch(8);
        let c = Axis::named("C", 3);
        let h = Axis::named("H", 4);
        let axes = Axes::new([c.clone(), h.clone(), n.clone()]);
        assert_eq!(axes.find(&Axes::new([h.clone(), n.clone()])), Some(1));
        assert_eq!(axes.find(&Axes::new([n.clone(), h.clone()])), None);
        assert_eq!(axes.batch_axes(), Axes::new([n]));
        assert_eq!(axes.sample_axes(), Axes::new([c, h]));
    }

    #[test]
    fn test_linear_map_axes() {
        let i = Axis::named("I", 3);
        let o = Axis::named("O", 2);
        let s = Axis::named("S", 5);
        let in_axes = Axes::new([i.clone(), s.clone()]);
        let out_axes = Axes::new([o.clone(), s]);
        assert_eq!(linear_map_axes(&in_axes, &out_axes), Axes::new([o, i]));
    }
}
