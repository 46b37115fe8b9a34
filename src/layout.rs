use crate::common::{delinearize, is_permutation, Coord, DimSize, Order, Shape};
use enum_dispatch::enum_dispatch;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};
use std::collections::HashSet;
use std::fmt::{self, Display};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("Layout of rank {layout_rank} does not apply to shape {shape:?}")]
    RankMismatch { layout_rank: usize, shape: Vec<u32> },
    #[error("Layout does not distribute elements across threads")]
    NotDistributed,
    #[error("Invalid layout: {0}")]
    Invalid(String),
    #[error("Shared-memory tensors of rank {0} are not supported")]
    UnsupportedSharedRank(usize),
}

/// Enumerates which logical coordinates of a tensor a single thread owns.
///
/// Coordinates are relative to the thread's base index: every thread owns the same pattern of
/// slots, shifted by a thread-dependent origin (see
/// [emit_indices](crate::lowering::indices::emit_indices)). The order of the returned coordinates
/// is the order in which a thread's values are packed into an aggregate.
#[enum_dispatch]
pub trait DistributedLayout {
    /// The rank of tensors this layout applies to.
    fn rank(&self) -> usize;

    fn order(&self) -> Order;

    fn coordinates(&self, shape: &[DimSize]) -> Result<Vec<Coord>, LayoutError>;

    fn elems_per_thread(&self, shape: &[DimSize]) -> Result<u32, LayoutError> {
        let coordinates = self.coordinates(shape)?;
        Ok(u32::try_from(coordinates.len()).unwrap())
    }
}

#[enum_dispatch(DistributedLayout)]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum Layout {
    Blocked(BlockedLayout),
    Slice(SliceLayout),
    Shared(SharedLayout),
}

/// Distributes a tensor by tiling it with a CTA-wide tile.
///
/// Each thread owns a `size_per_thread` block; `threads_per_warp` blocks form a warp's tile and
/// `warps_per_cta` warp tiles form the CTA tile. Shapes larger than the CTA tile are covered by
/// repeating the tile, so a thread owns one block per repetition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct BlockedLayout {
    size_per_thread: Vec<u32>,
    threads_per_warp: Vec<u32>,
    warps_per_cta: Vec<u32>,
    order: Order,
}

/// The layout of a tensor obtained by removing dimension `dim` from a tensor laid out by
/// `parent`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct SliceLayout {
    dim: u8,
    parent: Box<Layout>,
}

/// A shared-memory encoding.
///
/// Only `order` affects addressing. `vec`, `per_phase`, and `max_phase` describe swizzling,
/// which is applied by the code reading and writing the buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct SharedLayout {
    pub vec: u32,
    pub per_phase: u32,
    pub max_phase: u32,
    order: Order,
}

impl Layout {
    pub fn is_shared(&self) -> bool {
        matches!(self, Layout::Shared(_))
    }

    /// Returns the innermost [BlockedLayout] this layout derives from, if any.
    pub fn blocked_root(&self) -> Option<&BlockedLayout> {
        match self {
            Layout::Blocked(b) => Some(b),
            Layout::Slice(s) => s.parent.blocked_root(),
            Layout::Shared(_) => None,
        }
    }
}

impl BlockedLayout {
    pub fn new(
        size_per_thread: Vec<u32>,
        threads_per_warp: Vec<u32>,
        warps_per_cta: Vec<u32>,
        order: Order,
    ) -> Result<Self, LayoutError> {
        let rank = size_per_thread.len();
        if threads_per_warp.len() != rank || warps_per_cta.len() != rank {
            return Err(LayoutError::Invalid(format!(
                "blocked layout parameters have mismatched ranks: {:?}, {:?}, {:?}",
                size_per_thread, threads_per_warp, warps_per_cta
            )));
        }
        if !is_permutation(&order, rank) {
            return Err(LayoutError::Invalid(format!(
                "order {order:?} is not a permutation of 0..{rank}"
            )));
        }
        if size_per_thread
            .iter()
            .chain(&threads_per_warp)
            .chain(&warps_per_cta)
            .any(|&x| x == 0)
        {
            return Err(LayoutError::Invalid(
                "blocked layout parameters must be non-zero".to_string(),
            ));
        }
        Ok(BlockedLayout {
            size_per_thread,
            threads_per_warp,
            warps_per_cta,
            order,
        })
    }

    pub fn size_per_thread(&self) -> &[u32] {
        &self.size_per_thread
    }

    pub fn threads_per_warp(&self) -> &[u32] {
        &self.threads_per_warp
    }

    pub fn warps_per_cta(&self) -> &[u32] {
        &self.warps_per_cta
    }

    /// The extent of the tile covered by one CTA in each dimension.
    pub fn shape_per_cta(&self) -> SmallVec<[u32; 4]> {
        self.size_per_thread
            .iter()
            .zip(&self.threads_per_warp)
            .zip(&self.warps_per_cta)
            .map(|((s, t), w)| s * t * w)
            .collect()
    }

    fn check_rank(&self, shape: &[DimSize]) -> Result<(), LayoutError> {
        if shape.len() != self.rank() {
            return Err(LayoutError::RankMismatch {
                layout_rank: self.rank(),
                shape: shape.iter().map(|d| d.get()).collect(),
            });
        }
        Ok(())
    }
}

impl DistributedLayout for BlockedLayout {
    fn rank(&self) -> usize {
        self.size_per_thread.len()
    }

    fn order(&self) -> Order {
        self.order.clone()
    }

    fn coordinates(&self, shape: &[DimSize]) -> Result<Vec<Coord>, LayoutError> {
        self.check_rank(shape)?;
        let tile = self.shape_per_cta();
        let reps: SmallVec<[u32; 4]> = shape
            .iter()
            .zip(&tile)
            .map(|(s, t)| s.get().div_ceil(*t))
            .collect();
        let per_rep: u32 = self.size_per_thread.iter().product();
        let total = per_rep * reps.iter().product::<u32>();

        let coordinates = (0..total)
            .map(|n| {
                let rep = delinearize(n / per_rep, &reps, &self.order);
                let elem = delinearize(n % per_rep, &self.size_per_thread, &self.order);
                (0..self.rank())
                    .map(|k| rep[k] * tile[k] + elem[k])
                    .collect::<Coord>()
            })
            .collect();
        Ok(coordinates)
    }

    fn elems_per_thread(&self, shape: &[DimSize]) -> Result<u32, LayoutError> {
        self.check_rank(shape)?;
        Ok(shape
            .iter()
            .zip(self.shape_per_cta())
            .zip(&self.size_per_thread)
            .map(|((s, t), spt)| s.get().div_ceil(t) * spt)
            .product())
    }
}

impl SliceLayout {
    pub fn new(dim: u8, parent: Layout) -> Result<Self, LayoutError> {
        if parent.is_shared() {
            return Err(LayoutError::Invalid(
                "slice layouts require a distributed parent".to_string(),
            ));
        }
        if usize::from(dim) >= parent.rank() {
            return Err(LayoutError::Invalid(format!(
                "slice dimension {dim} out of range for parent of rank {}",
                parent.rank()
            )));
        }
        Ok(SliceLayout {
            dim,
            parent: Box::new(parent),
        })
    }

    pub fn dim(&self) -> u8 {
        self.dim
    }

    pub fn parent(&self) -> &Layout {
        &self.parent
    }

    /// The parent's shape: `shape` with a size-one dimension re-inserted at `dim`.
    pub fn padded_shape(&self, shape: &[DimSize]) -> Shape {
        let mut padded = Shape::from(shape);
        padded.insert(usize::from(self.dim), DimSize::MIN);
        padded
    }
}

impl DistributedLayout for SliceLayout {
    fn rank(&self) -> usize {
        self.parent.rank() - 1
    }

    fn order(&self) -> Order {
        crate::common::drop_dims_from_order(&self.parent.order(), &[usize::from(self.dim)])
    }

    fn coordinates(&self, shape: &[DimSize]) -> Result<Vec<Coord>, LayoutError> {
        if shape.len() != self.rank() {
            return Err(LayoutError::RankMismatch {
                layout_rank: self.rank(),
                shape: shape.iter().map(|d| d.get()).collect(),
            });
        }
        let parent_coordinates = self.parent.coordinates(&self.padded_shape(shape))?;
        let dim = usize::from(self.dim);
        let mut seen = HashSet::with_capacity(parent_coordinates.len());
        Ok(parent_coordinates
            .into_iter()
            .filter_map(|mut c| {
                c.remove(dim);
                seen.insert(c.clone()).then_some(c)
            })
            .collect())
    }
}

impl SharedLayout {
    pub fn new(vec: u32, per_phase: u32, max_phase: u32, order: Order) -> Self {
        SharedLayout {
            vec,
            per_phase,
            max_phase,
            order,
        }
    }

    /// The dimension order used for an allocation of the given rank.
    ///
    /// Rank-3 tensors are pipelined buffers whose encoding only describes the two inner
    /// dimensions. Their order is shifted by one and the leading (stage) dimension is placed
    /// slowest. Ranks above 3 are not supported.
    pub fn allocation_order(&self, rank: usize) -> Result<Order, LayoutError> {
        match rank {
            3 => {
                let &[inner, outer] = self.order.as_slice() else {
                    return Err(LayoutError::Invalid(format!(
                        "rank-3 allocations expect a two-dimensional encoding order, got {:?}",
                        self.order
                    )));
                };
                Ok(smallvec![inner + 1, outer + 1, 0])
            }
            r if r > 3 => Err(LayoutError::UnsupportedSharedRank(r)),
            r => {
                if is_permutation(&self.order, r) {
                    Ok(self.order.clone())
                } else {
                    Err(LayoutError::Invalid(format!(
                        "order {:?} is not a permutation of 0..{r}",
                        self.order
                    )))
                }
            }
        }
    }

    /// The dimension order of a view of the given rank.
    ///
    /// Views derived by slicing carry an order covering all of their dimensions, which is used
    /// as-is. Otherwise this is the [allocation order](Self::allocation_order).
    pub fn view_order(&self, rank: usize) -> Result<Order, LayoutError> {
        if is_permutation(&self.order, rank) {
            Ok(self.order.clone())
        } else {
            self.allocation_order(rank)
        }
    }
}

impl DistributedLayout for SharedLayout {
    fn rank(&self) -> usize {
        self.order.len()
    }

    fn order(&self) -> Order {
        self.order.clone()
    }

    fn coordinates(&self, _shape: &[DimSize]) -> Result<Vec<Coord>, LayoutError> {
        Err(LayoutError::NotDistributed)
    }

    fn elems_per_thread(&self, _shape: &[DimSize]) -> Result<u32, LayoutError> {
        Err(LayoutError::NotDistributed)
    }
}

impl Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layout::Blocked(b) => write!(
                f,
                "#blocked<spt=[{}], tpw=[{}], wpc=[{}], order=[{}]>",
                b.size_per_thread.iter().join(", "),
                b.threads_per_warp.iter().join(", "),
                b.warps_per_cta.iter().join(", "),
                b.order.iter().join(", ")
            ),
            Layout::Slice(s) => write!(f, "#slice<dim={}, parent={}>", s.dim, s.parent),
            Layout::Shared(s) => write!(
                f,
                "#shared<vec={}, per_phase={}, max_phase={}, order=[{}]>",
                s.vec,
                s.per_phase,
                s.max_phase,
                s.order.iter().join(", ")
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape;
    use proptest::prelude::*;

    fn blocked(spt: &[u32], tpw: &[u32], wpc: &[u32], order: &[u8]) -> Layout {
        BlockedLayout::new(spt.to_vec(), tpw.to_vec(), wpc.to_vec(), order.into())
            .unwrap()
            .into()
    }

    fn coords(layout: &Layout, shape: &[DimSize]) -> Vec<Vec<u32>> {
        layout
            .coordinates(shape)
            .unwrap()
            .into_iter()
            .map(|c| c.to_vec())
            .collect()
    }

    #[test]
    fn test_blocked_coordinates_single_repetition() {
        let layout = blocked(&[1, 4], &[8, 4], &[4, 1], &[1, 0]);
        assert_eq!(
            coords(&layout, &shape![32, 16]),
            vec![vec![0, 0], vec![0, 1], vec![0, 2], vec![0, 3]]
        );
    }

    #[test]
    fn test_blocked_coordinates_repeat_tile() {
        // The CTA tile is [2, 4]; a [4, 4] tensor needs two repetitions along dimension 0.
        let layout = blocked(&[1, 2], &[2, 2], &[1, 1], &[1, 0]);
        assert_eq!(
            coords(&layout, &shape![4, 4]),
            vec![vec![0, 0], vec![0, 1], vec![2, 0], vec![2, 1]]
        );
    }

    #[test]
    fn test_blocked_coordinates_column_major_order() {
        let layout = blocked(&[2, 2], &[1, 1], &[1, 1], &[0, 1]);
        assert_eq!(
            coords(&layout, &shape![2, 2]),
            vec![vec![0, 0], vec![1, 0], vec![0, 1], vec![1, 1]]
        );
    }

    #[test]
    fn test_blocked_small_shape_uses_one_repetition() {
        let layout = blocked(&[1, 4], &[32, 1], &[4, 1], &[1, 0]);
        assert_eq!(layout.elems_per_thread(&shape![1, 4]).unwrap(), 4);
        assert_eq!(
            coords(&layout, &shape![1, 4]),
            vec![vec![0, 0], vec![0, 1], vec![0, 2], vec![0, 3]]
        );
    }

    #[test]
    fn test_blocked_rank_mismatch() {
        let layout = blocked(&[1, 4], &[32, 1], &[4, 1], &[1, 0]);
        assert!(matches!(
            layout.coordinates(&shape![4]),
            Err(LayoutError::RankMismatch { .. })
        ));
    }

    #[test]
    fn test_blocked_new_rejects_bad_order() {
        assert!(BlockedLayout::new(vec![1, 1], vec![1, 1], vec![1, 1], smallvec![0, 0]).is_err());
        assert!(BlockedLayout::new(vec![1], vec![1, 1], vec![1, 1], smallvec![1, 0]).is_err());
    }

    #[test]
    fn test_slice_coordinates_drop_dim_and_dedup() {
        let parent = blocked(&[2, 2], &[1, 1], &[1, 1], &[1, 0]);
        let slice: Layout = SliceLayout::new(0, parent).unwrap().into();
        assert_eq!(slice.rank(), 1);
        assert_eq!(coords(&slice, &shape![2]), vec![vec![0], vec![1]]);
        assert_eq!(slice.elems_per_thread(&shape![2]).unwrap(), 2);
        assert_eq!(slice.order().as_slice(), &[0]);
    }

    #[test]
    fn test_shared_is_not_distributed() {
        let shared: Layout = SharedLayout::new(1, 1, 1, smallvec![1, 0]).into();
        assert_eq!(
            shared.coordinates(&shape![4, 4]),
            Err(LayoutError::NotDistributed)
        );
        assert_eq!(
            shared.elems_per_thread(&shape![4, 4]),
            Err(LayoutError::NotDistributed)
        );
    }

    #[test]
    fn test_allocation_order() {
        let shared = SharedLayout::new(1, 1, 1, smallvec![1, 0]);
        assert_eq!(shared.allocation_order(2).unwrap().as_slice(), &[1, 0]);
        assert_eq!(shared.allocation_order(3).unwrap().as_slice(), &[2, 1, 0]);
        let col = SharedLayout::new(1, 1, 1, smallvec![0, 1]);
        assert_eq!(col.allocation_order(3).unwrap().as_slice(), &[1, 2, 0]);
        assert_eq!(
            shared.allocation_order(4),
            Err(LayoutError::UnsupportedSharedRank(4))
        );
        assert!(shared.allocation_order(1).is_err());
    }

    #[test]
    fn test_view_order_prefers_full_order() {
        let pipelined = SharedLayout::new(1, 1, 1, smallvec![1, 0]);
        assert_eq!(pipelined.view_order(3).unwrap().as_slice(), &[2, 1, 0]);
        assert_eq!(pipelined.view_order(2).unwrap().as_slice(), &[1, 0]);
        let view = SharedLayout::new(1, 1, 1, smallvec![2, 0, 1]);
        assert_eq!(view.view_order(3).unwrap().as_slice(), &[2, 0, 1]);
    }

    #[test]
    fn test_display() {
        let layout = blocked(&[1, 4], &[8, 4], &[4, 1], &[1, 0]);
        assert_eq!(
            layout.to_string(),
            "#blocked<spt=[1, 4], tpw=[8, 4], wpc=[4, 1], order=[1, 0]>"
        );
    }

    fn arb_blocked_and_shape() -> impl Strategy<Value = (Layout, Shape)> {
        (1usize..=3)
            .prop_flat_map(|rank| {
                (
                    prop::collection::vec(1u32..=2, rank),
                    prop::collection::vec(prop::sample::select(vec![1u32, 2, 4]), rank),
                    prop::collection::vec(1u32..=2, rank),
                    Just((0..u8::try_from(rank).unwrap()).collect::<Vec<_>>()).prop_shuffle(),
                    prop::collection::vec(prop::sample::select(vec![1u32, 2, 4, 8]), rank),
                )
            })
            .prop_map(|(spt, tpw, wpc, order, shape)| {
                let layout = blocked(&spt, &tpw, &wpc, &order);
                let shape = shape.into_iter().map(|d| DimSize::new(d).unwrap()).collect();
                (layout, shape)
            })
    }

    proptest! {
        #[test]
        fn test_blocked_elems_per_thread_matches_coordinates((layout, shape) in arb_blocked_and_shape()) {
            let coordinates = layout.coordinates(&shape).unwrap();
            prop_assert_eq!(layout.elems_per_thread(&shape).unwrap() as usize, coordinates.len());
        }

        #[test]
        fn test_blocked_coordinates_are_unique_and_inside_tiles((layout, shape) in arb_blocked_and_shape()) {
            let Layout::Blocked(b) = &layout else { unreachable!() };
            let tile = b.shape_per_cta();
            let coordinates = layout.coordinates(&shape).unwrap();
            let unique: HashSet<_> = coordinates.iter().cloned().collect();
            prop_assert_eq!(unique.len(), coordinates.len());
            for c in &coordinates {
                for k in 0..shape.len() {
                    let reps = shape[k].get().div_ceil(tile[k]);
                    prop_assert!(c[k] < reps * tile[k]);
                    prop_assert!(c[k] % tile[k] < b.size_per_thread()[k]);
                }
            }
        }
    }
}
