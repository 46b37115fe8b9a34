use smallvec::SmallVec;
use std::num::NonZeroU32;

pub type DimSize = NonZeroU32;
pub type Shape = Vec<DimSize>;

/// A logical coordinate into a tensor, one component per dimension.
pub type Coord = SmallVec<[u32; 4]>;

/// A permutation of a tensor's dimensions. `order[0]` names the fastest-varying dimension.
pub type Order = SmallVec<[u8; 4]>;

/// The number of elements in `shape`, saturating at `u64::MAX`.
pub fn volume(shape: &[DimSize]) -> u64 {
    shape
        .iter()
        .fold(1u64, |acc, d| acc.saturating_mul(u64::from(d.get())))
}

/// Returns `true` if `order` is a permutation of `0..rank`.
pub fn is_permutation(order: &[u8], rank: usize) -> bool {
    if order.len() != rank {
        return false;
    }
    let mut seen: SmallVec<[bool; 4]> = smallvec::smallvec![false; rank];
    for &d in order {
        let d = usize::from(d);
        if d >= rank || seen[d] {
            return false;
        }
        seen[d] = true;
    }
    true
}

/// Splits `linear` into a multi-dimensional index over `extents`, with `order[0]` varying fastest.
///
/// The slowest-varying dimension absorbs any remainder, so indices past the end of `extents`'
/// volume are not wrapped.
///
/// # Examples
/// ```
/// # use tessera::common::delinearize;
/// assert_eq!(delinearize(5, &[2, 4], &[1, 0]).as_slice(), &[1, 1]);
/// assert_eq!(delinearize(5, &[2, 4], &[0, 1]).as_slice(), &[1, 2]);
/// ```
pub fn delinearize(linear: u32, extents: &[u32], order: &[u8]) -> Coord {
    debug_assert_eq!(extents.len(), order.len());
    let mut result: Coord = smallvec::smallvec![0; extents.len()];
    let mut remaining = linear;
    for (i, &dim) in order.iter().enumerate() {
        let dim = usize::from(dim);
        if i + 1 == order.len() {
            result[dim] = remaining;
        } else {
            result[dim] = remaining % extents[dim];
            remaining /= extents[dim];
        }
    }
    result
}

/// Removes `dropped` dimensions from `order`, renumbering the survivors densely.
pub fn drop_dims_from_order(order: &[u8], dropped: &[usize]) -> Order {
    order
        .iter()
        .copied()
        .filter(|d| !dropped.contains(&usize::from(*d)))
        .map(|d| {
            let shift = dropped.iter().filter(|&&x| x < usize::from(d)).count();
            d - u8::try_from(shift).unwrap()
        })
        .collect()
}

pub mod macros {
    pub mod internal {
        use crate::common::DimSize;

        pub trait IntoDimSize {
            fn into_dim_size(self) -> DimSize;
        }

        impl IntoDimSize for DimSize {
            fn into_dim_size(self) -> DimSize {
                self
            }
        }

        impl IntoDimSize for u32 {
            fn into_dim_size(self) -> DimSize {
                DimSize::new(self).unwrap()
            }
        }
    }

    #[macro_export]
    macro_rules! shape {
        ($dim:expr; $n:expr) => {{
            use $crate::common::macros::internal::IntoDimSize;
            // Bind to a variable with an explicit type to help out type inference.
            let sv: $crate::common::Shape = vec![ ($dim).into_dim_size(); $n ];
            sv
        }};
        ($($dim:expr),*$(,)*) => {{
            use $crate::common::macros::internal::IntoDimSize;
            // Bind to a variable with an explicit type to help out type inference.
            let sv: $crate::common::Shape = vec![ $( ($dim).into_dim_size() ),* ];
            sv
        }};
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_delinearize_row_major() {
        let extents = [3, 4];
        let order = [1, 0];
        assert_eq!(delinearize(0, &extents, &order).as_slice(), &[0, 0]);
        assert_eq!(delinearize(3, &extents, &order).as_slice(), &[0, 3]);
        assert_eq!(delinearize(4, &extents, &order).as_slice(), &[1, 0]);
        assert_eq!(delinearize(11, &extents, &order).as_slice(), &[2, 3]);
    }

    #[test]
    fn test_delinearize_slowest_dim_absorbs_overflow() {
        assert_eq!(delinearize(9, &[2, 2], &[1, 0]).as_slice(), &[4, 1]);
    }

    #[test]
    fn test_drop_dims_from_order() {
        assert_eq!(drop_dims_from_order(&[2, 0, 1], &[0]).as_slice(), &[1, 0]);
        assert_eq!(drop_dims_from_order(&[1, 0], &[0]).as_slice(), &[0]);
        assert_eq!(drop_dims_from_order(&[1, 0], &[0, 1]).as_slice(), &[] as &[u8]);
        assert_eq!(drop_dims_from_order(&[0, 1, 2], &[]).as_slice(), &[0, 1, 2]);
    }

    #[test]
    fn test_volume_saturates() {
        assert_eq!(volume(&crate::shape![2, 3, 4]), 24);
        assert_eq!(volume(&crate::shape![u32::MAX; 3]), u64::MAX);
    }

    #[test]
    fn test_is_permutation() {
        assert!(is_permutation(&[1, 0], 2));
        assert!(is_permutation(&[], 0));
        assert!(!is_permutation(&[0, 0], 2));
        assert!(!is_permutation(&[0, 2], 2));
        assert!(!is_permutation(&[0], 2));
    }

    proptest! {
        #[test]
        fn test_delinearize_is_a_bijection_over_volume(
            extents in prop::collection::vec(1u32..5, 1..4),
            rotate in 0usize..4,
        ) {
            let rank = extents.len();
            let mut order: Vec<u8> = (0..u8::try_from(rank).unwrap()).collect();
            order.rotate_left(rotate % rank);
            let total: u32 = extents.iter().product();
            let mut seen = std::collections::HashSet::new();
            for n in 0..total {
                let c = delinearize(n, &extents, &order);
                for (k, &e) in extents.iter().enumerate() {
                    prop_assert!(c[k] < e);
                }
                prop_assert!(seen.insert(c));
            }
        }
    }
}
