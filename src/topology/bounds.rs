//! Axis-aligned bounds over discrete or continuous index spaces.
//!
//! [`Coordinate`] is the bound set every coordinate type must satisfy; it is
//! implemented for the usual integer (discrete) and float (continuous) types.
//! Discrete bounds are inclusive on both ends; continuous bounds describe the
//! closed box `[min, max]`.

use crate::block_error::BlockError;
use num_traits::Num;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Coordinate scalar for a domain axis.
pub trait Coordinate:
    Num + Copy + PartialOrd + Debug + Default + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// `true` for integer lattices, `false` for real-valued domains.
    const DISCRETE: bool;

    /// Convert a block count or index into this coordinate type.
    fn from_count(n: usize) -> Self;
}

macro_rules! impl_coordinate {
    ($discrete:expr => $($t:ty),*) => {
        $(
            impl Coordinate for $t {
                const DISCRETE: bool = $discrete;
                #[inline]
                fn from_count(n: usize) -> Self {
                    n as $t
                }
            }
        )*
    };
}

impl_coordinate!(true => i32, i64, isize);
impl_coordinate!(false => f32, f64);

/// Axis-aligned box with one `min`/`max` entry per dimension.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Bounds<T> {
    pub min: Vec<T>,
    pub max: Vec<T>,
}

/// Integer lattice bounds.
pub type DiscreteBounds = Bounds<i64>;
/// Real-valued bounds.
pub type ContinuousBounds = Bounds<f64>;

impl<T: Coordinate> Bounds<T> {
    /// Build bounds, rejecting mismatched dimensions or inverted axes.
    pub fn new(min: Vec<T>, max: Vec<T>) -> Result<Self, BlockError> {
        if min.len() != max.len() {
            return Err(BlockError::Configuration(format!(
                "bounds dimension mismatch: min has {} axes, max has {}",
                min.len(),
                max.len()
            )));
        }
        if let Some(axis) = (0..min.len()).find(|&i| min[i] > max[i]) {
            return Err(BlockError::Configuration(format!(
                "bounds axis {axis} is inverted: {:?} > {:?}",
                min[axis], max[axis]
            )));
        }
        Ok(Bounds { min, max })
    }

    /// Zero-sized bounds at the origin, used as a placeholder before filling.
    pub fn zeros(dim: usize) -> Self {
        Bounds {
            min: vec![T::zero(); dim],
            max: vec![T::zero(); dim],
        }
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.min.len()
    }

    /// Whether `p` lies inside (boundary included).
    pub fn contains(&self, p: &[T]) -> bool {
        p.len() == self.dim()
            && p
                .iter()
                .zip(self.min.iter().zip(&self.max))
                .all(|(x, (lo, hi))| lo <= x && x <= hi)
    }

    /// Whether the two boxes share at least one point.
    pub fn intersects(&self, other: &Bounds<T>) -> bool {
        self.dim() == other.dim()
            && (0..self.dim()).all(|i| self.min[i] <= other.max[i] && other.min[i] <= self.max[i])
    }

    /// Length of the domain along `axis`, as a period for wrap-around shifts.
    ///
    /// Discrete domains count lattice points, so `[0, 9]` has period 10.
    pub fn period(&self, axis: usize) -> T {
        let span = self.max[axis] - self.min[axis];
        if T::DISCRETE { span + T::one() } else { span }
    }

    /// Shift axis `axis` by `delta` in place.
    pub fn shift(&mut self, axis: usize, delta: T) {
        self.min[axis] = self.min[axis] + delta;
        self.max[axis] = self.max[axis] + delta;
    }
}
