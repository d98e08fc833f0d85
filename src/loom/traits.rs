use itertools::Itertools;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeError {
    #[error("shape {shape:?} and tile shape {tile:?} differ in rank")]
    Rank { shape: Vec<usize>, tile: Vec<usize> },
    #[error("shape dimension {axis} is zero")]
    ZeroShape { axis: usize },
    #[error("tile dimension {axis} is zero")]
    ZeroTile { axis: usize },
    #[error("tile dimension {axis} ({tile}) exceeds shape dimension ({shape})")]
    TileExceeds {
        axis: usize,
        tile: usize,
        shape: usize,
    },
}

/// Describes how a logical tensor of `shape` is cut into a grid of tiles of `basetile_shape`.
///
/// Tiles on the upper boundary of an axis may be smaller than the base tile.
/// Both elements and tiles are linearized in row-major order (last axis fastest).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorTraits {
    shape: Vec<usize>,
    basetile_shape: Vec<usize>,
    grid: Vec<usize>,
}

impl TensorTraits {
    /// Derives the tile grid of a tensor. Pure computation.
    pub fn describe(
        shape: impl Into<Vec<usize>>,
        basetile_shape: impl Into<Vec<usize>>,
    ) -> Result<Self, ShapeError> {
        let shape: Vec<usize> = shape.into();
        let basetile_shape: Vec<usize> = basetile_shape.into();
        if shape.len() != basetile_shape.len() {
            return Err(ShapeError::Rank {
                shape,
                tile: basetile_shape,
            });
        }
        for (axis, (&shape, &tile)) in shape.iter().zip_eq(basetile_shape.iter()).enumerate() {
            if shape == 0 {
                return Err(ShapeError::ZeroShape { axis });
            }
            if tile == 0 {
                return Err(ShapeError::ZeroTile { axis });
            }
            if tile > shape {
                return Err(ShapeError::TileExceeds { axis, tile, shape });
            }
        }
        let grid = shape
            .iter()
            .zip_eq(basetile_shape.iter())
            .map(|(&shape, &tile)| shape.div_ceil(tile))
            .collect();
        Ok(Self {
            shape,
            basetile_shape,
            grid,
        })
    }

    /// A tensor made of a single tile.
    #[inline]
    pub fn single_tile(shape: impl Into<Vec<usize>>) -> Result<Self, ShapeError> {
        let shape: Vec<usize> = shape.into();
        Self::describe(shape.clone(), shape)
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[inline]
    pub fn basetile_shape(&self) -> &[usize] {
        &self.basetile_shape
    }

    #[inline]
    pub fn grid(&self) -> &[usize] {
        &self.grid
    }

    #[inline]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements of the whole tensor.
    #[inline]
    pub fn nelems(&self) -> usize {
        self.shape.iter().product()
    }

    /// Number of tiles in the grid.
    #[inline]
    pub fn grid_nelems(&self) -> usize {
        self.grid.iter().product()
    }

    /// Converts a linear tile index into a grid index.
    pub fn tile_index(&self, mut linear: usize) -> Vec<usize> {
        let mut index = vec![0; self.ndim()];
        for (axis, &extent) in self.grid.iter().enumerate().rev() {
            index[axis] = linear % extent;
            linear /= extent;
        }
        index
    }

    /// Converts a grid index into a linear tile index.
    pub fn tile_linear(&self, index: &[usize]) -> usize {
        index
            .iter()
            .zip_eq(self.grid.iter())
            .fold(0, |acc, (&i, &extent)| acc * extent + i)
    }

    /// Shape of the tile at grid `index`; boundary tiles are clipped to the tensor.
    pub fn tile_shape(&self, index: &[usize]) -> Vec<usize> {
        itertools::izip!(index, &self.shape, &self.basetile_shape)
            .map(|(&i, &shape, &tile)| tile.min(shape - i * tile))
            .collect()
    }

    /// Global coordinates of the first element of the tile at grid `index`.
    pub fn tile_offset(&self, index: &[usize]) -> Vec<usize> {
        index
            .iter()
            .zip_eq(self.basetile_shape.iter())
            .map(|(&i, &tile)| i * tile)
            .collect()
    }

    /// Contiguous runs of the tile at linear index `tile`, as `(global, local, len)` element
    /// offsets: `len` elements starting at `local` inside the tile lie at `global` in the
    /// row-major dense tensor.
    pub fn tile_runs(&self, tile: usize) -> Vec<(usize, usize, usize)> {
        let ndim = self.ndim();
        if ndim == 0 {
            return vec![(0, 0, 1)];
        }
        let index = self.tile_index(tile);
        let shape = self.tile_shape(&index);
        let offset = self.tile_offset(&index);
        let strides = row_major_strides(&self.shape);

        let len = shape[ndim - 1];
        let rows: usize = shape[..ndim - 1].iter().product();
        let mut runs = Vec::with_capacity(rows);
        let mut cursor = vec![0; ndim - 1];
        for row in 0..rows {
            let global = (0..ndim)
                .map(|axis| {
                    let local = cursor.get(axis).copied().unwrap_or(0);
                    (offset[axis] + local) * strides[axis]
                })
                .sum();
            runs.push((global, row * len, len));

            // advance the odometer over the leading axes of the tile
            for axis in (0..ndim - 1).rev() {
                cursor[axis] += 1;
                if cursor[axis] < shape[axis] {
                    break;
                }
                cursor[axis] = 0;
            }
        }
        runs
    }

    /// Number of elements held by the tile at linear index `tile`.
    pub fn tile_nelems(&self, tile: usize) -> usize {
        self.tile_shape(&self.tile_index(tile)).iter().product()
    }
}

/// Row-major strides of a dense array of `shape`.
pub fn row_major_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for axis in (0..shape.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * shape[axis + 1];
    }
    strides
}
