//! Broadcast planning shared by every dispatched operation.
//!
//! A [`BroadcastPlan`] aligns one iteration layout (usually the output) with
//! any number of operand layouts. The trailing `block_rank` dimensions form the
//! block handed to a kernel as a [`Tile`]; every dimension in front of them is
//! a batch dimension walked by [`BroadcastPlan::for_each`]. An operand whose
//! size at a batch dimension is 1 gets stride 0 there, so the same slice is
//! reused for every index along it.
//!
//! Run backwards, with a gradient contribution as the iteration layout and the
//! (smaller) input gradient as operand, replicated slices land on the same
//! offset and an accumulating kernel sums them.

use crate::backend::Tile;
use crate::error::Error;
use crate::shape::Shape;
use crate::storage::Layout;
use std::iter;

#[derive(Debug, Clone)]
pub struct BroadcastPlan {
    /// Rank-unified shapes; index 0 is the iteration layout.
    shapes: Vec<Shape>,
    batch_rank: usize,
    /// Iteration sizes of the dimensions walked by `for_each`.
    loop_dims: Vec<usize>,
    /// Element stride per operand per loop dimension.
    strides: Vec<Vec<usize>>,
    tiles: Vec<Tile>,
}

impl BroadcastPlan {
    /// Plans `operands` against `iteration`.
    ///
    /// With `block_rank == 1` the block is one row and columns may broadcast
    /// (an operand with one column). Trailing batch dimensions where no operand
    /// broadcasts are folded into the tile rows. With `block_rank == 2` the
    /// block is the trailing matrix of each operand, whose sizes the caller
    /// validates.
    pub fn new(iteration: &Layout, operands: &[&Layout], block_rank: usize) -> Result<Self, Error> {
        if !(1..=2).contains(&block_rank) {
            return Err(Error::InternalLogicError(format!(
                "unsupported block rank {block_rank}"
            )));
        }
        let layouts: Vec<&Layout> = iter::once(iteration).chain(operands.iter().copied()).collect();
        let rank = layouts
            .iter()
            .map(|l| l.shape.rank())
            .max()
            .unwrap_or(1)
            .max(2);
        let shapes: Vec<Shape> = layouts.iter().map(|l| l.shape.expanded(rank)).collect();
        let target = &shapes[0];
        let batch_rank = rank - block_rank;

        for shape in &shapes[1..] {
            let batch_ok = (0..batch_rank).all(|d| shape[d] == target[d] || shape[d] == 1);
            let cols_ok = block_rank == 2 || shape.cols() == target.cols() || shape.cols() == 1;
            if !batch_ok || !cols_ok {
                return Err(Error::shape_mismatch(
                    "broadcast",
                    format!("{shape} cannot broadcast to {target}"),
                ));
            }
        }

        let mut loop_rank = batch_rank;
        let mut folded_rows = 1;
        if block_rank == 1 {
            while loop_rank > 0 && shapes.iter().all(|s| s[loop_rank - 1] == target[loop_rank - 1]) {
                loop_rank -= 1;
                folded_rows *= target[loop_rank];
            }
        }

        let tiles = shapes
            .iter()
            .zip(&layouts)
            .map(|(shape, layout)| {
                let rows = if block_rank == 1 { folded_rows } else { shape.rows() };
                Tile::new(rows, shape.cols(), layout.row_stride)
            })
            .collect();

        let strides = shapes
            .iter()
            .zip(&layouts)
            .map(|(shape, layout)| {
                (0..loop_rank)
                    .map(|d| {
                        if shape[d] == 1 && target[d] != 1 {
                            0
                        } else {
                            let inner: usize = shape.dims()[d + 1..rank - 1].iter().product();
                            inner * layout.row_stride
                        }
                    })
                    .collect()
            })
            .collect();

        Ok(Self {
            loop_dims: target.dims()[..loop_rank].to_vec(),
            shapes,
            batch_rank,
            strides,
            tiles,
        })
    }

    /// Number of times `for_each` calls its closure.
    pub fn batch_count(&self) -> usize {
        self.loop_dims.iter().product()
    }

    /// Tile of operand `index`; 0 is the iteration layout.
    pub fn tile(&self, index: usize) -> Tile {
        self.tiles[index]
    }

    /// Product of the iteration layout's batch dimensions.
    pub fn batch_size(&self) -> usize {
        self.shapes[0].dims()[..self.batch_rank].iter().product()
    }

    /// How operand `index` relates to the iteration batch:
    /// `Some(false)` when its batch dims are identical, `Some(true)` when they
    /// are all 1, `None` for partial broadcasting.
    pub fn batch_broadcast(&self, index: usize) -> Option<bool> {
        let (shape, target) = (&self.shapes[index], &self.shapes[0]);
        let batch = 0..self.batch_rank;
        if batch.clone().all(|d| shape[d] == target[d]) {
            Some(false)
        } else if batch.clone().all(|d| shape[d] == 1) {
            Some(true)
        } else {
            None
        }
    }

    /// Calls `f` with the element offset of every operand's tile, once per
    /// batch element.
    pub fn for_each<F>(&self, mut f: F) -> Result<(), Error>
    where
        F: FnMut(&[usize]) -> Result<(), Error>,
    {
        let mut offsets = vec![0; self.tiles.len()];
        for index in 0..self.batch_count() {
            offsets.fill(0);
            let mut rest = index;
            for d in (0..self.loop_dims.len()).rev() {
                let coord = rest % self.loop_dims[d];
                rest /= self.loop_dims[d];
                for (offset, strides) in offsets.iter_mut().zip(&self.strides) {
                    *offset += coord * strides[d];
                }
            }
            f(&offsets)?;
        }
        Ok(())
    }
}

/// The part of `buf` covered by `tile` starting at `offset`.
pub(crate) fn span(buf: &[f32], offset: usize, tile: Tile) -> Result<&[f32], Error> {
    buf.get(offset..offset + tile.extent())
        .ok_or_else(|| out_of_bounds(offset, tile, buf.len()))
}

pub(crate) fn span_mut(buf: &mut [f32], offset: usize, tile: Tile) -> Result<&mut [f32], Error> {
    let len = buf.len();
    buf.get_mut(offset..offset + tile.extent())
        .ok_or_else(|| out_of_bounds(offset, tile, len))
}

fn out_of_bounds(offset: usize, tile: Tile, len: usize) -> Error {
    Error::InternalLogicError(format!(
        "tile {tile:?} at offset {offset} exceeds buffer of {len}"
    ))
}
