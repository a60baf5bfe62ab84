//! Spatial region walker shared by the pooling and depthwise emitters.
//!
//! Classifies output rows and columns into border regions (clipped kernel
//! footprints, unrolled with their exact clip) and an interior (full
//! footprints, emitted as counted loops when they run more than twice), and
//! invokes a per-cell body with the resolved footprint and cursor register.
//!
//! Register protocol: `rsi` row base, `r8` column cursor inside interior
//! column loops, `rax`/`rcx` loop counters, `rdi` advanced by one output
//! cell after every body invocation. Bodies may use any XMM register and
//! `rbx`/`rdx`/`r10`/`r11`.

use iced_x86::code_asm::*;

use crate::codegen::util::disp;
use crate::error::Result;
use crate::model::PaddingType;

#[derive(Debug, Clone)]
pub struct SpatialWalk {
    /// Input dimensions `[h, w, c]`.
    pub input: [usize; 3],
    pub kernel: [usize; 2],
    pub strides: [usize; 2],
    /// Output spatial dimensions `[oh, ow]`.
    pub output: [usize; 2],
    /// `[top, bottom, left, right]` in input pixels.
    pub padding: [usize; 4],
    /// Floats one output cell occupies (the per-cell `rdi` advance).
    pub out_cell_floats: usize,
}

/// `[top, bottom, left, right]` for a pooling/depthwise footprint.
pub fn padding_partition(
    padding: PaddingType,
    input: [usize; 2],
    kernel: [usize; 2],
    strides: [usize; 2],
    output: [usize; 2],
) -> [usize; 4] {
    if padding == PaddingType::Valid {
        return [0; 4];
    }
    let vertical = ((output[0] - 1) * strides[0] + kernel[0]).saturating_sub(input[0]);
    let horizontal = ((output[1] - 1) * strides[1] + kernel[1]).saturating_sub(input[1]);
    [
        vertical / 2,
        vertical - vertical / 2,
        horizontal / 2,
        horizontal - horizontal / 2,
    ]
}

/// The resolved kernel footprint of one output cell.
#[derive(Debug, Clone, Copy)]
pub struct Cell {
    /// Cursor register pointing at the cell's first valid input pixel,
    /// up to `base_floats` of compile-time displacement.
    pub cursor: AsmRegister64,
    /// Additional displacement in floats on top of `cursor`.
    pub base_floats: usize,
    /// Valid kernel rows `ky0..ky1` and columns `kx0..kx1`.
    pub ky: (usize, usize),
    pub kx: (usize, usize),
}

impl Cell {
    pub fn clipped(&self, kernel: [usize; 2]) -> bool {
        self.ky.0 > 0 || self.ky.1 < kernel[0] || self.kx.0 > 0 || self.kx.1 < kernel[1]
    }

    /// Displacement in floats of input pixel `(ky, kx)` of the footprint.
    pub fn pixel_floats(&self, w: usize, c: usize, ky: usize, kx: usize) -> usize {
        self.base_floats + ((ky - self.ky.0) * w + (kx - self.kx.0)) * c
    }
}

pub(crate) fn row_clip(walk: &SpatialWalk, oy: usize) -> (usize, usize) {
    let [h, _, _] = walk.input;
    let top = walk.padding[0];
    let y = oy * walk.strides[0];
    let ky0 = top.saturating_sub(y);
    let ky1 = walk.kernel[0].min(h + top - y);
    (ky0, ky1)
}

pub(crate) fn col_clip(walk: &SpatialWalk, ox: usize) -> (usize, usize) {
    let [_, w, _] = walk.input;
    let left = walk.padding[2];
    let x = ox * walk.strides[1];
    let kx0 = left.saturating_sub(x);
    let kx1 = walk.kernel[1].min(w + left - x);
    (kx0, kx1)
}

pub fn emit_spatial_walk(
    a: &mut CodeAssembler,
    walk: &SpatialWalk,
    input_addr: u64,
    body: &mut dyn FnMut(&mut CodeAssembler, Cell) -> Result<()>,
) -> Result<()> {
    let [_, w, c] = walk.input;
    let [oh, ow] = walk.output;
    let [sh, sw] = walk.strides;

    let clipped_row = |oy: usize| {
        let (ky0, ky1) = row_clip(walk, oy);
        ky0 > 0 || ky1 < walk.kernel[0]
    };
    let mut top_rows = 0usize;
    while top_rows < oh && clipped_row(top_rows) {
        top_rows += 1;
    }
    let mut bottom_rows = 0usize;
    while bottom_rows < oh - top_rows && clipped_row(oh - 1 - bottom_rows) {
        bottom_rows += 1;
    }
    let middle_rows = oh - top_rows - bottom_rows;

    // First valid input row of an output row's footprint.
    let base_row = |oy: usize| {
        let (ky0, _) = row_clip(walk, oy);
        oy * sh + ky0 - walk.padding[0]
    };

    let mut emit_row = |a: &mut CodeAssembler, oy: usize| -> Result<()> {
        let (ky0, ky1) = row_clip(walk, oy);

        let clipped_col = |ox: usize| {
            let (kx0, kx1) = col_clip(walk, ox);
            kx0 > 0 || kx1 < walk.kernel[1]
        };
        let mut left_cols = 0usize;
        while left_cols < ow && clipped_col(left_cols) {
            left_cols += 1;
        }
        let mut right_cols = 0usize;
        while right_cols < ow - left_cols && clipped_col(ow - 1 - right_cols) {
            right_cols += 1;
        }
        let middle_cols = ow - left_cols - right_cols;

        let base_col = |ox: usize| {
            let (kx0, _) = col_clip(walk, ox);
            ox * sw + kx0 - walk.padding[2]
        };

        for ox in 0..left_cols {
            let (kx0, kx1) = col_clip(walk, ox);
            body(
                a,
                Cell {
                    cursor: rsi,
                    base_floats: base_col(ox) * c,
                    ky: (ky0, ky1),
                    kx: (kx0, kx1),
                },
            )?;
            a.add(rdi, disp(walk.out_cell_floats * 4)?)?;
        }

        if middle_cols > 2 {
            a.lea(r8, qword_ptr(rsi + disp(base_col(left_cols) * c * 4)?))?;
            let mut col_loop = a.create_label();
            a.mov(rcx, middle_cols as u64)?;
            a.set_label(&mut col_loop)?;
            body(
                a,
                Cell {
                    cursor: r8,
                    base_floats: 0,
                    ky: (ky0, ky1),
                    kx: (0, walk.kernel[1]),
                },
            )?;
            a.add(rdi, disp(walk.out_cell_floats * 4)?)?;
            a.add(r8, disp(sw * c * 4)?)?;
            a.dec(rcx)?;
            a.jnz(col_loop)?;
        } else {
            for i in 0..middle_cols {
                let ox = left_cols + i;
                body(
                    a,
                    Cell {
                        cursor: rsi,
                        base_floats: base_col(ox) * c,
                        ky: (ky0, ky1),
                        kx: (0, walk.kernel[1]),
                    },
                )?;
                a.add(rdi, disp(walk.out_cell_floats * 4)?)?;
            }
        }

        for i in 0..right_cols {
            let ox = ow - right_cols + i;
            let (kx0, kx1) = col_clip(walk, ox);
            body(
                a,
                Cell {
                    cursor: rsi,
                    base_floats: base_col(ox) * c,
                    ky: (ky0, ky1),
                    kx: (kx0, kx1),
                },
            )?;
            a.add(rdi, disp(walk.out_cell_floats * 4)?)?;
        }
        Ok(())
    };

    for oy in 0..top_rows {
        a.mov(rsi, input_addr + (base_row(oy) * w * c * 4) as u64)?;
        emit_row(a, oy)?;
    }

    if middle_rows > 2 {
        a.mov(rsi, input_addr + (base_row(top_rows) * w * c * 4) as u64)?;
        let mut row_loop = a.create_label();
        a.mov(rax, middle_rows as u64)?;
        a.set_label(&mut row_loop)?;
        emit_row(a, top_rows)?;
        a.add(rsi, disp(sh * w * c * 4)?)?;
        a.dec(rax)?;
        a.jnz(row_loop)?;
    } else {
        for i in 0..middle_rows {
            let oy = top_rows + i;
            a.mov(rsi, input_addr + (base_row(oy) * w * c * 4) as u64)?;
            emit_row(a, oy)?;
        }
    }

    for i in 0..bottom_rows {
        let oy = oh - bottom_rows + i;
        a.mov(rsi, input_addr + (base_row(oy) * w * c * 4) as u64)?;
        emit_row(a, oy)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_ranges_cover_the_valid_footprint() {
        let walk = SpatialWalk {
            input: [5, 5, 1],
            kernel: [3, 3],
            strides: [1, 1],
            output: [5, 5],
            padding: [1, 1, 1, 1],
            out_cell_floats: 1,
        };
        assert_eq!(row_clip(&walk, 0), (1, 3));
        assert_eq!(row_clip(&walk, 2), (0, 3));
        assert_eq!(row_clip(&walk, 4), (0, 2));
        assert_eq!(col_clip(&walk, 0), (1, 3));
    }

    #[test]
    fn odd_total_padding_goes_to_the_far_edge() {
        // 3x3 stride-2 same pooling over 4x4: one padded row/column, at the
        // bottom/right only.
        let padding = padding_partition(PaddingType::Same, [4, 4], [3, 3], [2, 2], [2, 2]);
        assert_eq!(padding, [0, 1, 0, 1]);
        let walk = SpatialWalk {
            input: [4, 4, 1],
            kernel: [3, 3],
            strides: [2, 2],
            output: [2, 2],
            padding,
            out_cell_floats: 1,
        };
        assert_eq!(row_clip(&walk, 0), (0, 3));
        assert_eq!(row_clip(&walk, 1), (0, 2));
    }
}
