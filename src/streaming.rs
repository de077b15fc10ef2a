use crate::field::DistributionField;
use crate::lattice::Lattice;
use rayon::prelude::*;

/// Advects every population one cell along its lattice velocity with periodic wraparound on both axes:
/// f_i(row, col) <- f_i(row - cy mod ny, col - cx mod nx).
///
/// Reads only the front buffer, writes only the back buffer, then swaps, so no
/// direction ever observes a partially streamed plane.
pub fn stream(lattice: &Lattice, field: &mut DistributionField) {
    let dims = field.dims;
    let plane_len = field.plane_len();
    let (nx, ny) = (dims.nx, dims.ny);
    let src = &field.f_in;

    field
        .f_out
        .par_chunks_mut(plane_len)
        .enumerate()
        .for_each(|(i, dst_plane)| {
            let src_plane = &src[i * plane_len..(i + 1) * plane_len];
            let [cx, cy] = lattice.velocities[i];
            // Shift expressed as a non-negative offset so the modulo stays in range
            let col_shift = (nx as i64 - cx as i64).rem_euclid(nx as i64) as usize;
            let row_shift = (ny as i64 - cy as i64).rem_euclid(ny as i64) as usize;

            for row in 0..ny {
                let src_row = (row + row_shift) % ny;
                let dst_line = &mut dst_plane[row * nx..(row + 1) * nx];
                let src_line = &src_plane[src_row * nx..(src_row + 1) * nx];
                for (col, out) in dst_line.iter_mut().enumerate() {
                    *out = src_line[(col + col_shift) % nx];
                }
            }
        });

    field.swap_buffers();
}
