use crate::field::{DistributionField, MacroFields};
use crate::lattice::Lattice;
use rayon::prelude::*;

/// Second-order Maxwell-Boltzmann equilibrium for one direction:
/// f_eq_i = w_i rho (1 + 3 (c_i.u) + 4.5 (c_i.u)^2 - 1.5 |u|^2)
#[inline(always)]
pub fn equilibrium_at(lattice: &Lattice, i: usize, rho: f64, ux: f64, uy: f64) -> f64 {
    let cu = lattice.cx(i) * ux + lattice.cy(i) * uy;
    let uu = ux * ux + uy * uy;
    lattice.weights[i] * rho * (1.0 + 3.0 * cu + 4.5 * cu * cu - 1.5 * uu)
}

/// Fills `feq` (shape (9, ny, nx), same layout as the distribution arena) from the macroscopic fields.
/// Each direction plane is computed independently in parallel.
pub fn compute_equilibrium(lattice: &Lattice, fields: &MacroFields, feq: &mut [f64]) {
    let plane_len = fields.dims.num_cells();
    debug_assert_eq!(feq.len(), Lattice::Q * plane_len);

    feq.par_chunks_mut(plane_len)
        .enumerate()
        .for_each(|(i, plane)| {
            for (cell, out) in plane.iter_mut().enumerate() {
                *out = equilibrium_at(lattice, i, fields.rho[cell], fields.ux[cell], fields.uy[cell]);
            }
        });
}

/// BGK relaxation f <- f - (f - f_eq) / tau, applied to every population.
pub fn collide(field: &mut DistributionField, feq: &[f64], omega: f64) {
    let plane_len = field.plane_len();
    debug_assert_eq!(feq.len(), field.f_in.len());

    field
        .f_in
        .par_chunks_mut(plane_len)
        .zip(feq.par_chunks(plane_len))
        .for_each(|(f_plane, feq_plane)| {
            for (f, &eq) in f_plane.iter_mut().zip(feq_plane) {
                *f -= (*f - eq) * omega;
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::Dims;
    use crate::macroscopic::extract;
    use approx::assert_relative_eq;

    fn sheared_fields(dims: Dims) -> MacroFields {
        let mut fields = MacroFields::new(dims);
        for row in 0..dims.ny {
            for col in 0..dims.nx {
                let cell = dims.cell_idx(row, col);
                fields.rho[cell] = 0.9 + 0.01 * (row + 2 * col) as f64;
                fields.ux[cell] = 0.08 * row as f64 / dims.ny as f64;
                fields.uy[cell] = -0.03 + 0.01 * col as f64;
            }
        }
        fields
    }

    #[test]
    fn equilibrium_reproduces_density_and_momentum() {
        let lattice = Lattice::d2q9();
        let dims = Dims::new(6, 5);
        let fields = sheared_fields(dims);
        let mut feq = vec![0.0; Lattice::Q * dims.num_cells()];
        compute_equilibrium(&lattice, &fields, &mut feq);

        for cell in 0..dims.num_cells() {
            let mut rho = 0.0;
            let mut mx = 0.0;
            let mut my = 0.0;
            for i in 0..Lattice::Q {
                let v = feq[i * dims.num_cells() + cell];
                rho += v;
                mx += v * lattice.cx(i);
                my += v * lattice.cy(i);
            }
            assert_relative_eq!(rho, fields.rho[cell], epsilon = 1e-12);
            assert_relative_eq!(mx, fields.rho[cell] * fields.ux[cell], epsilon = 1e-12);
            assert_relative_eq!(my, fields.rho[cell] * fields.uy[cell], epsilon = 1e-12);
        }
    }

    #[test]
    fn zero_velocity_equilibrium_is_weighted_density() {
        let lattice = Lattice::d2q9();
        for i in 0..Lattice::Q {
            assert_relative_eq!(
                equilibrium_at(&lattice, i, 1.3, 0.0, 0.0),
                lattice.weights[i] * 1.3,
                epsilon = 1e-15
            );
        }
    }

    #[test]
    fn collision_conserves_mass_and_momentum() {
        let lattice = Lattice::d2q9();
        let dims = Dims::new(4, 4);
        let mut field = DistributionField::uniform(dims, 1.0).unwrap();
        for (k, f) in field.f_in.iter_mut().enumerate() {
            *f += 0.05 * ((k * 7919) % 13) as f64 / 13.0;
        }
        let mut before = MacroFields::new(dims);
        extract(&field, &lattice, &mut before);

        let mut feq = vec![0.0; field.f_in.len()];
        compute_equilibrium(&lattice, &before, &mut feq);
        collide(&mut field, &feq, 1.0 / 0.6);

        let mut after = MacroFields::new(dims);
        extract(&field, &lattice, &mut after);
        for cell in 0..dims.num_cells() {
            assert_relative_eq!(after.rho[cell], before.rho[cell], epsilon = 1e-12);
            assert_relative_eq!(after.ux[cell], before.ux[cell], epsilon = 1e-12);
            assert_relative_eq!(after.uy[cell], before.uy[cell], epsilon = 1e-12);
        }
    }

    #[test]
    fn unit_relaxation_lands_on_equilibrium() {
        let dims = Dims::new(3, 3);
        let mut field = DistributionField::uniform(dims, 1.0).unwrap();
        let feq: Vec<f64> = (0..field.f_in.len()).map(|k| k as f64 * 0.01).collect();
        collide(&mut field, &feq, 1.0);
        for (f, eq) in field.f_in.iter().zip(&feq) {
            assert_relative_eq!(*f, *eq, epsilon = 1e-15);
        }
    }
}
