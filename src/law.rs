//! Local nonsmooth laws and their projection operators.
//!
//! Each interaction carries a law that fixes the dimension of its local
//! reaction/velocity vectors and the projection used by block-iterative
//! solvers to keep the local reaction feasible.

use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum NonSmoothLaw {
    /// Frictionless unilateral contact of the given dimension:
    /// componentwise `z >= 0`, `w >= 0`, `z . w = 0`.
    Complementarity { size: usize },
    /// Coulomb friction with coefficient `mu`. The local reaction is
    /// `[z_n, z_t1, z_t2]` constrained to the cone `|z_t| <= mu * z_n`.
    CoulombFriction { mu: f64 },
}

impl NonSmoothLaw {
    /// Dimension of the local reaction and velocity vectors.
    pub fn size(&self) -> usize {
        match self {
            NonSmoothLaw::Complementarity { size } => *size,
            NonSmoothLaw::CoulombFriction { .. } => 3,
        }
    }

    pub fn friction_coefficient(&self) -> Option<f64> {
        match self {
            NonSmoothLaw::Complementarity { .. } => None,
            NonSmoothLaw::CoulombFriction { mu } => Some(*mu),
        }
    }

    /// Projects a local reaction onto the feasible set of this law.
    pub fn project(&self, z: &mut [f64]) {
        debug_assert_eq!(z.len(), self.size());
        match self {
            NonSmoothLaw::Complementarity { .. } => {
                for zi in z.iter_mut() {
                    *zi = zi.max(0.0);
                }
            }
            NonSmoothLaw::CoulombFriction { mu } => project_coulomb_cone(*mu, z),
        }
    }
}

/// Orthogonal projection of `[z_n, z_t1, z_t2]` onto the second order cone
/// `{ |z_t| <= mu * z_n }`.
fn project_coulomb_cone(mu: f64, z: &mut [f64]) {
    let zn = z[0];
    let zt_norm = z[1].hypot(z[2]);
    if zt_norm <= mu * zn {
        // Inside the cone.
        return;
    }
    if mu * zt_norm <= -zn {
        // Inside the polar cone; the projection is the apex.
        z[0] = 0.0;
        z[1] = 0.0;
        z[2] = 0.0;
        return;
    }
    // On the boundary.
    let zn_new = (zn + mu * zt_norm) / (1.0 + mu * mu);
    let scale = mu * zn_new / zt_norm;
    z[0] = zn_new;
    z[1] *= scale;
    z[2] *= scale;
}
