use glam::{Mat3, Vec3};

/// Inverse mass with optional per-axis locks (used by 2-D mode to pin the
/// z translation axis).
#[derive(Debug, Clone, Copy)]
pub struct Mass {
    inv_mass: f32,
    axis_locked: [bool; 3],
}

impl Default for Mass {
    fn default() -> Self {
        Self {
            inv_mass: 1.0,
            axis_locked: [false; 3],
        }
    }
}

impl Mass {
    pub fn infinite() -> Self {
        Self {
            inv_mass: 0.0,
            axis_locked: [false; 3],
        }
    }

    pub fn set_inv_mass(&mut self, inv_mass: f32) {
        self.inv_mass = inv_mass;
    }

    pub fn inv_mass(&self) -> f32 {
        self.inv_mass
    }

    pub fn mass(&self) -> f32 {
        if self.inv_mass != 0.0 {
            1.0 / self.inv_mass
        } else {
            0.0
        }
    }

    pub fn set_axis_lock(&mut self, locked: bool, axis: usize) {
        self.axis_locked[axis] = locked;
    }

    /// inv-mass * v, with locked axes zeroed.
    pub fn apply(&self, v: Vec3) -> Vec3 {
        let mut out = v * self.inv_mass;
        for axis in 0..3 {
            if self.axis_locked[axis] {
                out[axis] = 0.0;
            }
        }
        out
    }

    /// mass * v; turns an acceleration into a force.
    pub fn apply_inverted(&self, v: Vec3) -> Vec3 {
        if self.inv_mass == 0.0 {
            return Vec3::ZERO;
        }
        v / self.inv_mass
    }
}

/// Inverse inertia in local and world space, with per-axis rotation locks.
#[derive(Debug, Clone, Copy, Default)]
pub struct Inertia {
    local_inv: Mat3,
    world_inv: Mat3,
    axis_locked: [bool; 3],
}

impl Inertia {
    pub fn clear(&mut self) {
        self.local_inv = Mat3::ZERO;
        self.world_inv = Mat3::ZERO;
    }

    pub fn set_inv_local(&mut self, inv: Mat3) {
        self.local_inv = inv;
        self.apply_local_locks();
    }

    pub fn inv_local(&self) -> Mat3 {
        self.local_inv
    }

    pub fn inv_world(&self) -> Mat3 {
        self.world_inv
    }

    pub fn lock_local_axis(&mut self, axis: usize) {
        self.axis_locked[axis] = true;
        self.apply_local_locks();
    }

    pub fn unlock_local_axis(&mut self, axis: usize) {
        self.axis_locked[axis] = false;
    }

    fn apply_local_locks(&mut self) {
        for axis in 0..3 {
            if self.axis_locked[axis] {
                let mut cols = [self.local_inv.x_axis, self.local_inv.y_axis, self.local_inv.z_axis];
                for col in &mut cols {
                    col[axis] = 0.0;
                }
                cols[axis] = Vec3::ZERO;
                self.local_inv = Mat3::from_cols(cols[0], cols[1], cols[2]);
            }
        }
    }

    /// Rotates the local tensor into world space.
    pub fn compute_world(&mut self, rotation: Mat3) {
        self.world_inv = rotation * self.local_inv * rotation.transpose();
    }

    /// Locks the world-space x and y rotation axes; 2-D bodies spin only
    /// about z. Performed on the world tensor since the locked axes are
    /// world axes.
    pub fn world_lock_2d(&mut self) {
        let zz = self.world_inv.z_axis.z;
        self.world_inv = Mat3::ZERO;
        self.world_inv.z_axis.z = zz;
    }

    pub fn apply(&self, v: Vec3) -> Vec3 {
        self.world_inv * v
    }
}

/// Replaces computed mass (and optionally the center of mass) on a body.
#[derive(Debug, Clone, Copy)]
pub struct MassOverride {
    pub active: bool,
    pub inv_mass: f32,
    /// When false, the given local center of mass replaces the computed one.
    pub auto_compute_center_of_mass: bool,
    pub local_center_of_mass: Vec3,
}

impl Default for MassOverride {
    fn default() -> Self {
        Self {
            active: false,
            inv_mass: 1.0,
            auto_compute_center_of_mass: true,
            local_center_of_mass: Vec3::ZERO,
        }
    }
}

/// Parallel-axis accumulation of a world-space inertia contribution about
/// `center_of_mass`.
pub fn combine_inertia(
    total: &mut Mat3,
    center_of_mass: Vec3,
    world_inertia: Mat3,
    contribution_center: Vec3,
    mass: f32,
) {
    let r = contribution_center - center_of_mass;
    let dot = r.dot(r);
    let outer = Mat3::from_cols(r * r.x, r * r.y, r * r.z);
    let shift = (Mat3::from_diagonal(Vec3::splat(dot)) + outer * -1.0) * mass;
    *total = *total + world_inertia + shift;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mass_axis_lock_zeroes_component() {
        let mut mass = Mass::default();
        mass.set_inv_mass(2.0);
        mass.set_axis_lock(true, 2);
        let out = mass.apply(Vec3::new(1.0, 1.0, 1.0));
        assert_eq!(out, Vec3::new(2.0, 2.0, 0.0));
    }

    #[test]
    fn world_lock_2d_keeps_only_z() {
        let mut inertia = Inertia::default();
        inertia.set_inv_local(Mat3::from_diagonal(Vec3::new(1.0, 2.0, 3.0)));
        inertia.compute_world(Mat3::IDENTITY);
        inertia.world_lock_2d();
        assert_eq!(inertia.apply(Vec3::new(1.0, 1.0, 1.0)), Vec3::new(0.0, 0.0, 3.0));
    }

    #[test]
    fn parallel_axis_shift() {
        // Two point-like unit masses at x = ±d/2 about the midpoint: each
        // contributes m*(d/2)^2 about y and z.
        let mut total = Mat3::ZERO;
        let d = 4.0;
        combine_inertia(
            &mut total,
            Vec3::ZERO,
            Mat3::ZERO,
            Vec3::new(d / 2.0, 0.0, 0.0),
            1.0,
        );
        combine_inertia(
            &mut total,
            Vec3::ZERO,
            Mat3::ZERO,
            Vec3::new(-d / 2.0, 0.0, 0.0),
            1.0,
        );
        assert!((total.y_axis.y - 8.0).abs() < 1e-5);
        assert!((total.z_axis.z - 8.0).abs() < 1e-5);
        assert!(total.x_axis.x.abs() < 1e-5);
    }
}
