use glam::{ Vec3, vec3 };

use crate::Voxel;

/// Signs of each octant's offset from its parent's center.
///
/// The octant index packs one bit per axis, x in the high bit:
/// ```text
/// index = (x > cx) << 2 | (y > cy) << 1 | (z > cz)
/// ```
pub const OCTANT_SIGNS: [Vec3; 8] = [
    vec3(-1.0, -1.0, -1.0),
    vec3(-1.0, -1.0,  1.0),
    vec3(-1.0,  1.0, -1.0),
    vec3(-1.0,  1.0,  1.0),
    vec3( 1.0, -1.0, -1.0),
    vec3( 1.0, -1.0,  1.0),
    vec3( 1.0,  1.0, -1.0),
    vec3( 1.0,  1.0,  1.0),
];

/// Axis-aligned cube described by its center and half extents.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Cube {
    pub center: Vec3,
    pub halfsize: Vec3,
}

impl Default for Cube {
    fn default() -> Self {
        Self::UNIT
    }
}

impl Cube {
    pub const UNIT: Self = Self {
        center: Vec3::ZERO,
        halfsize: Vec3::ONE,
    };

    pub fn new(center: Vec3, halfsize: Vec3) -> Self {
        Self { center, halfsize }
    }

    pub fn from_radius(center: Vec3, radius: f32) -> Self {
        Self {
            center,
            halfsize: Vec3::splat(radius),
        }
    }

    /// Smallest origin-centred cube containing every voxel. An empty set
    /// (or one sitting entirely on the origin) gets a unit cube.
    pub fn enclosing(voxels: &[Voxel]) -> Self {
        let extent = voxels.iter()
            .map(|voxel| voxel.position().abs().max_element())
            .fold(0.0f32, f32::max);

        Self::from_radius(Vec3::ZERO, extent.max(1.0))
    }

    /// Inclusive on every face.
    pub fn contains(&self, point: Vec3) -> bool {
        (self.center - point).abs().cmple(self.halfsize).all()
    }

    /// Which child octant `point` falls in. A coordinate equal to the
    /// center is not strictly greater, so it goes to the lower side.
    #[inline]
    pub fn octant(&self, point: Vec3) -> u8 {
        ((point.x > self.center.x) as u8) << 2
            | ((point.y > self.center.y) as u8) << 1
            | (point.z > self.center.z) as u8
    }

    pub fn child(&self, octant: u8) -> Cube {
        let quarter = self.halfsize * 0.5;
        Cube {
            center: self.center + quarter * OCTANT_SIGNS[octant as usize & 7],
            halfsize: quarter,
        }
    }

    pub fn subdivide(&self) -> [Cube; 8] {
        [0, 1, 2, 3, 4, 5, 6, 7].map(|octant| self.child(octant))
    }

    /// Corner positions in octant order, used to draw a node's outline.
    pub fn corners(&self) -> [Vec3; 8] {
        OCTANT_SIGNS.map(|sign| self.center + self.halfsize * sign)
    }

    #[inline]
    pub fn min(&self) -> Vec3 {
        self.center - self.halfsize
    }

    #[inline]
    pub fn max(&self) -> Vec3 {
        self.center + self.halfsize
    }

    pub fn is_valid(&self) -> bool {
        self.center.is_finite() && self.halfsize.is_finite() && self.halfsize.cmpgt(Vec3::ZERO).all()
    }
}

#[test]
fn cube_subdivide_test() {
    let cube = Cube::from_radius(Vec3::ZERO, 4.0);
    let children = cube.subdivide();

    for (octant, child) in children.iter().enumerate() {
        assert_eq!(child.halfsize, Vec3::splat(2.0));
        assert_eq!(cube.octant(child.center), octant as u8);
        assert!(cube.contains(child.min()) && cube.contains(child.max()));
    }
    assert_eq!(children[0].center, vec3(-2.0, -2.0, -2.0));
    assert_eq!(children[5].center, vec3(2.0, -2.0, 2.0));
}

#[test]
fn octant_tie_break_test() {
    let cube = Cube::new(vec3(1.0, 1.0, 1.0), Vec3::ONE);

    assert_eq!(cube.octant(vec3(1.0, 1.0, 1.0)), 0);
    assert_eq!(cube.octant(vec3(1.5, 1.0, 1.0)), 0b100);
    assert_eq!(cube.octant(vec3(1.0, 1.5, 1.0)), 0b010);
    assert_eq!(cube.octant(vec3(1.0, 1.0, 1.5)), 0b001);
    assert_eq!(cube.octant(vec3(0.5, 1.5, 1.5)), 0b011);
}

#[test]
fn cube_contains_test() {
    let cube = Cube::from_radius(Vec3::ZERO, 2.0);
    assert!(cube.contains(vec3(2.0, -2.0, 0.0)));
    assert!(!cube.contains(vec3(2.0, -2.5, 0.0)));

    let corners = cube.corners();
    assert_eq!(corners[0], cube.min());
    assert_eq!(corners[7], cube.max());
}

#[test]
fn cube_validity_test() {
    assert!(Cube::UNIT.is_valid());
    assert!(!Cube::from_radius(Vec3::ZERO, 0.0).is_valid());
    assert!(!Cube::new(vec3(f32::NAN, 0.0, 0.0), Vec3::ONE).is_valid());
}
