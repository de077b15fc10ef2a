//! D2Q9 velocity set.
//!
//! ```text
//!   6   2   5
//!    \  |  /
//!   3 - 0 - 1
//!    /  |  \
//!   7   4   8
//! ```
//! Positive y (north) points toward increasing row index, so the top wall is row ny - 1.

/// Named lattice directions. The discriminant is the plane index in the distribution arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum Direction {
    Rest = 0,
    East = 1,
    North = 2,
    West = 3,
    South = 4,
    NorthEast = 5,
    NorthWest = 6,
    SouthWest = 7,
    SouthEast = 8,
}

impl Direction {
    pub const ALL: [Direction; 9] = [
        Direction::Rest,
        Direction::East,
        Direction::North,
        Direction::West,
        Direction::South,
        Direction::NorthEast,
        Direction::NorthWest,
        Direction::SouthWest,
        Direction::SouthEast,
    ];

    #[inline(always)]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Direction reversed through the origin, used for bounce-back pairing.
    pub fn opposite(self) -> Direction {
        match self {
            Direction::Rest => Direction::Rest,
            Direction::East => Direction::West,
            Direction::North => Direction::South,
            Direction::West => Direction::East,
            Direction::South => Direction::North,
            Direction::NorthEast => Direction::SouthWest,
            Direction::NorthWest => Direction::SouthEast,
            Direction::SouthWest => Direction::NorthEast,
            Direction::SouthEast => Direction::NorthWest,
        }
    }
}

/// Immutable D2Q9 constants, handed explicitly to every kernel that needs them.
#[derive(Debug, Clone, PartialEq)]
pub struct Lattice {
    /// Integer velocity (cx, cy) per direction.
    pub velocities: [[i32; 2]; 9],
    pub weights: [f64; 9],
    /// `opposite[i]` is the index of the reverse of direction `i`.
    pub opposite: [usize; 9],
}

impl Lattice {
    pub const Q: usize = 9;

    pub fn d2q9() -> Self {
        let mut velocities = [[0; 2]; 9];
        let mut weights = [0.0; 9];
        let mut opposite = [0; 9];
        for dir in Direction::ALL {
            let i = dir.index();
            velocities[i] = match dir {
                Direction::Rest => [0, 0],
                Direction::East => [1, 0],
                Direction::North => [0, 1],
                Direction::West => [-1, 0],
                Direction::South => [0, -1],
                Direction::NorthEast => [1, 1],
                Direction::NorthWest => [-1, 1],
                Direction::SouthWest => [-1, -1],
                Direction::SouthEast => [1, -1],
            };
            weights[i] = match dir {
                Direction::Rest => 4.0 / 9.0,
                Direction::East | Direction::North | Direction::West | Direction::South => 1.0 / 9.0,
                _ => 1.0 / 36.0,
            };
            opposite[i] = dir.opposite().index();
        }
        Self { velocities, weights, opposite }
    }

    #[inline(always)]
    pub fn cx(&self, i: usize) -> f64 {
        self.velocities[i][0] as f64
    }

    #[inline(always)]
    pub fn cy(&self, i: usize) -> f64 {
        self.velocities[i][1] as f64
    }
}
