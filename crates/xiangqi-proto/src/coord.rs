use serde::{Deserialize, Serialize};

/// A board cell. `row` is 0–9 (red starts low, black starts high), `col` is
/// 0–8.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coord {
    pub row: i32,
    pub col: i32,
}

impl Coord {
    pub fn in_bounds(self) -> bool {
        (0..=9).contains(&self.row) && (0..=8).contains(&self.col)
    }
}
