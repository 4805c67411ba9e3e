use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::PlayerError;

/// A pixel position on the rendered page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

/// Click coordinates calibrated at known base render widths. The automated
/// page exposes no stable DOM hooks for its controls, only pixel positions
/// calibrated by hand at a few resolutions; anything in between is derived
/// by linear scaling from the nearest base width.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CoordinateMap {
    bases: BTreeMap<u32, HashMap<String, Point>>,
}

impl CoordinateMap {
    pub fn new(bases: BTreeMap<u32, HashMap<String, Point>>) -> Self {
        CoordinateMap { bases }
    }

    pub fn is_empty(&self) -> bool {
        self.bases.is_empty()
    }

    pub fn base_widths(&self) -> impl Iterator<Item = u32> + '_ {
        self.bases.keys().copied()
    }

    /// Nearest base width by absolute distance; ties break toward the
    /// smaller base width.
    fn nearest_base(&self, current_width: u32) -> Result<u32, PlayerError> {
        self.bases
            .keys()
            .min_by_key(|&&base| (base as i64 - current_width as i64).abs())
            .copied()
            .ok_or(PlayerError::EmptyCoordinateMap)
    }

    /// Map a logical action at the current render width to a pixel position,
    /// scaling both axes by `current_width / base_width`.
    pub fn resolve(&self, action: &str, current_width: u32) -> Result<Point, PlayerError> {
        let base = self.nearest_base(current_width)?;
        let point = self
            .bases
            .get(&base)
            .and_then(|actions| actions.get(action))
            .copied()
            .ok_or_else(|| PlayerError::UnknownAction(action.to_string()))?;

        let scale = current_width as f64 / base as f64;
        Ok(Point {
            x: (point.x as f64 * scale).round() as i32,
            y: (point.y as f64 * scale).round() as i32,
        })
    }
}
