// src/analysis/gate.rs
//
// Static gate geometry. A gate is a horizontal band between two boundary
// lines, limited to an x-window. Positions are classified against the band
// with a hysteresis margin so jitter near a boundary does not flip regions.

use crate::config::{GateConfig, ReferenceMode};
use crate::types::{BoundingBox, Region};

#[derive(Debug, Clone, PartialEq)]
pub struct Gate {
    pub name: String,
    /// min(A, B)
    pub top: f32,
    /// max(A, B)
    pub bottom: f32,
    pub xmin: f32,
    pub xmax: f32,
}

impl Gate {
    pub fn new(name: impl Into<String>, boundary_a: f32, boundary_b: f32, xmin: f32, xmax: f32) -> Self {
        Self {
            name: name.into(),
            top: boundary_a.min(boundary_b),
            bottom: boundary_a.max(boundary_b),
            xmin,
            xmax,
        }
    }

    pub fn from_config(cfg: &GateConfig) -> Self {
        Self::new(cfg.name.clone(), cfg.boundary_a, cfg.boundary_b, cfg.xmin, cfg.xmax)
    }

    /// `Above` if y < top - h, `Below` if y > bottom + h, else `Inside`.
    pub fn classify(&self, y: f32, hysteresis: f32) -> Region {
        if y < self.top - hysteresis {
            Region::Above
        } else if y > self.bottom + hysteresis {
            Region::Below
        } else {
            Region::Inside
        }
    }

    pub fn in_window(&self, x: f32) -> bool {
        x >= self.xmin && x <= self.xmax
    }

    /// Distance from `y` to the top and bottom boundary lines.
    pub fn boundary_distances(&self, y: f32) -> (f32, f32) {
        ((y - self.top).abs(), (y - self.bottom).abs())
    }

    pub fn band_height(&self) -> f32 {
        self.bottom - self.top
    }
}

/// Fixed, ordered set of gates. Index order is evaluation order.
#[derive(Debug, Clone, Default)]
pub struct GateBank {
    gates: Vec<Gate>,
}

impl GateBank {
    pub fn new(gates: Vec<Gate>) -> Self {
        Self { gates }
    }

    pub fn from_config(gates: &[GateConfig]) -> Self {
        Self::new(gates.iter().map(Gate::from_config).collect())
    }

    pub fn len(&self) -> usize {
        self.gates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Gate)> {
        self.gates.iter().enumerate()
    }
}

/// Reference vertical position of a box for the configured mode.
pub fn reference_y(bbox: &BoundingBox, mode: ReferenceMode, fraction: f32) -> f32 {
    let h = bbox.y2 - bbox.y1;
    match mode {
        ReferenceMode::Top => bbox.y1,
        ReferenceMode::Bottom => bbox.y2,
        ReferenceMode::Center => (bbox.y1 + bbox.y2) * 0.5,
        ReferenceMode::TopQuarter => bbox.y1 + 0.25 * h,
        ReferenceMode::Fraction => bbox.y1 + fraction * h,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_normalizes_boundaries() {
        let gate = Gate::new("G1", 52.0, 30.0, 292.0, 398.0);
        assert_eq!(gate.top, 30.0);
        assert_eq!(gate.bottom, 52.0);
        assert_eq!(gate.band_height(), 22.0);
    }

    #[test]
    fn test_classify_with_hysteresis() {
        let gate = Gate::new("G1", 30.0, 52.0, 292.0, 398.0);
        assert_eq!(gate.classify(20.0, 2.0), Region::Above);
        // Within the margin above the top line still counts as inside
        assert_eq!(gate.classify(28.5, 2.0), Region::Inside);
        assert_eq!(gate.classify(27.9, 2.0), Region::Above);
        assert_eq!(gate.classify(40.0, 2.0), Region::Inside);
        assert_eq!(gate.classify(54.0, 2.0), Region::Inside);
        assert_eq!(gate.classify(54.1, 2.0), Region::Below);
    }

    #[test]
    fn test_window_is_inclusive() {
        let gate = Gate::new("G1", 30.0, 52.0, 292.0, 398.0);
        assert!(gate.in_window(292.0));
        assert!(gate.in_window(398.0));
        assert!(!gate.in_window(399.0));
    }

    #[test]
    fn test_reference_modes() {
        let b = BoundingBox::new(0.0, 100.0, 50.0, 200.0);
        assert_eq!(reference_y(&b, ReferenceMode::Top, 0.0), 100.0);
        assert_eq!(reference_y(&b, ReferenceMode::Bottom, 0.0), 200.0);
        assert_eq!(reference_y(&b, ReferenceMode::Center, 0.0), 150.0);
        assert_eq!(reference_y(&b, ReferenceMode::TopQuarter, 0.0), 125.0);
        assert_eq!(reference_y(&b, ReferenceMode::Fraction, 0.6), 160.0);
    }

    #[test]
    fn test_bank_preserves_order() {
        let bank = GateBank::new(vec![
            Gate::new("B", 0.0, 10.0, 0.0, 10.0),
            Gate::new("A", 0.0, 10.0, 0.0, 10.0),
        ]);
        let names: Vec<_> = bank.iter().map(|(_, g)| g.name.as_str()).collect();
        assert_eq!(names, vec!["B", "A"]);
    }
}
